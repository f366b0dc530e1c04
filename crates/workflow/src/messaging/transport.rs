//! In-memory message transport

use async_trait::async_trait;
use parking_lot::Mutex;

use super::outbox::{MessagePublisher, OutboxMessage, PublishError};

/// Collects published messages; can be told to fail upcoming publishes
///
/// Handy for exercising dispatcher redelivery without a broker.
#[derive(Debug, Default)]
pub struct InMemoryTransport {
    published: Mutex<Vec<OutboxMessage>>,
    failures_remaining: Mutex<usize>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` publishes fail as unavailable
    pub fn fail_next(&self, count: usize) {
        *self.failures_remaining.lock() = count;
    }

    pub fn published(&self) -> Vec<OutboxMessage> {
        self.published.lock().clone()
    }

    pub fn published_types(&self) -> Vec<String> {
        self.published
            .lock()
            .iter()
            .map(|m| m.message_type.clone())
            .collect()
    }
}

#[async_trait]
impl MessagePublisher for InMemoryTransport {
    async fn publish(&self, message: &OutboxMessage) -> Result<(), PublishError> {
        {
            let mut remaining = self.failures_remaining.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(PublishError::Unavailable("injected failure".into()));
            }
        }
        self.published.lock().push(message.clone());
        Ok(())
    }
}
