//! Idempotent inbound message handling
//!
//! A consumer turns a message into a list of [`ConsumerEffect`]s without
//! touching storage. The [`InboxStore`] then records the receipt and applies
//! the effects in one transaction, keyed by `(message id, consumer)`, so a
//! redelivered message is a no-op.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};
use uuid::Uuid;

use super::outbox::{MessagePublisher, OutboxMessage, PublishError};
use crate::persistence::{InboxStore, StoreError};

/// Proof that a consumer processed a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxReceipt {
    pub message_id: Uuid,
    pub consumer: String,
    pub message_type: String,
    pub received_at: DateTime<Utc>,
}

impl InboxReceipt {
    pub fn new(message: &OutboxMessage, consumer: impl Into<String>) -> Self {
        Self {
            message_id: message.id,
            consumer: consumer.into(),
            message_type: message.message_type.clone(),
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxOutcome {
    Applied { effects: usize },
    Duplicate,
}

/// A user-facing notification row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub recipient: String,
    pub instance_id: Option<Uuid>,
    pub activity_id: Option<String>,
    pub subject: String,
    pub body: String,
    pub source_message_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// An audit trail row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub activity_id: Option<String>,
    pub message_type: String,
    pub assignee: Option<String>,
    pub correlation_id: Option<String>,
    pub payload: Value,
    pub source_message_id: Uuid,
    pub recorded_at: DateTime<Utc>,
}

/// A side effect to apply together with the inbox receipt
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerEffect {
    Notify(Notification),
    Audit(AuditEntry),
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("cannot decode message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("message rejected: {0}")]
    Rejected(String),
}

/// Something that reacts to integration events
#[async_trait]
pub trait MessageConsumer: Send + Sync + 'static {
    /// Stable name; part of the inbox key
    fn name(&self) -> &str;

    fn accepts(&self, _message_type: &str) -> bool {
        true
    }

    /// Compute effects; must not write anywhere itself
    async fn handle(&self, message: &OutboxMessage) -> Result<Vec<ConsumerEffect>, ConsumerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum InboxError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("consumer {consumer} failed: {source}")]
    Consumer {
        consumer: String,
        #[source]
        source: ConsumerError,
    },
}

/// Fans a message out to every interested consumer through the inbox
pub struct InboxProcessor {
    store: Arc<dyn InboxStore>,
    consumers: Vec<Arc<dyn MessageConsumer>>,
}

impl InboxProcessor {
    pub fn new(store: Arc<dyn InboxStore>) -> Self {
        Self {
            store,
            consumers: Vec::new(),
        }
    }

    pub fn with_consumer(mut self, consumer: Arc<dyn MessageConsumer>) -> Self {
        self.consumers.push(consumer);
        self
    }

    /// Deliver a message to each accepting consumer exactly once
    #[instrument(skip(self, message), fields(message_id = %message.id, message_type = %message.message_type))]
    pub async fn deliver(
        &self,
        message: &OutboxMessage,
    ) -> Result<Vec<(String, InboxOutcome)>, InboxError> {
        let mut outcomes = Vec::new();

        for consumer in self.consumers.iter().filter(|c| c.accepts(&message.message_type)) {
            let name = consumer.name().to_string();

            if self.store.inbox_contains(message.id, &name).await? {
                debug!(consumer = %name, "duplicate message skipped");
                outcomes.push((name, InboxOutcome::Duplicate));
                continue;
            }

            let effects = consumer
                .handle(message)
                .await
                .map_err(|source| InboxError::Consumer {
                    consumer: name.clone(),
                    source,
                })?;

            let outcome = self
                .store
                .apply_inbound(InboxReceipt::new(message, &name), effects)
                .await?;
            debug!(consumer = %name, ?outcome, "message consumed");
            outcomes.push((name, outcome));
        }

        Ok(outcomes)
    }
}

/// In-process transport: publishing means consuming through the inbox
#[async_trait]
impl MessagePublisher for InboxProcessor {
    async fn publish(&self, message: &OutboxMessage) -> Result<(), PublishError> {
        match self.deliver(message).await {
            Ok(_) => Ok(()),
            Err(InboxError::Store(e)) => Err(PublishError::Unavailable(e.to_string())),
            Err(e @ InboxError::Consumer { .. }) => Err(PublishError::Rejected(e.to_string())),
        }
    }
}
