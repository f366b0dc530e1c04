//! Transactional outbox and its dispatcher
//!
//! Messages are written in the same transaction as the state change that
//! caused them. The dispatcher leases unprocessed rows, publishes them and
//! only then marks them processed, so delivery is at-least-once: a crash at
//! any point leaves the row eligible for the next run.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::persistence::{OutboxStore, StoreError};
use crate::workflow::WorkflowEvent;

/// A message waiting for (or done with) publication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub message_type: String,
    pub payload: Value,
    pub instance_id: Option<Uuid>,
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Number of times the row was claimed for publication
    pub attempts: u32,
    pub last_error: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    pub fn new(message_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            message_type: message_type.into(),
            payload,
            instance_id: None,
            correlation_id: None,
            created_at: Utc::now(),
            processed_at: None,
            attempts: 0,
            last_error: None,
            locked_until: None,
        }
    }

    /// Wrap a workflow event
    pub fn from_event(event: &WorkflowEvent) -> Result<Self, serde_json::Error> {
        let mut message = Self::new(event.message_type(), serde_json::to_value(event)?);
        message.instance_id = Some(event.instance_id);
        message.correlation_id = event.correlation_id.clone();
        Ok(message)
    }

    /// Decode the payload back into a workflow event
    pub fn decode_event(&self) -> Result<WorkflowEvent, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("message rejected: {0}")]
    Rejected(String),
}

/// The message transport the dispatcher publishes to
#[async_trait]
pub trait MessagePublisher: Send + Sync + 'static {
    /// Must only return `Ok` once the transport has accepted the message
    async fn publish(&self, message: &OutboxMessage) -> Result<(), PublishError>;
}

/// Dispatcher tuning; none of these affect correctness
#[derive(Debug, Clone)]
pub struct OutboxDispatcherConfig {
    pub batch_size: usize,
    pub poll_interval: Duration,
    /// How long a claimed row stays invisible to other dispatchers
    pub lease: Duration,
}

impl Default for OutboxDispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            lease: Duration::from_secs(30),
        }
    }
}

/// Counters from one dispatcher pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub claimed: usize,
    pub published: usize,
    pub failed: usize,
}

/// Background publisher for outbox rows
pub struct OutboxDispatcher {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn MessagePublisher>,
    config: OutboxDispatcherConfig,
}

impl OutboxDispatcher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn MessagePublisher>,
        config: OutboxDispatcherConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    /// Claim one batch and publish it
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<DispatchReport, StoreError> {
        let batch = self
            .store
            .claim_outbox_batch(self.config.batch_size, self.config.lease)
            .await?;

        let mut report = DispatchReport {
            claimed: batch.len(),
            ..Default::default()
        };

        for message in batch {
            match self.publisher.publish(&message).await {
                Ok(()) => {
                    self.store.mark_outbox_processed(message.id).await?;
                    report.published += 1;
                }
                Err(e) => {
                    warn!(
                        message_id = %message.id,
                        message_type = %message.message_type,
                        attempts = message.attempts,
                        error = %e,
                        "outbox publish failed, will retry"
                    );
                    self.store
                        .record_outbox_failure(message.id, &e.to_string())
                        .await?;
                    report.failed += 1;
                }
            }
        }

        if report.claimed > 0 {
            debug!(
                claimed = report.claimed,
                published = report.published,
                failed = report.failed,
                "outbox batch dispatched"
            );
        }
        Ok(report)
    }

    /// Poll until shutdown is signalled
    ///
    /// A full batch is followed immediately by another pass; otherwise the
    /// dispatcher sleeps for the poll interval.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "outbox dispatcher started"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let drained = match self.run_once().await {
                Ok(report) => report.claimed < self.config.batch_size,
                Err(e) => {
                    error!(error = %e, "outbox dispatch pass failed");
                    true
                }
            };

            if drained {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        info!("outbox dispatcher stopped");
    }
}
