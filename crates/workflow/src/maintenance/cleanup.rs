//! Retention cleanup for outbox and inbox rows

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument};

use crate::persistence::{InboxStore, OutboxStore, StoreError};

/// Retention configuration
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Processed outbox rows and inbox receipts older than this are deleted
    pub retention: Duration,

    /// Rows deleted per statement
    pub batch_size: usize,

    pub interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            batch_size: 500,
            interval: Duration::from_secs(60 * 60),
        }
    }
}

impl RetentionConfig {
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub outbox_purged: u64,
    pub inbox_purged: u64,
}

/// Deletes expired messaging rows in batches
///
/// Unprocessed outbox rows are never touched, whatever their age.
pub struct RetentionCleanupTask {
    outbox: Arc<dyn OutboxStore>,
    inbox: Arc<dyn InboxStore>,
    config: RetentionConfig,
}

impl RetentionCleanupTask {
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        inbox: Arc<dyn InboxStore>,
        config: RetentionConfig,
    ) -> Self {
        Self {
            outbox,
            inbox,
            config,
        }
    }

    /// Purge everything past the retention window
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<CleanupReport, StoreError> {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::days(3650));
        let cutoff = Utc::now() - retention;
        let limit = self.config.batch_size;
        let mut report = CleanupReport::default();

        loop {
            let purged = self.outbox.purge_processed_outbox(cutoff, limit).await?;
            report.outbox_purged += purged;
            if purged < limit as u64 {
                break;
            }
        }

        loop {
            let purged = self.inbox.purge_inbox(cutoff, limit).await?;
            report.inbox_purged += purged;
            if purged < limit as u64 {
                break;
            }
        }

        debug!(
            outbox_purged = report.outbox_purged,
            inbox_purged = report.inbox_purged,
            %cutoff,
            "retention cleanup pass finished"
        );
        Ok(report)
    }

    /// Run on a fixed interval until shutdown is signalled
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            retention_secs = self.config.retention.as_secs(),
            interval_secs = self.config.interval.as_secs(),
            "retention cleanup started"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(e) = self.run_once().await {
                error!(error = %e, "retention cleanup failed");
            }
        }

        info!("retention cleanup stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{InboxReceipt, OutboxMessage};
    use crate::persistence::{InMemoryWorkflowStore, WorkflowStore};
    use crate::workflow::{WorkflowEvent, WorkflowEventKind, WorkflowInstance};
    use serde_json::json;

    async fn start_instance(store: &InMemoryWorkflowStore, name: &str) {
        let instance = WorkflowInstance::new("appraisal", 1, name, "requester", "start");
        let started = OutboxMessage::from_event(&WorkflowEvent::for_instance(
            &instance,
            Some("start"),
            WorkflowEventKind::WorkflowStarted { definition_version: 1 },
        ))
        .unwrap();
        store.create_instance(&instance, started).await.unwrap();
    }

    async fn seeded() -> (Arc<InMemoryWorkflowStore>, Vec<OutboxMessage>) {
        let store = Arc::new(InMemoryWorkflowStore::new());
        start_instance(&store, "APR-1").await;

        let claimed = store
            .claim_outbox_batch(10, Duration::from_secs(30))
            .await
            .unwrap();
        (store, claimed)
    }

    #[tokio::test]
    async fn test_purges_only_processed_rows() {
        let (store, claimed) = seeded().await;
        assert_eq!(claimed.len(), 1);
        store.mark_outbox_processed(claimed[0].id).await.unwrap();

        // Unprocessed rows survive regardless of age
        start_instance(&store, "APR-2").await;

        let delivered = OutboxMessage::new("workflow.test", json!({}));
        store
            .apply_inbound(InboxReceipt::new(&delivered, "audit"), Vec::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let task = RetentionCleanupTask::new(
            store.clone(),
            store.clone(),
            RetentionConfig::default().with_retention(Duration::ZERO).with_batch_size(1),
        );
        let report = task.run_once().await.unwrap();

        assert_eq!(report, CleanupReport { outbox_purged: 1, inbox_purged: 1 });
        let remaining = store.outbox_messages();
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].processed_at.is_none());
        assert!(!store.inbox_contains(delivered.id, "audit").await.unwrap());
    }

    #[tokio::test]
    async fn test_recent_rows_are_kept() {
        let (store, claimed) = seeded().await;
        store.mark_outbox_processed(claimed[0].id).await.unwrap();

        let task = RetentionCleanupTask::new(store.clone(), store.clone(), RetentionConfig::default());
        let report = task.run_once().await.unwrap();

        assert_eq!(report, CleanupReport::default());
        assert_eq!(store.outbox_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (store, _) = seeded().await;
        let task = RetentionCleanupTask::new(
            store.clone(),
            store,
            RetentionConfig::default().with_interval(Duration::from_millis(10)),
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(task.run(rx));

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
