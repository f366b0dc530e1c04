//! Periodic round-robin membership sync
//!
//! Round-robin selection syncs a rotation whenever a task is assigned. Queues
//! that see no traffic would keep stale members indefinitely, so this task
//! walks every known rotation and reconciles it against the directory.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::assignment::UserDirectory;
use crate::persistence::{RoundRobinStore, StoreError};

#[derive(Debug, Clone)]
pub struct MembershipSyncConfig {
    pub interval: Duration,
}

impl Default for MembershipSyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
        }
    }
}

impl MembershipSyncConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Totals across all rotations for one pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MembershipSyncReport {
    pub queues: usize,
    pub added: usize,
    pub reactivated: usize,
    pub deactivated: usize,
    /// Rotations skipped because the directory lookup failed
    pub skipped: usize,
}

pub struct MembershipSyncTask {
    queue: Arc<dyn RoundRobinStore>,
    directory: Arc<dyn UserDirectory>,
    config: MembershipSyncConfig,
}

impl MembershipSyncTask {
    pub fn new(
        queue: Arc<dyn RoundRobinStore>,
        directory: Arc<dyn UserDirectory>,
        config: MembershipSyncConfig,
    ) -> Self {
        Self {
            queue,
            directory,
            config,
        }
    }

    /// Reconcile every known rotation once
    ///
    /// A directory failure skips that rotation; store failures abort the pass.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<MembershipSyncReport, StoreError> {
        let keys = self.queue.list_queue_keys().await?;
        let mut report = MembershipSyncReport {
            queues: keys.len(),
            ..Default::default()
        };

        for (key, groups) in keys {
            let users = match self.directory.users_in_groups(&groups).await {
                Ok(users) => users,
                Err(e) => {
                    warn!(
                        activity = %key.activity_name,
                        group_set_hash = %key.group_set_hash,
                        error = %e,
                        "directory lookup failed, skipping rotation"
                    );
                    report.skipped += 1;
                    continue;
                }
            };

            let sync = self
                .queue
                .sync_users_for_group_combination(
                    &key.activity_name,
                    &key.group_set_hash,
                    &groups,
                    &users,
                )
                .await?;

            if !sync.is_noop() {
                info!(
                    activity = %key.activity_name,
                    added = ?sync.added,
                    reactivated = ?sync.reactivated,
                    deactivated = ?sync.deactivated,
                    "rotation membership changed"
                );
            }
            report.added += sync.added.len();
            report.reactivated += sync.reactivated.len();
            report.deactivated += sync.deactivated.len();
        }

        debug!(?report, "membership sync pass finished");
        Ok(report)
    }

    /// Run on a fixed interval until shutdown is signalled
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "membership sync started"
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
                error!(error = %e, "membership sync failed");
            }
        }

        info!("membership sync stopped");
    }
}
