// Background worker: outbox dispatch, retention cleanup and membership sync
// Decision: Consumers run in-process behind the inbox; the dispatcher publishes straight to them
// Decision: One shutdown watch channel stops every loop

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use appraisal_workflow::assignment::{StaticUserDirectory, UserDirectory};
use appraisal_workflow::maintenance::{MembershipSyncTask, RetentionCleanupTask};
use appraisal_workflow::messaging::{
    AuditConsumer, InboxProcessor, NotificationConsumer, OutboxDispatcher,
};
use appraisal_workflow::persistence::{
    InboxStore, OutboxStore, PostgresWorkflowStore, RoundRobinStore,
};

use crate::config::WorkerConfig;

/// Runs the background loops until [`Worker::shutdown`] is called
pub struct Worker {
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Worker {
    /// Connect to PostgreSQL and spawn every loop
    ///
    /// The loops only make sense against the store the orchestrators write
    /// to, so a missing `DATABASE_URL` is an error.
    pub async fn start(config: WorkerConfig) -> Result<Self> {
        let Some(url) = config.database_url.as_deref() else {
            bail!("DATABASE_URL must be set; the worker has no store to drain without it");
        };

        let store = PostgresWorkflowStore::connect(url, config.max_connections)
            .await
            .context("Failed to connect to PostgreSQL")?;
        store
            .migrate()
            .await
            .context("Failed to apply migrations")?;
        info!(max_connections = config.max_connections, "using PostgreSQL store");

        let directory = Arc::new(StaticUserDirectory::from_groups(
            config.group_members.clone(),
        ));
        Ok(Self::spawn(Arc::new(store), directory, &config))
    }

    /// Spawn the loops against an already constructed store
    pub fn spawn<S>(store: Arc<S>, directory: Arc<dyn UserDirectory>, config: &WorkerConfig) -> Self
    where
        S: OutboxStore + InboxStore + RoundRobinStore,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let processor = InboxProcessor::new(store.clone())
            .with_consumer(Arc::new(NotificationConsumer))
            .with_consumer(Arc::new(AuditConsumer));
        let dispatcher =
            OutboxDispatcher::new(store.clone(), Arc::new(processor), config.dispatcher.clone());
        let cleanup =
            RetentionCleanupTask::new(store.clone(), store.clone(), config.retention.clone());
        let sync = MembershipSyncTask::new(store, directory, config.membership_sync.clone());

        let handles = vec![
            tokio::spawn(dispatcher.run(shutdown_rx.clone())),
            tokio::spawn(cleanup.run(shutdown_rx.clone())),
            tokio::spawn(sync.run(shutdown_rx)),
        ];

        Self {
            handles,
            shutdown_tx,
        }
    }

    /// Signal every loop to stop and wait for them
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                warn!(error = %e, "background task ended abnormally");
            }
        }
        info!("worker stopped");
    }
}
