//! Store traits and persisted record types

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::assignment::{QueueKey, RoundRobinEntry, RoundRobinSelection, SyncReport};
use crate::messaging::{
    AuditEntry, ConsumerEffect, InboxOutcome, InboxReceipt, Notification, OutboxMessage,
};
use crate::workflow::{ActivityExecutionRecord, WorkflowInstance};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("workflow instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("no bookmark for activity {activity_id} on instance {instance_id}")]
    BookmarkNotFound { instance_id: Uuid, activity_id: String },

    /// The bookmark was already used by an earlier resume
    #[error("bookmark for activity {activity_id} on instance {instance_id} was already consumed")]
    BookmarkConsumed { instance_id: Uuid, activity_id: String },

    /// Optimistic locking failed
    #[error("concurrency conflict on instance {instance_id}: expected version {expected}, got {actual}")]
    ConcurrencyConflict {
        instance_id: Uuid,
        expected: i64,
        actual: i64,
    },

    #[error("duplicate key: {0}")]
    Duplicate(String),

    /// Serializable transaction aborted (SQLSTATE 40001/40P01); safe to retry
    #[error("serialization conflict: {0}")]
    SerializationConflict(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SerializationConflict(_) | Self::Database(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InstanceNotFound(_) => "INSTANCE_NOT_FOUND",
            Self::BookmarkNotFound { .. } => "BOOKMARK_NOT_FOUND",
            Self::BookmarkConsumed { .. } => "BOOKMARK_CONSUMED",
            Self::ConcurrencyConflict { .. } => "CONCURRENCY_CONFLICT",
            Self::Duplicate(_) => "DUPLICATE",
            Self::SerializationConflict(_) => "SERIALIZATION_CONFLICT",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Resumption point for a suspended activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bookmark {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub activity_id: String,
    /// Opaque token handed to whoever completes the task
    pub token: String,
    pub assignee: Option<String>,
    pub created_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
}

impl Bookmark {
    pub fn new(instance_id: Uuid, activity_id: impl Into<String>, assignee: Option<String>) -> Self {
        let id = Uuid::now_v7();
        Self {
            id,
            instance_id,
            activity_id: activity_id.into(),
            token: id.simple().to_string(),
            assignee,
            created_at: Utc::now(),
            consumed_at: None,
        }
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed_at.is_some()
    }
}

/// Everything one orchestrator step writes, applied atomically
///
/// The store must check `expected_version` against the stored instance,
/// consume the bookmark only if it is still open, and write the instance,
/// record, bookmark and outbox message in one transaction.
#[derive(Debug, Clone)]
pub struct TransitionCommit {
    /// New instance state; its `version` field is ignored
    pub instance: WorkflowInstance,
    pub expected_version: i64,
    pub record: Option<ActivityExecutionRecord>,
    pub consume_bookmark: Option<Uuid>,
    pub create_bookmark: Option<Bookmark>,
    /// Exactly one integration event per transition
    pub event: OutboxMessage,
}

/// Persistence for instances, history and bookmarks
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    /// Insert a new instance together with its start event
    async fn create_instance(
        &self,
        instance: &WorkflowInstance,
        event: OutboxMessage,
    ) -> Result<(), StoreError>;

    async fn get_instance(&self, instance_id: Uuid) -> Result<WorkflowInstance, StoreError>;

    /// Apply one transition; returns the new version
    async fn commit_transition(&self, commit: TransitionCommit) -> Result<i64, StoreError>;

    /// Execution history in commit order
    async fn list_history(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<ActivityExecutionRecord>, StoreError>;

    /// Assignee of the most recent completed execution of an activity
    async fn last_completed_assignee(
        &self,
        instance_id: Uuid,
        activity_id: &str,
    ) -> Result<Option<String>, StoreError>;

    /// Most recent bookmark for an activity, consumed or not
    async fn latest_bookmark(
        &self,
        instance_id: Uuid,
        activity_id: &str,
    ) -> Result<Option<Bookmark>, StoreError>;
}

/// Persistence for round-robin rotations
///
/// Both operations must be atomic per queue key under concurrency.
#[async_trait]
pub trait RoundRobinStore: Send + Sync + 'static {
    async fn select_next_user_with_round_reset(
        &self,
        activity_name: &str,
        group_set_hash: &str,
    ) -> Result<Option<RoundRobinSelection>, StoreError>;

    async fn sync_users_for_group_combination(
        &self,
        activity_name: &str,
        group_set_hash: &str,
        groups: &[String],
        current_user_ids: &[String],
    ) -> Result<SyncReport, StoreError>;

    /// All entries of a rotation ordered by user id
    async fn list_queue_entries(
        &self,
        activity_name: &str,
        group_set_hash: &str,
    ) -> Result<Vec<RoundRobinEntry>, StoreError>;

    /// Every known rotation with its group list
    async fn list_queue_keys(&self) -> Result<Vec<(QueueKey, Vec<String>)>, StoreError>;
}

/// Outbox rows awaiting publication
#[async_trait]
pub trait OutboxStore: Send + Sync + 'static {
    /// Lease up to `batch_size` unprocessed messages in creation order
    ///
    /// Leased rows are invisible to other claimers until the lease expires.
    async fn claim_outbox_batch(
        &self,
        batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxMessage>, StoreError>;

    async fn mark_outbox_processed(&self, message_id: Uuid) -> Result<(), StoreError>;

    /// Release the lease and remember the error; the row stays unprocessed
    async fn record_outbox_failure(&self, message_id: Uuid, error: &str)
        -> Result<(), StoreError>;

    async fn get_outbox_message(&self, message_id: Uuid)
        -> Result<Option<OutboxMessage>, StoreError>;

    async fn count_unprocessed_outbox(&self) -> Result<u64, StoreError>;

    /// Delete processed rows older than the cutoff; returns rows removed
    async fn purge_processed_outbox(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64, StoreError>;
}

/// Inbox deduplication plus the side-effect tables it guards
#[async_trait]
pub trait InboxStore: Send + Sync + 'static {
    /// Insert the receipt and apply the effects in one transaction, or do
    /// nothing if the receipt already exists
    async fn apply_inbound(
        &self,
        receipt: InboxReceipt,
        effects: Vec<ConsumerEffect>,
    ) -> Result<InboxOutcome, StoreError>;

    async fn inbox_contains(&self, message_id: Uuid, consumer: &str) -> Result<bool, StoreError>;

    async fn purge_inbox(&self, older_than: DateTime<Utc>, limit: usize)
        -> Result<u64, StoreError>;

    async fn list_notifications(&self, recipient: &str) -> Result<Vec<Notification>, StoreError>;

    async fn list_audit_entries(&self, instance_id: Uuid) -> Result<Vec<AuditEntry>, StoreError>;
}
