//! In-memory implementation of the workflow stores for testing

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::assignment::round_robin::{select_next, sync_entries};
use crate::assignment::{QueueKey, RoundRobinEntry, RoundRobinSelection, SyncReport};
use crate::messaging::{
    AuditEntry, ConsumerEffect, InboxOutcome, InboxReceipt, Notification, OutboxMessage,
};
use crate::workflow::{ActivityExecutionRecord, ExecutionStatus, WorkflowInstance};

/// Every table behind one lock so multi-table writes are atomic
#[derive(Default)]
struct MemoryState {
    instances: HashMap<Uuid, WorkflowInstance>,
    history: Vec<ActivityExecutionRecord>,
    bookmarks: Vec<Bookmark>,
    queues: BTreeMap<QueueKey, Vec<RoundRobinEntry>>,
    queue_groups: BTreeMap<QueueKey, Vec<String>>,
    outbox: Vec<OutboxMessage>,
    inbox: HashMap<(Uuid, String), InboxReceipt>,
    notifications: Vec<Notification>,
    audit: Vec<AuditEntry>,
}

/// In-memory implementation of every store trait
///
/// Provides the same semantics as the PostgreSQL implementation: version
/// checks, single-use bookmarks, leased outbox claims and per-consumer
/// inbox deduplication.
///
/// # Example
///
/// ```
/// use appraisal_workflow::InMemoryWorkflowStore;
///
/// let store = InMemoryWorkflowStore::new();
/// assert_eq!(store.instance_count(), 0);
/// ```
#[derive(Default)]
pub struct InMemoryWorkflowStore {
    state: RwLock<MemoryState>,
}

fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    let lease = chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::days(1));
    now + lease
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn instance_count(&self) -> usize {
        self.state.read().instances.len()
    }

    /// Snapshot of the whole outbox in creation order
    pub fn outbox_messages(&self) -> Vec<OutboxMessage> {
        self.state.read().outbox.clone()
    }

    /// Bookmarks not yet consumed
    pub fn open_bookmarks(&self) -> Vec<Bookmark> {
        self.state
            .read()
            .bookmarks
            .iter()
            .filter(|b| !b.is_consumed())
            .cloned()
            .collect()
    }

    /// Replace a rotation wholesale (test fixtures)
    pub fn seed_queue(&self, key: QueueKey, groups: Vec<String>, entries: Vec<RoundRobinEntry>) {
        let mut state = self.state.write();
        state.queue_groups.insert(key.clone(), groups);
        state.queues.insert(key, entries);
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        *self.state.write() = MemoryState::default();
    }
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn create_instance(
        &self,
        instance: &WorkflowInstance,
        event: OutboxMessage,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if state.instances.contains_key(&instance.id) {
            return Err(StoreError::Duplicate(format!("instance {}", instance.id)));
        }
        let mut stored = instance.clone();
        stored.version = 0;
        state.instances.insert(stored.id, stored);
        state.outbox.push(event);
        Ok(())
    }

    async fn get_instance(&self, instance_id: Uuid) -> Result<WorkflowInstance, StoreError> {
        self.state
            .read()
            .instances
            .get(&instance_id)
            .cloned()
            .ok_or(StoreError::InstanceNotFound(instance_id))
    }

    async fn commit_transition(&self, commit: TransitionCommit) -> Result<i64, StoreError> {
        let mut state = self.state.write();
        let instance_id = commit.instance.id;

        let current = state
            .instances
            .get(&instance_id)
            .ok_or(StoreError::InstanceNotFound(instance_id))?;
        if current.version != commit.expected_version {
            return Err(StoreError::ConcurrencyConflict {
                instance_id,
                expected: commit.expected_version,
                actual: current.version,
            });
        }

        if let Some(bookmark_id) = commit.consume_bookmark {
            let bookmark = state
                .bookmarks
                .iter()
                .find(|b| b.id == bookmark_id)
                .ok_or_else(|| StoreError::BookmarkNotFound {
                    instance_id,
                    activity_id: bookmark_id.to_string(),
                })?;
            if bookmark.is_consumed() {
                return Err(StoreError::BookmarkConsumed {
                    instance_id,
                    activity_id: bookmark.activity_id.clone(),
                });
            }
        }

        // All checks passed; apply everything
        let now = Utc::now();
        if let Some(bookmark_id) = commit.consume_bookmark {
            if let Some(bookmark) = state.bookmarks.iter_mut().find(|b| b.id == bookmark_id) {
                bookmark.consumed_at = Some(now);
            }
        }
        if let Some(bookmark) = commit.create_bookmark {
            state.bookmarks.push(bookmark);
        }
        if let Some(record) = commit.record {
            state.history.push(record);
        }
        state.outbox.push(commit.event);

        let new_version = commit.expected_version + 1;
        let mut instance = commit.instance;
        instance.version = new_version;
        state.instances.insert(instance_id, instance);

        Ok(new_version)
    }

    async fn list_history(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<ActivityExecutionRecord>, StoreError> {
        let state = self.state.read();
        if !state.instances.contains_key(&instance_id) {
            return Err(StoreError::InstanceNotFound(instance_id));
        }
        Ok(state
            .history
            .iter()
            .filter(|r| r.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn last_completed_assignee(
        &self,
        instance_id: Uuid,
        activity_id: &str,
    ) -> Result<Option<String>, StoreError> {
        Ok(self
            .state
            .read()
            .history
            .iter()
            .rev()
            .filter(|r| {
                r.instance_id == instance_id
                    && r.activity_id == activity_id
                    && r.status == ExecutionStatus::Completed
            })
            .find_map(|r| r.assignee.clone()))
    }

    async fn latest_bookmark(
        &self,
        instance_id: Uuid,
        activity_id: &str,
    ) -> Result<Option<Bookmark>, StoreError> {
        Ok(self
            .state
            .read()
            .bookmarks
            .iter()
            .rev()
            .find(|b| b.instance_id == instance_id && b.activity_id == activity_id)
            .cloned())
    }
}

#[async_trait]
impl RoundRobinStore for InMemoryWorkflowStore {
    async fn select_next_user_with_round_reset(
        &self,
        activity_name: &str,
        group_set_hash: &str,
    ) -> Result<Option<RoundRobinSelection>, StoreError> {
        let key = QueueKey::new(activity_name, group_set_hash);
        let mut state = self.state.write();
        Ok(state
            .queues
            .get_mut(&key)
            .and_then(|entries| select_next(entries, Utc::now())))
    }

    async fn sync_users_for_group_combination(
        &self,
        activity_name: &str,
        group_set_hash: &str,
        groups: &[String],
        current_user_ids: &[String],
    ) -> Result<SyncReport, StoreError> {
        let key = QueueKey::new(activity_name, group_set_hash);
        let mut state = self.state.write();
        state.queue_groups.insert(key.clone(), groups.to_vec());
        let entries = state.queues.entry(key.clone()).or_default();
        Ok(sync_entries(entries, &key, groups, current_user_ids))
    }

    async fn list_queue_entries(
        &self,
        activity_name: &str,
        group_set_hash: &str,
    ) -> Result<Vec<RoundRobinEntry>, StoreError> {
        let key = QueueKey::new(activity_name, group_set_hash);
        let mut entries = self
            .state
            .read()
            .queues
            .get(&key)
            .cloned()
            .unwrap_or_default();
        entries.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(entries)
    }

    async fn list_queue_keys(&self) -> Result<Vec<(QueueKey, Vec<String>)>, StoreError> {
        Ok(self
            .state
            .read()
            .queue_groups
            .iter()
            .map(|(k, g)| (k.clone(), g.clone()))
            .collect())
    }
}

#[async_trait]
impl OutboxStore for InMemoryWorkflowStore {
    async fn claim_outbox_batch(
        &self,
        batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        let now = Utc::now();
        let locked_until = lease_deadline(now, lease);
        let mut state = self.state.write();

        Ok(state
            .outbox
            .iter_mut()
            .filter(|m| m.processed_at.is_none() && m.locked_until.map_or(true, |t| t <= now))
            .take(batch_size)
            .map(|m| {
                m.locked_until = Some(locked_until);
                m.attempts += 1;
                m.clone()
            })
            .collect())
    }

    async fn mark_outbox_processed(&self, message_id: Uuid) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if let Some(message) = state.outbox.iter_mut().find(|m| m.id == message_id) {
            message.processed_at = Some(Utc::now());
            message.locked_until = None;
        }
        Ok(())
    }

    async fn record_outbox_failure(
        &self,
        message_id: Uuid,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        if let Some(message) = state.outbox.iter_mut().find(|m| m.id == message_id) {
            message.last_error = Some(error.to_string());
            message.locked_until = None;
        }
        Ok(())
    }

    async fn get_outbox_message(
        &self,
        message_id: Uuid,
    ) -> Result<Option<OutboxMessage>, StoreError> {
        Ok(self
            .state
            .read()
            .outbox
            .iter()
            .find(|m| m.id == message_id)
            .cloned())
    }

    async fn count_unprocessed_outbox(&self) -> Result<u64, StoreError> {
        Ok(self
            .state
            .read()
            .outbox
            .iter()
            .filter(|m| m.processed_at.is_none())
            .count() as u64)
    }

    async fn purge_processed_outbox(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.write();
        let mut removed = 0usize;
        state.outbox.retain(|m| {
            let expired = removed < limit && m.processed_at.is_some_and(|t| t < older_than);
            if expired {
                removed += 1;
            }
            !expired
        });
        Ok(removed as u64)
    }
}

#[async_trait]
impl InboxStore for InMemoryWorkflowStore {
    async fn apply_inbound(
        &self,
        receipt: InboxReceipt,
        effects: Vec<ConsumerEffect>,
    ) -> Result<InboxOutcome, StoreError> {
        let mut state = self.state.write();
        let key = (receipt.message_id, receipt.consumer.clone());
        if state.inbox.contains_key(&key) {
            return Ok(InboxOutcome::Duplicate);
        }

        let applied = effects.len();
        for effect in effects {
            match effect {
                ConsumerEffect::Notify(n) => state.notifications.push(n),
                ConsumerEffect::Audit(a) => state.audit.push(a),
            }
        }
        state.inbox.insert(key, receipt);

        Ok(InboxOutcome::Applied { effects: applied })
    }

    async fn inbox_contains(&self, message_id: Uuid, consumer: &str) -> Result<bool, StoreError> {
        Ok(self
            .state
            .read()
            .inbox
            .contains_key(&(message_id, consumer.to_string())))
    }

    async fn purge_inbox(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.write();
        let mut removed = 0usize;
        state.inbox.retain(|_, r| {
            let expired = removed < limit && r.received_at < older_than;
            if expired {
                removed += 1;
            }
            !expired
        });
        Ok(removed as u64)
    }

    async fn list_notifications(&self, recipient: &str) -> Result<Vec<Notification>, StoreError> {
        Ok(self
            .state
            .read()
            .notifications
            .iter()
            .filter(|n| n.recipient == recipient)
            .cloned()
            .collect())
    }

    async fn list_audit_entries(&self, instance_id: Uuid) -> Result<Vec<AuditEntry>, StoreError> {
        Ok(self
            .state
            .read()
            .audit
            .iter()
            .filter(|a| a.instance_id == instance_id)
            .cloned()
            .collect())
    }
}
