//! PostgreSQL implementation of the workflow stores
//!
//! Production persistence using PostgreSQL with:
//! - Optimistic concurrency control via the instance `version` column
//! - Serializable transactions for round-robin rotations, retried on
//!   serialization failure and deadlock
//! - Outbox claiming with `FOR UPDATE SKIP LOCKED` and a lease
//! - Inbox receipts keyed by `(message_id, consumer)`

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use super::store::*;
use crate::assignment::round_robin::{select_next, sync_entries};
use crate::assignment::{
    QueueKey, RoundRobinEntry, RoundRobinSelection, RuntimeOverride, SyncReport,
};
use crate::messaging::{
    AuditEntry, ConsumerEffect, InboxOutcome, InboxReceipt, Notification, OutboxMessage,
};
use crate::workflow::{ActivityExecutionRecord, Variables, WorkflowInstance};

const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const UNIQUE_VIOLATION: &str = "23505";

const INSTANCE_COLUMNS: &str = "id, definition_id, definition_version, name, started_by, status, \
     current_activity_id, current_assignee, variables, runtime_overrides, correlation_id, \
     fault_reason, started_at, ended_at, version";

const EXECUTION_COLUMNS: &str = "id, instance_id, activity_id, activity_type, status, assignee, \
     attempt, output, error, started_at, completed_at";

const OUTBOX_COLUMNS: &str = "id, message_type, payload, instance_id, correlation_id, created_at, \
     processed_at, attempts, last_error, locked_until";

const QUEUE_COLUMNS: &str =
    "activity_name, group_set_hash, user_id, assignment_count, last_assigned_at, is_active, groups";

/// Map a driver error, keeping the SQLSTATEs callers act on
fn db_error(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        match db.code().as_deref() {
            Some(SERIALIZATION_FAILURE | DEADLOCK_DETECTED) => {
                return StoreError::SerializationConflict(db.message().to_string());
            }
            Some(UNIQUE_VIOLATION) => return StoreError::Duplicate(db.message().to_string()),
            _ => {}
        }
    }
    StoreError::Database(err.to_string())
}

/// Retry bounds for serializable transactions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializableRetryConfig {
    /// Retries after the first attempt
    pub max_retries: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for SerializableRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(25),
            max_backoff: Duration::from_millis(250),
        }
    }
}

/// Re-run a serializable unit of work while Postgres reports a
/// serialization failure or deadlock
async fn retry_serializable<T, Op, Fut>(
    config: &SerializableRetryConfig,
    operation: &'static str,
    mut op: Op,
) -> Result<T, StoreError>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0usize;
    let mut backoff = config.initial_backoff;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err @ StoreError::SerializationConflict(_)) if attempt < config.max_retries => {
                attempt += 1;
                warn!(operation, attempt, error = %err, "serialization conflict; retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(config.max_backoff);
            }
            Err(err) => return Err(err),
        }
    }
}

fn parse_column<T>(value: String) -> Result<T, StoreError>
where
    T: std::str::FromStr<Err = String>,
{
    value.parse().map_err(StoreError::Serialization)
}

fn instance_from_row(row: &PgRow) -> Result<WorkflowInstance, StoreError> {
    let variables: Json<Variables> = row.get("variables");
    let overrides: Json<BTreeMap<String, RuntimeOverride>> = row.get("runtime_overrides");

    Ok(WorkflowInstance {
        id: row.get("id"),
        definition_id: row.get("definition_id"),
        definition_version: row.get("definition_version"),
        name: row.get("name"),
        started_by: row.get("started_by"),
        status: parse_column(row.get("status"))?,
        current_activity_id: row.get("current_activity_id"),
        current_assignee: row.get("current_assignee"),
        variables: variables.0,
        runtime_overrides: overrides.0,
        correlation_id: row.get("correlation_id"),
        fault_reason: row.get("fault_reason"),
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
        version: row.get("version"),
    })
}

fn record_from_row(row: &PgRow) -> Result<ActivityExecutionRecord, StoreError> {
    Ok(ActivityExecutionRecord {
        id: row.get("id"),
        instance_id: row.get("instance_id"),
        activity_id: row.get("activity_id"),
        activity_type: row.get("activity_type"),
        status: parse_column(row.get("status"))?,
        assignee: row.get("assignee"),
        attempt: row.get::<i32, _>("attempt") as u32,
        output: row.get("output"),
        error: row.get("error"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

fn bookmark_from_row(row: &PgRow) -> Bookmark {
    Bookmark {
        id: row.get("id"),
        instance_id: row.get("instance_id"),
        activity_id: row.get("activity_id"),
        token: row.get("token"),
        assignee: row.get("assignee"),
        created_at: row.get("created_at"),
        consumed_at: row.get("consumed_at"),
    }
}

fn outbox_from_row(row: &PgRow) -> OutboxMessage {
    OutboxMessage {
        id: row.get("id"),
        message_type: row.get("message_type"),
        payload: row.get("payload"),
        instance_id: row.get("instance_id"),
        correlation_id: row.get("correlation_id"),
        created_at: row.get("created_at"),
        processed_at: row.get("processed_at"),
        attempts: row.get::<i32, _>("attempts") as u32,
        last_error: row.get("last_error"),
        locked_until: row.get("locked_until"),
    }
}

fn entry_from_row(row: &PgRow) -> RoundRobinEntry {
    RoundRobinEntry {
        activity_name: row.get("activity_name"),
        group_set_hash: row.get("group_set_hash"),
        user_id: row.get("user_id"),
        assignment_count: row.get("assignment_count"),
        last_assigned_at: row.get("last_assigned_at"),
        is_active: row.get("is_active"),
        groups: row.get("groups"),
    }
}

async fn insert_outbox(conn: &mut PgConnection, message: &OutboxMessage) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO outbox_messages
            (id, message_type, payload, instance_id, correlation_id, created_at, attempts)
        VALUES ($1, $2, $3, $4, $5, $6, 0)
        "#,
    )
    .bind(message.id)
    .bind(&message.message_type)
    .bind(&message.payload)
    .bind(message.instance_id)
    .bind(&message.correlation_id)
    .bind(message.created_at)
    .execute(conn)
    .await
    .map_err(db_error)?;
    Ok(())
}

async fn begin_serializable(pool: &PgPool) -> Result<Transaction<'static, Postgres>, StoreError> {
    let mut tx = pool.begin().await.map_err(db_error)?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;
    Ok(tx)
}

async fn load_rotation(
    conn: &mut PgConnection,
    key: &QueueKey,
) -> Result<Vec<RoundRobinEntry>, StoreError> {
    let rows = sqlx::query(&format!(
        "SELECT {QUEUE_COLUMNS} FROM round_robin_queue \
         WHERE activity_name = $1 AND group_set_hash = $2 \
         ORDER BY user_id FOR UPDATE"
    ))
    .bind(&key.activity_name)
    .bind(&key.group_set_hash)
    .fetch_all(conn)
    .await
    .map_err(db_error)?;

    Ok(rows.iter().map(entry_from_row).collect())
}

/// PostgreSQL implementation of every store trait
///
/// # Example
///
/// ```ignore
/// use appraisal_workflow::PostgresWorkflowStore;
///
/// let store = PostgresWorkflowStore::connect("postgres://localhost/appraisal", 10).await?;
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresWorkflowStore {
    pool: PgPool,
    serializable_retry: SerializableRetryConfig,
}

impl PostgresWorkflowStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            serializable_retry: SerializableRetryConfig::default(),
        }
    }

    pub fn with_serializable_retry(mut self, config: SerializableRetryConfig) -> Self {
        self.serializable_retry = config;
        self
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(db_error)?;
        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    async fn select_next_once(
        &self,
        key: &QueueKey,
    ) -> Result<Option<RoundRobinSelection>, StoreError> {
        let mut tx = begin_serializable(&self.pool).await?;
        let mut entries = load_rotation(&mut *tx, key).await?;

        let Some(selection) = select_next(&mut entries, Utc::now()) else {
            tx.commit().await.map_err(db_error)?;
            return Ok(None);
        };

        for entry in entries.iter().filter(|e| e.is_active) {
            sqlx::query(
                r#"
                UPDATE round_robin_queue
                SET assignment_count = $4, last_assigned_at = $5
                WHERE activity_name = $1 AND group_set_hash = $2 AND user_id = $3
                "#,
            )
            .bind(&key.activity_name)
            .bind(&key.group_set_hash)
            .bind(&entry.user_id)
            .bind(entry.assignment_count)
            .bind(entry.last_assigned_at)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }

        tx.commit().await.map_err(db_error)?;
        Ok(Some(selection))
    }

    async fn sync_once(
        &self,
        key: &QueueKey,
        groups: &[String],
        current_user_ids: &[String],
    ) -> Result<SyncReport, StoreError> {
        let mut tx = begin_serializable(&self.pool).await?;
        let mut entries = load_rotation(&mut *tx, key).await?;
        let report = sync_entries(&mut entries, key, groups, current_user_ids);

        for entry in entries.iter().filter(|e| report.added.contains(&e.user_id)) {
            sqlx::query(
                r#"
                INSERT INTO round_robin_queue
                    (activity_name, group_set_hash, user_id, assignment_count, is_active, groups)
                VALUES ($1, $2, $3, 0, TRUE, $4)
                ON CONFLICT (activity_name, group_set_hash, user_id) DO NOTHING
                "#,
            )
            .bind(&key.activity_name)
            .bind(&key.group_set_hash)
            .bind(&entry.user_id)
            .bind(&entry.groups)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }

        let toggled = report.reactivated.iter().chain(report.deactivated.iter());
        for user_id in toggled {
            let Some(entry) = entries.iter().find(|e| &e.user_id == user_id) else {
                continue;
            };
            sqlx::query(
                r#"
                UPDATE round_robin_queue
                SET is_active = $4, groups = $5
                WHERE activity_name = $1 AND group_set_hash = $2 AND user_id = $3
                "#,
            )
            .bind(&key.activity_name)
            .bind(&key.group_set_hash)
            .bind(&entry.user_id)
            .bind(entry.is_active)
            .bind(&entry.groups)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }

        tx.commit().await.map_err(db_error)?;
        Ok(report)
    }
}

#[async_trait]
impl WorkflowStore for PostgresWorkflowStore {
    #[instrument(skip(self, instance, event), fields(instance_id = %instance.id))]
    async fn create_instance(
        &self,
        instance: &WorkflowInstance,
        event: OutboxMessage,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        sqlx::query(&format!(
            "INSERT INTO workflow_instances ({INSTANCE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, 0)"
        ))
        .bind(instance.id)
        .bind(&instance.definition_id)
        .bind(instance.definition_version)
        .bind(&instance.name)
        .bind(&instance.started_by)
        .bind(instance.status.as_str())
        .bind(&instance.current_activity_id)
        .bind(&instance.current_assignee)
        .bind(Json(&instance.variables))
        .bind(Json(&instance.runtime_overrides))
        .bind(&instance.correlation_id)
        .bind(&instance.fault_reason)
        .bind(instance.started_at)
        .bind(instance.ended_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to create workflow instance: {}", e);
            db_error(e)
        })?;

        insert_outbox(&mut *tx, &event).await?;
        tx.commit().await.map_err(db_error)?;

        debug!(definition_id = %instance.definition_id, "created workflow instance");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_instance(&self, instance_id: Uuid) -> Result<WorkflowInstance, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM workflow_instances WHERE id = $1"
        ))
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?
        .ok_or(StoreError::InstanceNotFound(instance_id))?;

        instance_from_row(&row)
    }

    #[instrument(skip(self, commit), fields(instance_id = %commit.instance.id, expected_version = commit.expected_version))]
    async fn commit_transition(&self, commit: TransitionCommit) -> Result<i64, StoreError> {
        let instance = &commit.instance;
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let current: i64 = sqlx::query("SELECT version FROM workflow_instances WHERE id = $1 FOR UPDATE")
            .bind(instance.id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error)?
            .ok_or(StoreError::InstanceNotFound(instance.id))?
            .get("version");

        if current != commit.expected_version {
            return Err(StoreError::ConcurrencyConflict {
                instance_id: instance.id,
                expected: commit.expected_version,
                actual: current,
            });
        }

        if let Some(bookmark_id) = commit.consume_bookmark {
            let consumed = sqlx::query(
                r#"
                UPDATE workflow_bookmarks
                SET consumed_at = NOW()
                WHERE id = $1 AND consumed_at IS NULL
                "#,
            )
            .bind(bookmark_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

            if consumed.rows_affected() == 0 {
                let existing = sqlx::query("SELECT activity_id FROM workflow_bookmarks WHERE id = $1")
                    .bind(bookmark_id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(db_error)?;
                return Err(match existing {
                    Some(row) => StoreError::BookmarkConsumed {
                        instance_id: instance.id,
                        activity_id: row.get("activity_id"),
                    },
                    None => StoreError::BookmarkNotFound {
                        instance_id: instance.id,
                        activity_id: bookmark_id.to_string(),
                    },
                });
            }
        }

        if let Some(bookmark) = &commit.create_bookmark {
            sqlx::query(
                r#"
                INSERT INTO workflow_bookmarks
                    (id, instance_id, activity_id, token, assignee, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(bookmark.id)
            .bind(bookmark.instance_id)
            .bind(&bookmark.activity_id)
            .bind(&bookmark.token)
            .bind(&bookmark.assignee)
            .bind(bookmark.created_at)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }

        if let Some(record) = &commit.record {
            sqlx::query(&format!(
                "INSERT INTO workflow_activity_executions ({EXECUTION_COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"
            ))
            .bind(record.id)
            .bind(record.instance_id)
            .bind(&record.activity_id)
            .bind(&record.activity_type)
            .bind(record.status.as_str())
            .bind(&record.assignee)
            .bind(record.attempt as i32)
            .bind(&record.output)
            .bind(&record.error)
            .bind(record.started_at)
            .bind(record.completed_at)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }

        let new_version = commit.expected_version + 1;
        sqlx::query(
            r#"
            UPDATE workflow_instances
            SET status = $2,
                current_activity_id = $3,
                current_assignee = $4,
                variables = $5,
                runtime_overrides = $6,
                fault_reason = $7,
                ended_at = $8,
                version = $9,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(instance.id)
        .bind(instance.status.as_str())
        .bind(&instance.current_activity_id)
        .bind(&instance.current_assignee)
        .bind(Json(&instance.variables))
        .bind(Json(&instance.runtime_overrides))
        .bind(&instance.fault_reason)
        .bind(instance.ended_at)
        .bind(new_version)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        insert_outbox(&mut *tx, &commit.event).await?;

        tx.commit().await.map_err(|e| {
            error!("Failed to commit transition: {}", e);
            db_error(e)
        })?;

        debug!(
            status = %instance.status,
            activity_id = ?instance.current_activity_id,
            new_version,
            "committed transition"
        );
        Ok(new_version)
    }

    #[instrument(skip(self))]
    async fn list_history(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<ActivityExecutionRecord>, StoreError> {
        let exists = sqlx::query("SELECT 1 FROM workflow_instances WHERE id = $1")
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
        if exists.is_none() {
            return Err(StoreError::InstanceNotFound(instance_id));
        }

        let rows = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM workflow_activity_executions \
             WHERE instance_id = $1 ORDER BY seq"
        ))
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(record_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn last_completed_assignee(
        &self,
        instance_id: Uuid,
        activity_id: &str,
    ) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT assignee
            FROM workflow_activity_executions
            WHERE instance_id = $1
              AND activity_id = $2
              AND status = 'completed'
              AND assignee IS NOT NULL
            ORDER BY seq DESC
            LIMIT 1
            "#,
        )
        .bind(instance_id)
        .bind(activity_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.map(|r| r.get("assignee")))
    }

    #[instrument(skip(self))]
    async fn latest_bookmark(
        &self,
        instance_id: Uuid,
        activity_id: &str,
    ) -> Result<Option<Bookmark>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, instance_id, activity_id, token, assignee, created_at, consumed_at
            FROM workflow_bookmarks
            WHERE instance_id = $1 AND activity_id = $2
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(instance_id)
        .bind(activity_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.as_ref().map(bookmark_from_row))
    }
}

#[async_trait]
impl RoundRobinStore for PostgresWorkflowStore {
    #[instrument(skip(self))]
    async fn select_next_user_with_round_reset(
        &self,
        activity_name: &str,
        group_set_hash: &str,
    ) -> Result<Option<RoundRobinSelection>, StoreError> {
        let key = QueueKey::new(activity_name, group_set_hash);
        let selection =
            retry_serializable(&self.serializable_retry, "round_robin_select", || {
                self.select_next_once(&key)
            })
            .await?;

        if let Some(s) = &selection {
            debug!(user_id = %s.user_id, round_reset = s.round_reset, "round-robin selection");
        }
        Ok(selection)
    }

    #[instrument(skip(self, groups, current_user_ids), fields(users = current_user_ids.len()))]
    async fn sync_users_for_group_combination(
        &self,
        activity_name: &str,
        group_set_hash: &str,
        groups: &[String],
        current_user_ids: &[String],
    ) -> Result<SyncReport, StoreError> {
        let key = QueueKey::new(activity_name, group_set_hash);
        let report = retry_serializable(&self.serializable_retry, "round_robin_sync", || {
            self.sync_once(&key, groups, current_user_ids)
        })
        .await?;

        if !report.is_noop() {
            debug!(
                added = report.added.len(),
                reactivated = report.reactivated.len(),
                deactivated = report.deactivated.len(),
                "round-robin membership changed"
            );
        }
        Ok(report)
    }

    async fn list_queue_entries(
        &self,
        activity_name: &str,
        group_set_hash: &str,
    ) -> Result<Vec<RoundRobinEntry>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {QUEUE_COLUMNS} FROM round_robin_queue \
             WHERE activity_name = $1 AND group_set_hash = $2 ORDER BY user_id"
        ))
        .bind(activity_name)
        .bind(group_set_hash)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(rows.iter().map(entry_from_row).collect())
    }

    async fn list_queue_keys(&self) -> Result<Vec<(QueueKey, Vec<String>)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (activity_name, group_set_hash)
                   activity_name, group_set_hash, groups
            FROM round_robin_queue
            ORDER BY activity_name, group_set_hash, is_active DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(rows
            .iter()
            .map(|row| {
                (
                    QueueKey::new(
                        row.get::<String, _>("activity_name"),
                        row.get::<String, _>("group_set_hash"),
                    ),
                    row.get("groups"),
                )
            })
            .collect())
    }
}

#[async_trait]
impl OutboxStore for PostgresWorkflowStore {
    #[instrument(skip(self))]
    async fn claim_outbox_batch(
        &self,
        batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            WITH claimable AS (
                SELECT id
                FROM outbox_messages
                WHERE processed_at IS NULL
                  AND (locked_until IS NULL OR locked_until <= NOW())
                ORDER BY created_at, id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox_messages o
            SET locked_until = NOW() + make_interval(secs => $2),
                attempts = o.attempts + 1
            FROM claimable c
            WHERE o.id = c.id
            RETURNING {}
            "#,
            OUTBOX_COLUMNS
                .split(", ")
                .map(|c| format!("o.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .bind(batch_size as i64)
        .bind(lease.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim outbox batch: {}", e);
            db_error(e)
        })?;

        let mut claimed: Vec<OutboxMessage> = rows.iter().map(outbox_from_row).collect();
        claimed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(claimed)
    }

    async fn mark_outbox_processed(&self, message_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE outbox_messages SET processed_at = NOW(), locked_until = NULL WHERE id = $1",
        )
        .bind(message_id)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn record_outbox_failure(
        &self,
        message_id: Uuid,
        error: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE outbox_messages SET last_error = $2, locked_until = NULL WHERE id = $1",
        )
        .bind(message_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn get_outbox_message(
        &self,
        message_id: Uuid,
    ) -> Result<Option<OutboxMessage>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox_messages WHERE id = $1"
        ))
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.as_ref().map(outbox_from_row))
    }

    async fn count_unprocessed_outbox(&self) -> Result<u64, StoreError> {
        let count: i64 =
            sqlx::query("SELECT COUNT(*) AS n FROM outbox_messages WHERE processed_at IS NULL")
                .fetch_one(&self.pool)
                .await
                .map_err(db_error)?
                .get("n");
        Ok(count.max(0) as u64)
    }

    #[instrument(skip(self))]
    async fn purge_processed_outbox(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM outbox_messages
            WHERE id IN (
                SELECT id FROM outbox_messages
                WHERE processed_at IS NOT NULL AND processed_at < $1
                ORDER BY processed_at
                LIMIT $2
            )
            "#,
        )
        .bind(older_than)
        .bind(limit as i64)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl InboxStore for PostgresWorkflowStore {
    #[instrument(skip(self, receipt, effects), fields(message_id = %receipt.message_id, consumer = %receipt.consumer))]
    async fn apply_inbound(
        &self,
        receipt: InboxReceipt,
        effects: Vec<ConsumerEffect>,
    ) -> Result<InboxOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO inbox_messages (message_id, consumer, message_type, received_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (message_id, consumer) DO NOTHING
            "#,
        )
        .bind(receipt.message_id)
        .bind(&receipt.consumer)
        .bind(&receipt.message_type)
        .bind(receipt.received_at)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await.map_err(db_error)?;
            return Ok(InboxOutcome::Duplicate);
        }

        let applied = effects.len();
        for effect in effects {
            match effect {
                ConsumerEffect::Notify(n) => {
                    sqlx::query(
                        r#"
                        INSERT INTO workflow_notifications
                            (id, recipient, instance_id, activity_id, subject, body,
                             source_message_id, created_at)
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                        "#,
                    )
                    .bind(n.id)
                    .bind(&n.recipient)
                    .bind(n.instance_id)
                    .bind(&n.activity_id)
                    .bind(&n.subject)
                    .bind(&n.body)
                    .bind(n.source_message_id)
                    .bind(n.created_at)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_error)?;
                }
                ConsumerEffect::Audit(a) => {
                    sqlx::query(
                        r#"
                        INSERT INTO workflow_audit_log
                            (id, instance_id, activity_id, message_type, assignee,
                             correlation_id, payload, source_message_id, recorded_at)
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                        "#,
                    )
                    .bind(a.id)
                    .bind(a.instance_id)
                    .bind(&a.activity_id)
                    .bind(&a.message_type)
                    .bind(&a.assignee)
                    .bind(&a.correlation_id)
                    .bind(&a.payload)
                    .bind(a.source_message_id)
                    .bind(a.recorded_at)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_error)?;
                }
            }
        }

        tx.commit().await.map_err(db_error)?;
        Ok(InboxOutcome::Applied { effects: applied })
    }

    async fn inbox_contains(&self, message_id: Uuid, consumer: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT 1 AS present FROM inbox_messages WHERE message_id = $1 AND consumer = $2",
        )
        .bind(message_id)
        .bind(consumer)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(row.is_some())
    }

    #[instrument(skip(self))]
    async fn purge_inbox(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM inbox_messages
            WHERE (message_id, consumer) IN (
                SELECT message_id, consumer FROM inbox_messages
                WHERE received_at < $1
                ORDER BY received_at
                LIMIT $2
            )
            "#,
        )
        .bind(older_than)
        .bind(limit as i64)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected())
    }

    async fn list_notifications(&self, recipient: &str) -> Result<Vec<Notification>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, recipient, instance_id, activity_id, subject, body,
                   source_message_id, created_at
            FROM workflow_notifications
            WHERE recipient = $1
            ORDER BY created_at, id
            "#,
        )
        .bind(recipient)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(rows
            .iter()
            .map(|row| Notification {
                id: row.get("id"),
                recipient: row.get("recipient"),
                instance_id: row.get("instance_id"),
                activity_id: row.get("activity_id"),
                subject: row.get("subject"),
                body: row.get("body"),
                source_message_id: row.get("source_message_id"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    async fn list_audit_entries(&self, instance_id: Uuid) -> Result<Vec<AuditEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, instance_id, activity_id, message_type, assignee, correlation_id,
                   payload, source_message_id, recorded_at
            FROM workflow_audit_log
            WHERE instance_id = $1
            ORDER BY recorded_at, id
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(rows
            .iter()
            .map(|row| AuditEntry {
                id: row.get("id"),
                instance_id: row.get("instance_id"),
                activity_id: row.get("activity_id"),
                message_type: row.get("message_type"),
                assignee: row.get("assignee"),
                correlation_id: row.get("correlation_id"),
                payload: row.get("payload"),
                source_message_id: row.get("source_message_id"),
                recorded_at: row.get("recorded_at"),
            })
            .collect())
    }
}
