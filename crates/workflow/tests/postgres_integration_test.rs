//! Integration tests for PostgresWorkflowStore
//!
//! Run with: DATABASE_URL=postgres://... cargo test -p appraisal-workflow --test postgres_integration_test
//!
//! Every test returns early when DATABASE_URL is not set. Migrations are
//! applied by the tests themselves.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use appraisal_workflow::assignment::{group_set_hash, AssignmentResolver, StaticUserDirectory};
use appraisal_workflow::messaging::{InboxOutcome, InboxReceipt, OutboxMessage};
use appraisal_workflow::persistence::{
    InboxStore, OutboxStore, PostgresWorkflowStore, RoundRobinStore, StoreError, WorkflowStore,
};
use appraisal_workflow::prelude::{
    DefinitionRegistry, InstanceStatus, Orchestrator, OrchestratorConfig, RetryPolicy,
};
use appraisal_workflow::workflow::{WorkflowEvent, WorkflowEventKind, WorkflowInstance};

/// Database URL from the environment; `None` skips the test
fn get_database_url() -> Option<String> {
    std::env::var("DATABASE_URL").ok()
}

async fn create_test_store() -> Option<Arc<PostgresWorkflowStore>> {
    let database_url = get_database_url()?;
    let store = PostgresWorkflowStore::connect(&database_url, 10)
        .await
        .expect("Failed to connect to PostgreSQL. Check DATABASE_URL.");
    store.migrate().await.expect("migrations apply");
    Some(Arc::new(store))
}

async fn cleanup_instance(store: &PostgresWorkflowStore, instance_id: Uuid) {
    for table in [
        "workflow_activity_executions",
        "workflow_bookmarks",
        "outbox_messages",
    ] {
        sqlx::query(&format!("DELETE FROM {table} WHERE instance_id = $1"))
            .bind(instance_id)
            .execute(store.pool())
            .await
            .ok();
    }
    sqlx::query("DELETE FROM workflow_instances WHERE id = $1")
        .bind(instance_id)
        .execute(store.pool())
        .await
        .ok();
}

fn started_event(instance: &WorkflowInstance) -> OutboxMessage {
    OutboxMessage::from_event(&WorkflowEvent::for_instance(
        instance,
        Some("start"),
        WorkflowEventKind::WorkflowStarted {
            definition_version: 1,
        },
    ))
    .unwrap()
}

// ============================================
// Instance Tests
// ============================================

#[tokio::test]
async fn test_create_and_get_instance() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let mut instance = WorkflowInstance::new("appraisal", 1, "APR-PG-1", "requester", "start");
    instance
        .variables
        .insert("amount".into(), json!(450000));

    store
        .create_instance(&instance, started_event(&instance))
        .await
        .unwrap();
    let loaded = store.get_instance(instance.id).await.unwrap();

    assert_eq!(loaded.id, instance.id);
    assert_eq!(loaded.status, InstanceStatus::Running);
    assert_eq!(loaded.current_activity_id.as_deref(), Some("start"));
    assert_eq!(loaded.variables["amount"], 450000);
    assert_eq!(loaded.version, 0);

    cleanup_instance(&store, instance.id).await;
}

#[tokio::test]
async fn test_missing_instance_is_not_found() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let err = store.get_instance(Uuid::now_v7()).await.unwrap_err();
    assert!(matches!(err, StoreError::InstanceNotFound(_)));
}

// ============================================
// Orchestration Tests
// ============================================

#[tokio::test]
async fn test_appraisal_flow_on_postgres() {
    let Some(store) = create_test_store().await else {
        return;
    };

    // Fresh rotation per run: unique group name
    let group = format!("appraisers-{}", Uuid::now_v7());
    let directory = Arc::new(StaticUserDirectory::from_groups([(
        group.as_str(),
        vec!["alice", "bob"],
    )]));
    let mut definition = common::appraisal_definition();
    for activity in definition.activities.iter_mut().filter(|a| a.id == "admin_review") {
        activity
            .properties
            .insert("candidate_groups".into(), json!([group.clone()]));
    }

    let registry = DefinitionRegistry::new(Arc::new(common::catalog()))
        .with(definition)
        .unwrap();
    let resolver =
        AssignmentResolver::standard(store.clone(), store.clone(), directory, None);
    let orch = Orchestrator::with_config(
        store.clone(),
        Arc::new(registry),
        Arc::new(resolver),
        OrchestratorConfig::default()
            .with_retry_policy(RetryPolicy::fixed(Duration::from_millis(5), 3)),
    );

    let run = orch
        .start_workflow(common::start_request("APR-PG-2"))
        .await
        .unwrap();
    assert_eq!(run.status, InstanceStatus::Suspended);
    assert_eq!(run.next_assignee.as_deref(), Some("alice"));

    let done = orch
        .resume_activity(
            run.instance_id,
            "admin_review",
            json!({"decision": "approve", "completed_by": "alice"}),
        )
        .await
        .unwrap();
    assert_eq!(done.status, InstanceStatus::Completed);

    let conflict = orch
        .resume_activity(
            run.instance_id,
            "admin_review",
            json!({"decision": "approve", "completed_by": "alice"}),
        )
        .await
        .unwrap_err();
    assert_eq!(conflict.code(), "BOOKMARK_CONFLICT");

    let history = orch.get_history(run.instance_id).await.unwrap();
    assert_eq!(history.last().map(|r| r.activity_id.as_str()), Some("end"));
    assert_eq!(
        store.last_completed_assignee(run.instance_id, "admin_review").await.unwrap().as_deref(),
        Some("alice")
    );

    cleanup_instance(&store, run.instance_id).await;
}

// ============================================
// Round-Robin Tests
// ============================================

#[tokio::test]
async fn test_concurrent_round_robin_on_postgres() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let activity = format!("AdminReview-{}", Uuid::now_v7());
    let groups = vec!["appraisers".to_string()];
    let hash = group_set_hash(&groups);
    let users: Vec<String> = common::APPRAISERS.iter().map(|u| u.to_string()).collect();

    store
        .sync_users_for_group_combination(&activity, &hash, &groups, &users)
        .await
        .unwrap();

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let store = store.clone();
            let activity = activity.clone();
            let hash = hash.clone();
            tokio::spawn(async move {
                store
                    .select_next_user_with_round_reset(&activity, &hash)
                    .await
                    .unwrap()
                    .unwrap()
                    .user_id
            })
        })
        .collect();

    let mut tally: BTreeMap<String, usize> = BTreeMap::new();
    for handle in handles {
        *tally.entry(handle.await.unwrap()).or_default() += 1;
    }
    assert_eq!(tally.values().copied().collect::<Vec<_>>(), [4, 3, 3]);

    sqlx::query("DELETE FROM round_robin_queue WHERE activity_name = $1")
        .bind(&activity)
        .execute(store.pool())
        .await
        .ok();
}

// ============================================
// Outbox / Inbox Tests
// ============================================

#[tokio::test]
async fn test_outbox_claim_lease_and_inbox_dedup() {
    let Some(store) = create_test_store().await else {
        return;
    };
    let instance = WorkflowInstance::new("appraisal", 1, "APR-PG-3", "requester", "start");
    let event = started_event(&instance);
    let event_id = event.id;
    store.create_instance(&instance, event).await.unwrap();

    // Other tests may leave rows behind; only look at ours
    let claimed = store
        .claim_outbox_batch(1000, Duration::from_secs(30))
        .await
        .unwrap();
    let ours = claimed.iter().find(|m| m.id == event_id).cloned().unwrap();

    let reclaimed = store
        .claim_outbox_batch(1000, Duration::from_secs(30))
        .await
        .unwrap();
    assert!(reclaimed.iter().all(|m| m.id != event_id));

    store
        .record_outbox_failure(event_id, "broker unavailable")
        .await
        .unwrap();
    let failed = store.get_outbox_message(event_id).await.unwrap().unwrap();
    assert_eq!(failed.last_error.as_deref(), Some("broker unavailable"));
    assert!(!failed.is_processed());

    store.mark_outbox_processed(event_id).await.unwrap();
    assert!(store
        .get_outbox_message(event_id)
        .await
        .unwrap()
        .unwrap()
        .is_processed());

    let first = store
        .apply_inbound(InboxReceipt::new(&ours, "audit"), Vec::new())
        .await
        .unwrap();
    let second = store
        .apply_inbound(InboxReceipt::new(&ours, "audit"), Vec::new())
        .await
        .unwrap();
    assert_eq!(
        (first, second),
        (
            InboxOutcome::Applied { effects: 0 },
            InboxOutcome::Duplicate
        )
    );

    sqlx::query("DELETE FROM inbox_messages WHERE message_id = $1")
        .bind(event_id)
        .execute(store.pool())
        .await
        .ok();
    cleanup_instance(&store, instance.id).await;
}
