//! Shared fixtures for the orchestration tests

#![allow(dead_code)]

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use appraisal_workflow::activity::HumanTaskActivity;
use appraisal_workflow::assignment::{RuntimeOverride, StaticUserDirectory};
use appraisal_workflow::prelude::*;

pub const APPRAISERS: [&str; 3] = ["alice", "bob", "carol"];

/// start → submit → admin_review ⇄ requester_update, admin_review → end
pub fn appraisal_definition() -> WorkflowDefinition {
    WorkflowDefinition::new("appraisal", "Appraisal request")
        .with_activity(ActivityDefinition::new("start", "Start").start())
        .with_activity(
            ActivityDefinition::new("submit", "SetVariables")
                .with_property("values", json!({"submitted": true})),
        )
        .with_activity(
            ActivityDefinition::new("admin_review", "AdminReview")
                .named("AdminReview")
                .with_property("candidate_groups", json!(["appraisers"]))
                .with_property("admin_pool", "appraisal-admins")
                .with_assignment(vec![
                    StrategyKind::PreviousOwner,
                    StrategyKind::RoundRobin,
                    StrategyKind::AdminPool,
                ]),
        )
        .with_activity(
            ActivityDefinition::new("requester_update", "HumanTask")
                .with_property("decisions", json!(["resubmit"]))
                .with_property("reason_required_for", json!([]))
                .with_assignment(vec![StrategyKind::Manual, StrategyKind::AdminPool]),
        )
        .with_activity(ActivityDefinition::new("end", "End").end())
        .with_transition(TransitionDefinition::new("start", "submit"))
        .with_transition(TransitionDefinition::new("submit", "admin_review"))
        .with_transition(
            TransitionDefinition::new("admin_review", "requester_update")
                .when(Condition::equals("decision", "route_back")),
        )
        .with_transition(TransitionDefinition::new("admin_review", "end"))
        .with_transition(TransitionDefinition::new("requester_update", "admin_review"))
}

pub fn catalog() -> ActivityCatalog {
    ActivityCatalog::with_builtins()
        .with(Arc::new(HumanTaskActivity::new("AdminReview")))
        .expect("AdminReview registers once")
}

pub fn directory() -> Arc<StaticUserDirectory> {
    Arc::new(StaticUserDirectory::from_groups([(
        "appraisers",
        APPRAISERS.to_vec(),
    )]))
}

pub fn orchestrator_with(
    store: Arc<InMemoryWorkflowStore>,
    directory: Arc<StaticUserDirectory>,
) -> Orchestrator<InMemoryWorkflowStore> {
    let definitions = DefinitionRegistry::new(Arc::new(catalog()))
        .with(appraisal_definition())
        .expect("appraisal definition is valid");
    let resolver =
        AssignmentResolver::standard(store.clone(), store.clone(), directory, None);
    let config = OrchestratorConfig::default().with_retry_policy(
        RetryPolicy::fixed(std::time::Duration::from_millis(1), 3),
    );
    Orchestrator::with_config(store, Arc::new(definitions), Arc::new(resolver), config)
}

pub fn orchestrator() -> Orchestrator<InMemoryWorkflowStore> {
    orchestrator_with(Arc::new(InMemoryWorkflowStore::new()), directory())
}

pub fn start_request(name: &str) -> StartWorkflowRequest {
    StartWorkflowRequest::new("appraisal", name, "requester")
        .with_variable("amount", 450_000)
        .with_correlation_id(format!("corr-{name}"))
        .with_override("requester_update", RuntimeOverride::assign_to("requester"))
}

pub async fn start(orch: &Orchestrator<InMemoryWorkflowStore>, name: &str) -> WorkflowRunResponse {
    orch.start_workflow(start_request(name))
        .await
        .expect("workflow starts")
}

pub async fn assignee_of(orch: &Orchestrator<InMemoryWorkflowStore>, id: Uuid) -> Option<String> {
    orch.get_instance(id)
        .await
        .expect("instance exists")
        .current_assignee
}
