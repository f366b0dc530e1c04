//! Integration events emitted through the outbox
//!
//! Every committed transition produces exactly one event. Events are the
//! only way other services learn about workflow progress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ExecutionStatus, WorkflowInstance};
use crate::assignment::StrategyKind;

/// What happened
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEventKind {
    WorkflowStarted {
        definition_version: i32,
    },
    ActivityCompleted {
        status: ExecutionStatus,
        next_activity_id: Option<String>,
    },
    TaskAssigned {
        assignee_group: Option<String>,
        strategy: Option<StrategyKind>,
    },
    WorkflowCompleted,
    WorkflowFaulted {
        reason: String,
    },
    WorkflowCancelled {
        reason: String,
    },
}

impl WorkflowEventKind {
    /// Message type used on the wire and in the outbox table
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow.started",
            Self::ActivityCompleted { .. } => "workflow.activity_completed",
            Self::TaskAssigned { .. } => "workflow.task_assigned",
            Self::WorkflowCompleted => "workflow.completed",
            Self::WorkflowFaulted { .. } => "workflow.faulted",
            Self::WorkflowCancelled { .. } => "workflow.cancelled",
        }
    }
}

/// Event envelope carrying the instance context
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowEvent {
    pub instance_id: Uuid,
    pub definition_id: String,
    pub started_by: String,
    pub activity_id: Option<String>,
    pub assignee: Option<String>,
    pub correlation_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: WorkflowEventKind,
}

impl WorkflowEvent {
    /// Build an event for an instance about a specific activity
    pub fn for_instance(
        instance: &WorkflowInstance,
        activity_id: Option<&str>,
        kind: WorkflowEventKind,
    ) -> Self {
        Self {
            instance_id: instance.id,
            definition_id: instance.definition_id.clone(),
            started_by: instance.started_by.clone(),
            activity_id: activity_id.map(str::to_string),
            assignee: instance.current_assignee.clone(),
            correlation_id: instance.correlation_id.clone(),
            occurred_at: Utc::now(),
            kind,
        }
    }

    pub fn message_type(&self) -> &'static str {
        self.kind.message_type()
    }
}
