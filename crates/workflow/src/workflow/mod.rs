//! Workflow model
//!
//! This module contains the data the orchestrator works on:
//! - [`WorkflowDefinition`]: the activity graph with conditional transitions
//! - [`WorkflowInstance`]: the persistent state machine of one execution
//! - [`ActivityExecutionRecord`]: append-only history
//! - [`WorkflowEvent`]: integration events written to the outbox

mod condition;
mod definition;
mod event;
mod instance;

pub use condition::Condition;
pub use definition::{
    ActivityDefinition, DefinitionError, TransitionDefinition, WorkflowDefinition,
};
pub use event::{WorkflowEvent, WorkflowEventKind};
pub use instance::{
    ActivityExecutionRecord, ExecutionStatus, InstanceStatus, InvalidTransition,
    WorkflowInstance,
};

/// Instance variables: a JSON object with deterministic key order
pub type Variables = serde_json::Map<String, serde_json::Value>;
