//! Orchestration engine
//!
//! - [`Orchestrator`] starts, drives, resumes and cancels instances
//! - [`DefinitionRegistry`] holds the validated workflow definitions
//! - [`OrchestratorConfig`] carries the step budget, timeouts and retries

mod config;
mod orchestrator;
mod registry;
mod resume;

pub use config::OrchestratorConfig;
pub use orchestrator::{
    Orchestrator, OrchestratorError, StartWorkflowRequest, WorkflowRunResponse,
    STEP_BUDGET_EXHAUSTED, UNKNOWN_ACTIVITY_TYPE,
};
pub use registry::DefinitionRegistry;
