//! # Appraisal Workflow Orchestration Core
//!
//! Drives appraisal requests through a graph of activities, assigns human
//! tasks fairly and publishes every state change reliably.
//!
//! ## Features
//!
//! - **Persistent state machine**: instances move `Running → Suspended →
//!   Running → … → Completed | Faulted | Cancelled`, with an append-only
//!   execution history
//! - **Assignment strategies**: manual, round-robin, previous owner and admin
//!   pool, tried in a configurable order
//! - **Race-free round-robin**: smallest count wins, ties by user id, and the
//!   round resets once every active user has been picked
//! - **Bookmarks**: human tasks suspend the instance; a single-use bookmark
//!   resumes it
//! - **Transactional outbox/inbox**: one event per transition, delivered
//!   at least once and applied at most once per consumer
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Orchestrator                          │
//! │  (start / resume / cancel, step loop, fault handling)        │
//! └─────────────────────────────────────────────────────────────┘
//!           │                    │                     │
//!           ▼                    ▼                     ▼
//! ┌──────────────────┐ ┌──────────────────┐ ┌────────────────────┐
//! │ ActivityCatalog  │ │AssignmentResolver│ │   WorkflowStore    │
//! │ (behaviors)      │ │ (strategies, RR) │ │ (instances, outbox)│
//! └──────────────────┘ └──────────────────┘ └────────────────────┘
//!                                                      │
//!                                                      ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │        OutboxDispatcher → MessagePublisher → InboxProcessor   │
//! │  (notifications, audit log)                                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use appraisal_workflow::prelude::*;
//!
//! let store = Arc::new(InMemoryWorkflowStore::new());
//! let catalog = Arc::new(ActivityCatalog::with_builtins());
//! let definitions = DefinitionRegistry::new(catalog).with(appraisal_definition())?;
//! let resolver = AssignmentResolver::standard(store.clone(), store.clone(), directory, None);
//!
//! let orchestrator = Orchestrator::new(store, Arc::new(definitions), Arc::new(resolver));
//! let run = orchestrator
//!     .start_workflow(StartWorkflowRequest::new("appraisal", "APR-1042", "requester"))
//!     .await?;
//! ```

pub mod activity;
pub mod assignment;
pub mod engine;
pub mod maintenance;
pub mod messaging;
pub mod persistence;
pub mod reliability;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{
        ActivityBehavior, ActivityCatalog, ActivityContext, ActivityDescriptor, ActivityError,
        ActivityResult, HumanTaskActivity,
    };
    pub use crate::assignment::{
        AssignmentResolver, RuntimeOverride, StaticUserDirectory, StrategyKind, UserDirectory,
    };
    pub use crate::engine::{
        DefinitionRegistry, Orchestrator, OrchestratorConfig, OrchestratorError,
        StartWorkflowRequest, WorkflowRunResponse,
    };
    pub use crate::messaging::{
        AuditConsumer, InboxProcessor, NotificationConsumer, OutboxDispatcher,
        OutboxDispatcherConfig,
    };
    pub use crate::persistence::{
        InMemoryWorkflowStore, PostgresWorkflowStore, StoreError, WorkflowStore,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::workflow::{
        ActivityDefinition, Condition, InstanceStatus, TransitionDefinition, WorkflowDefinition,
    };
}

// Re-export key types at crate root
pub use activity::{ActivityBehavior, ActivityCatalog, ActivityContext, ActivityError, ActivityResult};
pub use assignment::{AssignmentResolver, StrategyKind};
pub use engine::{
    DefinitionRegistry, Orchestrator, OrchestratorConfig, OrchestratorError, StartWorkflowRequest,
    WorkflowRunResponse,
};
pub use persistence::{InMemoryWorkflowStore, PostgresWorkflowStore, StoreError, WorkflowStore};
pub use reliability::RetryPolicy;
pub use workflow::{InstanceStatus, WorkflowDefinition, WorkflowInstance};
