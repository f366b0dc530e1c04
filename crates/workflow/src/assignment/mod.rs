//! Assignee resolution for human tasks
//!
//! - [`AssignmentResolver`] walks an ordered list of [`StrategyKind`]s
//! - [`round_robin`] holds the fairness rules shared by every queue store
//! - [`UserDirectory`] supplies group membership

mod directory;
mod resolver;
pub mod round_robin;
mod strategies;
mod strategy;

pub use directory::{DirectoryError, StaticUserDirectory, UserDirectory};
pub use resolver::AssignmentResolver;
pub use round_robin::{
    group_set_hash, QueueKey, RoundRobinEntry, RoundRobinSelection, SyncReport,
};
pub use strategies::{AdminPoolStrategy, ManualStrategy, PreviousOwnerStrategy, RoundRobinStrategy};
pub use strategy::{
    properties, AssigneeSelectionResult, AssignmentError, AssignmentRequest, AssignmentStrategy,
    RuntimeOverride, StrategyKind,
};
