//! Activity abstractions
//!
//! Activities are the nodes of a workflow definition. Each activity type
//! maps to an [`ActivityBehavior`] registered in the [`ActivityCatalog`].
//! Behaviors:
//! - Receive everything through an [`ActivityContext`]
//! - May fail and be retried according to the retry policy
//! - May suspend the instance by returning a pending result

mod builtin;
mod catalog;
mod context;
mod definition;

pub use builtin::{
    EndActivity, HumanTaskActivity, NotificationActivity, SetVariablesActivity, StartActivity,
};
pub use catalog::{ActivityCatalog, CatalogError};
pub use context::ActivityContext;
pub use definition::{
    error_types, ActivityBehavior, ActivityDescriptor, ActivityError, ActivityResult,
    ActivityStatus,
};
