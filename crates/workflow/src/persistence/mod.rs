//! Persistence layer
//!
//! This module provides:
//! - [`WorkflowStore`] for instances, history and bookmarks
//! - [`RoundRobinStore`] for race-free assignment rotations
//! - [`OutboxStore`] and [`InboxStore`] for reliable messaging
//! - [`InMemoryWorkflowStore`] for testing and local development
//! - [`PostgresWorkflowStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryWorkflowStore;
pub use postgres::{PostgresWorkflowStore, SerializableRetryConfig};
pub use store::{
    Bookmark, InboxStore, OutboxStore, RoundRobinStore, StoreError, TransitionCommit,
    WorkflowStore,
};
