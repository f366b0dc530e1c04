//! Background housekeeping loops run by the worker

mod cleanup;
mod membership_sync;

pub use cleanup::{CleanupReport, RetentionCleanupTask, RetentionConfig};
pub use membership_sync::{MembershipSyncConfig, MembershipSyncReport, MembershipSyncTask};
