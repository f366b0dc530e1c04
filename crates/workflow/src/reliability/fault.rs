//! Fault classification and retry decisions
//!
//! Only in-flight faults go through the handler. A startup fault happens
//! before an instance exists and is returned from `start_workflow` as a
//! plain error with nothing persisted. An in-flight fault happens while an
//! instance is executing; once retries are exhausted the instance is moved
//! to `Faulted` with a reason.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::RetryPolicy;
use crate::activity::{error_types, ActivityError};
use crate::persistence::StoreError;

/// Category of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Broken definition or catalog wiring; retrying cannot help
    Configuration,
    /// Bad input from the caller
    Validation,
    /// Timeouts, lost connections, serialization conflicts
    Transient,
    /// Business failure reported by the activity
    Permanent,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Validation => "validation",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }
}

/// What to do about a fault
#[derive(Debug, Clone, PartialEq)]
pub enum FaultDecision {
    Retry { next_attempt: u32, delay: Duration },
    Fail { kind: FaultKind, reason: String },
}

/// Decides between retrying and failing
#[derive(Debug, Clone, Default)]
pub struct FaultHandler {
    policy: RetryPolicy,
}

impl FaultHandler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Engine-wide default policy
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Classify an activity error under a given policy
    pub fn classify(error: &ActivityError, policy: &RetryPolicy) -> FaultKind {
        match error.error_type.as_deref() {
            Some(error_types::VALIDATION) => FaultKind::Validation,
            Some(
                error_types::CONFIGURATION
                | error_types::UNKNOWN_ACTIVITY_TYPE
                | error_types::MISSING_PROPERTY
                | error_types::NO_MATCHING_TRANSITION
                | error_types::NOT_RESUMABLE,
            ) => FaultKind::Configuration,
            other if policy.excludes(other) => FaultKind::Permanent,
            _ if error.retryable => FaultKind::Transient,
            _ => FaultKind::Permanent,
        }
    }

    /// Decide what happens after `attempt` failed with `error`
    ///
    /// Only transient faults are retried, and only while the policy has
    /// attempts left.
    pub fn decide(
        &self,
        attempt: u32,
        error: &ActivityError,
        policy: &RetryPolicy,
    ) -> FaultDecision {
        let kind = Self::classify(error, policy);

        if kind == FaultKind::Transient && policy.has_attempts_remaining(attempt) {
            let next_attempt = attempt + 1;
            return FaultDecision::Retry {
                next_attempt,
                delay: policy.delay_for_attempt(next_attempt),
            };
        }

        let reason = match kind {
            FaultKind::Transient => format!(
                "{}: {} (gave up after {} attempts)",
                kind.as_str(),
                error.message,
                attempt
            ),
            _ => format!("{}: {}", kind.as_str(), error.message),
        };

        FaultDecision::Fail { kind, reason }
    }

    /// Run a store operation, retrying transient store errors under the
    /// default policy
    pub async fn retry_store<T, F, Fut>(
        &self,
        operation: &'static str,
        mut op: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && self.policy.has_attempts_remaining(attempt) => {
                    attempt += 1;
                    let delay = self.policy.delay_for_attempt(attempt);
                    warn!(operation, attempt, ?delay, error = %e, "retrying store operation");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
