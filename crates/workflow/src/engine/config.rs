//! Orchestrator configuration

use std::time::Duration;

use crate::reliability::RetryPolicy;

/// Configuration for the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum activities executed by one start or resume call before the
    /// instance is faulted
    pub max_steps: usize,

    /// Timeout used when neither the activity nor its behavior sets one
    pub default_activity_timeout: Duration,

    /// Retry policy used when neither the activity nor its behavior sets one
    pub retry_policy: RetryPolicy,

    /// Commits tried by `cancel_workflow` while the instance keeps changing
    /// underneath it
    pub cancel_attempts: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_steps: 100,
            default_activity_timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
            cancel_attempts: 5,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    pub fn with_default_activity_timeout(mut self, timeout: Duration) -> Self {
        self.default_activity_timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_cancel_attempts(mut self, attempts: u32) -> Self {
        self.cancel_attempts = attempts.max(1);
        self
    }
}
