//! Activity behavior trait, results and errors

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ActivityContext;
use crate::assignment::AssigneeSelectionResult;
use crate::reliability::RetryPolicy;
use crate::workflow::{ExecutionStatus, Variables};

/// Well-known error types used for fault classification
pub mod error_types {
    pub const VALIDATION: &str = "VALIDATION";
    pub const CONFIGURATION: &str = "CONFIGURATION";
    pub const UNKNOWN_ACTIVITY_TYPE: &str = "UNKNOWN_ACTIVITY_TYPE";
    pub const MISSING_PROPERTY: &str = "MISSING_PROPERTY";
    pub const NO_MATCHING_TRANSITION: &str = "NO_MATCHING_TRANSITION";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const ASSIGNMENT_FAILED: &str = "ASSIGNMENT_FAILED";
    pub const NOT_RESUMABLE: &str = "NOT_RESUMABLE";
}

/// Error type for activity failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityError {
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Whether this error is retryable
    ///
    /// Non-retryable errors fault the instance without further attempts.
    pub retryable: bool,

    pub details: Option<Value>,
}

impl ActivityError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            details: None,
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
            details: None,
        }
    }

    /// Caller input was rejected; state must not change
    pub fn validation(message: impl Into<String>) -> Self {
        Self::non_retryable(message).with_type(error_types::VALIDATION)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::non_retryable(message).with_type(error_types::CONFIGURATION)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::retryable(format!("activity timed out after {}ms", after.as_millis()))
            .with_type(error_types::TIMEOUT)
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_validation(&self) -> bool {
        self.error_type.as_deref() == Some(error_types::VALIDATION)
    }

    /// Machine-readable code, defaulting to `ACTIVITY_FAILED`
    pub fn code(&self) -> &str {
        self.error_type.as_deref().unwrap_or("ACTIVITY_FAILED")
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActivityError {}

/// Outcome status reported by a behavior
pub type ActivityStatus = ExecutionStatus;

/// What a behavior hands back to the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityResult {
    pub status: ActivityStatus,

    /// Stored on the execution record
    pub output: Value,

    /// Merged into the instance variables on completion
    pub variable_updates: Variables,

    /// Overrides transition evaluation when set
    pub next_activity_id: Option<String>,

    /// Who the activity waits for (pending results)
    pub assignment: Option<AssigneeSelectionResult>,

    /// Who completed the work; recorded on the execution record
    pub performed_by: Option<String>,

    /// Set on failed results
    pub error: Option<ActivityError>,
}

impl ActivityResult {
    fn with_status(status: ActivityStatus) -> Self {
        Self {
            status,
            output: Value::Null,
            variable_updates: Variables::new(),
            next_activity_id: None,
            assignment: None,
            performed_by: None,
            error: None,
        }
    }

    pub fn completed() -> Self {
        Self::with_status(ExecutionStatus::Completed)
    }

    pub fn skipped() -> Self {
        Self::with_status(ExecutionStatus::Skipped)
    }

    /// Suspend the instance waiting for the selected assignee
    pub fn pending(assignment: AssigneeSelectionResult) -> Self {
        Self {
            assignment: Some(assignment),
            ..Self::with_status(ExecutionStatus::Pending)
        }
    }

    pub fn failed(error: ActivityError) -> Self {
        Self {
            error: Some(error),
            ..Self::with_status(ExecutionStatus::Failed)
        }
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = output;
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variable_updates.insert(key.into(), value.into());
        self
    }

    pub fn with_variables(mut self, updates: Variables) -> Self {
        self.variable_updates.extend(updates);
        self
    }

    pub fn with_next_activity(mut self, activity_id: impl Into<String>) -> Self {
        self.next_activity_id = Some(activity_id.into());
        self
    }

    pub fn with_performed_by(mut self, user_id: impl Into<String>) -> Self {
        self.performed_by = Some(user_id.into());
        self
    }

    pub fn is_failed(&self) -> bool {
        self.status == ExecutionStatus::Failed
    }
}

/// Static metadata a behavior publishes to the catalog
#[derive(Debug, Clone, Default)]
pub struct ActivityDescriptor {
    /// Catalog key
    pub activity_type: String,

    /// Properties every activity of this type must declare
    pub required_properties: Vec<String>,

    /// Whether the behavior accepts `resume`
    pub resumable: bool,

    pub timeout: Option<Duration>,

    pub retry_policy: Option<RetryPolicy>,
}

impl ActivityDescriptor {
    pub fn new(activity_type: impl Into<String>) -> Self {
        Self {
            activity_type: activity_type.into(),
            ..Default::default()
        }
    }

    pub fn requires(mut self, property: impl Into<String>) -> Self {
        self.required_properties.push(property.into());
        self
    }

    pub fn resumable(mut self) -> Self {
        self.resumable = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
}

/// The code behind an activity type
///
/// Behaviors are stateless; everything they need arrives through the
/// [`ActivityContext`]. Returning `Err` is equivalent to returning a
/// failed [`ActivityResult`].
///
/// # Example
///
/// ```ignore
/// struct ValidateDocuments;
///
/// #[async_trait]
/// impl ActivityBehavior for ValidateDocuments {
///     fn descriptor(&self) -> ActivityDescriptor {
///         ActivityDescriptor::new("ValidateDocuments").requires("document_kinds")
///     }
///
///     async fn execute(&self, ctx: &ActivityContext) -> Result<ActivityResult, ActivityError> {
///         let ok = ctx.variable("documents").is_some();
///         Ok(ActivityResult::completed().with_variable("documents_valid", ok))
///     }
/// }
/// ```
#[async_trait]
pub trait ActivityBehavior: Send + Sync + 'static {
    fn descriptor(&self) -> ActivityDescriptor;

    async fn execute(&self, ctx: &ActivityContext) -> Result<ActivityResult, ActivityError>;

    /// Continue a suspended activity with external input
    async fn resume(
        &self,
        ctx: &ActivityContext,
        _input: &Value,
    ) -> Result<ActivityResult, ActivityError> {
        Err(ActivityError::configuration(format!(
            "activity {} of type {} cannot be resumed",
            ctx.activity_id(),
            self.descriptor().activity_type
        ))
        .with_type(error_types::NOT_RESUMABLE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_activity_error_constructors() {
        assert!(ActivityError::retryable("timeout").retryable);
        assert!(!ActivityError::non_retryable("invalid").retryable);
        assert!(ActivityError::validation("missing decision").is_validation());
        assert_eq!(ActivityError::configuration("x").code(), "CONFIGURATION");
        assert_eq!(ActivityError::non_retryable("x").code(), "ACTIVITY_FAILED");

        let timeout = ActivityError::timeout(Duration::from_millis(1500));
        assert!(timeout.retryable);
        assert_eq!(timeout.message, "activity timed out after 1500ms");
    }

    #[test]
    fn test_activity_error_serialization() {
        let error = ActivityError::retryable("test error")
            .with_type("TEST")
            .with_details(json!({"key": "value"}));

        let json = serde_json::to_string(&error).unwrap();
        let parsed: ActivityError = serde_json::from_str(&json).unwrap();
        assert_eq!(error, parsed);
    }

    #[test]
    fn test_result_builders() {
        let result = ActivityResult::completed()
            .with_output(json!({"checked": true}))
            .with_variable("documents_valid", true)
            .with_next_activity("review");

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.variable_updates["documents_valid"], true);
        assert_eq!(result.next_activity_id.as_deref(), Some("review"));
        assert!(!result.is_failed());

        let failed = ActivityResult::failed(ActivityError::non_retryable("nope"));
        assert!(failed.is_failed());
        assert!(failed.error.is_some());
    }
}
