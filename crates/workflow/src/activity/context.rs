//! Activity execution context

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use super::{error_types, ActivityError};
use crate::assignment::{
    AssigneeSelectionResult, AssignmentRequest, AssignmentResolver, RuntimeOverride,
};
use crate::workflow::{ActivityDefinition, Variables, WorkflowInstance};

/// Context provided to behaviors during execution
///
/// The context provides:
/// - Information about the current execution attempt
/// - A snapshot of the instance variables and the activity's properties
/// - The runtime override for this activity, if one was supplied
/// - Access to the assignment resolver
///
/// # Example
///
/// ```ignore
/// async fn execute(&self, ctx: &ActivityContext) -> Result<ActivityResult, ActivityError> {
///     let assignment = ctx.resolve_assignee().await?;
///     if !assignment.success {
///         return Err(ActivityError::non_retryable("nobody to review"));
///     }
///     Ok(ActivityResult::pending(assignment))
/// }
/// ```
#[derive(Clone)]
pub struct ActivityContext {
    /// Unique execution attempt ID
    pub attempt_id: Uuid,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed
    pub max_attempts: u32,

    pub instance_id: Uuid,

    pub definition_id: String,

    pub started_by: String,

    pub correlation_id: Option<String>,

    activity: ActivityDefinition,

    variables: Variables,

    runtime_override: Option<RuntimeOverride>,

    resolver: Option<Arc<AssignmentResolver>>,
}

impl std::fmt::Debug for ActivityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityContext")
            .field("instance_id", &self.instance_id)
            .field("activity_id", &self.activity.id)
            .field("attempt", &self.attempt)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl ActivityContext {
    /// Create a context for one attempt of `activity` on `instance`
    pub fn new(
        instance: &WorkflowInstance,
        activity: &ActivityDefinition,
        attempt: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            attempt_id: Uuid::now_v7(),
            attempt,
            max_attempts,
            instance_id: instance.id,
            definition_id: instance.definition_id.clone(),
            started_by: instance.started_by.clone(),
            correlation_id: instance.correlation_id.clone(),
            activity: activity.clone(),
            variables: instance.variables.clone(),
            runtime_override: instance.runtime_override(&activity.id).cloned(),
            resolver: None,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<AssignmentResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn activity_id(&self) -> &str {
        &self.activity.id
    }

    pub fn activity(&self) -> &ActivityDefinition {
        &self.activity
    }

    pub fn properties(&self) -> &Variables {
        &self.activity.properties
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.activity.properties.get(key)
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn variable(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    pub fn runtime_override(&self) -> Option<&RuntimeOverride> {
        self.runtime_override.as_ref()
    }

    /// Check if this is the last retry attempt
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Build the assignment request for this activity
    pub fn assignment_request(&self) -> AssignmentRequest {
        AssignmentRequest {
            instance_id: self.instance_id,
            activity_id: self.activity.id.clone(),
            activity_name: self.activity.name.clone(),
            properties: self.activity.properties.clone(),
            strategies: self.activity.assignment.clone(),
            runtime_override: self.runtime_override.clone(),
        }
    }

    /// Run the configured strategies for this activity
    ///
    /// Infrastructure failures surface as retryable errors when the
    /// underlying failure is transient. A result with `success == false`
    /// means no strategy found anyone; the behavior decides what that means.
    pub async fn resolve_assignee(&self) -> Result<AssigneeSelectionResult, ActivityError> {
        let resolver = self.resolver.as_ref().ok_or_else(|| {
            ActivityError::configuration(format!(
                "no assignment resolver available for activity {}",
                self.activity.id
            ))
        })?;

        resolver
            .resolve(&self.assignment_request())
            .await
            .map_err(|e| {
                let error = if e.is_retryable() {
                    ActivityError::retryable(e.to_string())
                } else {
                    ActivityError::non_retryable(e.to_string())
                };
                error.with_type(error_types::ASSIGNMENT_FAILED)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn instance() -> WorkflowInstance {
        let mut instance = WorkflowInstance::new("appraisal", 1, "APR-1", "requester", "start");
        instance.variables.insert("amount".into(), json!(250_000));
        instance
            .runtime_overrides
            .insert("review".into(), RuntimeOverride::assign_to("carol"));
        instance
    }

    #[test]
    fn test_context_exposes_snapshot() {
        let activity = ActivityDefinition::new("review", "HumanTask")
            .named("AdminReview")
            .with_property("assignee_group", "appraisers");
        let ctx = ActivityContext::new(&instance(), &activity, 1, 3);

        assert_eq!(ctx.activity_id(), "review");
        assert_eq!(ctx.variable("amount"), Some(&json!(250_000)));
        assert_eq!(ctx.property("assignee_group"), Some(&json!("appraisers")));
        assert_eq!(
            ctx.runtime_override().and_then(|o| o.assignee_id.as_deref()),
            Some("carol")
        );
        assert!(!ctx.is_last_attempt());

        let request = ctx.assignment_request();
        assert_eq!(request.activity_name, "AdminReview");
        assert!(request.runtime_override.is_some());
    }

    #[test]
    fn test_is_last_attempt() {
        let activity = ActivityDefinition::new("start", "Start");
        assert!(ActivityContext::new(&instance(), &activity, 3, 3).is_last_attempt());
        assert!(!ActivityContext::new(&instance(), &activity, 2, 3).is_last_attempt());
    }

    #[tokio::test]
    async fn test_resolve_without_resolver_is_configuration_error() {
        let activity = ActivityDefinition::new("review", "HumanTask");
        let ctx = ActivityContext::new(&instance(), &activity, 1, 1);

        let err = ctx.resolve_assignee().await.unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION");
        assert!(!err.retryable);
    }
}
