//! Built-in activity behaviors

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{
    error_types, ActivityBehavior, ActivityContext, ActivityDescriptor, ActivityError,
    ActivityResult,
};

/// Entry point of every definition; does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct StartActivity;

#[async_trait]
impl ActivityBehavior for StartActivity {
    fn descriptor(&self) -> ActivityDescriptor {
        ActivityDescriptor::new("Start")
    }

    async fn execute(&self, _ctx: &ActivityContext) -> Result<ActivityResult, ActivityError> {
        Ok(ActivityResult::completed())
    }
}

/// Terminal marker; the orchestrator completes the instance after it runs
#[derive(Debug, Clone, Copy, Default)]
pub struct EndActivity;

#[async_trait]
impl ActivityBehavior for EndActivity {
    fn descriptor(&self) -> ActivityDescriptor {
        ActivityDescriptor::new("End")
    }

    async fn execute(&self, _ctx: &ActivityContext) -> Result<ActivityResult, ActivityError> {
        Ok(ActivityResult::completed())
    }
}

/// Copies the `values` property into the instance variables
#[derive(Debug, Clone, Copy, Default)]
pub struct SetVariablesActivity;

impl SetVariablesActivity {
    pub const VALUES: &'static str = "values";
}

#[async_trait]
impl ActivityBehavior for SetVariablesActivity {
    fn descriptor(&self) -> ActivityDescriptor {
        ActivityDescriptor::new("SetVariables").requires(Self::VALUES)
    }

    async fn execute(&self, ctx: &ActivityContext) -> Result<ActivityResult, ActivityError> {
        let values = ctx
            .property(Self::VALUES)
            .and_then(Value::as_object)
            .ok_or_else(|| {
                ActivityError::configuration(format!(
                    "activity {} property `values` must be an object",
                    ctx.activity_id()
                ))
            })?;

        Ok(ActivityResult::completed().with_variables(values.clone()))
    }
}

/// Informs someone without waiting for them
///
/// Assignment is best-effort: when no recipient can be resolved the
/// activity still completes and records why.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotificationActivity;

#[async_trait]
impl ActivityBehavior for NotificationActivity {
    fn descriptor(&self) -> ActivityDescriptor {
        ActivityDescriptor::new("Notification")
    }

    async fn execute(&self, ctx: &ActivityContext) -> Result<ActivityResult, ActivityError> {
        let subject = ctx
            .property("subject")
            .and_then(Value::as_str)
            .unwrap_or(ctx.activity().name.as_str())
            .to_string();

        match ctx.resolve_assignee().await {
            Ok(selection) if selection.success => {
                let recipient = selection.assignee().map(str::to_string);
                debug!(activity_id = ctx.activity_id(), ?recipient, "notification addressed");
                Ok(ActivityResult::completed().with_output(json!({
                    "delivered": true,
                    "recipient": recipient,
                    "subject": subject,
                })))
            }
            Ok(selection) => Ok(ActivityResult::completed().with_output(json!({
                "delivered": false,
                "subject": subject,
                "reason": selection.reason,
            }))),
            Err(e) => {
                warn!(activity_id = ctx.activity_id(), error = %e, "notification recipient lookup failed");
                Ok(ActivityResult::completed().with_output(json!({
                    "delivered": false,
                    "subject": subject,
                    "reason": e.message,
                })))
            }
        }
    }
}

/// A task a person has to complete
///
/// `execute` resolves an assignee and suspends. `resume` accepts the
/// person's submission:
///
/// ```json
/// {"decision": "reject", "reason": "comparables are outdated",
///  "completed_by": "alice", "variables": {"value_estimate": 410000}}
/// ```
///
/// The decision must be one of the `decisions` property (default
/// `approve`, `reject`, `route_back`); `reject` and `route_back` need a
/// non-empty reason unless `reason_required_for` says otherwise.
#[derive(Debug, Clone)]
pub struct HumanTaskActivity {
    activity_type: String,
}

impl HumanTaskActivity {
    pub const TYPE: &'static str = "HumanTask";
    pub const DEFAULT_DECISIONS: [&'static str; 3] = ["approve", "reject", "route_back"];
    pub const DEFAULT_REASON_REQUIRED: [&'static str; 2] = ["reject", "route_back"];

    /// Variable the decision is written to
    pub const DECISION_VARIABLE: &'static str = "decision";
    pub const REASON_VARIABLE: &'static str = "decision_reason";

    /// Register the human-task behavior under a domain-specific type name
    /// such as `AdminReview`
    pub fn new(activity_type: impl Into<String>) -> Self {
        Self {
            activity_type: activity_type.into(),
        }
    }

    fn string_list(ctx: &ActivityContext, key: &str, default: &[&str]) -> Vec<String> {
        match ctx.property(key).and_then(Value::as_array) {
            Some(items) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            None => default.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[async_trait]
impl ActivityBehavior for HumanTaskActivity {
    fn descriptor(&self) -> ActivityDescriptor {
        ActivityDescriptor::new(self.activity_type.clone()).resumable()
    }

    async fn execute(&self, ctx: &ActivityContext) -> Result<ActivityResult, ActivityError> {
        let selection = ctx.resolve_assignee().await?;
        if !selection.success {
            return Err(ActivityError::non_retryable(format!(
                "no assignee for activity {}: {}",
                ctx.activity_id(),
                selection.reason.as_deref().unwrap_or("no strategy matched")
            ))
            .with_type(error_types::ASSIGNMENT_FAILED)
            .with_details(Value::Object(selection.metadata)));
        }

        let output = json!({
            "assignee_id": selection.assignee_id,
            "assignee_group": selection.assignee_group,
            "strategy": selection.strategy,
        });
        Ok(ActivityResult::pending(selection).with_output(output))
    }

    async fn resume(
        &self,
        ctx: &ActivityContext,
        input: &Value,
    ) -> Result<ActivityResult, ActivityError> {
        let input = input
            .as_object()
            .ok_or_else(|| ActivityError::validation("task submission must be a JSON object"))?;

        let decision = input
            .get("decision")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .ok_or_else(|| ActivityError::validation("decision is required"))?;

        let allowed = Self::string_list(ctx, "decisions", &Self::DEFAULT_DECISIONS);
        if !allowed.iter().any(|d| d == decision) {
            return Err(ActivityError::validation(format!(
                "decision `{decision}` is not one of: {}",
                allowed.join(", ")
            )));
        }

        let reason = input
            .get("reason")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|r| !r.is_empty());
        let needs_reason =
            Self::string_list(ctx, "reason_required_for", &Self::DEFAULT_REASON_REQUIRED);
        if reason.is_none() && needs_reason.iter().any(|d| d == decision) {
            return Err(ActivityError::validation(format!(
                "a reason is required when the decision is `{decision}`"
            )));
        }

        let mut result = ActivityResult::completed();
        if let Some(extra) = input.get("variables").and_then(Value::as_object) {
            result = result.with_variables(extra.clone());
        }
        result = result
            .with_variable(Self::DECISION_VARIABLE, decision)
            .with_variable(Self::REASON_VARIABLE, reason.map_or(Value::Null, Value::from));

        let completed_by = input.get("completed_by").and_then(Value::as_str);
        if let Some(user) = completed_by {
            result = result.with_performed_by(user);
        }

        Ok(result.with_output(json!({
            "decision": decision,
            "reason": reason,
            "completed_by": completed_by,
        })))
    }
}
