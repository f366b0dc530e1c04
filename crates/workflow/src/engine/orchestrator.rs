//! Workflow orchestrator
//!
//! The `Orchestrator` is responsible for:
//! - Starting new instances
//! - Executing activities one step at a time until the instance suspends,
//!   finishes or faults
//! - Routing failures through the fault handler
//! - Committing every step atomically with exactly one integration event

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::config::OrchestratorConfig;
use super::registry::DefinitionRegistry;
use crate::activity::{
    ActivityBehavior, ActivityCatalog, ActivityContext, ActivityDescriptor, ActivityError,
    ActivityResult,
};
use crate::assignment::{AssignmentResolver, RuntimeOverride};
use crate::messaging::OutboxMessage;
use crate::persistence::{Bookmark, StoreError, TransitionCommit, WorkflowStore};
use crate::reliability::{FaultDecision, FaultHandler, FaultKind, RetryPolicy};
use crate::workflow::{
    ActivityDefinition, ActivityExecutionRecord, DefinitionError, ExecutionStatus,
    InstanceStatus, InvalidTransition, Variables, WorkflowDefinition, WorkflowEvent,
    WorkflowEventKind, WorkflowInstance,
};

/// Fault reason recorded when an instance runs out of steps
pub const STEP_BUDGET_EXHAUSTED: &str = "step_budget_exhausted";

/// Activity type on records for an activity the definition does not have
pub const UNKNOWN_ACTIVITY_TYPE: &str = "unknown";

/// Errors from orchestrator operations
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Definition missing or broken
    #[error("definition error: {0}")]
    Definition(#[from] DefinitionError),

    /// Resume input rejected; nothing was changed
    #[error("invalid input for activity {activity_id}: {source}")]
    Validation {
        activity_id: String,
        source: ActivityError,
    },

    /// Transient failure while resuming; the bookmark stays open
    #[error("activity {activity_id} failed: {source}")]
    ActivityFailed {
        activity_id: String,
        source: ActivityError,
    },

    #[error("instance {instance_id} is {status}: {message}")]
    InvalidState {
        instance_id: Uuid,
        status: InstanceStatus,
        message: String,
    },

    #[error("no open bookmark for activity {activity_id} on instance {instance_id}")]
    BookmarkNotFound { instance_id: Uuid, activity_id: String },

    /// The bookmark was consumed by an earlier or concurrent resume
    #[error("activity {activity_id} on instance {instance_id} was already resumed")]
    BookmarkConflict { instance_id: Uuid, activity_id: String },

    /// The instance was faulted after running `max_steps` activities
    #[error("instance {instance_id} exceeded the step budget of {max_steps}")]
    StepBudgetExhausted { instance_id: Uuid, max_steps: usize },

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OrchestratorError {
    /// Machine-readable error code
    pub fn code(&self) -> &str {
        match self {
            Self::Store(e) => e.code(),
            Self::Definition(e) => e.code(),
            Self::Validation { .. } => "VALIDATION",
            Self::ActivityFailed { source, .. } => source.code(),
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::BookmarkNotFound { .. } => "BOOKMARK_NOT_FOUND",
            Self::BookmarkConflict { .. } => "BOOKMARK_CONFLICT",
            Self::StepBudgetExhausted { .. } => "STEP_BUDGET_EXHAUSTED",
            Self::InvalidTransition(_) => "INVALID_TRANSITION",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

/// Input for [`Orchestrator::start_workflow`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartWorkflowRequest {
    pub definition_id: String,
    pub instance_name: String,
    pub started_by: String,
    #[serde(default)]
    pub variables: Variables,
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Assignment overrides keyed by activity id
    #[serde(default)]
    pub runtime_overrides: BTreeMap<String, RuntimeOverride>,
}

impl StartWorkflowRequest {
    pub fn new(
        definition_id: impl Into<String>,
        instance_name: impl Into<String>,
        started_by: impl Into<String>,
    ) -> Self {
        Self {
            definition_id: definition_id.into(),
            instance_name: instance_name.into(),
            started_by: started_by.into(),
            ..Default::default()
        }
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables.extend(variables);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_override(mut self, activity_id: impl Into<String>, ov: RuntimeOverride) -> Self {
        self.runtime_overrides.insert(activity_id.into(), ov);
        self
    }
}

/// Where an instance stands after a start, resume or cancel call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRunResponse {
    pub instance_id: Uuid,
    pub status: InstanceStatus,
    pub next_activity_id: Option<String>,
    pub next_assignee: Option<String>,
    pub fault_reason: Option<String>,
}

impl From<&WorkflowInstance> for WorkflowRunResponse {
    fn from(instance: &WorkflowInstance) -> Self {
        Self {
            instance_id: instance.id,
            status: instance.status,
            next_activity_id: instance.current_activity_id.clone(),
            next_assignee: instance.current_assignee.clone(),
            fault_reason: instance.fault_reason.clone(),
        }
    }
}

/// One execution of an activity, after retries
struct Attempted {
    attempt: u32,
    started_at: DateTime<Utc>,
    /// `Err` carries the fault reason
    outcome: Result<ActivityResult, String>,
}

/// Workflow orchestrator
///
/// The orchestrator walks an instance through its definition's activity
/// graph. Each step is committed with an optimistic version check, so a
/// concurrent cancel or resume is detected at commit time rather than
/// silently overwritten.
///
/// # Example
///
/// ```ignore
/// let orchestrator = Orchestrator::new(store, definitions, resolver);
///
/// let started = orchestrator
///     .start_workflow(StartWorkflowRequest::new("appraisal", "APR-1042", "requester"))
///     .await?;
///
/// // Later, when the reviewer submits the task
/// orchestrator
///     .resume_activity(started.instance_id, "review", json!({"decision": "approve"}))
///     .await?;
/// ```
pub struct Orchestrator<S: WorkflowStore> {
    pub(super) store: Arc<S>,
    pub(super) catalog: Arc<ActivityCatalog>,
    pub(super) definitions: Arc<DefinitionRegistry>,
    pub(super) resolver: Arc<AssignmentResolver>,
    pub(super) faults: FaultHandler,
    pub(super) config: OrchestratorConfig,
}

impl<S: WorkflowStore> Orchestrator<S> {
    /// Create an orchestrator with the default configuration
    pub fn new(
        store: Arc<S>,
        definitions: Arc<DefinitionRegistry>,
        resolver: Arc<AssignmentResolver>,
    ) -> Self {
        Self::with_config(store, definitions, resolver, OrchestratorConfig::default())
    }

    pub fn with_config(
        store: Arc<S>,
        definitions: Arc<DefinitionRegistry>,
        resolver: Arc<AssignmentResolver>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            catalog: definitions.catalog().clone(),
            definitions,
            resolver,
            faults: FaultHandler::new(config.retry_policy.clone()),
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Create an instance and run it until it suspends or finishes
    ///
    /// A missing or invalid definition is a startup fault: the error is
    /// returned and nothing is persisted. Faults after the instance exists
    /// leave it `Faulted` and are reported through the response.
    #[instrument(skip(self, request), fields(definition_id = %request.definition_id))]
    pub async fn start_workflow(
        &self,
        request: StartWorkflowRequest,
    ) -> Result<WorkflowRunResponse, OrchestratorError> {
        let definition = self.definitions.get(&request.definition_id)?;
        let start = definition.start_activity()?;

        let mut instance = WorkflowInstance::new(
            definition.id.clone(),
            definition.version,
            request.instance_name,
            request.started_by,
            start.id.clone(),
        );
        instance.variables = request.variables;
        instance.correlation_id = request.correlation_id;
        instance.runtime_overrides = request.runtime_overrides;

        let event = OutboxMessage::from_event(&WorkflowEvent::for_instance(
            &instance,
            Some(&start.id),
            WorkflowEventKind::WorkflowStarted {
                definition_version: definition.version,
            },
        ))?;

        self.faults
            .retry_store("create_instance", || {
                self.store.create_instance(&instance, event.clone())
            })
            .await?;

        info!(
            instance_id = %instance.id,
            version = definition.version,
            started_by = %instance.started_by,
            "workflow instance started"
        );

        let instance = self.drive(instance, &definition).await?;
        Ok(WorkflowRunResponse::from(&instance))
    }

    /// Execute steps while the instance is running
    ///
    /// Stops on suspension or a terminal state. Before every step after the
    /// first the stored instance is re-read, so a cancel that landed between
    /// steps stops the loop before the next activity executes. A version
    /// conflict means someone else changed the instance; if it is now
    /// terminal that state is returned, otherwise the conflict surfaces.
    pub(super) async fn drive(
        &self,
        mut instance: WorkflowInstance,
        definition: &WorkflowDefinition,
    ) -> Result<WorkflowInstance, OrchestratorError> {
        let mut steps = 0usize;

        while instance.status == InstanceStatus::Running {
            if steps >= self.config.max_steps {
                return Err(self.exhaust_budget(&instance, definition).await?);
            }
            if steps > 0 {
                let stored = self.store.get_instance(instance.id).await?;
                if stored.version != instance.version {
                    return self.changed_concurrently(stored, instance.version);
                }
            }
            steps += 1;

            match self.step(&instance, definition).await {
                Ok(next) => instance = next,
                Err(OrchestratorError::Store(StoreError::ConcurrencyConflict {
                    instance_id,
                    expected,
                    ..
                })) => {
                    let current = self.store.get_instance(instance_id).await?;
                    return self.changed_concurrently(current, expected);
                }
                Err(e) => return Err(e),
            }
        }

        debug!(instance_id = %instance.id, status = %instance.status, steps, "drive loop stopped");
        Ok(instance)
    }

    /// Someone else moved the instance past `expected`
    fn changed_concurrently(
        &self,
        current: WorkflowInstance,
        expected: i64,
    ) -> Result<WorkflowInstance, OrchestratorError> {
        if current.is_terminal() {
            info!(
                instance_id = %current.id,
                status = %current.status,
                "instance finished concurrently, stopping"
            );
            return Ok(current);
        }
        Err(StoreError::ConcurrencyConflict {
            instance_id: current.id,
            expected,
            actual: current.version,
        }
        .into())
    }

    async fn exhaust_budget(
        &self,
        instance: &WorkflowInstance,
        definition: &WorkflowDefinition,
    ) -> Result<OrchestratorError, OrchestratorError> {
        warn!(
            instance_id = %instance.id,
            activity_id = ?instance.current_activity_id,
            max_steps = self.config.max_steps,
            "step budget exhausted, faulting instance"
        );
        let activity = instance
            .current_activity_id
            .as_deref()
            .and_then(|id| definition.activity(id).ok());
        let commit = self.fault_commit(
            instance,
            activity,
            0,
            Utc::now(),
            STEP_BUDGET_EXHAUSTED.into(),
            None,
        )?;
        self.commit(commit).await?;
        Ok(OrchestratorError::StepBudgetExhausted {
            instance_id: instance.id,
            max_steps: self.config.max_steps,
        })
    }

    /// Execute the current activity and commit the resulting transition
    #[instrument(skip_all, fields(instance_id = %instance.id, activity_id = ?instance.current_activity_id))]
    async fn step(
        &self,
        instance: &WorkflowInstance,
        definition: &WorkflowDefinition,
    ) -> Result<WorkflowInstance, OrchestratorError> {
        let Some(activity_id) = instance.current_activity_id.as_deref() else {
            return Err(OrchestratorError::InvalidState {
                instance_id: instance.id,
                status: instance.status,
                message: "running instance has no current activity".into(),
            });
        };

        let activity = match definition.activity(activity_id) {
            Ok(activity) => activity,
            Err(e) => {
                let reason = format!("{}: {e}", FaultKind::Configuration.as_str());
                let commit = self.fault_commit(instance, None, 0, Utc::now(), reason, None)?;
                return Ok(self.commit(commit).await?);
            }
        };

        let behavior = match self.catalog.get(&activity.activity_type) {
            Ok(behavior) => behavior,
            Err(e) => {
                let reason = format!("{}: {e}", FaultKind::Configuration.as_str());
                let commit =
                    self.fault_commit(instance, Some(activity), 1, Utc::now(), reason, None)?;
                return Ok(self.commit(commit).await?);
            }
        };

        let attempted = self.execute_with_retries(instance, activity, &behavior).await;
        let commit = match attempted.outcome {
            Ok(result) => self.transition_commit(
                instance,
                definition,
                activity,
                result,
                attempted.attempt,
                attempted.started_at,
                None,
            )?,
            Err(reason) => self.fault_commit(
                instance,
                Some(activity),
                attempted.attempt,
                attempted.started_at,
                reason,
                None,
            )?,
        };

        Ok(self.commit(commit).await?)
    }

    /// Run `execute` with timeout and in-flight retries
    async fn execute_with_retries(
        &self,
        instance: &WorkflowInstance,
        activity: &ActivityDefinition,
        behavior: &Arc<dyn ActivityBehavior>,
    ) -> Attempted {
        let descriptor = behavior.descriptor();
        let policy = self.policy_for(activity, &descriptor);
        let timeout = self.timeout_for(activity, &descriptor);
        let started_at = Utc::now();
        let mut attempt = 1;

        loop {
            let ctx = self.context(instance, activity, attempt, &policy);
            let outcome = settle(tokio::time::timeout(timeout, behavior.execute(&ctx)).await, timeout);

            let error = match outcome {
                Ok(result) => {
                    return Attempted {
                        attempt,
                        started_at,
                        outcome: Ok(result),
                    }
                }
                Err(error) => error,
            };

            match self.faults.decide(attempt, &error, &policy) {
                FaultDecision::Retry { next_attempt, delay } => {
                    warn!(
                        activity_id = %activity.id,
                        attempt,
                        ?delay,
                        error = %error,
                        "activity failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt = next_attempt;
                }
                FaultDecision::Fail { kind, reason } => {
                    warn!(
                        activity_id = %activity.id,
                        attempt,
                        kind = kind.as_str(),
                        error = %error,
                        "activity failed"
                    );
                    return Attempted {
                        attempt,
                        started_at,
                        outcome: Err(reason),
                    };
                }
            }
        }
    }

    pub(super) fn context(
        &self,
        instance: &WorkflowInstance,
        activity: &ActivityDefinition,
        attempt: u32,
        policy: &RetryPolicy,
    ) -> ActivityContext {
        ActivityContext::new(instance, activity, attempt, policy.max_attempts)
            .with_resolver(self.resolver.clone())
    }

    /// Activity policy, then the behavior's, then the engine default
    pub(super) fn policy_for(
        &self,
        activity: &ActivityDefinition,
        descriptor: &ActivityDescriptor,
    ) -> RetryPolicy {
        activity
            .retry_policy
            .clone()
            .or_else(|| descriptor.retry_policy.clone())
            .unwrap_or_else(|| self.config.retry_policy.clone())
    }

    pub(super) fn timeout_for(
        &self,
        activity: &ActivityDefinition,
        descriptor: &ActivityDescriptor,
    ) -> Duration {
        activity
            .timeout
            .or(descriptor.timeout)
            .unwrap_or(self.config.default_activity_timeout)
    }

    /// Turn a successful activity result into the next instance state
    #[allow(clippy::too_many_arguments)]
    pub(super) fn transition_commit(
        &self,
        instance: &WorkflowInstance,
        definition: &WorkflowDefinition,
        activity: &ActivityDefinition,
        result: ActivityResult,
        attempt: u32,
        started_at: DateTime<Utc>,
        consume_bookmark: Option<Uuid>,
    ) -> Result<TransitionCommit, OrchestratorError> {
        let mut next = instance.clone();
        if next.status == InstanceStatus::Suspended {
            next.wake()?;
        }

        let mut record_assignee = result
            .performed_by
            .clone()
            .or_else(|| instance.current_assignee.clone());
        let mut create_bookmark = None;

        let kind = match result.status {
            ExecutionStatus::Completed | ExecutionStatus::Skipped => {
                next.merge_variables(&result.variable_updates);
                if activity.is_end {
                    next.complete()?;
                    WorkflowEventKind::WorkflowCompleted
                } else {
                    match definition.next_activity(
                        &activity.id,
                        &next.variables,
                        result.next_activity_id.as_deref(),
                    ) {
                        Ok(target) => {
                            next.advance_to(target.id.clone())?;
                            WorkflowEventKind::ActivityCompleted {
                                status: result.status,
                                next_activity_id: Some(target.id.clone()),
                            }
                        }
                        Err(e) => {
                            let reason = format!("{}: {e}", FaultKind::Configuration.as_str());
                            warn!(instance_id = %instance.id, activity_id = %activity.id, %reason, "routing failed");
                            next.fault(reason.clone())?;
                            WorkflowEventKind::WorkflowFaulted { reason }
                        }
                    }
                }
            }
            ExecutionStatus::Pending => {
                let assignment = result.assignment.clone().unwrap_or_default();
                let assignee = assignment.assignee().map(str::to_string);
                next.merge_variables(&result.variable_updates);
                next.suspend(assignee.clone())?;
                create_bookmark = Some(Bookmark::new(next.id, activity.id.clone(), assignee.clone()));
                record_assignee = assignee;
                WorkflowEventKind::TaskAssigned {
                    assignee_group: assignment.assignee_group,
                    strategy: assignment.strategy,
                }
            }
            ExecutionStatus::Failed => {
                let message = result
                    .error
                    .as_ref()
                    .map_or("activity failed", |e| e.message.as_str());
                let reason = format!("{}: {message}", FaultKind::Permanent.as_str());
                next.fault(reason.clone())?;
                WorkflowEventKind::WorkflowFaulted { reason }
            }
        };

        let mut event = WorkflowEvent::for_instance(&next, Some(&activity.id), kind);
        event.assignee = record_assignee.clone();

        let record = ActivityExecutionRecord {
            id: Uuid::now_v7(),
            instance_id: instance.id,
            activity_id: activity.id.clone(),
            activity_type: activity.activity_type.clone(),
            status: result.status,
            assignee: record_assignee,
            attempt,
            output: result.output,
            error: result.error.map(|e| e.message),
            started_at,
            completed_at: Utc::now(),
        };

        Ok(TransitionCommit {
            instance: next,
            expected_version: instance.version,
            record: Some(record),
            consume_bookmark,
            create_bookmark,
            event: OutboxMessage::from_event(&event)?,
        })
    }

    /// Fault the instance and record a failed execution of its current
    /// activity
    ///
    /// Without a definition entry the record is built from the instance's
    /// current activity id with an `unknown` type. `attempt` 0 means the
    /// activity never ran.
    pub(super) fn fault_commit(
        &self,
        instance: &WorkflowInstance,
        activity: Option<&ActivityDefinition>,
        attempt: u32,
        started_at: DateTime<Utc>,
        reason: String,
        consume_bookmark: Option<Uuid>,
    ) -> Result<TransitionCommit, OrchestratorError> {
        let activity_id = instance.current_activity_id.clone();
        let mut next = instance.clone();
        next.fault(reason.clone())?;

        let executed = match activity {
            Some(activity) => Some((activity.id.clone(), activity.activity_type.clone())),
            None => activity_id
                .clone()
                .map(|id| (id, UNKNOWN_ACTIVITY_TYPE.to_string())),
        };
        let record = executed.map(|(activity_id, activity_type)| ActivityExecutionRecord {
            id: Uuid::now_v7(),
            instance_id: instance.id,
            activity_id,
            activity_type,
            status: ExecutionStatus::Failed,
            assignee: instance.current_assignee.clone(),
            attempt,
            output: serde_json::Value::Null,
            error: Some(reason.clone()),
            started_at,
            completed_at: Utc::now(),
        });

        let event = WorkflowEvent::for_instance(
            instance,
            activity_id.as_deref(),
            WorkflowEventKind::WorkflowFaulted { reason },
        );

        Ok(TransitionCommit {
            instance: next,
            expected_version: instance.version,
            record,
            consume_bookmark,
            create_bookmark: None,
            event: OutboxMessage::from_event(&event)?,
        })
    }

    /// Apply a transition, retrying transient store failures
    pub(super) async fn commit(
        &self,
        commit: TransitionCommit,
    ) -> Result<WorkflowInstance, StoreError> {
        let mut next = commit.instance.clone();
        next.version = self
            .faults
            .retry_store("commit_transition", || {
                self.store.commit_transition(commit.clone())
            })
            .await?;

        debug!(
            instance_id = %next.id,
            status = %next.status,
            activity_id = ?next.current_activity_id,
            version = next.version,
            "transition committed"
        );
        Ok(next)
    }
}

/// Fold a timed-out or failed result into an activity error
pub(super) fn settle(
    outcome: Result<Result<ActivityResult, ActivityError>, tokio::time::error::Elapsed>,
    timeout: Duration,
) -> Result<ActivityResult, ActivityError> {
    match outcome {
        Ok(Ok(result)) if result.is_failed() => Err(result
            .error
            .unwrap_or_else(|| ActivityError::non_retryable("activity reported failure without an error"))),
        Ok(result) => result,
        Err(_) => Err(ActivityError::timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::StrategyKind;
    use crate::persistence::InMemoryWorkflowStore;
    use crate::workflow::{Condition, TransitionDefinition};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails with a retryable error until `succeed_on`
    struct Flaky {
        calls: Arc<AtomicU32>,
        succeed_on: u32,
    }

    #[async_trait]
    impl ActivityBehavior for Flaky {
        fn descriptor(&self) -> ActivityDescriptor {
            ActivityDescriptor::new("Flaky")
        }

        async fn execute(&self, ctx: &ActivityContext) -> Result<ActivityResult, ActivityError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            assert_eq!(ctx.attempt, call);
            if call < self.succeed_on {
                return Err(ActivityError::retryable("valuation service unavailable"));
            }
            Ok(ActivityResult::completed().with_variable("valued", true))
        }
    }

    struct Slow;

    #[async_trait]
    impl ActivityBehavior for Slow {
        fn descriptor(&self) -> ActivityDescriptor {
            ActivityDescriptor::new("Slow").with_timeout(Duration::from_millis(10))
        }

        async fn execute(&self, _ctx: &ActivityContext) -> Result<ActivityResult, ActivityError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ActivityResult::completed())
        }
    }

    fn quick_retries(max_attempts: u32) -> OrchestratorConfig {
        OrchestratorConfig::default()
            .with_retry_policy(RetryPolicy::fixed(Duration::from_millis(1), max_attempts))
    }

    fn orchestrator(
        definitions: Vec<WorkflowDefinition>,
        catalog: ActivityCatalog,
        config: OrchestratorConfig,
    ) -> Orchestrator<InMemoryWorkflowStore> {
        let store = Arc::new(InMemoryWorkflowStore::new());
        let mut registry = DefinitionRegistry::new(Arc::new(catalog));
        for definition in definitions {
            registry.register(definition).unwrap();
        }
        let resolver = Arc::new(AssignmentResolver::new(vec![StrategyKind::Manual]));
        Orchestrator::with_config(store, Arc::new(registry), resolver, config)
    }

    fn linear(middle: ActivityDefinition) -> WorkflowDefinition {
        let middle_id = middle.id.clone();
        WorkflowDefinition::new("linear", "Linear")
            .with_activity(ActivityDefinition::new("start", "Start").start())
            .with_activity(middle)
            .with_activity(ActivityDefinition::new("end", "End").end())
            .with_transition(TransitionDefinition::new("start", middle_id.clone()))
            .with_transition(TransitionDefinition::new(middle_id, "end"))
    }

    #[tokio::test]
    async fn test_runs_to_completion() {
        let definition = linear(
            ActivityDefinition::new("init", "SetVariables")
                .with_property("values", json!({"priority": "high"})),
        );
        let orch = orchestrator(vec![definition], ActivityCatalog::with_builtins(), quick_retries(1));

        let response = orch
            .start_workflow(StartWorkflowRequest::new("linear", "APR-1", "requester"))
            .await
            .unwrap();

        assert_eq!(response.status, InstanceStatus::Completed);
        assert!(response.next_activity_id.is_none());

        let instance = orch.store().get_instance(response.instance_id).await.unwrap();
        assert_eq!(instance.variables["priority"], "high");
        assert_eq!(instance.version, 3);

        let history = orch.store().list_history(response.instance_id).await.unwrap();
        let steps: Vec<_> = history.iter().map(|r| r.activity_id.as_str()).collect();
        assert_eq!(steps, vec!["start", "init", "end"]);

        // started + one event per step
        let types: Vec<_> = orch
            .store()
            .outbox_messages()
            .into_iter()
            .map(|m| m.message_type)
            .collect();
        assert_eq!(
            types,
            vec![
                "workflow.started",
                "workflow.activity_completed",
                "workflow.activity_completed",
                "workflow.completed"
            ]
        );
    }

    #[tokio::test]
    async fn test_conditional_routing_uses_variables() {
        let definition = WorkflowDefinition::new("routing", "Routing")
            .with_activity(ActivityDefinition::new("start", "Start").start())
            .with_activity(
                ActivityDefinition::new("senior", "SetVariables")
                    .with_property("values", json!({"track": "senior"})),
            )
            .with_activity(
                ActivityDefinition::new("standard", "SetVariables")
                    .with_property("values", json!({"track": "standard"})),
            )
            .with_activity(ActivityDefinition::new("end", "End").end())
            .with_transition(
                TransitionDefinition::new("start", "senior")
                    .when(Condition::greater_than("amount", 1_000_000)),
            )
            .with_transition(TransitionDefinition::new("start", "standard"))
            .with_transition(TransitionDefinition::new("senior", "end"))
            .with_transition(TransitionDefinition::new("standard", "end"));
        let orch = orchestrator(vec![definition], ActivityCatalog::with_builtins(), quick_retries(1));

        let big = orch
            .start_workflow(
                StartWorkflowRequest::new("routing", "APR-2", "requester")
                    .with_variable("amount", 2_500_000),
            )
            .await
            .unwrap();
        let small = orch
            .start_workflow(
                StartWorkflowRequest::new("routing", "APR-3", "requester")
                    .with_variable("amount", 300_000),
            )
            .await
            .unwrap();

        let big = orch.store().get_instance(big.instance_id).await.unwrap();
        let small = orch.store().get_instance(small.instance_id).await.unwrap();
        assert_eq!(big.variables["track"], "senior");
        assert_eq!(small.variables["track"], "standard");
    }

    #[tokio::test]
    async fn test_missing_definition_persists_nothing() {
        let orch = orchestrator(vec![], ActivityCatalog::with_builtins(), quick_retries(1));

        let err = orch
            .start_workflow(StartWorkflowRequest::new("missing", "APR-4", "requester"))
            .await
            .unwrap_err();

        assert_eq!(err.code(), "DEFINITION_NOT_FOUND");
        assert_eq!(orch.store().instance_count(), 0);
        assert!(orch.store().outbox_messages().is_empty());
    }

    #[tokio::test]
    async fn test_step_budget_faults_instance() {
        // Two activities that route to each other forever
        let definition = WorkflowDefinition::new("loop", "Loop")
            .with_activity(ActivityDefinition::new("start", "Start").start())
            .with_activity(ActivityDefinition::new("ping", "SetVariables").with_property("values", json!({"side": "ping"})))
            .with_activity(ActivityDefinition::new("pong", "SetVariables").with_property("values", json!({"side": "pong"})))
            .with_activity(ActivityDefinition::new("end", "End").end())
            .with_transition(TransitionDefinition::new("start", "ping"))
            .with_transition(TransitionDefinition::new("ping", "pong"))
            .with_transition(TransitionDefinition::new("pong", "ping"))
            .with_transition(
                TransitionDefinition::new("pong", "end").when(Condition::exists("never_set")),
            );
        let orch = orchestrator(
            vec![definition],
            ActivityCatalog::with_builtins(),
            quick_retries(1).with_max_steps(5),
        );

        let err = orch
            .start_workflow(StartWorkflowRequest::new("loop", "APR-5", "requester"))
            .await
            .unwrap_err();

        let OrchestratorError::StepBudgetExhausted { instance_id, max_steps } = err else {
            panic!("expected step budget error, got {err:?}");
        };
        assert_eq!(max_steps, 5);

        let instance = orch.store().get_instance(instance_id).await.unwrap();
        assert_eq!(instance.status, InstanceStatus::Faulted);
        assert_eq!(instance.fault_reason.as_deref(), Some(STEP_BUDGET_EXHAUSTED));

        // start, ping, pong, ping, pong, then the fault on the next ping
        let history = orch.store().list_history(instance_id).await.unwrap();
        assert_eq!(history.len(), 6);
        let last = history.last().unwrap();
        assert_eq!(last.activity_id, "ping");
        assert_eq!(last.activity_type, "SetVariables");
        assert_eq!(last.status, ExecutionStatus::Failed);
        assert_eq!(last.attempt, 0);
        assert_eq!(last.error.as_deref(), Some(STEP_BUDGET_EXHAUSTED));

        let last_event = orch.store().outbox_messages().pop().unwrap();
        assert_eq!(last_event.message_type, "workflow.faulted");
    }

    #[tokio::test]
    async fn test_unknown_current_activity_faults_with_record() {
        let definition = linear(
            ActivityDefinition::new("init", "SetVariables")
                .with_property("values", json!({"priority": "high"})),
        );
        let orch = orchestrator(vec![definition.clone()], ActivityCatalog::with_builtins(), quick_retries(1));

        let instance = WorkflowInstance::new("linear", 1, "APR-11", "requester", "ghost");
        let started = OutboxMessage::from_event(&WorkflowEvent::for_instance(
            &instance,
            Some("ghost"),
            WorkflowEventKind::WorkflowStarted { definition_version: 1 },
        ))
        .unwrap();
        orch.store().create_instance(&instance, started).await.unwrap();

        let faulted = orch.drive(instance, &definition).await.unwrap();
        assert_eq!(faulted.status, InstanceStatus::Faulted);
        assert!(faulted.fault_reason.as_deref().unwrap().starts_with("configuration"));

        let history = orch.store().list_history(faulted.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].activity_id, "ghost");
        assert_eq!(history[0].activity_type, UNKNOWN_ACTIVITY_TYPE);
        assert_eq!(history[0].status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_unguarded_transition_declared_first_is_taken() {
        let definition = WorkflowDefinition::new("routing", "Routing")
            .with_activity(ActivityDefinition::new("start", "Start").start())
            .with_activity(
                ActivityDefinition::new("senior", "SetVariables")
                    .with_property("values", json!({"track": "senior"})),
            )
            .with_activity(
                ActivityDefinition::new("standard", "SetVariables")
                    .with_property("values", json!({"track": "standard"})),
            )
            .with_activity(ActivityDefinition::new("end", "End").end())
            .with_transition(TransitionDefinition::new("start", "standard"))
            .with_transition(
                TransitionDefinition::new("start", "senior")
                    .when(Condition::greater_than("amount", 1_000_000)),
            )
            .with_transition(TransitionDefinition::new("senior", "end"))
            .with_transition(TransitionDefinition::new("standard", "end"));
        let orch = orchestrator(vec![definition], ActivityCatalog::with_builtins(), quick_retries(1));

        let big = orch
            .start_workflow(
                StartWorkflowRequest::new("routing", "APR-12", "requester")
                    .with_variable("amount", 2_500_000),
            )
            .await
            .unwrap();

        let history = orch.store().list_history(big.instance_id).await.unwrap();
        let steps: Vec<_> = history.iter().map(|r| r.activity_id.as_str()).collect();
        assert_eq!(steps, vec!["start", "standard", "end"]);
    }

    /// Counts executions under its own type name
    struct Counting {
        name: &'static str,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ActivityBehavior for Counting {
        fn descriptor(&self) -> ActivityDescriptor {
            ActivityDescriptor::new(self.name)
        }

        async fn execute(&self, _ctx: &ActivityContext) -> Result<ActivityResult, ActivityError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ActivityResult::completed())
        }
    }

    /// In-memory store that cancels the instance right after `trigger`
    /// commits, like a requester withdrawing between two steps
    struct CancelAfter {
        inner: InMemoryWorkflowStore,
        trigger: &'static str,
    }

    #[async_trait]
    impl WorkflowStore for CancelAfter {
        async fn create_instance(
            &self,
            instance: &WorkflowInstance,
            event: OutboxMessage,
        ) -> Result<(), StoreError> {
            self.inner.create_instance(instance, event).await
        }

        async fn get_instance(&self, instance_id: Uuid) -> Result<WorkflowInstance, StoreError> {
            self.inner.get_instance(instance_id).await
        }

        async fn commit_transition(&self, commit: TransitionCommit) -> Result<i64, StoreError> {
            let instance_id = commit.instance.id;
            let cancel_after = commit
                .record
                .as_ref()
                .is_some_and(|r| r.activity_id == self.trigger);
            let version = self.inner.commit_transition(commit).await?;

            if cancel_after {
                let current = self.inner.get_instance(instance_id).await?;
                let mut cancelled = current.clone();
                cancelled.cancel("withdrawn").unwrap();
                let event = OutboxMessage::from_event(&WorkflowEvent::for_instance(
                    &current,
                    current.current_activity_id.as_deref(),
                    WorkflowEventKind::WorkflowCancelled {
                        reason: "withdrawn".into(),
                    },
                ))?;
                self.inner
                    .commit_transition(TransitionCommit {
                        instance: cancelled,
                        expected_version: current.version,
                        record: None,
                        consume_bookmark: None,
                        create_bookmark: None,
                        event,
                    })
                    .await?;
            }
            Ok(version)
        }

        async fn list_history(
            &self,
            instance_id: Uuid,
        ) -> Result<Vec<ActivityExecutionRecord>, StoreError> {
            self.inner.list_history(instance_id).await
        }

        async fn last_completed_assignee(
            &self,
            instance_id: Uuid,
            activity_id: &str,
        ) -> Result<Option<String>, StoreError> {
            self.inner.last_completed_assignee(instance_id, activity_id).await
        }

        async fn latest_bookmark(
            &self,
            instance_id: Uuid,
            activity_id: &str,
        ) -> Result<Option<Bookmark>, StoreError> {
            self.inner.latest_bookmark(instance_id, activity_id).await
        }
    }

    #[tokio::test]
    async fn test_cancel_between_steps_skips_next_activity() {
        let calls = Arc::new(AtomicU32::new(0));
        let catalog = ActivityCatalog::with_builtins()
            .with(Arc::new(Counting {
                name: "Valuation",
                calls: calls.clone(),
            }))
            .unwrap();
        let mut registry = DefinitionRegistry::new(Arc::new(catalog));
        registry
            .register(linear(ActivityDefinition::new("valuate", "Valuation")))
            .unwrap();
        let store = Arc::new(CancelAfter {
            inner: InMemoryWorkflowStore::new(),
            trigger: "start",
        });
        let orch = Orchestrator::with_config(
            store.clone(),
            Arc::new(registry),
            Arc::new(AssignmentResolver::new(vec![StrategyKind::Manual])),
            quick_retries(1),
        );

        let response = orch
            .start_workflow(StartWorkflowRequest::new("linear", "APR-13", "requester"))
            .await
            .unwrap();

        assert_eq!(response.status, InstanceStatus::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let history = store.list_history(response.instance_id).await.unwrap();
        let steps: Vec<_> = history.iter().map(|r| r.activity_id.as_str()).collect();
        assert_eq!(steps, vec!["start"]);

        let last_event = store.inner.outbox_messages().pop().unwrap();
        assert_eq!(last_event.message_type, "workflow.cancelled");
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let catalog = ActivityCatalog::with_builtins()
            .with(Arc::new(Flaky {
                calls: calls.clone(),
                succeed_on: 3,
            }))
            .unwrap();
        let orch = orchestrator(
            vec![linear(ActivityDefinition::new("valuate", "Flaky"))],
            catalog,
            quick_retries(3),
        );

        let response = orch
            .start_workflow(StartWorkflowRequest::new("linear", "APR-6", "requester"))
            .await
            .unwrap();

        assert_eq!(response.status, InstanceStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let history = orch.store().list_history(response.instance_id).await.unwrap();
        assert_eq!(history[1].attempt, 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted_faults_with_history() {
        let calls = Arc::new(AtomicU32::new(0));
        let catalog = ActivityCatalog::with_builtins()
            .with(Arc::new(Flaky {
                calls: calls.clone(),
                succeed_on: u32::MAX,
            }))
            .unwrap();
        let orch = orchestrator(
            vec![linear(ActivityDefinition::new("valuate", "Flaky"))],
            catalog,
            quick_retries(2),
        );

        let response = orch
            .start_workflow(StartWorkflowRequest::new("linear", "APR-7", "requester"))
            .await
            .unwrap();

        assert_eq!(response.status, InstanceStatus::Faulted);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(response
            .fault_reason
            .as_deref()
            .unwrap()
            .starts_with("transient: valuation service unavailable"));

        let history = orch.store().list_history(response.instance_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_timeout_is_transient_failure() {
        let catalog = ActivityCatalog::with_builtins().with(Arc::new(Slow)).unwrap();
        let orch = orchestrator(
            vec![linear(ActivityDefinition::new("wait", "Slow"))],
            catalog,
            quick_retries(1),
        );

        let response = orch
            .start_workflow(StartWorkflowRequest::new("linear", "APR-8", "requester"))
            .await
            .unwrap();

        assert_eq!(response.status, InstanceStatus::Faulted);
        assert!(response.fault_reason.unwrap().contains("timed out after 10ms"));
    }

    #[tokio::test]
    async fn test_human_task_suspends_with_bookmark() {
        let definition = linear(
            ActivityDefinition::new("review", "HumanTask").with_property("assignee_id", "alice"),
        );
        let orch = orchestrator(vec![definition], ActivityCatalog::with_builtins(), quick_retries(1));

        let response = orch
            .start_workflow(StartWorkflowRequest::new("linear", "APR-9", "requester"))
            .await
            .unwrap();

        assert_eq!(response.status, InstanceStatus::Suspended);
        assert_eq!(response.next_activity_id.as_deref(), Some("review"));
        assert_eq!(response.next_assignee.as_deref(), Some("alice"));

        let bookmarks = orch.store().open_bookmarks();
        assert_eq!(bookmarks.len(), 1);
        assert_eq!(bookmarks[0].activity_id, "review");

        let last = orch.store().outbox_messages().pop().unwrap();
        let event = last.decode_event().unwrap();
        assert_eq!(event.assignee.as_deref(), Some("alice"));
        assert_eq!(
            event.kind,
            WorkflowEventKind::TaskAssigned {
                assignee_group: None,
                strategy: Some(StrategyKind::Manual),
            }
        );
    }

    #[tokio::test]
    async fn test_unassignable_human_task_faults() {
        let definition = linear(ActivityDefinition::new("review", "HumanTask"));
        let orch = orchestrator(vec![definition], ActivityCatalog::with_builtins(), quick_retries(3));

        let response = orch
            .start_workflow(StartWorkflowRequest::new("linear", "APR-10", "requester"))
            .await
            .unwrap();

        assert_eq!(response.status, InstanceStatus::Faulted);
        assert!(response.fault_reason.unwrap().contains("no assignee for activity review"));
        assert!(orch.store().open_bookmarks().is_empty());
    }
}
