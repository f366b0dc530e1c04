//! Bookmark resumption, cancellation and queries

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::orchestrator::{settle, Orchestrator, OrchestratorError, WorkflowRunResponse};
use crate::messaging::OutboxMessage;
use crate::persistence::{StoreError, TransitionCommit, WorkflowStore};
use crate::reliability::{FaultHandler, FaultKind};
use crate::workflow::{
    ActivityExecutionRecord, DefinitionError, InstanceStatus, WorkflowEvent, WorkflowEventKind,
    WorkflowInstance,
};

impl<S: WorkflowStore> Orchestrator<S> {
    /// Complete a suspended activity with external input and keep going
    ///
    /// The behavior's resume path validates the input first. Rejected input
    /// returns [`OrchestratorError::Validation`] and changes nothing, so the
    /// task can be resubmitted. A bookmark can be consumed once: a second
    /// resume, sequential or concurrent, fails with
    /// [`OrchestratorError::BookmarkConflict`] and has no side effects.
    #[instrument(skip_all, fields(instance_id = %instance_id, activity_id = %activity_id))]
    pub async fn resume_activity(
        &self,
        instance_id: Uuid,
        activity_id: &str,
        input: Value,
    ) -> Result<WorkflowRunResponse, OrchestratorError> {
        let instance = self.store.get_instance(instance_id).await?;

        let bookmark = self
            .store
            .latest_bookmark(instance_id, activity_id)
            .await?
            .ok_or_else(|| OrchestratorError::BookmarkNotFound {
                instance_id,
                activity_id: activity_id.to_string(),
            })?;
        if bookmark.is_consumed() {
            return Err(OrchestratorError::BookmarkConflict {
                instance_id,
                activity_id: activity_id.to_string(),
            });
        }

        if instance.status != InstanceStatus::Suspended
            || instance.current_activity_id.as_deref() != Some(activity_id)
        {
            return Err(OrchestratorError::InvalidState {
                instance_id,
                status: instance.status,
                message: format!("not waiting on activity {activity_id}"),
            });
        }

        let definition = self
            .definitions
            .get_version(&instance.definition_id, instance.definition_version)?;
        let activity = definition.activity(activity_id)?;
        let behavior = self
            .catalog
            .get(&activity.activity_type)
            .map_err(DefinitionError::from)?;

        let descriptor = behavior.descriptor();
        let policy = self.policy_for(activity, &descriptor);
        let timeout = self.timeout_for(activity, &descriptor);
        let ctx = self.context(&instance, activity, 1, &policy);
        let started_at = Utc::now();

        let outcome = settle(
            tokio::time::timeout(timeout, behavior.resume(&ctx, &input)).await,
            timeout,
        );

        let commit = match outcome {
            Ok(result) => self.transition_commit(
                &instance,
                &definition,
                activity,
                result,
                1,
                started_at,
                Some(bookmark.id),
            )?,
            Err(error) => match FaultHandler::classify(&error, &policy) {
                FaultKind::Validation => {
                    debug!(error = %error, "resume input rejected");
                    return Err(OrchestratorError::Validation {
                        activity_id: activity_id.to_string(),
                        source: error,
                    });
                }
                FaultKind::Transient => {
                    warn!(error = %error, "resume failed, bookmark left open");
                    return Err(OrchestratorError::ActivityFailed {
                        activity_id: activity_id.to_string(),
                        source: error,
                    });
                }
                kind => {
                    warn!(kind = kind.as_str(), error = %error, "resume failed, faulting instance");
                    let reason = format!("{}: {}", kind.as_str(), error.message);
                    self.fault_commit(
                        &instance,
                        Some(activity),
                        1,
                        started_at,
                        reason,
                        Some(bookmark.id),
                    )?
                }
            },
        };

        let next = self.commit(commit).await.map_err(|e| match e {
            StoreError::BookmarkConsumed { .. } | StoreError::ConcurrencyConflict { .. } => {
                OrchestratorError::BookmarkConflict {
                    instance_id,
                    activity_id: activity_id.to_string(),
                }
            }
            other => other.into(),
        })?;

        info!(status = %next.status, "activity resumed");
        let next = self.drive(next, &definition).await?;
        Ok(WorkflowRunResponse::from(&next))
    }

    /// Cancel a non-terminal instance
    ///
    /// An open bookmark is consumed so the task can no longer be resumed.
    /// A drive loop running concurrently stops before its next step, or at
    /// commit if a step is already executing.
    #[instrument(skip_all, fields(instance_id = %instance_id))]
    pub async fn cancel_workflow(
        &self,
        instance_id: Uuid,
        reason: impl Into<String>,
    ) -> Result<WorkflowRunResponse, OrchestratorError> {
        let reason = reason.into();
        let mut attempt = 1;

        loop {
            let instance = self.store.get_instance(instance_id).await?;
            if instance.is_terminal() {
                return Err(OrchestratorError::InvalidState {
                    instance_id,
                    status: instance.status,
                    message: "cannot cancel a finished instance".into(),
                });
            }

            let commit = self.cancel_commit(&instance, &reason).await?;
            match self.commit(commit).await {
                Ok(next) => {
                    info!(%reason, "workflow cancelled");
                    return Ok(WorkflowRunResponse::from(&next));
                }
                Err(StoreError::ConcurrencyConflict { .. } | StoreError::BookmarkConsumed { .. })
                    if attempt < self.config.cancel_attempts =>
                {
                    debug!(attempt, "instance changed while cancelling, reloading");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn cancel_commit(
        &self,
        instance: &WorkflowInstance,
        reason: &str,
    ) -> Result<TransitionCommit, OrchestratorError> {
        let activity_id = instance.current_activity_id.clone();

        let consume_bookmark = match (&instance.status, activity_id.as_deref()) {
            (InstanceStatus::Suspended, Some(activity_id)) => self
                .store
                .latest_bookmark(instance.id, activity_id)
                .await?
                .filter(|b| !b.is_consumed())
                .map(|b| b.id),
            _ => None,
        };

        let mut next = instance.clone();
        next.cancel(reason)?;

        let event = WorkflowEvent::for_instance(
            instance,
            activity_id.as_deref(),
            WorkflowEventKind::WorkflowCancelled {
                reason: reason.to_string(),
            },
        );

        Ok(TransitionCommit {
            instance: next,
            expected_version: instance.version,
            record: None,
            consume_bookmark,
            create_bookmark: None,
            event: OutboxMessage::from_event(&event)?,
        })
    }

    #[instrument(skip(self))]
    pub async fn get_instance(&self, instance_id: Uuid) -> Result<WorkflowInstance, OrchestratorError> {
        Ok(self.store.get_instance(instance_id).await?)
    }

    /// Execution history in commit order
    #[instrument(skip(self))]
    pub async fn get_history(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<ActivityExecutionRecord>, OrchestratorError> {
        Ok(self.store.list_history(instance_id).await?)
    }
}
