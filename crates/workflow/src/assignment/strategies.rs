//! The four standard assignment strategies

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::round_robin::{group_set_hash, normalize_groups};
use super::strategy::properties;
use super::{
    AssigneeSelectionResult, AssignmentError, AssignmentRequest, AssignmentStrategy,
    StrategyKind, UserDirectory,
};
use crate::persistence::{RoundRobinStore, WorkflowStore};

/// Explicit assignee from the runtime override or the activity properties
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualStrategy;

#[async_trait]
impl AssignmentStrategy for ManualStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Manual
    }

    async fn select_assignee(
        &self,
        request: &AssignmentRequest,
    ) -> Result<AssigneeSelectionResult, AssignmentError> {
        let kind = self.kind();

        if let Some(ov) = &request.runtime_override {
            if let Some(user) = &ov.assignee_id {
                return Ok(AssigneeSelectionResult::user(kind, user)
                    .with_metadata("source", "runtime_override"));
            }
            if let Some(group) = &ov.assignee_group {
                return Ok(AssigneeSelectionResult::group(kind, group)
                    .with_metadata("source", "runtime_override"));
            }
        }

        if let Some(user) = request.property_str(properties::ASSIGNEE_ID) {
            return Ok(AssigneeSelectionResult::user(kind, user).with_metadata("source", "property"));
        }
        if let Some(group) = request.property_str(properties::ASSIGNEE_GROUP) {
            return Ok(AssigneeSelectionResult::group(kind, group).with_metadata("source", "property"));
        }

        Ok(AssigneeSelectionResult::failure(
            Some(kind),
            "no manual assignee configured",
        ))
    }
}

/// Rotates through the members of the activity's candidate groups
pub struct RoundRobinStrategy {
    queue: Arc<dyn RoundRobinStore>,
    directory: Arc<dyn UserDirectory>,
}

impl RoundRobinStrategy {
    pub fn new(queue: Arc<dyn RoundRobinStore>, directory: Arc<dyn UserDirectory>) -> Self {
        Self { queue, directory }
    }
}

#[async_trait]
impl AssignmentStrategy for RoundRobinStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::RoundRobin
    }

    async fn select_assignee(
        &self,
        request: &AssignmentRequest,
    ) -> Result<AssigneeSelectionResult, AssignmentError> {
        let mut groups = request.property_list(properties::CANDIDATE_GROUPS);
        if groups.is_empty() {
            groups = request.property_list(properties::ASSIGNEE_GROUP);
        }
        let groups = normalize_groups(&groups);
        if groups.is_empty() {
            return Ok(AssigneeSelectionResult::failure(
                Some(self.kind()),
                "no candidate groups configured",
            ));
        }

        let hash = group_set_hash(&groups);
        let members = self.directory.users_in_groups(&groups).await?;
        let report = self
            .queue
            .sync_users_for_group_combination(&request.activity_name, &hash, &groups, &members)
            .await?;
        if !report.is_noop() {
            debug!(
                activity = %request.activity_name,
                added = report.added.len(),
                deactivated = report.deactivated.len(),
                "round-robin membership changed"
            );
        }

        match self
            .queue
            .select_next_user_with_round_reset(&request.activity_name, &hash)
            .await?
        {
            Some(selection) => Ok(AssigneeSelectionResult::user(self.kind(), selection.user_id)
                .with_metadata("group_set_hash", hash)
                .with_metadata("round_reset", selection.round_reset)),
            None => Ok(AssigneeSelectionResult::failure(
                Some(self.kind()),
                format!("no active users in groups {}", groups.join(", ")),
            )),
        }
    }
}

/// Hands a routed-back task to whoever completed the activity last time
pub struct PreviousOwnerStrategy {
    history: Arc<dyn WorkflowStore>,
}

impl PreviousOwnerStrategy {
    pub fn new(history: Arc<dyn WorkflowStore>) -> Self {
        Self { history }
    }
}

#[async_trait]
impl AssignmentStrategy for PreviousOwnerStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::PreviousOwner
    }

    async fn select_assignee(
        &self,
        request: &AssignmentRequest,
    ) -> Result<AssigneeSelectionResult, AssignmentError> {
        let target = request
            .property_str(properties::PREVIOUS_OWNER_OF)
            .unwrap_or(&request.activity_id);

        match self
            .history
            .last_completed_assignee(request.instance_id, target)
            .await?
        {
            Some(user) => Ok(AssigneeSelectionResult::user(self.kind(), user)
                .with_metadata("previous_activity", target)),
            None => Ok(AssigneeSelectionResult::failure(
                Some(self.kind()),
                format!("activity {target} has no previous completion"),
            )),
        }
    }
}

/// Last-resort escalation to an admin group
#[derive(Debug, Clone, Default)]
pub struct AdminPoolStrategy {
    default_pool: Option<String>,
}

impl AdminPoolStrategy {
    pub fn new(default_pool: Option<String>) -> Self {
        Self { default_pool }
    }
}

#[async_trait]
impl AssignmentStrategy for AdminPoolStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::AdminPool
    }

    async fn select_assignee(
        &self,
        request: &AssignmentRequest,
    ) -> Result<AssigneeSelectionResult, AssignmentError> {
        let pool = request
            .property_str(properties::ADMIN_POOL)
            .or(self.default_pool.as_deref());

        Ok(match pool {
            Some(pool) => AssigneeSelectionResult::group(self.kind(), pool),
            None => AssigneeSelectionResult::failure(Some(self.kind()), "no admin pool configured"),
        })
    }
}
