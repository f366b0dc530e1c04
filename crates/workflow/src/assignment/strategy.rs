//! Assignment strategy trait and shared types

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::DirectoryError;
use crate::persistence::StoreError;
use crate::workflow::Variables;

/// Activity property keys read by the standard strategies
pub mod properties {
    /// Explicit user for manual assignment
    pub const ASSIGNEE_ID: &str = "assignee_id";
    /// Explicit group for manual assignment
    pub const ASSIGNEE_GROUP: &str = "assignee_group";
    /// Groups whose members rotate through the round-robin queue
    pub const CANDIDATE_GROUPS: &str = "candidate_groups";
    /// Activity whose last completer is reused by previous-owner assignment
    pub const PREVIOUS_OWNER_OF: &str = "previous_owner_of";
    /// Admin group receiving tasks nobody else picked up
    pub const ADMIN_POOL: &str = "admin_pool";
}

/// The closed set of assignment strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Manual,
    RoundRobin,
    PreviousOwner,
    AdminPool,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::RoundRobin => "round_robin",
            Self::PreviousOwner => "previous_owner",
            Self::AdminPool => "admin_pool",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-instance assignment override supplied when a workflow is started
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RuntimeOverride {
    #[serde(default)]
    pub assignee_id: Option<String>,
    #[serde(default)]
    pub assignee_group: Option<String>,
    /// Replaces the activity's configured strategy order
    #[serde(default)]
    pub strategies: Option<Vec<StrategyKind>>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl RuntimeOverride {
    pub fn assign_to(user_id: impl Into<String>) -> Self {
        Self {
            assignee_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    pub fn assign_to_group(group: impl Into<String>) -> Self {
        Self {
            assignee_group: Some(group.into()),
            ..Default::default()
        }
    }

    pub fn with_strategies(mut self, strategies: Vec<StrategyKind>) -> Self {
        self.strategies = Some(strategies);
        self
    }

    pub fn has_explicit_assignee(&self) -> bool {
        self.assignee_id.is_some() || self.assignee_group.is_some()
    }
}

/// Everything a strategy may look at
#[derive(Debug, Clone)]
pub struct AssignmentRequest {
    pub instance_id: Uuid,
    pub activity_id: String,
    /// Queue key for round-robin rotation
    pub activity_name: String,
    pub properties: Variables,
    /// Configured strategy order for the activity
    pub strategies: Vec<StrategyKind>,
    pub runtime_override: Option<RuntimeOverride>,
}

impl AssignmentRequest {
    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(|v| v.as_str())
    }

    /// A property that may be a single string or an array of strings
    pub fn property_list(&self, key: &str) -> Vec<String> {
        match self.properties.get(key) {
            Some(serde_json::Value::String(s)) => vec![s.clone()],
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Outcome of one strategy (or of the whole resolver)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AssigneeSelectionResult {
    pub success: bool,
    pub assignee_id: Option<String>,
    pub assignee_group: Option<String>,
    pub strategy: Option<StrategyKind>,
    pub reason: Option<String>,
    #[serde(default)]
    pub metadata: Variables,
}

impl AssigneeSelectionResult {
    pub fn user(strategy: StrategyKind, user_id: impl Into<String>) -> Self {
        Self {
            success: true,
            assignee_id: Some(user_id.into()),
            strategy: Some(strategy),
            ..Default::default()
        }
    }

    pub fn group(strategy: StrategyKind, group: impl Into<String>) -> Self {
        Self {
            success: true,
            assignee_group: Some(group.into()),
            strategy: Some(strategy),
            ..Default::default()
        }
    }

    pub fn failure(strategy: Option<StrategyKind>, reason: impl Into<String>) -> Self {
        Self {
            success: false,
            strategy,
            reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// The user if one was picked, otherwise the group
    pub fn assignee(&self) -> Option<&str> {
        self.assignee_id
            .as_deref()
            .or(self.assignee_group.as_deref())
    }
}

/// Errors that abort a strategy (as opposed to "no candidate")
#[derive(Debug, thiserror::Error)]
pub enum AssignmentError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

impl AssignmentError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            Self::Directory(_) => true,
        }
    }
}

/// A way of picking who works on a human task
#[async_trait]
pub trait AssignmentStrategy: Send + Sync + 'static {
    fn kind(&self) -> StrategyKind;

    /// Return a failed result when there is simply no candidate; reserve
    /// `Err` for infrastructure failures.
    async fn select_assignee(
        &self,
        request: &AssignmentRequest,
    ) -> Result<AssigneeSelectionResult, AssignmentError>;
}
