//! Workflow instance state machine and execution history records

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::Variables;
use crate::assignment::RuntimeOverride;

/// Lifecycle status of a workflow instance
///
/// ```text
///            ┌──────────┐  bookmark   ┌───────────┐
///  start ──▶ │ Running  │ ──────────▶ │ Suspended │
///            │          │ ◀────────── │           │
///            └──────────┘   resume    └───────────┘
///              │   │   │                 │     │
///   completed ◀┘   │   └▶ faulted ◀──────┘     │
///                  └──────▶ cancelled ◀────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Suspended,
    Completed,
    Faulted,
    Cancelled,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Completed => "completed",
            Self::Faulted => "faulted",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Faulted | Self::Cancelled)
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: InstanceStatus) -> bool {
        match self {
            Self::Running => next != Self::Running,
            Self::Suspended => matches!(next, Self::Running | Self::Faulted | Self::Cancelled),
            _ => false,
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "suspended" => Ok(Self::Suspended),
            "completed" => Ok(Self::Completed),
            "faulted" => Ok(Self::Faulted),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown instance status: {other}")),
        }
    }
}

/// Illegal state-machine move
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
#[error("instance {instance_id} cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub instance_id: Uuid,
    pub from: InstanceStatus,
    pub to: InstanceStatus,
}

/// A running (or finished) execution of a workflow definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub definition_id: String,
    pub definition_version: i32,
    pub name: String,
    pub started_by: String,
    pub status: InstanceStatus,
    pub current_activity_id: Option<String>,
    pub current_assignee: Option<String>,
    pub variables: Variables,
    /// Assignment overrides keyed by activity id
    #[serde(default)]
    pub runtime_overrides: BTreeMap<String, RuntimeOverride>,
    pub correlation_id: Option<String>,
    pub fault_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency token, bumped by every committed transition
    pub version: i64,
}

impl WorkflowInstance {
    /// A fresh instance positioned on its start activity
    pub fn new(
        definition_id: impl Into<String>,
        definition_version: i32,
        name: impl Into<String>,
        started_by: impl Into<String>,
        start_activity: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            definition_id: definition_id.into(),
            definition_version,
            name: name.into(),
            started_by: started_by.into(),
            status: InstanceStatus::Running,
            current_activity_id: Some(start_activity.into()),
            current_assignee: None,
            variables: Variables::new(),
            runtime_overrides: BTreeMap::new(),
            correlation_id: None,
            fault_reason: None,
            started_at: Utc::now(),
            ended_at: None,
            version: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Shallow-merge variable updates; later writes win
    pub fn merge_variables(&mut self, updates: &Variables) {
        for (key, value) in updates {
            self.variables.insert(key.clone(), value.clone());
        }
    }

    pub fn runtime_override(&self, activity_id: &str) -> Option<&RuntimeOverride> {
        self.runtime_overrides.get(activity_id)
    }

    fn transition(&mut self, next: InstanceStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                instance_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
            self.current_activity_id = None;
            self.current_assignee = None;
        }
        Ok(())
    }

    /// Move to the next activity and keep running
    pub fn advance_to(&mut self, activity_id: impl Into<String>) -> Result<(), InvalidTransition> {
        if self.status != InstanceStatus::Running {
            self.transition(InstanceStatus::Running)?;
        }
        self.current_activity_id = Some(activity_id.into());
        self.current_assignee = None;
        Ok(())
    }

    /// Park on the current activity waiting for external input
    pub fn suspend(&mut self, assignee: Option<String>) -> Result<(), InvalidTransition> {
        self.transition(InstanceStatus::Suspended)?;
        self.current_assignee = assignee;
        Ok(())
    }

    /// Leave the suspended state after a successful resume
    pub fn wake(&mut self) -> Result<(), InvalidTransition> {
        self.transition(InstanceStatus::Running)
    }

    pub fn complete(&mut self) -> Result<(), InvalidTransition> {
        self.transition(InstanceStatus::Completed)
    }

    pub fn fault(&mut self, reason: impl Into<String>) -> Result<(), InvalidTransition> {
        self.transition(InstanceStatus::Faulted)?;
        self.fault_reason = Some(reason.into());
        Ok(())
    }

    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), InvalidTransition> {
        self.transition(InstanceStatus::Cancelled)?;
        self.fault_reason = Some(reason.into());
        Ok(())
    }
}

/// Outcome of a single activity execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Pending,
    Failed,
    Skipped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Pending => "pending",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "pending" => Ok(Self::Pending),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// Append-only history row: one per executed step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityExecutionRecord {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub activity_id: String,
    pub activity_type: String,
    pub status: ExecutionStatus,
    pub assignee: Option<String>,
    pub attempt: u32,
    pub output: Value,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> WorkflowInstance {
        WorkflowInstance::new("appraisal", 1, "APR-1", "requester", "start")
    }

    #[test]
    fn test_new_instance_is_running_on_start() {
        let inst = instance();
        assert_eq!(inst.status, InstanceStatus::Running);
        assert_eq!(inst.current_activity_id.as_deref(), Some("start"));
        assert_eq!(inst.version, 0);
    }

    #[test]
    fn test_suspend_and_wake() {
        let mut inst = instance();
        inst.advance_to("review").unwrap();
        inst.suspend(Some("alice".into())).unwrap();
        assert_eq!(inst.status, InstanceStatus::Suspended);
        assert_eq!(inst.current_assignee.as_deref(), Some("alice"));

        inst.wake().unwrap();
        assert_eq!(inst.status, InstanceStatus::Running);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut inst = instance();
        inst.complete().unwrap();
        assert!(inst.is_terminal());
        assert!(inst.ended_at.is_some());
        assert!(inst.current_activity_id.is_none());

        assert!(inst.fault("late").is_err());
        assert!(inst.cancel("late").is_err());
        assert!(inst.advance_to("review").is_err());
    }

    #[test]
    fn test_suspended_cannot_complete_directly() {
        let mut inst = instance();
        inst.suspend(None).unwrap();
        let err = inst.complete().unwrap_err();
        assert_eq!(err.from, InstanceStatus::Suspended);
        assert_eq!(err.to, InstanceStatus::Completed);
    }

    #[test]
    fn test_merge_variables_last_write_wins() {
        let mut inst = instance();
        inst.variables.insert("a".into(), 1.into());
        let mut updates = Variables::new();
        updates.insert("a".into(), 2.into());
        updates.insert("b".into(), "x".into());
        inst.merge_variables(&updates);

        assert_eq!(inst.variables["a"], 2);
        assert_eq!(inst.variables["b"], "x");
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            InstanceStatus::Running,
            InstanceStatus::Suspended,
            InstanceStatus::Completed,
            InstanceStatus::Faulted,
            InstanceStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<InstanceStatus>().unwrap(), status);
        }
        assert!("paused".parse::<InstanceStatus>().is_err());
    }
}
