//! Workflow definitions: the activity graph an instance walks through

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Condition, Variables};
use crate::activity::CatalogError;
use crate::assignment::StrategyKind;
use crate::reliability::{option_duration_millis, RetryPolicy};

/// Errors raised while validating or walking a definition
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum DefinitionError {
    #[error("workflow definition not found: {0}")]
    NotFound(String),

    #[error("definition {definition} has no start activity")]
    NoStartActivity { definition: String },

    #[error("definition {definition} has {count} start activities, expected exactly one")]
    MultipleStartActivities { definition: String, count: usize },

    #[error("definition {definition} has no end activity")]
    NoEndActivity { definition: String },

    #[error("definition {definition} declares activity {activity} more than once")]
    DuplicateActivity { definition: String, activity: String },

    #[error("definition {definition} references unknown activity {activity}")]
    UnknownActivity { definition: String, activity: String },

    #[error("activity {activity} in definition {definition} has no outgoing transition")]
    DeadEnd { definition: String, activity: String },

    #[error("no transition out of activity {activity} matches the current variables")]
    NoMatchingTransition { definition: String, activity: String },

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

impl DefinitionError {
    /// Machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "DEFINITION_NOT_FOUND",
            Self::NoMatchingTransition { .. } => "NO_MATCHING_TRANSITION",
            Self::Catalog(e) => e.code(),
            _ => "DEFINITION_INVALID",
        }
    }
}

/// One node of the activity graph
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityDefinition {
    /// Identifier unique within the definition
    pub id: String,

    /// Human-readable name (also the round-robin queue key)
    pub name: String,

    /// Activity type looked up in the catalog
    pub activity_type: String,

    /// Static configuration handed to the behavior
    #[serde(default)]
    pub properties: Variables,

    #[serde(default)]
    pub is_start: bool,

    #[serde(default)]
    pub is_end: bool,

    /// Ordered assignment strategies for human tasks
    #[serde(default)]
    pub assignment: Vec<StrategyKind>,

    /// Per-activity timeout, overriding the behavior's and the engine default
    #[serde(default, with = "option_duration_millis")]
    pub timeout: Option<Duration>,

    /// Per-activity retry policy, overriding the behavior's and the engine default
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
}

impl ActivityDefinition {
    pub fn new(id: impl Into<String>, activity_type: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            activity_type: activity_type.into(),
            properties: Variables::new(),
            is_start: false,
            is_end: false,
            assignment: Vec::new(),
            timeout: None,
            retry_policy: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn start(mut self) -> Self {
        self.is_start = true;
        self
    }

    pub fn end(mut self) -> Self {
        self.is_end = true;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_assignment(mut self, strategies: Vec<StrategyKind>) -> Self {
        self.assignment = strategies;
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

/// A directed edge between two activities
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransitionDefinition {
    pub from: String,
    pub to: String,

    /// Guard; an unconditional transition is the fallback edge
    #[serde(default)]
    pub condition: Option<Condition>,
}

impl TransitionDefinition {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: None,
        }
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }
}

/// A named, versioned activity graph
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: i32,
    pub activities: Vec<ActivityDefinition>,
    #[serde(default)]
    pub transitions: Vec<TransitionDefinition>,
}

fn default_version() -> i32 {
    1
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: 1,
            activities: Vec::new(),
            transitions: Vec::new(),
        }
    }

    pub fn with_version(mut self, version: i32) -> Self {
        self.version = version;
        self
    }

    pub fn with_activity(mut self, activity: ActivityDefinition) -> Self {
        self.activities.push(activity);
        self
    }

    pub fn with_transition(mut self, transition: TransitionDefinition) -> Self {
        self.transitions.push(transition);
        self
    }

    /// Look up an activity by id
    pub fn activity(&self, id: &str) -> Result<&ActivityDefinition, DefinitionError> {
        self.activities
            .iter()
            .find(|a| a.id == id)
            .ok_or_else(|| DefinitionError::UnknownActivity {
                definition: self.id.clone(),
                activity: id.to_string(),
            })
    }

    /// The single start activity
    pub fn start_activity(&self) -> Result<&ActivityDefinition, DefinitionError> {
        let mut starts = self.activities.iter().filter(|a| a.is_start);
        let first = starts.next().ok_or_else(|| DefinitionError::NoStartActivity {
            definition: self.id.clone(),
        })?;
        let extra = starts.count();
        if extra > 0 {
            return Err(DefinitionError::MultipleStartActivities {
                definition: self.id.clone(),
                count: extra + 1,
            });
        }
        Ok(first)
    }

    /// Outgoing transitions of an activity in declaration order
    pub fn outgoing<'a>(
        &'a self,
        activity_id: &'a str,
    ) -> impl Iterator<Item = &'a TransitionDefinition> + 'a {
        self.transitions.iter().filter(move |t| t.from == activity_id)
    }

    /// Pick the next activity after `from` completes
    ///
    /// An explicit next activity from the behavior wins but must be the
    /// target of an outgoing transition. Otherwise outgoing transitions are
    /// tried in declaration order and the first one without a guard, or
    /// whose guard holds, is taken.
    pub fn next_activity(
        &self,
        from: &str,
        variables: &Variables,
        explicit: Option<&str>,
    ) -> Result<&ActivityDefinition, DefinitionError> {
        if let Some(target) = explicit {
            if self.outgoing(from).any(|t| t.to == target) {
                return self.activity(target);
            }
            return Err(DefinitionError::NoMatchingTransition {
                definition: self.id.clone(),
                activity: from.to_string(),
            });
        }

        let chosen = self
            .outgoing(from)
            .find(|t| t.condition.as_ref().map_or(true, |c| c.evaluate(variables)));

        match chosen {
            Some(transition) => self.activity(&transition.to),
            None => Err(DefinitionError::NoMatchingTransition {
                definition: self.id.clone(),
                activity: from.to_string(),
            }),
        }
    }

    /// Structural validation: one start, at least one end, unique ids,
    /// known transition endpoints and no dead ends.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        self.start_activity()?;

        if !self.activities.iter().any(|a| a.is_end) {
            return Err(DefinitionError::NoEndActivity {
                definition: self.id.clone(),
            });
        }

        let mut seen = HashSet::new();
        for activity in &self.activities {
            if !seen.insert(activity.id.as_str()) {
                return Err(DefinitionError::DuplicateActivity {
                    definition: self.id.clone(),
                    activity: activity.id.clone(),
                });
            }
        }

        for transition in &self.transitions {
            for endpoint in [&transition.from, &transition.to] {
                if !seen.contains(endpoint.as_str()) {
                    return Err(DefinitionError::UnknownActivity {
                        definition: self.id.clone(),
                        activity: endpoint.clone(),
                    });
                }
            }
        }

        for activity in self.activities.iter().filter(|a| !a.is_end) {
            if self.outgoing(&activity.id).next().is_none() {
                return Err(DefinitionError::DeadEnd {
                    definition: self.id.clone(),
                    activity: activity.id.clone(),
                });
            }
        }

        Ok(())
    }
}
