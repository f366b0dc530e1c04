//! Transition conditions
//!
//! Conditions are pure predicates over the instance's variable map. They are
//! stored as tagged JSON inside workflow definitions, so a definition can be
//! authored as data and evaluated without any side effects.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Variables;

/// A predicate guarding a transition
///
/// Variable names may use dotted paths (`"appraisal.status"`) to reach into
/// nested objects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    /// Variable equals the given value
    Equals { variable: String, value: Value },

    /// Variable is missing or differs from the given value
    NotEquals { variable: String, value: Value },

    /// Variable equals one of the given values
    In { variable: String, values: Vec<Value> },

    /// Variable is present and not null
    Exists { variable: String },

    /// Variable is truthy (true, non-zero, non-empty)
    Truthy { variable: String },

    /// Numeric variable is strictly greater than the threshold
    GreaterThan { variable: String, value: f64 },

    /// Numeric variable is strictly less than the threshold
    LessThan { variable: String, value: f64 },

    /// All nested conditions hold (vacuously true when empty)
    And { conditions: Vec<Condition> },

    /// At least one nested condition holds
    Or { conditions: Vec<Condition> },

    /// Nested condition does not hold
    Not { condition: Box<Condition> },
}

impl Condition {
    pub fn equals(variable: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Equals {
            variable: variable.into(),
            value: value.into(),
        }
    }

    pub fn not_equals(variable: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::NotEquals {
            variable: variable.into(),
            value: value.into(),
        }
    }

    pub fn exists(variable: impl Into<String>) -> Self {
        Self::Exists {
            variable: variable.into(),
        }
    }

    pub fn truthy(variable: impl Into<String>) -> Self {
        Self::Truthy {
            variable: variable.into(),
        }
    }

    pub fn one_of(variable: impl Into<String>, values: Vec<Value>) -> Self {
        Self::In {
            variable: variable.into(),
            values,
        }
    }

    pub fn greater_than(variable: impl Into<String>, value: impl Into<f64>) -> Self {
        Self::GreaterThan {
            variable: variable.into(),
            value: value.into(),
        }
    }

    pub fn less_than(variable: impl Into<String>, value: impl Into<f64>) -> Self {
        Self::LessThan {
            variable: variable.into(),
            value: value.into(),
        }
    }

    pub fn all(conditions: Vec<Condition>) -> Self {
        Self::And { conditions }
    }

    pub fn any(conditions: Vec<Condition>) -> Self {
        Self::Or { conditions }
    }

    pub fn negate(condition: Condition) -> Self {
        Self::Not {
            condition: Box::new(condition),
        }
    }

    /// Evaluate the condition against a variable map
    pub fn evaluate(&self, variables: &Variables) -> bool {
        match self {
            Self::Equals { variable, value } => lookup(variables, variable) == Some(value),
            Self::NotEquals { variable, value } => lookup(variables, variable) != Some(value),
            Self::In { variable, values } => {
                lookup(variables, variable).is_some_and(|v| values.contains(v))
            }
            Self::Exists { variable } => lookup(variables, variable).is_some_and(|v| !v.is_null()),
            Self::Truthy { variable } => lookup(variables, variable).is_some_and(is_truthy),
            Self::GreaterThan { variable, value } => lookup(variables, variable)
                .and_then(Value::as_f64)
                .is_some_and(|v| v > *value),
            Self::LessThan { variable, value } => lookup(variables, variable)
                .and_then(Value::as_f64)
                .is_some_and(|v| v < *value),
            Self::And { conditions } => conditions.iter().all(|c| c.evaluate(variables)),
            Self::Or { conditions } => conditions.iter().any(|c| c.evaluate(variables)),
            Self::Not { condition } => !condition.evaluate(variables),
        }
    }
}

fn lookup<'a>(variables: &'a Variables, path: &str) -> Option<&'a Value> {
    if let Some(value) = variables.get(path) {
        return Some(value);
    }

    let mut segments = path.split('.');
    let mut current = variables.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
