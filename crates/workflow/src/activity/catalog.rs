//! Activity catalog: activity type name to behavior
//!
//! The catalog is built once at startup and then shared read-only. Lookups
//! are by the `activity_type` string of an [`ActivityDefinition`].

use std::collections::HashMap;
use std::sync::Arc;

use super::builtin::{
    EndActivity, HumanTaskActivity, NotificationActivity, SetVariablesActivity, StartActivity,
};
use super::{error_types, ActivityBehavior, ActivityDescriptor, ActivityError};
use crate::workflow::ActivityDefinition;

/// Errors raised by catalog lookups and registration
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum CatalogError {
    #[error("unknown activity type: {activity_type}")]
    UnknownActivityType { activity_type: String },

    #[error("activity {activity_id} is missing required property {property}")]
    MissingProperty { activity_id: String, property: String },

    #[error("activity type {0} is already registered")]
    DuplicateType(String),
}

impl CatalogError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownActivityType { .. } => error_types::UNKNOWN_ACTIVITY_TYPE,
            Self::MissingProperty { .. } => error_types::MISSING_PROPERTY,
            Self::DuplicateType(_) => "DUPLICATE_ACTIVITY_TYPE",
        }
    }
}

impl From<CatalogError> for ActivityError {
    fn from(err: CatalogError) -> Self {
        let code = err.code();
        ActivityError::non_retryable(err.to_string()).with_type(code)
    }
}

struct CatalogEntry {
    behavior: Arc<dyn ActivityBehavior>,
    descriptor: ActivityDescriptor,
}

/// Closed registry of activity behaviors
#[derive(Default)]
pub struct ActivityCatalog {
    entries: HashMap<String, CatalogEntry>,
}

impl ActivityCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with `Start`, `End`, `HumanTask`, `Notification` and
    /// `SetVariables` registered
    pub fn with_builtins() -> Self {
        let builtins: [Arc<dyn ActivityBehavior>; 5] = [
            Arc::new(StartActivity),
            Arc::new(EndActivity),
            Arc::new(HumanTaskActivity::new(HumanTaskActivity::TYPE)),
            Arc::new(NotificationActivity),
            Arc::new(SetVariablesActivity),
        ];

        let mut catalog = Self::new();
        for behavior in builtins {
            let descriptor = behavior.descriptor();
            catalog
                .entries
                .insert(descriptor.activity_type.clone(), CatalogEntry { behavior, descriptor });
        }
        catalog
    }

    /// Register a behavior under its descriptor's type name
    pub fn register(&mut self, behavior: Arc<dyn ActivityBehavior>) -> Result<(), CatalogError> {
        let descriptor = behavior.descriptor();
        if self.entries.contains_key(&descriptor.activity_type) {
            return Err(CatalogError::DuplicateType(descriptor.activity_type));
        }
        self.entries
            .insert(descriptor.activity_type.clone(), CatalogEntry { behavior, descriptor });
        Ok(())
    }

    /// Builder-style [`register`](Self::register)
    pub fn with(mut self, behavior: Arc<dyn ActivityBehavior>) -> Result<Self, CatalogError> {
        self.register(behavior)?;
        Ok(self)
    }

    pub fn get(&self, activity_type: &str) -> Result<Arc<dyn ActivityBehavior>, CatalogError> {
        self.entries
            .get(activity_type)
            .map(|e| Arc::clone(&e.behavior))
            .ok_or_else(|| CatalogError::UnknownActivityType {
                activity_type: activity_type.to_string(),
            })
    }

    pub fn descriptor(&self, activity_type: &str) -> Result<&ActivityDescriptor, CatalogError> {
        self.entries
            .get(activity_type)
            .map(|e| &e.descriptor)
            .ok_or_else(|| CatalogError::UnknownActivityType {
                activity_type: activity_type.to_string(),
            })
    }

    pub fn contains(&self, activity_type: &str) -> bool {
        self.entries.contains_key(activity_type)
    }

    /// Registered type names, sorted
    pub fn activity_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Check that an activity's type is known and its required properties
    /// are declared
    pub fn validate(&self, activity: &ActivityDefinition) -> Result<(), CatalogError> {
        let descriptor = self.descriptor(&activity.activity_type)?;
        for property in &descriptor.required_properties {
            let present = activity
                .properties
                .get(property)
                .is_some_and(|v| !v.is_null());
            if !present {
                return Err(CatalogError::MissingProperty {
                    activity_id: activity.id.clone(),
                    property: property.clone(),
                });
            }
        }
        Ok(())
    }
}
