//! Definition registry
//!
//! Definitions are validated against the activity catalog when registered,
//! so the orchestrator never starts an instance of a broken graph. Every
//! registered version is kept: running instances finish on the version
//! they started with.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::info;

use crate::activity::ActivityCatalog;
use crate::workflow::{DefinitionError, WorkflowDefinition};

/// Registry of validated workflow definitions
pub struct DefinitionRegistry {
    catalog: Arc<ActivityCatalog>,
    definitions: HashMap<String, BTreeMap<i32, Arc<WorkflowDefinition>>>,
}

impl DefinitionRegistry {
    /// Create a new empty registry validating against `catalog`
    pub fn new(catalog: Arc<ActivityCatalog>) -> Self {
        Self {
            catalog,
            definitions: HashMap::new(),
        }
    }

    /// Validate and register a definition
    ///
    /// Registering the same id and version again replaces the earlier copy.
    pub fn register(&mut self, definition: WorkflowDefinition) -> Result<(), DefinitionError> {
        definition.validate()?;
        for activity in &definition.activities {
            self.catalog.validate(activity)?;
        }

        info!(
            definition_id = %definition.id,
            version = definition.version,
            activities = definition.activities.len(),
            "registered workflow definition"
        );
        self.definitions
            .entry(definition.id.clone())
            .or_default()
            .insert(definition.version, Arc::new(definition));
        Ok(())
    }

    /// Builder-style [`register`](Self::register)
    pub fn with(mut self, definition: WorkflowDefinition) -> Result<Self, DefinitionError> {
        self.register(definition)?;
        Ok(self)
    }

    /// Latest version of a definition
    pub fn get(&self, definition_id: &str) -> Result<Arc<WorkflowDefinition>, DefinitionError> {
        self.definitions
            .get(definition_id)
            .and_then(|versions| versions.values().next_back())
            .cloned()
            .ok_or_else(|| DefinitionError::NotFound(definition_id.to_string()))
    }

    /// A specific version of a definition
    pub fn get_version(
        &self,
        definition_id: &str,
        version: i32,
    ) -> Result<Arc<WorkflowDefinition>, DefinitionError> {
        self.definitions
            .get(definition_id)
            .and_then(|versions| versions.get(&version))
            .cloned()
            .ok_or_else(|| DefinitionError::NotFound(format!("{definition_id}@v{version}")))
    }

    pub fn catalog(&self) -> &Arc<ActivityCatalog> {
        &self.catalog
    }

    /// Registered definition ids, sorted
    pub fn definition_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.definitions.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}
