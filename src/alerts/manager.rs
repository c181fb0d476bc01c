//! Registry of loaded alert definitions

use std::sync::Arc;

use parking_lot::RwLock;

use super::definition::{AlertDefinition, AlertId};
use super::loader::{discover_alert_definitions, DefinitionFs, LoadError};

/// Default location of definition files below the content root
pub const DEFAULT_ALERT_PATTERN: &str = "*/alerts.yaml";

/// Discovers alert definitions and holds the current set.
///
/// A successful discovery replaces the whole set; a failed one leaves the
/// previous set untouched.
pub struct AlertManager {
    fs: Arc<dyn DefinitionFs>,
    pattern: String,
    definitions: RwLock<Vec<AlertDefinition>>,
}

impl AlertManager {
    pub fn new(fs: Arc<dyn DefinitionFs>) -> Self {
        Self::with_pattern(fs, DEFAULT_ALERT_PATTERN)
    }

    pub fn with_pattern(fs: Arc<dyn DefinitionFs>, pattern: impl Into<String>) -> Self {
        Self {
            fs,
            pattern: pattern.into(),
            definitions: RwLock::new(Vec::new()),
        }
    }

    /// Rescan the content tree; returns the number of loaded definitions
    pub fn discover(&self) -> Result<usize, LoadError> {
        let definitions = discover_alert_definitions(self.fs.as_ref(), &self.pattern)?;
        let count = definitions.len();

        tracing::debug!(
            pattern = %self.pattern,
            alerts = ?definitions.iter().map(|d| d.id.to_string()).collect::<Vec<_>>(),
            "loaded alert definitions"
        );

        *self.definitions.write() = definitions;
        Ok(count)
    }

    /// Snapshot of the loaded definitions
    pub fn definitions(&self) -> Vec<AlertDefinition> {
        self.definitions.read().clone()
    }

    pub fn get(&self, id: &AlertId) -> Option<AlertDefinition> {
        self.definitions
            .read()
            .iter()
            .find(|d| &d.id == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.definitions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
