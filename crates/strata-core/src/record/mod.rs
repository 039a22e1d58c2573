//! Migration records and the schema operations they carry.
//!
//! A [`MigrationRecord`] is an immutable value: an identity, the records it
//! depends on, and an ordered list of [`Operation`]s. Records are usually
//! loaded from JSON through a [`crate::discovery::MigrationSource`].

mod field;
mod id;
mod operation;

pub use field::{DefaultValue, FieldDescriptor, FieldType, OnDelete};
pub use id::{MigrationId, TableId};
pub use operation::{Operation, TableOptions};

use crate::error::MigrationError;
use serde::{Deserialize, Serialize};

/// A single versioned migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Application the migration belongs to.
    pub app_label: String,
    /// Migration name, unique within the application.
    pub name: String,
    /// Whether this is an initial migration of its application.
    #[serde(default)]
    pub initial: bool,
    /// Migrations that must be applied first.
    #[serde(default)]
    pub dependencies: Vec<MigrationId>,
    /// Operations, applied in order.
    #[serde(default)]
    pub operations: Vec<Operation>,
}

impl MigrationRecord {
    /// Create an empty record.
    pub fn new(app_label: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            app_label: app_label.into(),
            name: name.into(),
            initial: false,
            dependencies: Vec::new(),
            operations: Vec::new(),
        }
    }

    /// Mark as an initial migration.
    pub fn initial(mut self) -> Self {
        self.initial = true;
        self
    }

    /// Add a dependency.
    pub fn depends_on(mut self, app_label: impl Into<String>, name: impl Into<String>) -> Self {
        self.dependencies.push(MigrationId::new(app_label, name));
        self
    }

    /// Append an operation.
    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    /// The record's identity.
    pub fn id(&self) -> MigrationId {
        MigrationId::new(self.app_label.clone(), self.name.clone())
    }

    /// Hex-encoded blake3 digest of the record's canonical JSON form.
    pub fn checksum(&self) -> Result<String, MigrationError> {
        let bytes =
            serde_json::to_vec(self).map_err(|e| MigrationError::Serialization(e.to_string()))?;
        Ok(hex::encode(blake3::hash(&bytes).as_bytes()))
    }

    /// Parse a record from JSON.
    pub fn from_json(source_name: &str, json: &str) -> Result<Self, MigrationError> {
        let record: Self = serde_json::from_str(json).map_err(|e| MigrationError::Load {
            source_name: source_name.to_string(),
            reason: e.to_string(),
        })?;
        record.validate_identity(source_name)?;
        Ok(record)
    }

    /// Reject records with an empty or malformed identity.
    pub(crate) fn validate_identity(&self, source_name: &str) -> Result<(), MigrationError> {
        let invalid = |reason: &str| MigrationError::Load {
            source_name: source_name.to_string(),
            reason: reason.to_string(),
        };
        if self.app_label.is_empty() {
            return Err(invalid("app_label must not be empty"));
        }
        if self.name.is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.app_label.contains('.') {
            return Err(invalid("app_label must not contain '.'"));
        }
        Ok(())
    }
}
