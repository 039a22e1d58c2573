//! Abstract schema operations.

use super::field::{DefaultValue, FieldDescriptor};
use serde::{Deserialize, Serialize};

/// Table-level options.
///
/// Display names carry no behavior; `db_table` overrides the physical name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableOptions {
    /// Human-readable singular name.
    #[serde(default)]
    pub verbose_name: Option<String>,
    /// Human-readable plural name.
    #[serde(default)]
    pub verbose_name_plural: Option<String>,
    /// Physical table name override.
    #[serde(default)]
    pub db_table: Option<String>,
}

/// A schema operation. Table names are local to the owning record's app label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Operation {
    /// Create a table.
    CreateTable {
        /// Model name.
        name: String,
        /// Fields in declaration order.
        fields: Vec<FieldDescriptor>,
        /// Table options.
        #[serde(default)]
        options: TableOptions,
        /// Base tables for table-per-subclass linkage (`app_label.model`).
        #[serde(default)]
        bases: Vec<String>,
    },
    /// Drop a table.
    DeleteTable {
        /// Model name.
        name: String,
    },
    /// Add a column to an existing table.
    AddField {
        /// Model name.
        table: String,
        /// New field.
        field: FieldDescriptor,
        /// One-off value for existing rows; not kept as the column default.
        #[serde(default)]
        backfill: Option<DefaultValue>,
    },
    /// Drop a column.
    RemoveField {
        /// Model name.
        table: String,
        /// Field name.
        field: String,
    },
    /// Replace a field's definition; matched by name.
    AlterField {
        /// Model name.
        table: String,
        /// New definition.
        field: FieldDescriptor,
    },
    /// Add a relational column.
    AddForeignKey {
        /// Model name.
        table: String,
        /// ForeignKey or OneToOne field.
        field: FieldDescriptor,
    },
}

impl Operation {
    /// Create a table with default options and no bases.
    pub fn create_table(name: impl Into<String>, fields: Vec<FieldDescriptor>) -> Self {
        Operation::CreateTable {
            name: name.into(),
            fields,
            options: TableOptions::default(),
            bases: Vec::new(),
        }
    }

    /// Add a field without a backfill value.
    pub fn add_field(table: impl Into<String>, field: FieldDescriptor) -> Self {
        Operation::AddField {
            table: table.into(),
            field,
            backfill: None,
        }
    }

    /// The model name this operation targets.
    pub fn table(&self) -> &str {
        match self {
            Operation::CreateTable { name, .. } | Operation::DeleteTable { name } => name,
            Operation::AddField { table, .. }
            | Operation::RemoveField { table, .. }
            | Operation::AlterField { table, .. }
            | Operation::AddForeignKey { table, .. } => table,
        }
    }

    /// Short human-readable description.
    pub fn describe(&self) -> String {
        match self {
            Operation::CreateTable { name, .. } => format!("Create table {}", name),
            Operation::DeleteTable { name } => format!("Delete table {}", name),
            Operation::AddField { table, field, .. } => {
                format!("Add field {} to {}", field.name, table)
            }
            Operation::RemoveField { table, field } => {
                format!("Remove field {} from {}", field, table)
            }
            Operation::AlterField { table, field } => {
                format!("Alter field {} on {}", field.name, table)
            }
            Operation::AddForeignKey { table, field } => {
                format!("Add foreign key {} to {}", field.name, table)
            }
        }
    }
}
