//! In-memory schema model mutated by the operation interpreter.

use crate::error::MigrationError;
use crate::record::{FieldDescriptor, FieldType, OnDelete, TableId, TableOptions};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Who enforces a foreign key's delete policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Enforcement {
    /// The relational store enforces it through its `ON DELETE` clause.
    Store,
    /// The store has no equivalent; the engine must check before deletes.
    Engine,
}

/// One row of the constraint table derived from relational fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyConstraint {
    /// Referencing table.
    pub table: TableId,
    /// Referencing column.
    pub column: String,
    /// Referenced table.
    pub references: TableId,
    /// Delete policy.
    pub on_delete: OnDelete,
    /// Where the policy is enforced.
    pub enforcement: Enforcement,
    /// Whether the column is the table's primary key (parent link).
    pub parent_link: bool,
}

/// A table in the schema model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableState {
    /// Table identity.
    pub id: TableId,
    /// Model name as declared.
    pub name: String,
    /// Physical table name.
    pub db_table: String,
    /// Fields in column order.
    pub fields: Vec<FieldDescriptor>,
    /// Base tables this table links to (table-per-subclass).
    #[serde(default)]
    pub bases: Vec<TableId>,
    /// Table options.
    #[serde(default)]
    pub options: TableOptions,
}

impl TableState {
    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Check if a field exists.
    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// The primary key field.
    pub fn primary_key(&self) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.primary_key)
    }

    /// Resolved relation targets of this table's relational fields.
    pub fn relations(&self) -> impl Iterator<Item = (&FieldDescriptor, TableId, OnDelete)> + '_ {
        self.fields.iter().filter_map(move |field| {
            field
                .field_type
                .relation()
                .map(|(to, on_delete)| (field, TableId::resolve(to, &self.id.app_label), on_delete))
        })
    }
}

/// The schema as left by all applied operations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaModel {
    /// Tables keyed by `TableId` display form.
    tables: BTreeMap<String, TableState>,
}

impl SchemaModel {
    /// Create an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a table.
    pub fn table(&self, id: &TableId) -> Option<&TableState> {
        self.tables.get(&id.to_string())
    }

    pub(crate) fn table_mut(&mut self, id: &TableId) -> Option<&mut TableState> {
        self.tables.get_mut(&id.to_string())
    }

    /// Check if a table exists.
    pub fn has_table(&self, id: &TableId) -> bool {
        self.tables.contains_key(&id.to_string())
    }

    /// All tables, ordered by identity.
    pub fn tables(&self) -> impl Iterator<Item = &TableState> {
        self.tables.values()
    }

    /// Number of tables.
    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub(crate) fn insert_table(&mut self, table: TableState) {
        self.tables.insert(table.id.to_string(), table);
    }

    pub(crate) fn remove_table(&mut self, id: &TableId) -> Option<TableState> {
        self.tables.remove(&id.to_string())
    }

    /// The constraint table: every foreign key with its delete policy.
    pub fn foreign_keys(&self) -> Vec<ForeignKeyConstraint> {
        self.tables
            .values()
            .flat_map(|table| {
                table.relations().map(move |(field, references, on_delete)| {
                    ForeignKeyConstraint {
                        table: table.id.clone(),
                        column: field.column_name(),
                        references,
                        on_delete,
                        enforcement: if on_delete.is_native() {
                            Enforcement::Store
                        } else {
                            Enforcement::Engine
                        },
                        parent_link: field.is_parent_link(),
                    }
                })
            })
            .collect()
    }

    /// Foreign keys pointing at `table`, excluding self references.
    pub fn references_to(&self, table: &TableId) -> Vec<ForeignKeyConstraint> {
        self.foreign_keys()
            .into_iter()
            .filter(|fk| &fk.references == table && &fk.table != table)
            .collect()
    }

    /// Constraints the engine must check itself before deleting rows of `table`.
    pub fn engine_enforced_constraints(&self, table: &TableId) -> Vec<ForeignKeyConstraint> {
        self.references_to(table)
            .into_iter()
            .filter(|fk| fk.enforcement == Enforcement::Engine)
            .collect()
    }

    /// Column type of the primary key that relational fields pointing at `table` must use.
    pub(crate) fn reference_type(&self, table: &TableId) -> Option<FieldType> {
        let mut current = table.clone();
        // Parent-link chains are bounded by the number of tables.
        for _ in 0..=self.tables.len() {
            let pk = self.table(&current)?.primary_key()?;
            match &pk.field_type {
                FieldType::Auto => return Some(FieldType::Integer),
                FieldType::ForeignKey { to, .. } | FieldType::OneToOne { to, .. } => {
                    current = TableId::resolve(to, &current.app_label);
                }
                other => return Some(other.clone()),
            }
        }
        None
    }

    /// Serialize the model for persistence.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MigrationError> {
        serde_json::to_vec(self).map_err(|e| MigrationError::Serialization(e.to_string()))
    }

    /// Deserialize a persisted model.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MigrationError> {
        serde_json::from_slice(bytes).map_err(|e| MigrationError::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(app: &str, name: &str, fields: Vec<FieldDescriptor>) -> TableState {
        let id = TableId::new(app, name);
        TableState {
            db_table: id.default_db_table(),
            id,
            name: name.to_string(),
            fields,
            bases: Vec::new(),
            options: TableOptions::default(),
        }
    }

    fn sample() -> SchemaModel {
        let mut schema = SchemaModel::new();
        schema.insert_table(table(
            "core",
            "Provider",
            vec![FieldDescriptor::auto_id(), FieldDescriptor::new("name", FieldType::Text)],
        ));
        schema.insert_table(table(
            "core",
            "Application",
            vec![
                FieldDescriptor::auto_id(),
                FieldDescriptor::foreign_key("provider", "Provider", OnDelete::Protect),
            ],
        ));
        schema.insert_table(table(
            "gateway",
            "GatewayProvider",
            vec![FieldDescriptor::parent_link("provider_ptr", "core.Provider")],
        ));
        schema
    }

    #[test]
    fn test_constraint_table() {
        let schema = sample();
        let fks = schema.foreign_keys();
        assert_eq!(fks.len(), 2);

        let protect = fks
            .iter()
            .find(|fk| fk.table == TableId::new("core", "application"))
            .unwrap();
        assert_eq!(protect.column, "provider_id");
        assert_eq!(protect.references, TableId::new("core", "provider"));
        assert_eq!(protect.enforcement, Enforcement::Engine);

        let link = fks
            .iter()
            .find(|fk| fk.table == TableId::new("gateway", "gatewayprovider"))
            .unwrap();
        assert!(link.parent_link);
        assert_eq!(link.on_delete, OnDelete::Cascade);
        assert_eq!(link.enforcement, Enforcement::Store);

        let engine = schema.engine_enforced_constraints(&TableId::new("core", "provider"));
        assert_eq!(engine.len(), 1);
        assert_eq!(engine[0].column, "provider_id");
    }

    #[test]
    fn test_reference_type_follows_parent_links() {
        let schema = sample();
        assert_eq!(
            schema.reference_type(&TableId::new("gateway", "gatewayprovider")),
            Some(FieldType::Integer)
        );
        assert_eq!(schema.reference_type(&TableId::new("core", "missing")), None);
    }

    #[test]
    fn test_snapshot_bytes() {
        let schema = sample();
        let restored = SchemaModel::from_bytes(&schema.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, schema);
        assert!(SchemaModel::from_bytes(b"not json").is_err());
    }
}
