//! Operation interpreter: validates operations and applies them to a schema model.

use super::ddl::{DdlEmitter, Dialect};
use super::model::{SchemaModel, TableState};
use crate::error::MigrationError;
use crate::record::{
    DefaultValue, FieldDescriptor, FieldType, OnDelete, Operation, TableId, TableOptions,
};
use std::collections::HashSet;

/// Interpreter configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct InterpreterOptions {
    /// Proceed (with a warning) when a non-nullable field has no default for existing rows.
    pub allow_missing_defaults: bool,
}

/// Applies [`Operation`]s to a [`SchemaModel`].
///
/// Every operation is validated in full before the model is touched, so a
/// failed `apply` leaves the model exactly as it was.
#[derive(Debug, Clone, Default)]
pub struct OperationInterpreter {
    options: InterpreterOptions,
}

impl OperationInterpreter {
    /// Create an interpreter.
    pub fn new(options: InterpreterOptions) -> Self {
        Self { options }
    }

    /// Apply one operation of a record owned by `app_label`.
    pub fn apply(
        &self,
        app_label: &str,
        operation: &Operation,
        schema: &mut SchemaModel,
    ) -> Result<(), MigrationError> {
        tracing::debug!(app_label, operation = %operation.describe(), "applying operation");

        match operation {
            Operation::CreateTable {
                name,
                fields,
                options,
                bases,
            } => {
                let table = self.validate_create(app_label, name, fields, options, bases, schema)?;
                schema.insert_table(table);
                Ok(())
            }
            Operation::DeleteTable { name } => {
                let id = TableId::new(app_label, name);
                Self::validate_delete(&id, schema)?;
                schema.remove_table(&id);
                Ok(())
            }
            Operation::AddField {
                table,
                field,
                backfill,
            } => {
                let id = TableId::new(app_label, table);
                self.validate_add(&id, field, backfill.as_ref(), schema)?;
                Self::existing_mut(&id, schema)?.fields.push(field.clone());
                Ok(())
            }
            Operation::AddForeignKey { table, field } => {
                let id = TableId::new(app_label, table);
                if !field.field_type.is_relation() {
                    return Err(invalid(&id, field, "AddForeignKey requires a ForeignKey or OneToOne field"));
                }
                self.validate_add(&id, field, None, schema)?;
                Self::existing_mut(&id, schema)?.fields.push(field.clone());
                Ok(())
            }
            Operation::RemoveField { table, field } => {
                let id = TableId::new(app_label, table);
                let state = Self::existing(&id, schema)?;
                let current = state.field(field).ok_or_else(|| MigrationError::UnknownField {
                    table: id.clone(),
                    field: field.clone(),
                })?;
                if current.primary_key {
                    return Err(invalid(&id, current, "cannot remove the primary key"));
                }
                Self::existing_mut(&id, schema)?
                    .fields
                    .retain(|f| &f.name != field);
                Ok(())
            }
            Operation::AlterField { table, field } => {
                let id = TableId::new(app_label, table);
                self.validate_alter(&id, field, schema)?;
                let state = Self::existing_mut(&id, schema)?;
                if let Some(slot) = state.fields.iter_mut().find(|f| f.name == field.name) {
                    *slot = field.clone();
                }
                Ok(())
            }
        }
    }

    /// Apply one operation and return the DDL that performs it.
    pub fn apply_ddl(
        &self,
        app_label: &str,
        operation: &Operation,
        schema: &mut SchemaModel,
        dialect: Dialect,
    ) -> Result<Vec<String>, MigrationError> {
        let before = schema.clone();
        self.apply(app_label, operation, schema)?;
        Ok(DdlEmitter::new(dialect).emit(app_label, operation, &before, schema))
    }

    fn existing<'a>(id: &TableId, schema: &'a SchemaModel) -> Result<&'a TableState, MigrationError> {
        schema
            .table(id)
            .ok_or_else(|| MigrationError::UnknownTable(id.clone()))
    }

    fn existing_mut<'a>(
        id: &TableId,
        schema: &'a mut SchemaModel,
    ) -> Result<&'a mut TableState, MigrationError> {
        schema
            .table_mut(id)
            .ok_or_else(|| MigrationError::UnknownTable(id.clone()))
    }

    fn validate_create(
        &self,
        app_label: &str,
        name: &str,
        fields: &[FieldDescriptor],
        options: &TableOptions,
        bases: &[String],
        schema: &SchemaModel,
    ) -> Result<TableState, MigrationError> {
        let id = TableId::new(app_label, name);
        if schema.has_table(&id) {
            return Err(MigrationError::DuplicateTable(id));
        }

        let db_table = options
            .db_table
            .clone()
            .unwrap_or_else(|| id.default_db_table());
        if let Some(owner) = schema
            .tables()
            .find(|t| t.db_table.eq_ignore_ascii_case(&db_table))
        {
            return Err(MigrationError::DuplicateTable(owner.id.clone()));
        }

        // Field names and physical column names must both be unique.
        let mut names = HashSet::new();
        let mut column_names = HashSet::new();
        for field in fields {
            if !names.insert(field.name.as_str()) || !column_names.insert(field.column_name()) {
                return Err(MigrationError::DuplicateField {
                    table: id,
                    field: field.name.clone(),
                });
            }
        }

        let base_ids: Vec<TableId> = bases
            .iter()
            .map(|base| TableId::resolve(base, app_label))
            .collect();
        for base in &base_ids {
            if !schema.has_table(base) {
                return Err(MigrationError::UnknownTable(base.clone()));
            }
        }

        let primary_keys: Vec<&FieldDescriptor> = fields.iter().filter(|f| f.primary_key).collect();
        if primary_keys.len() > 1 {
            return Err(invalid(&id, primary_keys[1], "a table has at most one primary key"));
        }

        for field in fields {
            validate_field(&id, field, schema)?;
            if let (true, Some((to, _))) = (field.is_parent_link(), field.field_type.relation()) {
                let target = TableId::resolve(to, app_label);
                if !base_ids.is_empty() && !base_ids.contains(&target) {
                    return Err(invalid(&id, field, "parent link must point at one of the bases"));
                }
            }
        }

        let mut columns = Vec::with_capacity(fields.len() + 1);
        if primary_keys.is_empty() {
            if let Some(clash) = fields.iter().find(|f| f.name == "id" || f.column_name() == "id") {
                return Err(invalid(&id, clash, "conflicts with the implicit primary key"));
            }
            columns.push(FieldDescriptor::auto_id());
        }
        columns.extend(fields.iter().cloned());

        Ok(TableState {
            db_table,
            id,
            name: name.to_string(),
            fields: columns,
            bases: base_ids,
            options: options.clone(),
        })
    }

    fn validate_delete(id: &TableId, schema: &SchemaModel) -> Result<(), MigrationError> {
        Self::existing(id, schema)?;
        if let Some(fk) = schema.references_to(id).into_iter().next() {
            return Err(MigrationError::TableReferenced {
                table: id.clone(),
                referenced_by: fk.table,
            });
        }
        if let Some(child) = schema.tables().find(|t| t.bases.contains(id)) {
            return Err(MigrationError::TableReferenced {
                table: id.clone(),
                referenced_by: child.id.clone(),
            });
        }
        Ok(())
    }

    fn validate_add(
        &self,
        id: &TableId,
        field: &FieldDescriptor,
        backfill: Option<&DefaultValue>,
        schema: &SchemaModel,
    ) -> Result<(), MigrationError> {
        let state = Self::existing(id, schema)?;
        let column = field.column_name();
        if state.has_field(&field.name) || state.fields.iter().any(|f| f.column_name() == column) {
            return Err(MigrationError::DuplicateField {
                table: id.clone(),
                field: field.name.clone(),
            });
        }
        if field.primary_key {
            return Err(invalid(id, field, "cannot add a primary key to an existing table"));
        }
        validate_field(id, field, schema)?;
        if field.needs_default() && backfill.is_none() {
            self.missing_default(id, field)?;
        }
        Ok(())
    }

    fn validate_alter(
        &self,
        id: &TableId,
        field: &FieldDescriptor,
        schema: &SchemaModel,
    ) -> Result<(), MigrationError> {
        let state = Self::existing(id, schema)?;
        let current = state
            .field(&field.name)
            .ok_or_else(|| MigrationError::UnknownField {
                table: id.clone(),
                field: field.name.clone(),
            })?;
        if current.primary_key != field.primary_key {
            return Err(invalid(id, field, "cannot change primary key status"));
        }
        let column = field.column_name();
        if state
            .fields
            .iter()
            .any(|f| f.name != field.name && f.column_name() == column)
        {
            return Err(invalid(id, field, "column name is already used by another field"));
        }
        validate_field(id, field, schema)?;
        if current.nullable && field.needs_default() {
            self.missing_default(id, field)?;
        }
        Ok(())
    }

    fn missing_default(&self, id: &TableId, field: &FieldDescriptor) -> Result<(), MigrationError> {
        if self.options.allow_missing_defaults {
            tracing::warn!(
                table = %id,
                field = %field.name,
                "non-nullable field without default for existing rows (acknowledged)"
            );
            Ok(())
        } else {
            Err(MigrationError::RequiresDefault {
                table: id.clone(),
                field: field.name.clone(),
            })
        }
    }
}

/// Checks that do not depend on whether the field is new or altered.
fn validate_field(
    id: &TableId,
    field: &FieldDescriptor,
    schema: &SchemaModel,
) -> Result<(), MigrationError> {
    if field.field_type == FieldType::Auto && !field.primary_key {
        return Err(invalid(id, field, "auto fields must be the primary key"));
    }

    let Some((to, on_delete)) = field.field_type.relation() else {
        return Ok(());
    };

    let target = TableId::resolve(to, &id.app_label);
    if &target != id && !schema.has_table(&target) {
        return Err(MigrationError::UnknownTable(target));
    }
    if on_delete == OnDelete::SetNull && !field.nullable {
        return Err(invalid(id, field, "on_delete SetNull requires a nullable field"));
    }
    if field.is_parent_link() && !field.primary_key {
        return Err(invalid(id, field, "a parent link must be the primary key"));
    }
    if field.primary_key && &target == id {
        return Err(invalid(id, field, "a relational primary key cannot point at its own table"));
    }
    Ok(())
}

fn invalid(id: &TableId, field: &FieldDescriptor, reason: &str) -> MigrationError {
    MigrationError::InvalidField {
        table: id.clone(),
        field: field.name.clone(),
        reason: reason.to_string(),
    }
}
