//! Dialect-specific DDL emission.
//!
//! The emitter runs after the interpreter has validated and applied an
//! operation, and reads both the model before and after the change. It never
//! fails: anything it could reject has already been rejected by validation.

use super::model::{SchemaModel, TableState};
use crate::record::{DefaultValue, FieldDescriptor, FieldType, OnDelete, Operation, TableId};
use std::fmt;

/// Longest identifier PostgreSQL keeps without truncation.
const MAX_IDENTIFIER_LEN: usize = 63;

/// Target SQL dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    /// PostgreSQL.
    #[default]
    Postgres,
    /// SQLite; column changes are done by rebuilding the table.
    Sqlite,
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Postgres => write!(f, "postgres"),
            Dialect::Sqlite => write!(f, "sqlite"),
        }
    }
}

/// Translates operations into DDL statements.
#[derive(Debug, Clone, Copy, Default)]
pub struct DdlEmitter {
    dialect: Dialect,
}

impl DdlEmitter {
    /// Create an emitter for `dialect`.
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    /// The dialect statements are emitted for.
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Emit the statements that take the store from `before` to `after`.
    pub fn emit(
        &self,
        app_label: &str,
        operation: &Operation,
        before: &SchemaModel,
        after: &SchemaModel,
    ) -> Vec<String> {
        let id = TableId::new(app_label, operation.table());
        let old = before.table(&id);
        let new = after.table(&id);

        match (operation, old, new) {
            (Operation::CreateTable { .. }, _, Some(new)) => {
                let mut statements = vec![self.create_table(new, after)];
                statements.extend(self.indexes(new, new.fields.iter()));
                statements
            }
            (Operation::DeleteTable { .. }, Some(old), _) => {
                vec![format!("DROP TABLE {}", quote(&old.db_table))]
            }
            (Operation::AddField { field, backfill, .. }, Some(old), Some(new)) => {
                self.add_field(old, new, field, backfill.as_ref(), after)
            }
            (Operation::AddForeignKey { field, .. }, Some(old), Some(new)) => {
                self.add_field(old, new, field, None, after)
            }
            (Operation::RemoveField { field, .. }, Some(old), Some(new)) => {
                match old.field(field) {
                    Some(removed) => self.remove_field(old, new, removed, after),
                    None => Vec::new(),
                }
            }
            (Operation::AlterField { field, .. }, Some(old), Some(new)) => {
                match old.field(&field.name) {
                    Some(previous) => self.alter_field(old, new, previous, field, before, after),
                    None => Vec::new(),
                }
            }
            _ => Vec::new(),
        }
    }

    fn create_table(&self, table: &TableState, schema: &SchemaModel) -> String {
        let columns: Vec<String> = table
            .fields
            .iter()
            .map(|field| {
                format!(
                    "    {}",
                    self.column_definition(table, field, field.default.as_ref(), schema)
                )
            })
            .collect();
        format!(
            "CREATE TABLE {} (\n{}\n)",
            quote(&table.db_table),
            columns.join(",\n")
        )
    }

    fn add_field(
        &self,
        old: &TableState,
        new: &TableState,
        field: &FieldDescriptor,
        backfill: Option<&DefaultValue>,
        schema: &SchemaModel,
    ) -> Vec<String> {
        let one_off = field.default.is_none() && backfill.is_some();

        if self.dialect == Dialect::Sqlite
            && (field.field_type.is_relation() || field.unique || one_off)
        {
            let fill = backfill.map(|value| (field.name.as_str(), value));
            return self.rebuild(old, new, fill, schema);
        }

        let table = quote(&new.db_table);
        let default = field.default.as_ref().or(backfill);
        let mut statements = vec![format!(
            "ALTER TABLE {} ADD COLUMN {}",
            table,
            self.column_definition(new, field, default, schema)
        )];
        if one_off {
            statements.push(format!(
                "ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT",
                table,
                quote(&field.column_name())
            ));
        }
        statements.extend(self.indexes(new, std::iter::once(field)));
        statements
    }

    fn remove_field(
        &self,
        old: &TableState,
        new: &TableState,
        removed: &FieldDescriptor,
        schema: &SchemaModel,
    ) -> Vec<String> {
        match self.dialect {
            Dialect::Postgres => vec![format!(
                "ALTER TABLE {} DROP COLUMN {} CASCADE",
                quote(&old.db_table),
                quote(&removed.column_name())
            )],
            Dialect::Sqlite if removed.field_type.is_relation() || is_unique(removed) => {
                self.rebuild(old, new, None, schema)
            }
            Dialect::Sqlite => vec![format!(
                "ALTER TABLE {} DROP COLUMN {}",
                quote(&old.db_table),
                quote(&removed.column_name())
            )],
        }
    }

    fn alter_field(
        &self,
        old_table: &TableState,
        new_table: &TableState,
        old: &FieldDescriptor,
        new: &FieldDescriptor,
        before: &SchemaModel,
        after: &SchemaModel,
    ) -> Vec<String> {
        if self.dialect == Dialect::Sqlite {
            return self.rebuild(old_table, new_table, None, after);
        }

        let table = quote(&new_table.db_table);
        let old_column = old.column_name();
        let column = new.column_name();
        let renamed = old_column != column;
        let old_reference = self.references(old_table, old, before);
        let new_reference = self.references(new_table, new, after);
        let mut statements = Vec::new();

        // Constraints and indexes are named after the column, so they go
        // before a rename and come back after it.
        if old_reference.is_some() && (old_reference != new_reference || renamed) {
            statements.push(format!(
                "ALTER TABLE {} DROP CONSTRAINT {}",
                table,
                quote(&constraint_name(&old_table.db_table, &old_column, "fkey"))
            ));
        }
        if is_unique(old) && (!is_unique(new) || renamed) {
            statements.push(format!(
                "ALTER TABLE {} DROP CONSTRAINT {}",
                table,
                quote(&constraint_name(&old_table.db_table, &old_column, "key"))
            ));
        }
        if is_indexed(old) && (!is_indexed(new) || renamed) {
            statements.push(format!(
                "DROP INDEX {}",
                quote(&constraint_name(&old_table.db_table, &old_column, "idx"))
            ));
        }

        if renamed {
            statements.push(format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                table,
                quote(&old_column),
                quote(&column)
            ));
        }

        let old_type = self.column_type(old_table, old, before);
        let new_type = self.column_type(new_table, new, after);
        if old_type != new_type {
            statements.push(format!(
                "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING {}::{}",
                table,
                quote(&column),
                new_type,
                quote(&column),
                new_type
            ));
        }

        if old.default != new.default {
            statements.push(match &new.default {
                Some(value) => format!(
                    "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {}",
                    table,
                    quote(&column),
                    self.literal(value)
                ),
                None => format!(
                    "ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT",
                    table,
                    quote(&column)
                ),
            });
        }

        if old.nullable && !new.nullable {
            if let Some(value) = &new.default {
                statements.push(format!(
                    "UPDATE {} SET {} = {} WHERE {} IS NULL",
                    table,
                    quote(&column),
                    self.literal(value),
                    quote(&column)
                ));
            }
            statements.push(format!(
                "ALTER TABLE {} ALTER COLUMN {} SET NOT NULL",
                table,
                quote(&column)
            ));
        } else if !old.nullable && new.nullable {
            statements.push(format!(
                "ALTER TABLE {} ALTER COLUMN {} DROP NOT NULL",
                table,
                quote(&column)
            ));
        }

        if is_unique(new) && (!is_unique(old) || renamed) {
            statements.push(format!(
                "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({})",
                table,
                quote(&constraint_name(&new_table.db_table, &column, "key")),
                quote(&column)
            ));
        }
        if let Some(reference) = &new_reference {
            if old_reference.as_ref() != Some(reference) || renamed {
                statements.push(format!(
                    "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) {}",
                    table,
                    quote(&constraint_name(&new_table.db_table, &column, "fkey")),
                    quote(&column),
                    reference
                ));
            }
        }
        if is_indexed(new) && (!is_indexed(old) || renamed) {
            statements.extend(self.indexes(new_table, std::iter::once(new)));
        }

        statements
    }

    /// SQLite table rebuild: create `new__<table>`, copy rows, swap.
    fn rebuild(
        &self,
        old: &TableState,
        new: &TableState,
        fill: Option<(&str, &DefaultValue)>,
        schema: &SchemaModel,
    ) -> Vec<String> {
        let temporary = TableState {
            db_table: format!("new__{}", new.db_table),
            ..new.clone()
        };

        let mut targets = Vec::new();
        let mut sources = Vec::new();
        for field in &new.fields {
            let column = quote(&field.column_name());
            if let Some(previous) = old.field(&field.name) {
                let source = quote(&previous.column_name());
                sources.push(match (&field.default, previous.nullable && !field.nullable) {
                    (Some(value), true) => format!("coalesce({}, {})", source, self.literal(value)),
                    _ => source,
                });
                targets.push(column);
            } else if let Some((_, value)) = fill.filter(|(name, _)| *name == field.name) {
                sources.push(self.literal(value));
                targets.push(column);
            }
        }

        let mut statements = vec![self.create_table(&temporary, schema)];
        statements.push(format!(
            "INSERT INTO {} ({}) SELECT {} FROM {}",
            quote(&temporary.db_table),
            targets.join(", "),
            sources.join(", "),
            quote(&old.db_table)
        ));
        statements.push(format!("DROP TABLE {}", quote(&old.db_table)));
        statements.push(format!(
            "ALTER TABLE {} RENAME TO {}",
            quote(&temporary.db_table),
            quote(&new.db_table)
        ));
        statements.extend(self.indexes(new, new.fields.iter()));
        statements
    }

    fn column_definition(
        &self,
        table: &TableState,
        field: &FieldDescriptor,
        default: Option<&DefaultValue>,
        schema: &SchemaModel,
    ) -> String {
        let column = quote(&field.column_name());
        if field.field_type == FieldType::Auto {
            return match self.dialect {
                Dialect::Postgres => format!(
                    "{} INTEGER NOT NULL PRIMARY KEY GENERATED BY DEFAULT AS IDENTITY",
                    column
                ),
                Dialect::Sqlite => format!("{} INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT", column),
            };
        }

        let mut definition = format!("{} {}", column, self.column_type(table, field, schema));
        definition.push_str(if field.nullable { " NULL" } else { " NOT NULL" });
        if field.primary_key {
            definition.push_str(" PRIMARY KEY");
        } else if is_unique(field) {
            definition.push_str(&format!(
                " CONSTRAINT {} UNIQUE",
                quote(&constraint_name(&table.db_table, &field.column_name(), "key"))
            ));
        }
        if let Some(value) = default {
            definition.push_str(" DEFAULT ");
            definition.push_str(&self.literal(value));
        }
        if let Some(reference) = self.references(table, field, schema) {
            definition.push_str(&format!(
                " CONSTRAINT {} {}",
                quote(&constraint_name(&table.db_table, &field.column_name(), "fkey")),
                reference
            ));
        }
        definition
    }

    /// Column type; relational columns take the type of the target's primary key.
    fn column_type(&self, table: &TableState, field: &FieldDescriptor, schema: &SchemaModel) -> &'static str {
        match field.field_type.relation() {
            Some((to, _)) => {
                let target = TableId::resolve(to, &table.id.app_label);
                let key_type = schema.reference_type(&target).unwrap_or(FieldType::Integer);
                self.scalar_type(&key_type)
            }
            None => self.scalar_type(&field.field_type),
        }
    }

    fn scalar_type(&self, field_type: &FieldType) -> &'static str {
        match (field_type, self.dialect) {
            (FieldType::Text, _) => "TEXT",
            (FieldType::BigInteger, _) => "BIGINT",
            (FieldType::Boolean, _) => "BOOLEAN",
            (FieldType::Float, Dialect::Postgres) => "DOUBLE PRECISION",
            (FieldType::Float, Dialect::Sqlite) => "REAL",
            (FieldType::DateTime, Dialect::Postgres) => "TIMESTAMP WITH TIME ZONE",
            (FieldType::DateTime, Dialect::Sqlite) => "DATETIME",
            (FieldType::Uuid, Dialect::Postgres) => "UUID",
            (FieldType::Uuid, Dialect::Sqlite) => "CHAR(32)",
            (FieldType::Json, Dialect::Postgres) => "JSONB",
            (FieldType::Json, Dialect::Sqlite) => "TEXT",
            (FieldType::Auto | FieldType::Integer, _)
            | (FieldType::ForeignKey { .. } | FieldType::OneToOne { .. }, _) => "INTEGER",
        }
    }

    /// `REFERENCES "t" ("pk") ON DELETE ...` for relational fields.
    fn references(
        &self,
        table: &TableState,
        field: &FieldDescriptor,
        schema: &SchemaModel,
    ) -> Option<String> {
        let (to, on_delete) = field.field_type.relation()?;
        let target = TableId::resolve(to, &table.id.app_label);
        let (target_table, target_column) = match schema.table(&target) {
            Some(state) => (
                state.db_table.clone(),
                state
                    .primary_key()
                    .map(FieldDescriptor::column_name)
                    .unwrap_or_else(|| "id".to_string()),
            ),
            None => (target.default_db_table(), "id".to_string()),
        };
        Some(format!(
            "REFERENCES {} ({}) ON DELETE {}",
            quote(&target_table),
            quote(&target_column),
            on_delete_clause(on_delete)
        ))
    }

    fn indexes<'a>(
        &self,
        table: &TableState,
        fields: impl Iterator<Item = &'a FieldDescriptor>,
    ) -> Vec<String> {
        fields
            .filter(|field| is_indexed(field))
            .map(|field| {
                let column = field.column_name();
                format!(
                    "CREATE INDEX {} ON {} ({})",
                    quote(&constraint_name(&table.db_table, &column, "idx")),
                    quote(&table.db_table),
                    quote(&column)
                )
            })
            .collect()
    }

    fn literal(&self, value: &DefaultValue) -> String {
        match (value, self.dialect) {
            (DefaultValue::Null, _) => "NULL".to_string(),
            (DefaultValue::Bool(b), Dialect::Postgres) => (if *b { "TRUE" } else { "FALSE" }).to_string(),
            (DefaultValue::Bool(b), Dialect::Sqlite) => (if *b { "1" } else { "0" }).to_string(),
            (DefaultValue::Int(i), _) => i.to_string(),
            (DefaultValue::Float(f), _) => f.to_string(),
            (DefaultValue::Text(s), _) => format!("'{}'", s.replace('\'', "''")),
            (DefaultValue::CurrentTimestamp, _) => "CURRENT_TIMESTAMP".to_string(),
        }
    }
}

/// Whether the column carries a unique constraint besides a primary key.
fn is_unique(field: &FieldDescriptor) -> bool {
    !field.primary_key
        && (field.unique || matches!(field.field_type, FieldType::OneToOne { .. }))
}

/// Foreign-key columns not already covered by a unique or primary-key index.
fn is_indexed(field: &FieldDescriptor) -> bool {
    matches!(field.field_type, FieldType::ForeignKey { .. })
        && !field.primary_key
        && !field.unique
}

fn on_delete_clause(on_delete: OnDelete) -> &'static str {
    match on_delete {
        OnDelete::Cascade => "CASCADE",
        OnDelete::SetNull => "SET NULL",
        OnDelete::Restrict => "RESTRICT",
        // Enforced by the engine; the store only checks at statement end.
        OnDelete::Protect => "NO ACTION",
    }
}

/// `{table}_{column}_{suffix}`, shortened with a digest when too long.
fn constraint_name(table: &str, column: &str, suffix: &str) -> String {
    let name = format!("{}_{}_{}", table, column, suffix);
    if name.len() <= MAX_IDENTIFIER_LEN {
        return name;
    }
    let digest = blake3::hash(name.as_bytes()).to_hex();
    let keep = MAX_IDENTIFIER_LEN - suffix.len() - 10;
    let prefix: String = name.chars().take(keep).collect();
    format!("{}_{}_{}", prefix, &digest.as_str()[..8], suffix)
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::OperationInterpreter;

    fn run(schema: &mut SchemaModel, app: &str, op: Operation, dialect: Dialect) -> Vec<String> {
        OperationInterpreter::default()
            .apply_ddl(app, &op, schema, dialect)
            .unwrap()
    }

    fn base_schema(dialect: Dialect) -> SchemaModel {
        let mut schema = SchemaModel::new();
        run(
            &mut schema,
            "passbook_core",
            Operation::create_table("Provider", vec![FieldDescriptor::new("name", FieldType::Text)]),
            dialect,
        );
        run(
            &mut schema,
            "oidc_provider",
            Operation::create_table(
                "Client",
                vec![FieldDescriptor::new("client_id", FieldType::Text).unique()],
            ),
            dialect,
        );
        schema
    }

    fn gateway() -> Operation {
        Operation::CreateTable {
            name: "ApplicationGatewayProvider".to_string(),
            fields: vec![
                FieldDescriptor::parent_link("provider_ptr", "passbook_core.Provider"),
                FieldDescriptor::new("name", FieldType::Text),
                FieldDescriptor::new("host", FieldType::Text),
                FieldDescriptor::foreign_key("client", "oidc_provider.Client", OnDelete::Cascade),
            ],
            options: Default::default(),
            bases: vec!["passbook_core.provider".to_string()],
        }
    }

    #[test]
    fn test_create_parent_linked_table() {
        let mut schema = base_schema(Dialect::Postgres);
        let ddl = run(&mut schema, "passbook_providers_app_gw", gateway(), Dialect::Postgres);

        assert_eq!(ddl.len(), 2);
        let create = &ddl[0];
        assert!(create.starts_with(
            "CREATE TABLE \"passbook_providers_app_gw_applicationgatewayprovider\" ("
        ));
        let columns: Vec<&str> = create.lines().filter(|l| l.starts_with("    ")).collect();
        assert_eq!(columns.len(), 4);
        assert!(columns[0].contains("\"provider_ptr_id\" INTEGER NOT NULL PRIMARY KEY"));
        assert!(columns[0]
            .contains("REFERENCES \"passbook_core_provider\" (\"id\") ON DELETE CASCADE"));
        assert!(columns[3].contains("\"client_id\" INTEGER NOT NULL"));
        assert!(columns[3].contains("REFERENCES \"oidc_provider_client\" (\"id\") ON DELETE CASCADE"));
        assert!(ddl[1].starts_with("CREATE INDEX"));
        assert!(ddl[1].ends_with("(\"client_id\")"));
    }

    #[test]
    fn test_implicit_primary_key_per_dialect() {
        let mut schema = SchemaModel::new();
        let pg = run(
            &mut schema,
            "core",
            Operation::create_table("Tag", vec![]),
            Dialect::Postgres,
        );
        assert!(pg[0].contains("\"id\" INTEGER NOT NULL PRIMARY KEY GENERATED BY DEFAULT AS IDENTITY"));

        let mut schema = SchemaModel::new();
        let lite = run(
            &mut schema,
            "core",
            Operation::create_table("Tag", vec![]),
            Dialect::Sqlite,
        );
        assert!(lite[0].contains("\"id\" INTEGER NOT NULL PRIMARY KEY AUTOINCREMENT"));
    }

    #[test]
    fn test_protect_emits_no_action() {
        let mut schema = base_schema(Dialect::Postgres);
        let ddl = run(
            &mut schema,
            "passbook_core",
            Operation::create_table(
                "Application",
                vec![FieldDescriptor::foreign_key("provider", "Provider", OnDelete::Protect)],
            ),
            Dialect::Postgres,
        );
        assert!(ddl[0].contains("ON DELETE NO ACTION"));
    }

    #[test]
    fn test_add_field_with_backfill() {
        let mut schema = base_schema(Dialect::Postgres);
        let ddl = run(
            &mut schema,
            "passbook_core",
            Operation::AddField {
                table: "Provider".to_string(),
                field: FieldDescriptor::new("slug", FieldType::Text),
                backfill: Some(DefaultValue::Text("it's".to_string())),
            },
            Dialect::Postgres,
        );
        assert_eq!(
            ddl,
            vec![
                "ALTER TABLE \"passbook_core_provider\" ADD COLUMN \"slug\" TEXT NOT NULL DEFAULT 'it''s'",
                "ALTER TABLE \"passbook_core_provider\" ALTER COLUMN \"slug\" DROP DEFAULT",
            ]
        );
    }

    #[test]
    fn test_sqlite_rebuilds_for_foreign_key() {
        let mut schema = base_schema(Dialect::Sqlite);
        let ddl = run(
            &mut schema,
            "passbook_core",
            Operation::AddForeignKey {
                table: "Provider".to_string(),
                field: FieldDescriptor::nullable(
                    "client",
                    FieldType::ForeignKey {
                        to: "oidc_provider.Client".to_string(),
                        on_delete: OnDelete::SetNull,
                    },
                ),
            },
            Dialect::Sqlite,
        );

        assert!(ddl[0].starts_with("CREATE TABLE \"new__passbook_core_provider\""));
        assert!(ddl[0].contains("ON DELETE SET NULL"));
        assert_eq!(
            ddl[1],
            "INSERT INTO \"new__passbook_core_provider\" (\"id\", \"name\") SELECT \"id\", \"name\" FROM \"passbook_core_provider\""
        );
        assert_eq!(ddl[2], "DROP TABLE \"passbook_core_provider\"");
        assert_eq!(
            ddl[3],
            "ALTER TABLE \"new__passbook_core_provider\" RENAME TO \"passbook_core_provider\""
        );
        assert!(ddl[4].starts_with("CREATE INDEX"));
    }

    #[test]
    fn test_postgres_alter_to_not_null() {
        let mut schema = base_schema(Dialect::Postgres);
        run(
            &mut schema,
            "passbook_core",
            Operation::add_field("Provider", FieldDescriptor::nullable("slug", FieldType::Text)),
            Dialect::Postgres,
        );
        let ddl = run(
            &mut schema,
            "passbook_core",
            Operation::AlterField {
                table: "Provider".to_string(),
                field: FieldDescriptor::new("slug", FieldType::Text)
                    .with_default(DefaultValue::Text("x".to_string())),
            },
            Dialect::Postgres,
        );
        assert_eq!(
            ddl,
            vec![
                "ALTER TABLE \"passbook_core_provider\" ALTER COLUMN \"slug\" SET DEFAULT 'x'",
                "UPDATE \"passbook_core_provider\" SET \"slug\" = 'x' WHERE \"slug\" IS NULL",
                "ALTER TABLE \"passbook_core_provider\" ALTER COLUMN \"slug\" SET NOT NULL",
            ]
        );
    }

    #[test]
    fn test_remove_field_and_delete_table() {
        let mut schema = base_schema(Dialect::Postgres);
        let ddl = run(
            &mut schema,
            "passbook_core",
            Operation::RemoveField {
                table: "Provider".to_string(),
                field: "name".to_string(),
            },
            Dialect::Postgres,
        );
        assert_eq!(
            ddl,
            vec!["ALTER TABLE \"passbook_core_provider\" DROP COLUMN \"name\" CASCADE"]
        );

        let ddl = run(
            &mut schema,
            "passbook_core",
            Operation::DeleteTable {
                name: "Provider".to_string(),
            },
            Dialect::Postgres,
        );
        assert_eq!(ddl, vec!["DROP TABLE \"passbook_core_provider\""]);
    }

    #[test]
    fn test_long_constraint_names_are_shortened() {
        let name = constraint_name(
            "passbook_providers_app_gw_applicationgatewayprovider",
            "client_id",
            "fkey",
        );
        assert!(name.len() <= MAX_IDENTIFIER_LEN);
        assert!(name.ends_with("_fkey"));
        assert_eq!(
            name,
            constraint_name(
                "passbook_providers_app_gw_applicationgatewayprovider",
                "client_id",
                "fkey"
            )
        );
        assert_eq!(constraint_name("t", "c", "idx"), "t_c_idx");
    }
}
