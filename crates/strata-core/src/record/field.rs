//! Field descriptors carried by schema operations.

use serde::{Deserialize, Serialize};

/// Behavior when a referenced row is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OnDelete {
    /// Delete dependent rows.
    Cascade,
    /// Set the referencing column to null.
    SetNull,
    /// Refuse the delete while dependents exist; checked by the engine, not the store.
    Protect,
    /// Refuse the delete while dependents exist; enforced by the store.
    Restrict,
}

impl OnDelete {
    /// Whether relational stores enforce this policy natively.
    pub fn is_native(&self) -> bool {
        !matches!(self, OnDelete::Protect)
    }
}

impl std::fmt::Display for OnDelete {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OnDelete::Cascade => write!(f, "cascade"),
            OnDelete::SetNull => write!(f, "set_null"),
            OnDelete::Protect => write!(f, "protect"),
            OnDelete::Restrict => write!(f, "restrict"),
        }
    }
}

/// Semantic type of a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum FieldType {
    /// Auto-incrementing integer, used for implicit primary keys.
    Auto,
    /// Unbounded text.
    Text,
    /// 32-bit integer.
    Integer,
    /// 64-bit integer.
    BigInteger,
    /// Boolean.
    Boolean,
    /// Double-precision float.
    Float,
    /// Timestamp with time zone.
    DateTime,
    /// UUID.
    Uuid,
    /// JSON document.
    Json,
    /// Many-to-one reference.
    ForeignKey {
        /// Target model reference (`app_label.Model` or `Model`).
        to: String,
        /// Delete policy.
        on_delete: OnDelete,
    },
    /// Unique one-to-one reference.
    OneToOne {
        /// Target model reference (`app_label.Model` or `Model`).
        to: String,
        /// Delete policy.
        on_delete: OnDelete,
        /// The field links a child table to its base table and is its primary key.
        #[serde(default)]
        parent_link: bool,
    },
}

impl FieldType {
    /// Whether the field references another table.
    pub fn is_relation(&self) -> bool {
        matches!(self, FieldType::ForeignKey { .. } | FieldType::OneToOne { .. })
    }

    /// Target model reference and delete policy of a relational field.
    pub fn relation(&self) -> Option<(&str, OnDelete)> {
        match self {
            FieldType::ForeignKey { to, on_delete } | FieldType::OneToOne { to, on_delete, .. } => {
                Some((to.as_str(), *on_delete))
            }
            _ => None,
        }
    }
}

/// Default value expression for a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum DefaultValue {
    /// Null.
    Null,
    /// Boolean literal.
    Bool(bool),
    /// Integer literal.
    Int(i64),
    /// Float literal.
    Float(f64),
    /// Text literal.
    Text(String),
    /// Current timestamp, evaluated by the store.
    CurrentTimestamp,
}

/// A field (column) definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    /// Field name.
    pub name: String,
    /// Semantic type.
    pub field_type: FieldType,
    /// Whether the column accepts null.
    #[serde(default)]
    pub nullable: bool,
    /// Whether values must be unique.
    #[serde(default)]
    pub unique: bool,
    /// Whether this field is the table's primary key.
    #[serde(default)]
    pub primary_key: bool,
    /// Default for new rows.
    #[serde(default)]
    pub default: Option<DefaultValue>,
    /// Explicit column name.
    #[serde(default)]
    pub db_column: Option<String>,
}

impl FieldDescriptor {
    /// Create a non-nullable field.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            nullable: false,
            unique: false,
            primary_key: false,
            default: None,
            db_column: None,
        }
    }

    /// Create a nullable field.
    pub fn nullable(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            nullable: true,
            ..Self::new(name, field_type)
        }
    }

    /// Create a foreign key field.
    pub fn foreign_key(name: impl Into<String>, to: impl Into<String>, on_delete: OnDelete) -> Self {
        Self::new(
            name,
            FieldType::ForeignKey {
                to: to.into(),
                on_delete,
            },
        )
    }

    /// Create a parent-link one-to-one field that doubles as the primary key.
    pub fn parent_link(name: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            primary_key: true,
            ..Self::new(
                name,
                FieldType::OneToOne {
                    to: to.into(),
                    on_delete: OnDelete::Cascade,
                    parent_link: true,
                },
            )
        }
    }

    /// Implicit auto-increment primary key named `id`.
    pub fn auto_id() -> Self {
        Self {
            primary_key: true,
            ..Self::new("id", FieldType::Auto)
        }
    }

    /// Set the default value.
    pub fn with_default(mut self, default: DefaultValue) -> Self {
        self.default = Some(default);
        self
    }

    /// Mark as unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Mark as primary key.
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Whether this is a parent-link one-to-one field.
    pub fn is_parent_link(&self) -> bool {
        matches!(
            self.field_type,
            FieldType::OneToOne {
                parent_link: true,
                ..
            }
        )
    }

    /// Physical column name; relational fields get an `_id` suffix.
    pub fn column_name(&self) -> String {
        match &self.db_column {
            Some(column) => column.clone(),
            None if self.field_type.is_relation() => format!("{}_id", self.name),
            None => self.name.clone(),
        }
    }

    /// Whether adding this field to a populated table needs a value for existing rows.
    pub fn needs_default(&self) -> bool {
        !self.nullable && self.default.is_none() && self.field_type != FieldType::Auto
    }
}
