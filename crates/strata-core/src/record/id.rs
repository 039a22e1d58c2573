//! Identities for migrations and tables.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity of a migration record: `(app_label, name)`.
///
/// Ordering is by `(app_label, name)` ascending, which is the resolver's
/// tie-break order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MigrationId {
    /// Application label.
    pub app_label: String,
    /// Migration name.
    pub name: String,
}

impl MigrationId {
    /// Create a new migration identity.
    pub fn new(app_label: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            app_label: app_label.into(),
            name: name.into(),
        }
    }

    /// Storage key: `app_label \0 name`.
    pub(crate) fn to_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.app_label.len() + self.name.len() + 1);
        key.extend_from_slice(self.app_label.as_bytes());
        key.push(0);
        key.extend_from_slice(self.name.as_bytes());
        key
    }

    /// Decode a storage key produced by [`MigrationId::to_key`].
    pub(crate) fn from_key(key: &[u8]) -> Option<Self> {
        let split = key.iter().position(|b| *b == 0)?;
        let app_label = std::str::from_utf8(&key[..split]).ok()?;
        let name = std::str::from_utf8(&key[split + 1..]).ok()?;
        Some(Self::new(app_label, name))
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.app_label, self.name)
    }
}

impl FromStr for MigrationId {
    type Err = String;

    /// Parse `app_label.name`. The name may itself contain dots.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((app, name)) if !app.is_empty() && !name.is_empty() => Ok(Self::new(app, name)),
            _ => Err(format!("expected <app_label>.<name>, got '{}'", s)),
        }
    }
}

/// Identity of a table in the schema model.
///
/// Model names are case-insensitive, so the model part is stored lowercased.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableId {
    /// Owning application.
    pub app_label: String,
    /// Lowercased model name.
    pub model: String,
}

impl TableId {
    /// Create a table identity.
    pub fn new(app_label: impl Into<String>, model: impl AsRef<str>) -> Self {
        Self {
            app_label: app_label.into(),
            model: model.as_ref().to_lowercase(),
        }
    }

    /// Resolve a model reference (`app_label.Model` or `Model`) against a default app label.
    pub fn resolve(reference: &str, default_app: &str) -> Self {
        match reference.split_once('.') {
            Some((app, model)) => Self::new(app, model),
            None => Self::new(default_app, reference),
        }
    }

    /// Default physical table name: `{app_label}_{model}`.
    pub fn default_db_table(&self) -> String {
        format!("{}_{}", self.app_label, self.model)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.app_label, self.model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_id_ordering() {
        let mut ids = vec![
            MigrationId::new("b", "0001"),
            MigrationId::new("a", "0002"),
            MigrationId::new("a", "0001"),
        ];
        ids.sort();
        assert_eq!(
            ids.iter().map(ToString::to_string).collect::<Vec<_>>(),
            vec!["a.0001", "a.0002", "b.0001"]
        );
    }

    #[test]
    fn test_migration_id_parse() {
        let id: MigrationId = "passbook_core.0005_merge_20191025_2022".parse().unwrap();
        assert_eq!(id.app_label, "passbook_core");
        assert_eq!(id.name, "0005_merge_20191025_2022");

        assert!("no_dot".parse::<MigrationId>().is_err());
        assert!(".0001".parse::<MigrationId>().is_err());
    }

    #[test]
    fn test_migration_id_key_roundtrip() {
        let id = MigrationId::new("oidc_provider", "0026_client_multiple_response_types");
        assert_eq!(MigrationId::from_key(&id.to_key()), Some(id));
        assert_eq!(MigrationId::from_key(b"no-separator"), None);
    }

    #[test]
    fn test_table_id_resolution() {
        let qualified = TableId::resolve("passbook_core.Provider", "app_gw");
        assert_eq!(qualified, TableId::new("passbook_core", "provider"));

        let local = TableId::resolve("Provider", "app_gw");
        assert_eq!(local.app_label, "app_gw");
        assert_eq!(local.default_db_table(), "app_gw_provider");
    }
}
