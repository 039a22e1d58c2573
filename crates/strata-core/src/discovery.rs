//! Migration discovery.
//!
//! A [`MigrationSource`] supplies the records a [`crate::graph::SchemaGraph`]
//! is built from. [`DirectorySource`] reads one JSON file per record from
//! `<root>/<app_label>/<name>.json`.

use crate::error::MigrationError;
use crate::record::{MigrationId, MigrationRecord, Operation};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Supplies migration records.
pub trait MigrationSource {
    /// Load every record.
    fn load(&self) -> Result<Vec<MigrationRecord>, MigrationError>;
}

/// Records held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    records: Vec<MigrationRecord>,
}

impl StaticSource {
    /// Create a source over `records`.
    pub fn new(records: Vec<MigrationRecord>) -> Self {
        Self { records }
    }
}

impl MigrationSource for StaticSource {
    fn load(&self) -> Result<Vec<MigrationRecord>, MigrationError> {
        Ok(self.records.clone())
    }
}

/// A dependency as written in a migration file.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DependencyRef {
    /// `{"app_label": "core", "name": "0001_initial"}`
    Object(MigrationId),
    /// `["core", "0001_initial"]`
    Pair(String, String),
    /// `"core.0001_initial"`
    Dotted(String),
}

/// On-disk record layout; identity fields default to the file's location.
#[derive(Debug, Deserialize)]
struct RecordFile {
    #[serde(default)]
    app_label: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    initial: bool,
    #[serde(default)]
    dependencies: Vec<DependencyRef>,
    #[serde(default)]
    operations: Vec<Operation>,
}

/// Reads `<root>/<app_label>/*.json`.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    /// Create a source rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Parse one migration file belonging to `app_label`.
    pub fn load_file(app_label: &str, path: &Path) -> Result<MigrationRecord, MigrationError> {
        let source_name = path.display().to_string();
        let load_error = |reason: String| MigrationError::Load {
            source_name: source_name.clone(),
            reason,
        };

        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| load_error("file name is not valid UTF-8".to_string()))?;
        let contents = fs::read_to_string(path).map_err(|e| load_error(e.to_string()))?;
        let file: RecordFile =
            serde_json::from_str(&contents).map_err(|e| load_error(e.to_string()))?;

        if let Some(declared) = file.app_label.as_deref() {
            if declared != app_label {
                return Err(load_error(format!(
                    "declares app_label '{}' but lives in directory '{}'",
                    declared, app_label
                )));
            }
        }
        let name = match file.name {
            Some(declared) if declared != stem => {
                return Err(load_error(format!(
                    "declares name '{}' but the file is named '{}'",
                    declared, stem
                )));
            }
            Some(declared) => declared,
            None => stem.to_string(),
        };

        let dependencies = file
            .dependencies
            .into_iter()
            .map(|dependency| match dependency {
                DependencyRef::Object(id) => Ok(id),
                DependencyRef::Pair(app, name) => Ok(MigrationId::new(app, name)),
                DependencyRef::Dotted(text) => text.parse().map_err(load_error),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let record = MigrationRecord {
            app_label: app_label.to_string(),
            name,
            initial: file.initial,
            dependencies,
            operations: file.operations,
        };
        record.validate_identity(&source_name)?;
        Ok(record)
    }
}

impl MigrationSource for DirectorySource {
    fn load(&self) -> Result<Vec<MigrationRecord>, MigrationError> {
        let mut records = Vec::new();

        for app_dir in sorted_entries(&self.root)? {
            if !app_dir.is_dir() {
                continue;
            }
            let Some(app_label) = app_dir.file_name().and_then(|s| s.to_str()) else {
                continue;
            };

            for path in sorted_entries(&app_dir)? {
                if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
                    records.push(Self::load_file(app_label, &path)?);
                }
            }
        }

        tracing::debug!(root = %self.root.display(), records = records.len(), "discovered migrations");
        Ok(records)
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, MigrationError> {
    let load_error = |e: std::io::Error| MigrationError::Load {
        source_name: dir.display().to_string(),
        reason: e.to_string(),
    };
    let mut paths = fs::read_dir(dir)
        .map_err(load_error)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(load_error)?;
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, app: &str, file: &str, contents: &str) {
        let dir = root.join(app);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(file), contents).unwrap();
    }

    #[test]
    fn test_directory_source() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "core",
            "0001_initial.json",
            r#"{"initial": true, "operations": [{"type": "CreateTable", "name": "Provider", "fields": []}]}"#,
        );
        write(
            dir.path(),
            "core",
            "0002_slug.json",
            r#"{"dependencies": [["core", "0001_initial"]]}"#,
        );
        write(
            dir.path(),
            "gateway",
            "0001_initial.json",
            r#"{"app_label": "gateway", "name": "0001_initial", "dependencies": ["core.0002_slug"]}"#,
        );
        write(dir.path(), "gateway", "README.md", "not a migration");

        let records = DirectorySource::new(dir.path()).load().unwrap();
        let ids: Vec<String> = records.iter().map(|r| r.id().to_string()).collect();
        assert_eq!(
            ids,
            vec!["core.0001_initial", "core.0002_slug", "gateway.0001_initial"]
        );
        assert!(records[0].initial);
        assert_eq!(records[0].operations.len(), 1);
        assert_eq!(
            records[2].dependencies,
            vec![MigrationId::new("core", "0002_slug")]
        );
    }

    #[test]
    fn test_malformed_json_names_the_file() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "core", "0001_initial.json", "{ not json");

        let err = DirectorySource::new(dir.path()).load().unwrap_err();
        match err {
            MigrationError::Load { source_name, .. } => {
                assert!(source_name.ends_with("0001_initial.json"))
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_identity_mismatch() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "core",
            "0001_initial.json",
            r#"{"app_label": "other"}"#,
        );
        assert!(matches!(
            DirectorySource::new(dir.path()).load(),
            Err(MigrationError::Load { .. })
        ));
    }

    #[test]
    fn test_missing_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("absent");
        let err = DirectorySource::new(&root).load().unwrap_err();
        match &err {
            MigrationError::Load { source_name, .. } => {
                assert_eq!(source_name, &root.display().to_string())
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }
}
