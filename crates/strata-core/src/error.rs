//! Migration error types.

use crate::record::{MigrationId, TableId};
use thiserror::Error;

/// Coarse classification of a [`MigrationError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Raised before any mutation: loading, graph validation, history checks.
    Validation,
    /// Raised while applying records or persisting bookkeeping.
    Apply,
    /// Another engine holds the migration lock. Retryable.
    LockContention,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::Apply => write!(f, "apply"),
            ErrorKind::LockContention => write!(f, "lock contention"),
        }
    }
}

/// Migration engine errors.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A migration record could not be loaded.
    #[error("failed to load migration {source_name}: {reason}")]
    Load {
        /// File or identity the record came from.
        source_name: String,
        /// Why loading failed.
        reason: String,
    },

    /// The dependency relation contains a cycle.
    #[error("dependency cycle detected: {}", format_chain(.chain))]
    Cycle {
        /// Members of the cycle; the first element is repeated at the end.
        chain: Vec<MigrationId>,
    },

    /// A record depends on a migration that was never loaded.
    #[error("migration {migration} depends on unknown migration {dependency}")]
    UnknownDependency {
        /// The record declaring the dependency.
        migration: MigrationId,
        /// The missing dependency.
        dependency: MigrationId,
    },

    /// A migration target does not name a loaded record.
    #[error("unknown migration {0}")]
    UnknownMigration(MigrationId),

    /// CreateTable on a table that already exists.
    #[error("table {0} already exists")]
    DuplicateTable(TableId),

    /// The operation references a table that does not exist.
    #[error("table {0} does not exist")]
    UnknownTable(TableId),

    /// AddField with a name already used on the table.
    #[error("field {field} already exists on table {table}")]
    DuplicateField {
        /// Table being modified.
        table: TableId,
        /// Conflicting field name.
        field: String,
    },

    /// AlterField or RemoveField on a missing field.
    #[error("field {field} does not exist on table {table}")]
    UnknownField {
        /// Table being modified.
        table: TableId,
        /// Missing field name.
        field: String,
    },

    /// A non-nullable field without a default would leave existing rows without a value.
    #[error(
        "non-nullable field {field} on table {table} has no default for existing rows; \
         provide a default or backfill value, or acknowledge with allow_missing_defaults"
    )]
    RequiresDefault {
        /// Table being modified.
        table: TableId,
        /// Field lacking a default.
        field: String,
    },

    /// A field descriptor is not valid in its context.
    #[error("invalid field {field} on table {table}: {reason}")]
    InvalidField {
        /// Table being modified.
        table: TableId,
        /// Offending field.
        field: String,
        /// Why the field is rejected.
        reason: String,
    },

    /// DeleteTable on a table that other tables still reference.
    #[error("table {table} is still referenced by {referenced_by}")]
    TableReferenced {
        /// Table being deleted.
        table: TableId,
        /// A table holding a foreign key to it.
        referenced_by: TableId,
    },

    /// An applied migration has a dependency that is not applied.
    #[error("migration {migration} is applied before its dependency {dependency}")]
    InconsistentHistory {
        /// The applied record.
        migration: MigrationId,
        /// The unapplied dependency.
        dependency: MigrationId,
    },

    /// An applied migration was modified after being applied.
    #[error(
        "migration {migration} has been modified after being applied \
         (stored checksum {stored}, current checksum {current})"
    )]
    ChecksumMismatch {
        /// The modified record.
        migration: MigrationId,
        /// Checksum recorded at application time.
        stored: String,
        /// Checksum of the loaded record.
        current: String,
    },

    /// A record previously failed in non-atomic mode and needs intervention.
    #[error(
        "migration {migration} previously failed at operation {operation_index}; \
         fix the cause and resume"
    )]
    PreviouslyFailed {
        /// The failed record.
        migration: MigrationId,
        /// Index of the operation that failed.
        operation_index: usize,
    },

    /// Another engine instance holds the migration lock.
    #[error("migration lock held by {holder} until {expires_at} (retryable)")]
    LockContention {
        /// Owner label of the current holder.
        holder: String,
        /// Lease expiry (microseconds since epoch).
        expires_at: u64,
    },

    /// Applying a record failed.
    #[error(
        "migration {migration} failed{}: {source}",
        .operation_index.map(|i| format!(" at operation {i}")).unwrap_or_default()
    )]
    ApplyFailure {
        /// The failing record.
        migration: MigrationId,
        /// Index of the failing operation, if the failure was inside one.
        operation_index: Option<usize>,
        /// Records applied by this run before the failure.
        applied: Vec<MigrationId>,
        /// The underlying error.
        source: Box<MigrationError>,
    },

    /// Migration state is corrupted.
    #[error("migration state corrupted: {message}")]
    StateCorrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl MigrationError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MigrationError::Load { .. }
            | MigrationError::Cycle { .. }
            | MigrationError::UnknownDependency { .. }
            | MigrationError::UnknownMigration(_)
            | MigrationError::InconsistentHistory { .. }
            | MigrationError::ChecksumMismatch { .. } => ErrorKind::Validation,
            MigrationError::LockContention { .. } => ErrorKind::LockContention,
            // A run that lost the lock between records can be retried.
            MigrationError::ApplyFailure { source, .. }
                if source.kind() == ErrorKind::LockContention =>
            {
                ErrorKind::LockContention
            }
            _ => ErrorKind::Apply,
        }
    }

    /// Whether the caller may retry the same call later.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::LockContention
    }

    /// Whether this is a soft condition that can be acknowledged.
    pub fn is_warning(&self) -> bool {
        match self {
            MigrationError::RequiresDefault { .. } => true,
            MigrationError::ApplyFailure { source, .. } => source.is_warning(),
            _ => false,
        }
    }

    /// The innermost error, unwrapping [`MigrationError::ApplyFailure`].
    pub fn root_cause(&self) -> &MigrationError {
        match self {
            MigrationError::ApplyFailure { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

fn format_chain(chain: &[MigrationId]) -> String {
    chain
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_display() {
        let err = MigrationError::Cycle {
            chain: vec![
                MigrationId::new("a", "0001"),
                MigrationId::new("b", "0001"),
                MigrationId::new("a", "0001"),
            ],
        };
        assert_eq!(
            err.to_string(),
            "dependency cycle detected: a.0001 -> b.0001 -> a.0001"
        );
    }

    #[test]
    fn test_error_kinds() {
        let lock = MigrationError::LockContention {
            holder: "deploy-1".to_string(),
            expires_at: 0,
        };
        assert_eq!(lock.kind(), ErrorKind::LockContention);
        assert!(lock.is_retryable());

        let unknown = MigrationError::UnknownDependency {
            migration: MigrationId::new("app", "0002"),
            dependency: MigrationId::new("app", "0001"),
        };
        assert_eq!(unknown.kind(), ErrorKind::Validation);
        assert!(!unknown.is_retryable());
    }

    #[test]
    fn test_lost_lock_mid_run_is_retryable() {
        let err = MigrationError::ApplyFailure {
            migration: MigrationId::new("app", "0001_initial"),
            operation_index: None,
            applied: vec![MigrationId::new("app", "0001_initial")],
            source: Box::new(MigrationError::LockContention {
                holder: "deploy-2".to_string(),
                expires_at: 0,
            }),
        };
        assert_eq!(err.kind(), ErrorKind::LockContention);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_apply_failure_display_and_root_cause() {
        let err = MigrationError::ApplyFailure {
            migration: MigrationId::new("app", "0002_add_email"),
            operation_index: Some(1),
            applied: vec![MigrationId::new("app", "0001_initial")],
            source: Box::new(MigrationError::RequiresDefault {
                table: TableId::new("app", "User"),
                field: "email".to_string(),
            }),
        };
        assert_eq!(err.kind(), ErrorKind::Apply);
        assert!(err.is_warning());
        assert!(err
            .to_string()
            .starts_with("migration app.0002_add_email failed at operation 1"));
        assert!(matches!(
            err.root_cause(),
            MigrationError::RequiresDefault { .. }
        ));
    }
}
