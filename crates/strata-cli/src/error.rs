//! CLI error types and exit codes.

use strata_core::{ErrorKind, MigrationError};
use thiserror::Error;

/// Exit code for a successful run.
pub const EXIT_OK: i32 = 0;
/// Exit code for validation errors: cycles, unknown dependencies, bad input.
pub const EXIT_VALIDATION: i32 = 1;
/// Exit code for apply failures.
pub const EXIT_APPLY: i32 = 2;
/// Exit code for lock contention.
pub const EXIT_LOCK: i32 = 3;

/// CLI errors.
#[derive(Debug, Error)]
pub enum CliError {
    /// Error raised by the migration engine.
    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// Invalid invocation or environment.
    #[error("configuration error: {0}")]
    Config(String),

    /// Output could not be rendered.
    #[error("output error: {0}")]
    Output(#[from] serde_json::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Migration(e) => match e.kind() {
                ErrorKind::Validation => EXIT_VALIDATION,
                ErrorKind::Apply => EXIT_APPLY,
                ErrorKind::LockContention => EXIT_LOCK,
            },
            CliError::Config(_) => EXIT_VALIDATION,
            CliError::Output(_) | CliError::Io(_) => EXIT_APPLY,
        }
    }
}
