//! Engine configuration.

use crate::schema::{Dialect, InterpreterOptions};
use std::path::PathBuf;
use std::time::Duration;

/// How a record's operations are committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApplyMode {
    /// All operations of a record commit together with its log entry, or not at all.
    #[default]
    Atomic,
    /// Each operation commits on its own; a failure leaves a resumable Failed marker.
    NonAtomic,
}

impl std::fmt::Display for ApplyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApplyMode::Atomic => write!(f, "atomic"),
            ApplyMode::NonAtomic => write!(f, "non-atomic"),
        }
    }
}

/// Configuration for the migration engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Path to the database directory.
    pub path: PathBuf,

    /// Temporary database (deleted on drop).
    pub temporary: bool,

    /// Page cache capacity in bytes.
    pub cache_capacity: u64,

    /// Commit granularity.
    pub mode: ApplyMode,

    /// Dialect DDL is emitted for.
    pub dialect: Dialect,

    /// Lease length of the migration lock. Renewed after every record.
    pub lock_ttl: Duration,

    /// Label recorded in the lock lease, shown to contending engines.
    pub owner: String,

    /// Acknowledge non-nullable fields without defaults instead of failing.
    pub allow_missing_defaults: bool,

    /// Record initial migrations whose tables already exist without running them.
    pub fake_initial: bool,

    /// Resume records left Failed by a non-atomic run.
    pub resume_failed: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./strata_data"),
            temporary: false,
            cache_capacity: 64 * 1024 * 1024, // 64MB
            mode: ApplyMode::Atomic,
            dialect: Dialect::Postgres,
            lock_ttl: Duration::from_secs(300),
            owner: format!("pid-{}", std::process::id()),
            allow_missing_defaults: false,
            fake_initial: false,
            resume_failed: false,
        }
    }
}

impl EngineConfig {
    /// Create a new configuration with the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Create a temporary in-memory configuration for testing.
    pub fn temporary() -> Self {
        Self {
            path: PathBuf::from(""),
            temporary: true,
            ..Default::default()
        }
    }

    /// Set the apply mode.
    pub fn with_mode(mut self, mode: ApplyMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the DDL dialect.
    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Set the lock lease length.
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Set the lock owner label.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Set whether missing defaults are acknowledged.
    pub fn allow_missing_defaults(mut self, allow: bool) -> Self {
        self.allow_missing_defaults = allow;
        self
    }

    /// Set whether initial migrations may be faked.
    pub fn fake_initial(mut self, fake: bool) -> Self {
        self.fake_initial = fake;
        self
    }

    /// Set whether failed records are resumed.
    pub fn resume_failed(mut self, resume: bool) -> Self {
        self.resume_failed = resume;
        self
    }

    /// Options for the operation interpreter.
    pub fn interpreter_options(&self) -> InterpreterOptions {
        InterpreterOptions {
            allow_missing_defaults: self.allow_missing_defaults,
        }
    }

    /// Convert to sled configuration.
    pub(crate) fn to_sled_config(&self) -> sled::Config {
        let config = sled::Config::new()
            .cache_capacity(self.cache_capacity)
            .use_compression(true);

        if self.temporary {
            config.temporary(true)
        } else {
            config.path(&self.path)
        }
    }
}
