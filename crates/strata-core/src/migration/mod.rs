//! Migration engine for Strata.
//!
//! This module applies a [`crate::graph::SchemaGraph`] to a persisted schema:
//! - Deterministic apply order from the dependency resolver
//! - Exactly-once application tracked in the applied log
//! - Atomic or operation-by-operation commits with resumable failures
//! - A lease-based lock so concurrent engines never interleave
//!
//! # Persistence
//!
//! | Tree | Contents | Encoding |
//! |------|----------|----------|
//! | `migration:applied` | [`AppliedEntry`] per applied record | rkyv |
//! | `migration:state` | [`RecordState`] per unfinished record | rkyv |
//! | `migration:lock` | the current [`LockLease`] | rkyv |
//! | `schema:model` | the [`crate::schema::SchemaModel`] snapshot | JSON |
//!
//! # Example
//!
//! ```ignore
//! use strata_core::migration::{EngineConfig, MigrationEngine, MigrationTarget};
//!
//! let engine = MigrationEngine::open(EngineConfig::new("./strata_data"))?;
//! let summary = engine.migrate(&graph, &MigrationTarget::Latest)?;
//! println!("applied {} migrations", summary.applied.len());
//! ```

pub mod config;
pub mod executor;
pub mod lock;
pub mod log;
pub mod plan;
pub mod state;

pub use config::{ApplyMode, EngineConfig};
pub use executor::MigrationEngine;
pub use lock::{LockGuard, LockLease, MigrationLock};
pub use log::{AppliedEntry, AppliedMigrationLog};
pub use plan::{
    MigrateSummary, MigrationPlan, MigrationStatus, MigrationTarget, PlanAction, PlanStep,
    StatusEntry,
};
pub use state::{MarkerStatus, RecordState, RecordStateStore};

/// Current time in microseconds since the Unix epoch.
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
