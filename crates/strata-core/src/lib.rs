//! Strata Core - versioned schema migrations.
//!
//! This crate loads migration records into a dependency graph, orders them
//! deterministically, interprets their schema operations into a model and
//! dialect DDL, and applies them exactly once under an exclusive lock.

pub mod discovery;
pub mod error;
pub mod graph;
pub mod migration;
pub mod record;
pub mod schema;

pub use discovery::{DirectorySource, MigrationSource, StaticSource};
pub use error::{ErrorKind, MigrationError};
pub use graph::{DependencyResolver, SchemaGraph};
pub use migration::{
    current_timestamp, AppliedEntry, AppliedMigrationLog, ApplyMode, EngineConfig, LockGuard,
    MigrateSummary, MigrationEngine, MigrationPlan, MigrationStatus, MigrationTarget, PlanAction,
    StatusEntry,
};
pub use record::{
    DefaultValue, FieldDescriptor, FieldType, MigrationId, MigrationRecord, OnDelete, Operation,
    TableId, TableOptions,
};
pub use schema::{
    DdlEmitter, Dialect, Enforcement, ForeignKeyConstraint, InterpreterOptions,
    OperationInterpreter, SchemaModel, TableState,
};
