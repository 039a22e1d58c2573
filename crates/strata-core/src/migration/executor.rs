//! The migration engine: applies a schema graph against persisted state.
//!
//! Per-record state machine: Pending -> Applying -> Applied | Failed.
//! The applied log, the schema snapshot and the record markers live in one
//! sled database; every transition that touches more than one of them is a
//! single multi-tree transaction followed by a flush.

use super::config::{ApplyMode, EngineConfig};
use super::lock::{LockGuard, MigrationLock};
use super::log::{AppliedEntry, AppliedMigrationLog};
use super::plan::{
    MigrateSummary, MigrationPlan, MigrationStatus, MigrationTarget, PlanAction, PlanStep,
    StatusEntry,
};
use super::state::{MarkerStatus, RecordState, RecordStateStore};
use crate::error::MigrationError;
use crate::graph::{DependencyResolver, SchemaGraph};
use crate::record::{MigrationId, MigrationRecord, Operation, TableId};
use crate::schema::{OperationInterpreter, SchemaModel};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use std::collections::BTreeMap;

const SCHEMA_TREE: &str = "schema:model";
const SCHEMA_KEY: &[u8] = b"current";

/// A failure inside one record, before it is wrapped with run context.
struct RecordFailure {
    operation_index: Option<usize>,
    source: MigrationError,
}

impl From<MigrationError> for RecordFailure {
    fn from(source: MigrationError) -> Self {
        Self {
            operation_index: None,
            source,
        }
    }
}

/// Applies migration records in dependency order, exactly once each.
pub struct MigrationEngine {
    db: sled::Db,
    log: AppliedMigrationLog,
    states: RecordStateStore,
    lock: MigrationLock,
    schema_tree: sled::Tree,
    interpreter: OperationInterpreter,
    config: EngineConfig,
}

impl MigrationEngine {
    /// Open the database described by `config`.
    ///
    /// A database directory held open by another process is reported as
    /// [`MigrationError::LockContention`].
    pub fn open(config: EngineConfig) -> Result<Self, MigrationError> {
        let db = config
            .to_sled_config()
            .open()
            .map_err(|e| open_error(e, &config))?;
        Self::with_db(db, config)
    }

    /// Create an engine over an already open database.
    ///
    /// Engines sharing a database share its applied log and its lock.
    pub fn with_db(db: sled::Db, config: EngineConfig) -> Result<Self, MigrationError> {
        Ok(Self {
            log: AppliedMigrationLog::open(&db)?,
            states: RecordStateStore::open(&db)?,
            lock: MigrationLock::open(&db)?,
            schema_tree: db.open_tree(SCHEMA_TREE)?,
            interpreter: OperationInterpreter::new(config.interpreter_options()),
            db,
            config,
        })
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The applied-migration log.
    pub fn applied_log(&self) -> &AppliedMigrationLog {
        &self.log
    }

    /// The record marker store.
    pub fn state_store(&self) -> &RecordStateStore {
        &self.states
    }

    /// The persisted schema model; empty if nothing was applied yet.
    pub fn schema(&self) -> Result<SchemaModel, MigrationError> {
        match self.schema_tree.get(SCHEMA_KEY)? {
            Some(bytes) => SchemaModel::from_bytes(&bytes),
            None => Ok(SchemaModel::new()),
        }
    }

    /// Take the migration lock without waiting.
    ///
    /// `migrate` takes it itself; holding a guard from here makes every
    /// `migrate` on the same database fail with lock contention until the
    /// guard is dropped.
    pub fn acquire_lock(&self) -> Result<LockGuard, MigrationError> {
        let token = self.db.generate_id()?;
        self.lock
            .try_acquire(&self.config.owner, token, self.config.lock_ttl)
    }

    /// Validate the graph against the applied log without applying anything.
    ///
    /// Returns the full resolve order.
    pub fn check(&self, graph: &SchemaGraph) -> Result<Vec<MigrationId>, MigrationError> {
        let order = DependencyResolver::resolve_ids(graph)?;
        self.verify_history(graph, &self.log.entries()?)?;
        Ok(order)
    }

    /// Compute what `migrate` would do, simulating DDL against a copy of the schema.
    pub fn plan(
        &self,
        graph: &SchemaGraph,
        target: &MigrationTarget,
    ) -> Result<MigrationPlan, MigrationError> {
        let records = Self::ordered(graph, target)?;
        let applied = self.log.entries()?;
        self.verify_history(graph, &applied)?;

        let mut schema = self.schema()?;
        let mut steps = Vec::with_capacity(records.len());
        for record in records {
            let migration = record.id();
            let action = self.decide(record, &applied, &schema)?;
            let mut step = PlanStep {
                migration,
                action,
                operations: Vec::new(),
                ddl: Vec::new(),
            };

            let first = match action {
                PlanAction::Apply => Some(0),
                PlanAction::Resume { from_operation } => Some(from_operation),
                PlanAction::Fake | PlanAction::Skip => None,
            };
            if let Some(first) = first {
                for (index, operation) in record.operations.iter().enumerate().skip(first) {
                    step.operations.push(operation.describe());
                    let ddl = self
                        .interpreter
                        .apply_ddl(&record.app_label, operation, &mut schema, self.config.dialect)
                        .map_err(|source| MigrationError::ApplyFailure {
                            migration: step.migration.clone(),
                            operation_index: Some(index),
                            applied: Vec::new(),
                            source: Box::new(source),
                        })?;
                    step.ddl.extend(ddl);
                }
            }
            steps.push(step);
        }

        Ok(MigrationPlan {
            target: target.clone(),
            steps,
        })
    }

    /// State of every record in resolve order.
    pub fn status(&self, graph: &SchemaGraph) -> Result<Vec<StatusEntry>, MigrationError> {
        let applied = self.log.entries()?;
        let mut entries = Vec::with_capacity(graph.len());

        for record in DependencyResolver::resolve(graph)? {
            let migration = record.id();
            let entry = match (applied.get(&migration), self.states.load(&migration)?) {
                (Some(entry), _) => StatusEntry {
                    migration,
                    status: MigrationStatus::Applied,
                    applied_at: Some(entry.applied_at),
                    faked: entry.faked,
                    operation_index: None,
                    error: None,
                },
                (None, Some(marker)) => StatusEntry {
                    migration,
                    status: match marker.status {
                        MarkerStatus::Applying => MigrationStatus::Applying,
                        MarkerStatus::Failed => MigrationStatus::Failed,
                    },
                    applied_at: None,
                    faked: false,
                    operation_index: Some(marker.operation_index),
                    error: marker.error,
                },
                (None, None) => StatusEntry {
                    migration,
                    status: MigrationStatus::Pending,
                    applied_at: None,
                    faked: false,
                    operation_index: None,
                    error: None,
                },
            };
            entries.push(entry);
        }

        Ok(entries)
    }

    /// Apply every unapplied record up to `target`, in resolve order.
    ///
    /// Already applied records are skipped without interpretation. The run
    /// stops at the first failing record; the error is a
    /// [`MigrationError::ApplyFailure`] naming the record, the failing
    /// operation and the records this run applied before it.
    ///
    /// # Errors
    ///
    /// - Validation errors ([`MigrationError::Cycle`],
    ///   [`MigrationError::UnknownMigration`], history checks) before anything is written.
    /// - [`MigrationError::LockContention`] if another engine holds the lock.
    /// - [`MigrationError::ApplyFailure`] if a record fails.
    pub fn migrate(
        &self,
        graph: &SchemaGraph,
        target: &MigrationTarget,
    ) -> Result<MigrateSummary, MigrationError> {
        let records = Self::ordered(graph, target)?;

        let mut guard = self.acquire_lock()?;
        let applied = self.log.entries()?;
        self.verify_history(graph, &applied)?;

        tracing::info!(
            to = %target,
            records = records.len(),
            already_applied = applied.len(),
            mode = %self.config.mode,
            "starting migration run"
        );

        let mut schema = self.schema()?;
        let mut summary = MigrateSummary::default();

        for record in records {
            let id = record.id();
            let wrap = |failure: RecordFailure, applied: &[MigrationId]| {
                MigrationError::ApplyFailure {
                    migration: id.clone(),
                    operation_index: failure.operation_index,
                    applied: applied.to_vec(),
                    source: Box::new(failure.source),
                }
            };

            let action = self
                .decide(record, &applied, &schema)
                .map_err(|e| wrap(e.into(), &summary.applied))?;

            match action {
                PlanAction::Skip => {
                    tracing::debug!(migration = %id, "already applied, skipping");
                    summary.skipped.push(id);
                    continue;
                }
                PlanAction::Fake => {
                    self.commit(record, &schema, true)
                        .map_err(|e| wrap(e.into(), &summary.applied))?;
                    tracing::info!(migration = %id, "faked initial migration");
                    summary.faked.push(id);
                }
                PlanAction::Apply | PlanAction::Resume { .. } => {
                    let start = match action {
                        PlanAction::Resume { from_operation } => from_operation,
                        _ => 0,
                    };
                    let result = match self.config.mode {
                        ApplyMode::Atomic => self.apply_atomic(record, start, &mut schema),
                        ApplyMode::NonAtomic => self.apply_non_atomic(record, start, &mut schema),
                    };
                    let ddl = result.map_err(|f| wrap(f, &summary.applied))?;
                    tracing::info!(
                        migration = %id,
                        operations = record.operations.len().saturating_sub(start),
                        statements = ddl.len(),
                        "applied migration"
                    );
                    summary.applied.push(id.clone());
                    summary.ddl.push((id, ddl));
                }
            }

            self.renew_lease(&mut guard, &record.id(), &summary)?;
        }

        guard.release()?;
        tracing::info!(
            applied = summary.applied.len(),
            skipped = summary.skipped.len(),
            faked = summary.faked.len(),
            "migration run complete"
        );
        Ok(summary)
    }

    /// Extend the lease after `committed`. Losing it ends the run; the error
    /// carries the records this run already applied.
    fn renew_lease(
        &self,
        guard: &mut LockGuard,
        committed: &MigrationId,
        summary: &MigrateSummary,
    ) -> Result<(), MigrationError> {
        guard.renew(self.config.lock_ttl).map_err(|source| {
            tracing::warn!(
                migration = %committed,
                applied = summary.applied.len(),
                error = %source,
                "migration lock lost, stopping run"
            );
            MigrationError::ApplyFailure {
                migration: committed.clone(),
                operation_index: None,
                applied: summary.applied.clone(),
                source: Box::new(source),
            }
        })
    }

    /// Resolve order truncated at the target.
    fn ordered<'g>(
        graph: &'g SchemaGraph,
        target: &MigrationTarget,
    ) -> Result<Vec<&'g MigrationRecord>, MigrationError> {
        let mut order = DependencyResolver::resolve(graph)?;
        if let MigrationTarget::Migration(id) = target {
            let end = order
                .iter()
                .position(|r| r.app_label == id.app_label && r.name == id.name)
                .ok_or_else(|| MigrationError::UnknownMigration(id.clone()))?;
            order.truncate(end + 1);
        }
        Ok(order)
    }

    /// Applied records must have their dependencies applied and must not have changed.
    fn verify_history(
        &self,
        graph: &SchemaGraph,
        applied: &BTreeMap<MigrationId, AppliedEntry>,
    ) -> Result<(), MigrationError> {
        for (id, entry) in applied {
            let Some(record) = graph.get(id) else {
                tracing::warn!(migration = %id, "applied migration is missing from the loaded graph");
                continue;
            };
            if let Some(dependency) = record
                .dependencies
                .iter()
                .find(|dependency| !applied.contains_key(*dependency))
            {
                return Err(MigrationError::InconsistentHistory {
                    migration: id.clone(),
                    dependency: dependency.clone(),
                });
            }
            let current = record.checksum()?;
            if entry.checksum != current {
                return Err(MigrationError::ChecksumMismatch {
                    migration: id.clone(),
                    stored: entry.checksum.clone(),
                    current,
                });
            }
        }
        Ok(())
    }

    fn decide(
        &self,
        record: &MigrationRecord,
        applied: &BTreeMap<MigrationId, AppliedEntry>,
        schema: &SchemaModel,
    ) -> Result<PlanAction, MigrationError> {
        let id = record.id();
        if applied.contains_key(&id) {
            return Ok(PlanAction::Skip);
        }

        // A marker past operation 0 means part of the record is committed.
        if let Some(marker) = self.states.load(&id)? {
            if marker.is_failed() || marker.operation_index > 0 {
                if !self.config.resume_failed {
                    return Err(MigrationError::PreviouslyFailed {
                        migration: id,
                        operation_index: marker.operation_index,
                    });
                }
                return Ok(PlanAction::Resume {
                    from_operation: marker.operation_index,
                });
            }
        }

        if self.config.fake_initial && Self::tables_exist(record, schema) {
            return Ok(PlanAction::Fake);
        }
        Ok(PlanAction::Apply)
    }

    /// Whether an initial record's tables are all already present.
    fn tables_exist(record: &MigrationRecord, schema: &SchemaModel) -> bool {
        let mut created = record
            .operations
            .iter()
            .filter_map(|operation| match operation {
                Operation::CreateTable { name, .. } => Some(TableId::new(&record.app_label, name)),
                _ => None,
            })
            .peekable();
        record.initial && created.peek().is_some() && created.all(|table| schema.has_table(&table))
    }

    /// Pending -> Applying.
    fn begin(&self, id: &MigrationId, start: usize) -> Result<RecordState, MigrationError> {
        if let Some(stale) = self.states.load(id)? {
            if stale.status == MarkerStatus::Applying && start == 0 {
                tracing::warn!(
                    migration = %id,
                    started_at = stale.started_at,
                    "clearing marker left by an interrupted run"
                );
            }
        }
        let marker = RecordState::applying(id, start);
        self.states.save(&marker)?;
        self.states.flush()?;
        Ok(marker)
    }

    /// Interpret against a copy of the schema; commit everything or nothing.
    fn apply_atomic(
        &self,
        record: &MigrationRecord,
        start: usize,
        schema: &mut SchemaModel,
    ) -> Result<Vec<String>, RecordFailure> {
        let id = record.id();
        let mut marker = self.begin(&id, start)?;
        let mut working = schema.clone();
        let mut ddl = Vec::new();

        for (index, operation) in record.operations.iter().enumerate().skip(start) {
            match self.interpreter.apply_ddl(
                &record.app_label,
                operation,
                &mut working,
                self.config.dialect,
            ) {
                Ok(statements) => ddl.extend(statements),
                Err(source) => {
                    tracing::warn!(
                        migration = %id,
                        operation = index,
                        error = %source,
                        "operation failed, discarding record"
                    );
                    if start == 0 {
                        self.states.delete(&id)?;
                    } else {
                        // Operations before `start` stay committed from the earlier run.
                        marker.fail(start, source.to_string());
                        self.states.save(&marker)?;
                    }
                    self.states.flush()?;
                    return Err(RecordFailure {
                        operation_index: Some(index),
                        source,
                    });
                }
            }
        }

        self.commit(record, &working, false)?;
        *schema = working;
        Ok(ddl)
    }

    /// Commit operation by operation; persist a Failed marker at the first failure.
    fn apply_non_atomic(
        &self,
        record: &MigrationRecord,
        start: usize,
        schema: &mut SchemaModel,
    ) -> Result<Vec<String>, RecordFailure> {
        let id = record.id();
        let mut marker = self.begin(&id, start)?;
        let mut ddl = Vec::new();

        for (index, operation) in record.operations.iter().enumerate().skip(start) {
            match self.interpreter.apply_ddl(
                &record.app_label,
                operation,
                schema,
                self.config.dialect,
            ) {
                Ok(statements) => {
                    marker.advance();
                    self.commit_operation(schema, &marker)?;
                    ddl.extend(statements);
                }
                Err(source) => {
                    tracing::warn!(
                        migration = %id,
                        operation = index,
                        error = %source,
                        "operation failed, record left partially applied"
                    );
                    marker.fail(index, source.to_string());
                    self.states.save(&marker)?;
                    self.states.flush()?;
                    return Err(RecordFailure {
                        operation_index: Some(index),
                        source,
                    });
                }
            }
        }

        self.commit(record, schema, false)?;
        Ok(ddl)
    }

    /// Applying -> Applied: log entry, marker removal and schema snapshot together.
    fn commit(
        &self,
        record: &MigrationRecord,
        schema: &SchemaModel,
        faked: bool,
    ) -> Result<(), MigrationError> {
        let id = record.id();
        let key = id.to_key();
        let entry = AppliedEntry::new(&id, record.checksum()?, faked).to_bytes()?;
        let snapshot = schema.to_bytes()?;

        let result: Result<(), TransactionError<MigrationError>> =
            (self.log.tree(), self.states.tree(), &self.schema_tree).transaction(
                |(log_tx, state_tx, schema_tx)| {
                    log_tx.insert(key.as_slice(), entry.as_slice())?;
                    state_tx.remove(key.as_slice())?;
                    schema_tx.insert(SCHEMA_KEY, snapshot.as_slice())?;
                    Ok(())
                },
            );
        result.map_err(transaction_error)?;
        self.db.flush()?;
        Ok(())
    }

    /// One non-atomic operation: marker progress and schema snapshot together.
    fn commit_operation(
        &self,
        schema: &SchemaModel,
        marker: &RecordState,
    ) -> Result<(), MigrationError> {
        let key = marker.id().to_key();
        let state = marker.to_bytes()?;
        let snapshot = schema.to_bytes()?;

        let result: Result<(), TransactionError<MigrationError>> =
            (self.states.tree(), &self.schema_tree).transaction(|(state_tx, schema_tx)| {
                state_tx.insert(key.as_slice(), state.as_slice())?;
                schema_tx.insert(SCHEMA_KEY, snapshot.as_slice())?;
                Ok::<(), ConflictableTransactionError<MigrationError>>(())
            });
        result.map_err(transaction_error)?;
        self.db.flush()?;
        Ok(())
    }
}

fn transaction_error(error: TransactionError<MigrationError>) -> MigrationError {
    match error {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => MigrationError::Storage(e),
    }
}

/// sled refuses to open a directory another process holds.
fn open_error(error: sled::Error, config: &EngineConfig) -> MigrationError {
    match error {
        sled::Error::Io(io)
            if io.kind() == std::io::ErrorKind::WouldBlock
                || io.to_string().contains("could not acquire lock") =>
        {
            MigrationError::LockContention {
                holder: format!("another process using {}", config.path.display()),
                expires_at: 0,
            }
        }
        other => MigrationError::Storage(other),
    }
}
