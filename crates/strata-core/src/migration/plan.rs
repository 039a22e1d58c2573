//! Migration plans, run summaries and status reports.

use crate::record::MigrationId;
use std::fmt;
use std::str::FromStr;

/// How far `migrate` goes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MigrationTarget {
    /// Every record in the graph.
    #[default]
    Latest,
    /// The resolve order up to and including this record.
    Migration(MigrationId),
}

impl fmt::Display for MigrationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationTarget::Latest => write!(f, "latest"),
            MigrationTarget::Migration(id) => write!(f, "{}", id),
        }
    }
}

impl FromStr for MigrationTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("latest") {
            Ok(MigrationTarget::Latest)
        } else {
            s.parse().map(MigrationTarget::Migration)
        }
    }
}

/// What the engine will do with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanAction {
    /// Interpret every operation.
    Apply,
    /// Continue a failed non-atomic record at this operation.
    Resume {
        /// First operation to run.
        from_operation: usize,
    },
    /// Record as applied without interpretation.
    Fake,
    /// Already applied.
    Skip,
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanAction::Apply => write!(f, "apply"),
            PlanAction::Resume { from_operation } => write!(f, "resume@{}", from_operation),
            PlanAction::Fake => write!(f, "fake"),
            PlanAction::Skip => write!(f, "skip"),
        }
    }
}

/// One record in a plan.
#[derive(Debug, Clone)]
pub struct PlanStep {
    /// The record.
    pub migration: MigrationId,
    /// What will happen to it.
    pub action: PlanAction,
    /// Descriptions of the operations that will run.
    pub operations: Vec<String>,
    /// DDL the operations emit, simulated against the current schema.
    pub ddl: Vec<String>,
}

/// The records `migrate` would visit, in order.
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    /// Target the plan was computed for.
    pub target: MigrationTarget,
    /// Steps in resolve order.
    pub steps: Vec<PlanStep>,
}

impl MigrationPlan {
    /// Steps that change anything.
    pub fn pending(&self) -> impl Iterator<Item = &PlanStep> {
        self.steps.iter().filter(|s| s.action != PlanAction::Skip)
    }

    /// Check whether every step is already applied.
    pub fn is_up_to_date(&self) -> bool {
        self.pending().next().is_none()
    }

    /// All DDL in execution order.
    pub fn ddl(&self) -> Vec<&str> {
        self.steps
            .iter()
            .flat_map(|s| s.ddl.iter().map(String::as_str))
            .collect()
    }
}

/// Result of a successful `migrate` run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrateSummary {
    /// Records applied by this run, in order.
    pub applied: Vec<MigrationId>,
    /// Records skipped because they were already applied.
    pub skipped: Vec<MigrationId>,
    /// Initial records recorded without interpretation.
    pub faked: Vec<MigrationId>,
    /// DDL emitted per applied record.
    pub ddl: Vec<(MigrationId, Vec<String>)>,
}

impl MigrateSummary {
    /// Check whether the run changed nothing.
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty() && self.faked.is_empty()
    }
}

/// State of a record as seen by `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    /// Not applied.
    Pending,
    /// Interpretation started and never finished.
    Applying,
    /// In the applied log.
    Applied,
    /// Failed in non-atomic mode.
    Failed,
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationStatus::Pending => write!(f, "pending"),
            MigrationStatus::Applying => write!(f, "applying"),
            MigrationStatus::Applied => write!(f, "applied"),
            MigrationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One line of a status report.
#[derive(Debug, Clone)]
pub struct StatusEntry {
    /// The record.
    pub migration: MigrationId,
    /// Its state.
    pub status: MigrationStatus,
    /// When it was applied (microseconds since epoch).
    pub applied_at: Option<u64>,
    /// Whether it was faked.
    pub faked: bool,
    /// Operation index of an unfinished record.
    pub operation_index: Option<usize>,
    /// Failure message of a failed record.
    pub error: Option<String>,
}
