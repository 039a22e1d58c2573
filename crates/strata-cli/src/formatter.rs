//! Output formatters for plans, run summaries and status reports.

use clap::ValueEnum;
use comfy_table::Table;
use serde_json::{json, Value};
use strata_core::migration::PlanStep;
use strata_core::{MigrateSummary, MigrationPlan, PlanAction, StatusEntry};

/// Output format for reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format
    Table,
    /// JSON format
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Trait for formatting output.
pub trait Formatter {
    /// Format a migration plan.
    fn format_plan(&self, plan: &MigrationPlan) -> String;

    /// Format the result of a migrate run.
    fn format_summary(&self, summary: &MigrateSummary) -> String;

    /// Format a status report.
    fn format_status(&self, entries: &[StatusEntry]) -> String;
}

/// Create a formatter for the given output format.
pub fn create_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Table => Box::new(TableFormatter),
        OutputFormat::Json => Box::new(JsonFormatter),
    }
}

/// DDL as a script: one statement per paragraph, each terminated by `;`.
pub fn format_sql<'a>(statements: impl IntoIterator<Item = &'a str>) -> String {
    statements
        .into_iter()
        .map(|s| format!("{};", s))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Table formatter using comfy-table.
pub struct TableFormatter;

impl Formatter for TableFormatter {
    fn format_plan(&self, plan: &MigrationPlan) -> String {
        if plan.is_up_to_date() {
            return format!("No migrations to apply (target: {})", plan.target);
        }

        let mut table = Table::new();
        table.set_header(vec!["Migration", "Action", "Operations", "Statements"]);
        for step in plan.pending() {
            table.add_row(vec![
                step.migration.to_string(),
                step.action.to_string(),
                step.operations.join("\n"),
                step.ddl.len().to_string(),
            ]);
        }
        table.to_string()
    }

    fn format_summary(&self, summary: &MigrateSummary) -> String {
        if summary.is_noop() {
            return "No migrations to apply".to_string();
        }

        let mut table = Table::new();
        table.set_header(vec!["Migration", "Result"]);
        for id in &summary.applied {
            table.add_row(vec![id.to_string(), "applied".to_string()]);
        }
        for id in &summary.faked {
            table.add_row(vec![id.to_string(), "faked".to_string()]);
        }
        format!(
            "{}\n{} applied, {} faked, {} already applied",
            table,
            summary.applied.len(),
            summary.faked.len(),
            summary.skipped.len()
        )
    }

    fn format_status(&self, entries: &[StatusEntry]) -> String {
        if entries.is_empty() {
            return "No migrations found".to_string();
        }

        let mut table = Table::new();
        table.set_header(vec!["Migration", "Status", "Applied At (unix s)", "Note"]);
        for entry in entries {
            let note = match (&entry.error, entry.operation_index) {
                (Some(error), Some(index)) => format!("operation {}: {}", index, error),
                (None, Some(index)) => format!("stopped before operation {}", index),
                _ if entry.faked => "faked".to_string(),
                _ => String::new(),
            };
            table.add_row(vec![
                entry.migration.to_string(),
                entry.status.to_string(),
                entry
                    .applied_at
                    .map(|at| (at / 1_000_000).to_string())
                    .unwrap_or_default(),
                note,
            ]);
        }
        table.to_string()
    }
}

/// JSON formatter.
pub struct JsonFormatter;

impl JsonFormatter {
    fn step(step: &PlanStep) -> Value {
        let from_operation = match step.action {
            PlanAction::Resume { from_operation } => Some(from_operation),
            _ => None,
        };
        json!({
            "migration": step.migration.to_string(),
            "action": match step.action {
                PlanAction::Apply => "apply",
                PlanAction::Resume { .. } => "resume",
                PlanAction::Fake => "fake",
                PlanAction::Skip => "skip",
            },
            "from_operation": from_operation,
            "operations": step.operations,
            "ddl": step.ddl,
        })
    }
}

impl Formatter for JsonFormatter {
    fn format_plan(&self, plan: &MigrationPlan) -> String {
        let steps: Vec<Value> = plan.steps.iter().map(Self::step).collect();
        pretty(&json!({
            "target": plan.target.to_string(),
            "up_to_date": plan.is_up_to_date(),
            "steps": steps,
        }))
    }

    fn format_summary(&self, summary: &MigrateSummary) -> String {
        let ids = |ids: &[strata_core::MigrationId]| {
            ids.iter().map(ToString::to_string).collect::<Vec<_>>()
        };
        let ddl: serde_json::Map<String, Value> = summary
            .ddl
            .iter()
            .map(|(id, statements)| (id.to_string(), json!(statements)))
            .collect();
        pretty(&json!({
            "applied": ids(&summary.applied),
            "faked": ids(&summary.faked),
            "skipped": ids(&summary.skipped),
            "ddl": ddl,
        }))
    }

    fn format_status(&self, entries: &[StatusEntry]) -> String {
        let rows: Vec<Value> = entries
            .iter()
            .map(|entry| {
                json!({
                    "migration": entry.migration.to_string(),
                    "status": entry.status.to_string(),
                    "applied_at": entry.applied_at,
                    "faked": entry.faked,
                    "operation_index": entry.operation_index,
                    "error": entry.error,
                })
            })
            .collect();
        pretty(&Value::Array(rows))
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
