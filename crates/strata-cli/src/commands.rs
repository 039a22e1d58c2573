//! Subcommand implementations. Each returns the text to print on stdout.

use crate::error::CliError;
use crate::formatter::{create_formatter, format_sql, OutputFormat};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use strata_core::{
    DirectorySource, EngineConfig, MigrateSummary, MigrationEngine, MigrationError,
    MigrationTarget, SchemaGraph,
};

/// First delay between lock attempts.
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
/// Longest delay between lock attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Load and validate the migration graph under `dir`.
pub fn load_graph(dir: &Path) -> Result<SchemaGraph, CliError> {
    if !dir.is_dir() {
        return Err(CliError::Config(format!(
            "migrations directory {} does not exist",
            dir.display()
        )));
    }
    Ok(SchemaGraph::from_source(&DirectorySource::new(dir))?)
}

/// `check`: validate the graph and the applied history without applying.
pub fn check(config: EngineConfig, migrations: &Path) -> Result<String, CliError> {
    let graph = load_graph(migrations)?;
    let engine = MigrationEngine::open(config)?;
    let order = engine.check(&graph)?;
    let applied = engine.applied_log().len();

    tracing::info!(migrations = order.len(), applied, "graph is valid");
    let mut output = format!(
        "OK: {} migrations, {} applied, {} pending",
        order.len(),
        applied.min(order.len()),
        order.len().saturating_sub(applied)
    );
    for id in &order {
        output.push_str(&format!("\n  {}", id));
    }
    Ok(output)
}

/// `show-plan`: what `migrate` would do.
pub fn show_plan(
    config: EngineConfig,
    migrations: &Path,
    target: &MigrationTarget,
    sql: bool,
    format: OutputFormat,
) -> Result<String, CliError> {
    let graph = load_graph(migrations)?;
    let engine = MigrationEngine::open(config)?;
    let plan = engine.plan(&graph, target)?;

    if sql {
        return Ok(format_sql(plan.ddl()));
    }
    Ok(create_formatter(format).format_plan(&plan))
}

/// `status`: state of every loaded migration.
pub fn status(
    config: EngineConfig,
    migrations: &Path,
    format: OutputFormat,
) -> Result<String, CliError> {
    let graph = load_graph(migrations)?;
    let engine = MigrationEngine::open(config)?;
    let entries = engine.status(&graph)?;
    Ok(create_formatter(format).format_status(&entries))
}

/// `migrate`: apply pending migrations, retrying lock contention for up to `lock_wait`.
pub fn migrate(
    config: EngineConfig,
    migrations: &Path,
    target: &MigrationTarget,
    lock_wait: Duration,
    sql: bool,
    format: OutputFormat,
) -> Result<String, CliError> {
    let graph = load_graph(migrations)?;
    let summary = with_lock_retry(lock_wait, || {
        MigrationEngine::open(config.clone())?.migrate(&graph, target)
    })?;

    if sql {
        return Ok(format_sql(
            summary
                .ddl
                .iter()
                .flat_map(|(_, statements)| statements.iter().map(String::as_str)),
        ));
    }
    Ok(create_formatter(format).format_summary(&summary))
}

/// Run `attempt` until it succeeds, fails with a non-retryable error, or `wait` elapses.
fn with_lock_retry(
    wait: Duration,
    mut attempt: impl FnMut() -> Result<MigrateSummary, MigrationError>,
) -> Result<MigrateSummary, MigrationError> {
    let deadline = Instant::now() + wait;
    let mut backoff = INITIAL_BACKOFF;

    loop {
        match attempt() {
            Err(e) if e.is_retryable() => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(e);
                }
                let delay = backoff.min(deadline - now);
                tracing::info!(
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "migration lock busy, waiting"
                );
                thread::sleep(delay);
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            result => return result,
        }
    }
}
