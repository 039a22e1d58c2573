//! Strata Command-Line Client
//!
//! Applies, plans and inspects schema migrations stored as JSON files.

mod commands;
mod error;
mod formatter;

use clap::{Parser, Subcommand, ValueEnum};
use error::{CliError, EXIT_OK};
use formatter::OutputFormat;
use std::path::PathBuf;
use std::time::Duration;
use strata_core::{ApplyMode, Dialect, EngineConfig, MigrationTarget};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// SQL dialect accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DialectArg {
    /// PostgreSQL
    #[value(alias = "postgres")]
    Pg,
    /// SQLite
    Sqlite,
}

impl From<DialectArg> for Dialect {
    fn from(arg: DialectArg) -> Self {
        match arg {
            DialectArg::Pg => Dialect::Postgres,
            DialectArg::Sqlite => Dialect::Sqlite,
        }
    }
}

/// Strata schema migration tool
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(version, about = "Strata schema migration tool")]
pub struct Args {
    /// Directory holding migration state
    #[arg(long, global = true, default_value = "./strata_data")]
    pub data_dir: PathBuf,

    /// Directory of migration files (<app_label>/<name>.json)
    #[arg(long, global = true, default_value = "./migrations")]
    pub migrations: PathBuf,

    /// SQL dialect for emitted DDL
    #[arg(long, global = true, default_value = "pg", value_enum)]
    pub dialect: DialectArg,

    /// Migration lock lease in seconds
    #[arg(long, global = true, default_value_t = 300)]
    pub lock_ttl: u64,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Apply pending migrations up to TARGET
    Migrate {
        /// `latest` or `app_label.name`
        #[arg(default_value = "latest")]
        target: MigrationTarget,

        /// Record initial migrations whose tables already exist as applied
        #[arg(long)]
        fake_initial: bool,

        /// Commit operation by operation instead of per migration
        #[arg(long)]
        non_atomic: bool,

        /// Resume migrations that previously failed
        #[arg(long)]
        resume: bool,

        /// Accept non-nullable fields without a default for existing rows
        #[arg(long)]
        allow_missing_defaults: bool,

        /// Seconds to keep retrying while another run holds the lock
        #[arg(long, default_value_t = 0)]
        lock_wait: u64,

        /// Print the emitted DDL instead of a summary
        #[arg(long)]
        sql: bool,

        /// Output format
        #[arg(long, default_value = "table", value_enum)]
        format: OutputFormat,
    },

    /// Show what `migrate` would do without applying anything
    ShowPlan {
        /// `latest` or `app_label.name`
        #[arg(default_value = "latest")]
        target: MigrationTarget,

        /// Print only the DDL
        #[arg(long)]
        sql: bool,

        /// Output format
        #[arg(long, default_value = "table", value_enum)]
        format: OutputFormat,
    },

    /// Validate the migration graph and applied history
    Check,

    /// Show the state of every migration
    Status {
        /// Output format
        #[arg(long, default_value = "table", value_enum)]
        format: OutputFormat,
    },
}

impl Args {
    /// Engine configuration for this invocation.
    pub fn engine_config(&self) -> EngineConfig {
        let config = EngineConfig::new(&self.data_dir)
            .with_dialect(self.dialect.into())
            .with_lock_ttl(Duration::from_secs(self.lock_ttl));

        match &self.command {
            Command::Migrate {
                fake_initial,
                non_atomic,
                resume,
                allow_missing_defaults,
                ..
            } => config
                .with_mode(if *non_atomic {
                    ApplyMode::NonAtomic
                } else {
                    ApplyMode::Atomic
                })
                .fake_initial(*fake_initial)
                .resume_failed(*resume)
                .allow_missing_defaults(*allow_missing_defaults),
            _ => config,
        }
    }
}

fn main() {
    // Logs go to stderr so stdout stays machine-readable.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "strata_cli=info,strata_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    match run(&args) {
        Ok(output) => {
            if !output.is_empty() {
                println!("{}", output);
            }
            std::process::exit(EXIT_OK);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}

fn run(args: &Args) -> Result<String, CliError> {
    let config = args.engine_config();
    tracing::debug!(
        data_dir = %args.data_dir.display(),
        migrations = %args.migrations.display(),
        dialect = %config.dialect,
        "configuration loaded"
    );

    match &args.command {
        Command::Migrate {
            target,
            lock_wait,
            sql,
            format,
            ..
        } => commands::migrate(
            config,
            &args.migrations,
            target,
            Duration::from_secs(*lock_wait),
            *sql,
            *format,
        ),
        Command::ShowPlan {
            target,
            sql,
            format,
        } => commands::show_plan(config, &args.migrations, target, *sql, *format),
        Command::Check => commands::check(config, &args.migrations),
        Command::Status { format } => commands::status(config, &args.migrations, *format),
    }
}
