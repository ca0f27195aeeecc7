#![forbid(unsafe_code)]
//! `cms-migrate`: operator CLI over the migration coordinator.

use std::io::Write;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use cms_migrate_core::paths::write_file_atomic;
use cms_migrate_core::{Config, RunStatus};
use cms_migrate_runner::{
    AdminBoundary, AdminRequest, AdminResponse, LocalOperator, RunCoordinator, StatusReport,
};
use cms_migrate_storage::{LogFilter, LogRecord, LogViewer, RecordFormat, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("exit code {0}")]
    ExitCode(i32),
    #[error(transparent)]
    Core(#[from] cms_migrate_core::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type CliResult<T> = Result<T, CliError>;

#[derive(Parser, Debug)]
#[command(name = "cms-migrate", version, about = "CMS migration coordinator")]
pub struct Cli {
    /// Directory scanned for migration units.
    #[arg(long, global = true)]
    pub units_dir: Option<PathBuf>,
    /// Audit log file.
    #[arg(long, global = true)]
    pub log_path: Option<PathBuf>,
    /// Run lock file.
    #[arg(long, global = true)]
    pub lock_path: Option<PathBuf>,
    /// Applied-units ledger file.
    #[arg(long, global = true)]
    pub applied_path: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List every unit as a dry run.
    Preview,
    /// Execute the first requested unit that has not been applied yet.
    Run {
        #[arg(required = true, value_name = "NAME")]
        names: Vec<String>,
    },
    /// Execute every pending unit in order.
    #[command(name = "run-all")]
    RunAll,
    /// Show applied and pending units and the lock holder.
    Status {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Inspect or manage the audit log.
    Log {
        #[command(subcommand)]
        action: LogCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum LogCommand {
    /// Parsed entries, newest first.
    Show {
        #[arg(long, value_enum)]
        filter: Option<FilterArg>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Last raw lines of the log file.
    Tail {
        #[arg(short = 'n', long, default_value_t = 20)]
        lines: usize,
    },
    /// Copy the log file verbatim.
    Export {
        #[arg(long, short = 'o')]
        output: PathBuf,
    },
    /// Reset the log to an empty array. Applied state is kept.
    Clear {
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FilterArg {
    Success,
    Fail,
}

impl From<FilterArg> for LogFilter {
    fn from(value: FilterArg) -> Self {
        match value {
            FilterArg::Success => Self::Success,
            FilterArg::Fail => Self::Fail,
        }
    }
}

pub fn run() -> i32 {
    let cli = Cli::parse();
    match execute(cli) {
        Ok(()) => 0,
        Err(err) => {
            emit_error(&err);
            err_exit_code(&err)
        }
    }
}

const fn err_exit_code(err: &CliError) -> i32 {
    match err {
        CliError::ExitCode(code) => *code,
        CliError::InvalidArgument(_) => 2,
        _ => 1,
    }
}

fn emit_error(err: &CliError) {
    if matches!(err, CliError::ExitCode(_)) {
        return;
    }
    eprintln!("error: {err}");
}

/// 0 for success, 2 when nothing ran because the request was refused, 1 otherwise.
#[must_use]
pub const fn status_exit_code(status: RunStatus) -> i32 {
    if status.is_success() {
        return 0;
    }
    match status {
        RunStatus::Locked | RunStatus::Invalid | RunStatus::Unauthorized => 2,
        _ => 1,
    }
}

/// Environment configuration with command-line path overrides applied.
#[must_use]
pub fn resolve_config(cli: &Cli) -> Config {
    let mut config = Config::from_env();
    if let Some(dir) = &cli.units_dir {
        config.units_dir.clone_from(dir);
    }
    if let Some(path) = &cli.log_path {
        config.log_path.clone_from(path);
    }
    if let Some(path) = &cli.lock_path {
        config.lock_path.clone_from(path);
    }
    if let Some(path) = &cli.applied_path {
        config.applied_path.clone_from(path);
    }
    config
}

pub fn execute(cli: Cli) -> CliResult<()> {
    let config = resolve_config(&cli);
    tracing::debug!(
        units_dir = %config.units_dir.display(),
        log = %config.log_path.display(),
        lock = %config.lock_path.display(),
        "resolved configuration"
    );
    let mut out = std::io::stdout().lock();
    execute_with(&config, cli.command, &mut out)
}

/// Run one command against `config`, writing responses to `out`.
pub fn execute_with(config: &Config, command: Commands, out: &mut dyn Write) -> CliResult<()> {
    let boundary = AdminBoundary::new(RunCoordinator::with_command_invoker(config), LocalOperator);
    match command {
        Commands::Preview => respond(out, &boundary.dispatch(&AdminRequest::new("preview_all"))),
        Commands::Run { names } => respond(
            out,
            &boundary.dispatch(&AdminRequest::new("run_selected").with_migrations(names)),
        ),
        Commands::RunAll => respond(out, &boundary.dispatch(&AdminRequest::new("execute_all"))),
        Commands::Status { json } => {
            let report = boundary.coordinator().status()?;
            if json {
                writeln!(out, "{}", serde_json::to_string_pretty(&report)?)?;
            } else {
                write_status(out, &report)?;
            }
            Ok(())
        }
        Commands::Log { action } => handle_log(boundary.coordinator().log_viewer(), action, out),
    }
}

fn respond(out: &mut dyn Write, response: &AdminResponse) -> CliResult<()> {
    if !response.body.is_empty() {
        writeln!(out, "{}", response.body)?;
    }
    match response.status.map(status_exit_code) {
        Some(code) if code != 0 => Err(CliError::ExitCode(code)),
        _ => Ok(()),
    }
}

fn write_status(out: &mut dyn Write, report: &StatusReport) -> CliResult<()> {
    if report.units.is_empty() {
        writeln!(out, "no migration units found")?;
    }
    for unit in &report.units {
        let state = if unit.applied { "applied" } else { "pending" };
        writeln!(out, "{state:<8} {}", unit.name)?;
    }
    let pending = report.pending().count();
    writeln!(out, "{} units, {pending} pending", report.units.len())?;
    match &report.lock_holder {
        Some(holder) => writeln!(
            out,
            "lock: held by pid {} on {} since {}",
            holder.pid,
            holder.host,
            holder.acquired_at.to_rfc3339()
        )?,
        None => writeln!(out, "lock: free")?,
    }
    Ok(())
}

fn handle_log(viewer: &LogViewer, action: LogCommand, out: &mut dyn Write) -> CliResult<()> {
    match action {
        LogCommand::Show {
            filter,
            limit,
            json,
        } => {
            let filter = filter.map_or(LogFilter::All, LogFilter::from);
            let mut rows = viewer.rows(filter)?;
            if let Some(limit) = limit {
                rows.truncate(limit);
            }
            if json {
                let values: Vec<serde_json::Value> = rows.iter().map(record_json).collect();
                writeln!(out, "{}", serde_json::to_string_pretty(&values)?)?;
            } else {
                for row in &rows {
                    writeln!(out, "{}", record_line(row))?;
                }
            }
            Ok(())
        }
        LogCommand::Tail { lines } => {
            for line in viewer.tail(lines)? {
                writeln!(out, "{line}")?;
            }
            Ok(())
        }
        LogCommand::Export { output } => {
            let download = viewer.download()?;
            write_file_atomic(&output, &download.bytes)?;
            writeln!(
                out,
                "exported {} bytes to {} ({})",
                download.bytes.len(),
                output.display(),
                download.content_disposition()
            )?;
            Ok(())
        }
        LogCommand::Clear { yes } => {
            if !yes {
                return Err(CliError::InvalidArgument(
                    "refusing to clear the audit log without --yes".to_string(),
                ));
            }
            viewer.clear()?;
            writeln!(out, "{}", cms_migrate_runner::boundary::LOG_CLEARED)?;
            Ok(())
        }
    }
}

fn record_line(record: &LogRecord) -> String {
    match record.format {
        RecordFormat::Structured => {
            let timestamp = record
                .timestamp
                .map_or_else(|| record.timestamp_raw.clone(), |t| t.to_rfc3339());
            let mut line = format!(
                "{timestamp}  {:<15}  {}",
                record.outcome_label, record.unit_name
            );
            if !record.detail.is_empty() {
                line.push_str("  ");
                line.push_str(&record.detail);
            }
            line
        }
        RecordFormat::Legacy => record.raw.clone(),
    }
}

fn record_json(record: &LogRecord) -> serde_json::Value {
    serde_json::json!({
        "timestamp": record.timestamp.map(|t| t.to_rfc3339()),
        "unit_name": record.unit_name,
        "outcome": record.outcome.map(|o| o.as_str()),
        "detail": record.detail,
        "pid": record.pid,
        "legacy": record.format == RecordFormat::Legacy,
    })
}
