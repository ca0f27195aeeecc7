//! The seam through which a migration unit's body is actually run.

use std::io::Read;
use std::process::{Command, Stdio};

use cms_migrate_core::{Config, Error, MigrationUnit, Result};

/// Runs one unit's body. Returning `Err` marks the attempt as failed.
pub trait UnitInvoker: Send + Sync {
    fn invoke(&self, unit: &MigrationUnit) -> Result<()>;
}

impl<F> UnitInvoker for F
where
    F: Fn(&MigrationUnit) -> std::result::Result<(), String> + Send + Sync,
{
    fn invoke(&self, unit: &MigrationUnit) -> Result<()> {
        self(unit).map_err(|message| Error::UnitExecution {
            unit: unit.name.clone(),
            message,
        })
    }
}

/// Runs the unit file as a child process: `<runner_command...> <source_path>`.
#[derive(Debug, Clone)]
pub struct CommandInvoker {
    command: Vec<String>,
    detail_max_bytes: usize,
}

impl CommandInvoker {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self::with_command(config.runner_command.clone(), config.detail_max_bytes)
    }

    #[must_use]
    pub const fn with_command(command: Vec<String>, detail_max_bytes: usize) -> Self {
        Self {
            command,
            detail_max_bytes,
        }
    }
}

impl UnitInvoker for CommandInvoker {
    fn invoke(&self, unit: &MigrationUnit) -> Result<()> {
        let fail = |message: String| Error::UnitExecution {
            unit: unit.name.clone(),
            message,
        };
        let Some((program, args)) = self.command.split_first() else {
            return Err(fail("empty runner command".to_string()));
        };

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.arg(&unit.source_path);
        if let Some(dir) = unit.source_path.parent() {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| fail(format!("spawn {program} failed: {e}")))?;

        let mut raw = Vec::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_end(&mut raw);
        }
        let stderr = String::from_utf8_lossy(&raw);
        let status = child
            .wait()
            .map_err(|e| fail(format!("wait for {program} failed: {e}")))?;

        if status.success() {
            return Ok(());
        }
        let first_line = stderr
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map_or_else(|| format!("exited with {status}"), str::to_string);
        Err(fail(truncate_detail(&first_line, self.detail_max_bytes)))
    }
}

/// Truncate to at most `max_bytes`, on a char boundary.
#[must_use]
pub fn truncate_detail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
