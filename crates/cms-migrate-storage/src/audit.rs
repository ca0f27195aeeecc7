//! Audit Logger: append-only JSONL record of every execution attempt.
//!
//! Each append takes an exclusive `fs2` advisory lock on the log file for the
//! duration of one write, so concurrent writers never interleave partial
//! lines. Readers do not lock; the file is only ever appended to, except by
//! the administrative reset in [`AuditLogger::reset`].
//!
//! The reader is tolerant of three line shapes:
//! - structured JSON objects (`{timestamp, outcome|type, unit_name|data, detail, pid}`)
//! - JSON arrays of such objects (a cleared log is `[]`)
//! - legacy free-text lines (`2024-05-01 10:00:00 executed 0001_init.sh`)

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::Deserialize;
use serde_json::Value;

use cms_migrate_core::paths::ensure_parent_dir;
use cms_migrate_core::{AuditEntry, Config, Outcome, parse_timestamp};

use crate::{Result, StorageError};

/// Appends to and reads the audit log at a fixed path.
#[derive(Debug, Clone)]
pub struct AuditLogger {
    path: PathBuf,
}

impl AuditLogger {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self::at(config.log_path.clone())
    }

    #[must_use]
    pub const fn at(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry as a single JSON line. Never rewrites prior content.
    pub fn append(&self, entry: &AuditEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        ensure_parent_dir(&self.path).map_err(|e| self.log_err("create log directory", &e))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.log_err("open", &e))?;
        file.lock_exclusive().map_err(|e| self.log_err("lock", &e))?;
        let written = file
            .write_all(&line)
            .and_then(|()| file.flush())
            .and_then(|()| file.sync_data());
        let _ = FileExt::unlock(&file);
        written.map_err(|e| self.log_err("append to", &e))?;

        tracing::debug!(
            unit = %entry.unit_name,
            outcome = %entry.outcome,
            "audit entry appended"
        );
        Ok(())
    }

    /// All raw lines; a missing log reads as empty.
    ///
    /// Lines are decoded independently and lossily: older writers left
    /// Latin-1 text behind, and one such line must not hide the rest.
    pub fn read_lines(&self) -> Result<Vec<String>> {
        let bytes = self.read_bytes()?;
        let mut lines: Vec<String> = bytes
            .split(|b| *b == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
            .map(|line| String::from_utf8_lossy(line).into_owned())
            .collect();
        // Trailing newline leaves an empty final piece.
        if lines.last().is_some_and(String::is_empty) {
            lines.pop();
        }
        Ok(lines)
    }

    /// The last `n` raw lines, oldest first, without interpreting them.
    pub fn tail(&self, n: usize) -> Result<Vec<String>> {
        let mut lines = self.read_lines()?;
        let skip = lines.len().saturating_sub(n);
        Ok(lines.split_off(skip))
    }

    /// Every record in file order, parsed tolerantly. Blank lines are skipped.
    pub fn records(&self) -> Result<Vec<LogRecord>> {
        let lines = self.read_lines()?;
        Ok(lines.iter().flat_map(|line| parse_line(line)).collect())
    }

    /// Verbatim file bytes; a missing log reads as empty.
    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(self.log_err("read", &e)),
        }
    }

    /// Administrative reset: overwrite the log with an empty JSON array.
    ///
    /// Truncates in place under the same advisory lock appenders use, so an
    /// append racing the reset lands either before (and is cleared) or after.
    pub fn reset(&self) -> Result<()> {
        ensure_parent_dir(&self.path).map_err(|e| self.log_err("create log directory", &e))?;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| self.log_err("open", &e))?;
        file.lock_exclusive().map_err(|e| self.log_err("lock", &e))?;
        let reset = file
            .set_len(0)
            .and_then(|()| file.seek(SeekFrom::Start(0)).map(|_| ()))
            .and_then(|()| file.write_all(b"[]\n"))
            .and_then(|()| file.sync_data());
        let _ = FileExt::unlock(&file);
        reset.map_err(|e| self.log_err("reset", &e))
    }

    fn log_err(&self, action: &str, err: &std::io::Error) -> StorageError {
        StorageError::LogIo(format!("{action} {}: {err}", self.path.display()))
    }
}

// ---------------------------------------------------------------------------
// Tolerant record parsing
// ---------------------------------------------------------------------------

/// Which line shape a record was parsed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFormat {
    Structured,
    Legacy,
}

/// One parsed log record, structured or legacy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub timestamp: Option<DateTime<Utc>>,
    /// Timestamp text as found in the log.
    pub timestamp_raw: String,
    pub unit_name: String,
    pub outcome: Option<Outcome>,
    /// Outcome text as found in the log.
    pub outcome_label: String,
    pub detail: String,
    pub pid: Option<u32>,
    pub format: RecordFormat,
    pub raw: String,
}

impl LogRecord {
    /// Whether this record refers to `unit_name`.
    ///
    /// Legacy lines match when the name appears as a whole token.
    #[must_use]
    pub fn mentions(&self, unit_name: &str) -> bool {
        match self.format {
            RecordFormat::Structured => self.unit_name == unit_name,
            RecordFormat::Legacy => {
                self.unit_name == unit_name || tokens(&self.raw).any(|t| t == unit_name)
            }
        }
    }

    /// Whether this record proves `unit_name` has been applied.
    #[must_use]
    pub fn proves_applied(&self, unit_name: &str) -> bool {
        self.outcome.is_some_and(Outcome::is_success_equivalent) && self.mentions(unit_name)
    }
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(default)]
    timestamp: Option<Value>,
    #[serde(default, alias = "type")]
    outcome: Option<Value>,
    #[serde(default, alias = "data")]
    unit_name: Option<Value>,
    #[serde(default)]
    detail: Option<Value>,
    #[serde(default)]
    pid: Option<Value>,
}

/// Parse one log line into zero or more records.
#[must_use]
pub fn parse_line(line: &str) -> Vec<LogRecord> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if trimmed.starts_with('[')
        && let Ok(items) = serde_json::from_str::<Vec<RawRecord>>(trimmed)
    {
        return items
            .into_iter()
            .map(|raw| structured_record(raw, trimmed))
            .collect();
    }
    if trimmed.starts_with('{')
        && let Ok(raw) = serde_json::from_str::<RawRecord>(trimmed)
    {
        return vec![structured_record(raw, trimmed)];
    }
    vec![legacy_record(trimmed)]
}

fn structured_record(raw: RawRecord, line: &str) -> LogRecord {
    let timestamp_raw = raw.timestamp.as_ref().map(value_text).unwrap_or_default();
    let outcome_label = raw.outcome.as_ref().map(value_text).unwrap_or_default();
    let unit_name = raw.unit_name.as_ref().map(unit_name_of).unwrap_or_default();
    LogRecord {
        timestamp: raw.timestamp.as_ref().and_then(parse_timestamp_value),
        timestamp_raw,
        outcome: Outcome::parse(&outcome_label),
        outcome_label,
        unit_name,
        detail: raw.detail.as_ref().map(value_text).unwrap_or_default(),
        pid: raw
            .pid
            .as_ref()
            .and_then(|v| match v {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            })
            .and_then(|p| u32::try_from(p).ok()),
        format: RecordFormat::Structured,
        raw: line.to_string(),
    }
}

fn legacy_record(line: &str) -> LogRecord {
    let lower = line.to_ascii_lowercase();
    let words: Vec<&str> = tokens(&lower).collect();
    let has = |w: &str| words.contains(&w);

    let (outcome, label) = if has("error") || has("failed") || has("fail") || has("failure") {
        (Some(Outcome::Error), "error")
    } else if has("dry") || has("dry_run") {
        (Some(Outcome::DryRun), "dry_run")
    } else if has("already") || has("already_applied") || has("skipped") {
        (Some(Outcome::AlreadyApplied), "already_applied")
    } else if has("executed") || has("success") || has("applied") || has("ok") {
        (Some(Outcome::Executed), "executed")
    } else {
        (None, "")
    };

    let unit_name = tokens(line)
        .find(|t| t.starts_with(|c: char| c.is_ascii_digit()) && t.contains('_'))
        .unwrap_or_default()
        .to_string();

    let timestamp_raw = legacy_timestamp(line);
    LogRecord {
        timestamp: timestamp_raw.as_deref().and_then(parse_timestamp),
        timestamp_raw: timestamp_raw.unwrap_or_default(),
        unit_name,
        outcome,
        outcome_label: label.to_string(),
        detail: line.to_string(),
        pid: None,
        format: RecordFormat::Legacy,
        raw: line.to_string(),
    }
}

/// Split on whitespace and punctuation that never appears inside unit names.
fn tokens(line: &str) -> impl Iterator<Item = &str> {
    line.split(|c: char| {
        c.is_whitespace() || matches!(c, '[' | ']' | '(' | ')' | ',' | ';' | ':' | '"' | '\'' | '=')
    })
    .filter(|t| !t.is_empty())
}

/// Leading `YYYY-MM-DD[ T]HH:MM:SS...` prefix of a legacy line, optionally bracketed.
fn legacy_timestamp(line: &str) -> Option<String> {
    let body = line.trim_start_matches('[');
    let end = body
        .char_indices()
        .skip(19)
        .find(|(_, c)| c.is_whitespace() || *c == ']')
        .map_or(body.len(), |(i, _)| i);
    let candidate = body.get(..end)?;
    parse_timestamp(candidate).map(|_| candidate.to_string())
}

fn parse_timestamp_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp(s),
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0)),
        _ => None,
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Older writers stored the unit under `data`, sometimes as an object.
fn unit_name_of(value: &Value) -> String {
    match value {
        Value::Object(map) => ["unit_name", "migration", "name", "file"]
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_str))
            .unwrap_or_default()
            .to_string(),
        other => value_text(other),
    }
}
