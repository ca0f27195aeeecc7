//! Read-only operator view over the audit log, plus download and audited clear.

use std::cmp::Ordering;

use cms_migrate_core::{AuditEntry, Config, Outcome};

use crate::Result;
use crate::audit::{AuditLogger, LogRecord};

/// Unit name recorded on administrative entries that are not about one unit.
pub const ADMIN_UNIT_NAME: &str = "*";

/// Row filter for [`LogViewer::rows`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFilter {
    #[default]
    All,
    /// Success-equivalent outcomes.
    Success,
    Fail,
}

impl LogFilter {
    /// Parse a filter label; unknown labels fall back to [`LogFilter::All`].
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "success" | "ok" | "applied" => Self::Success,
            "fail" | "failed" | "error" => Self::Fail,
            _ => Self::All,
        }
    }

    #[must_use]
    pub fn matches(self, record: &LogRecord) -> bool {
        match self {
            Self::All => true,
            Self::Success => record.outcome.is_some_and(Outcome::is_success_equivalent),
            Self::Fail => record.outcome.is_some_and(Outcome::is_failure),
        }
    }
}

/// Raw log bytes packaged for a file download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogDownload {
    pub file_name: String,
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

impl LogDownload {
    #[must_use]
    pub fn content_disposition(&self) -> String {
        format!("attachment; filename=\"{}\"", self.file_name)
    }
}

#[derive(Debug, Clone)]
pub struct LogViewer {
    log: AuditLogger,
}

impl LogViewer {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self::from_logger(AuditLogger::new(config))
    }

    #[must_use]
    pub const fn from_logger(log: AuditLogger) -> Self {
        Self { log }
    }

    /// Filtered records, newest first. Ties break on unit name ascending;
    /// records without a parseable timestamp sort last in file order.
    pub fn rows(&self, filter: LogFilter) -> Result<Vec<LogRecord>> {
        let mut rows: Vec<LogRecord> = self
            .log
            .records()?
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect();
        rows.sort_by(compare_rows);
        Ok(rows)
    }

    /// The last `n` raw lines of the log.
    pub fn tail(&self, n: usize) -> Result<Vec<String>> {
        self.log.tail(n)
    }

    /// The log file verbatim, named after the file on disk.
    pub fn download(&self) -> Result<LogDownload> {
        let file_name = self
            .log
            .path()
            .file_name()
            .map_or_else(|| "migrations.log".to_string(), |n| n.to_string_lossy().into_owned());
        Ok(LogDownload {
            file_name,
            content_type: "text/plain; charset=utf-8",
            bytes: self.log.read_bytes()?,
        })
    }

    /// Reset the log to an empty array and record who cleared it.
    ///
    /// Applied state lives in the ledger and is not affected.
    pub fn clear(&self) -> Result<()> {
        self.log.reset()?;
        self.log.append(&AuditEntry::now(
            ADMIN_UNIT_NAME,
            Outcome::LogCleared,
            "audit log cleared by operator",
        ))?;
        tracing::info!(log = %self.log.path().display(), "audit log cleared");
        Ok(())
    }
}

fn compare_rows(a: &LogRecord, b: &LogRecord) -> Ordering {
    match (a.timestamp, b.timestamp) {
        (Some(x), Some(y)) => y.cmp(&x).then_with(|| a.unit_name.cmp(&b.unit_name)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::fs;
    use tempfile::TempDir;

    fn viewer(tmp: &TempDir) -> (LogViewer, AuditLogger) {
        let log = AuditLogger::at(tmp.path().join("logs").join("migrations.log"));
        (LogViewer::from_logger(log.clone()), log)
    }

    fn entry_at(secs: i64, unit: &str, outcome: Outcome) -> AuditEntry {
        AuditEntry {
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            unit_name: unit.to_string(),
            outcome,
            detail: String::new(),
            pid: 1,
        }
    }

    #[test]
    fn test_filter_parse() {
        assert_eq!(LogFilter::parse("success"), LogFilter::Success);
        assert_eq!(LogFilter::parse("FAIL"), LogFilter::Fail);
        assert_eq!(LogFilter::parse(""), LogFilter::All);
        assert_eq!(LogFilter::parse("bogus"), LogFilter::All);
    }

    #[test]
    fn test_rows_sorted_newest_first_with_name_tiebreak() {
        let tmp = TempDir::new().unwrap();
        let (viewer, log) = viewer(&tmp);
        log.append(&entry_at(100, "0001_a.sh", Outcome::Executed)).unwrap();
        log.append(&entry_at(300, "0003_c.sh", Outcome::Error)).unwrap();
        log.append(&entry_at(300, "0002_b.sh", Outcome::Executed)).unwrap();
        log.append(&entry_at(200, "0004_d.sh", Outcome::DryRun)).unwrap();

        let names: Vec<String> = viewer
            .rows(LogFilter::All)
            .unwrap()
            .into_iter()
            .map(|r| r.unit_name)
            .collect();
        assert_eq!(names, vec!["0002_b.sh", "0003_c.sh", "0004_d.sh", "0001_a.sh"]);
    }

    #[test]
    fn test_rows_filtering() {
        let tmp = TempDir::new().unwrap();
        let (viewer, log) = viewer(&tmp);
        log.append(&entry_at(1, "0001_a.sh", Outcome::Executed)).unwrap();
        log.append(&entry_at(2, "0001_a.sh", Outcome::AlreadyApplied)).unwrap();
        log.append(&entry_at(3, "0002_b.sh", Outcome::Error)).unwrap();
        log.append(&entry_at(4, "0003_c.sh", Outcome::DryRun)).unwrap();

        assert_eq!(viewer.rows(LogFilter::Success).unwrap().len(), 2);
        let failed = viewer.rows(LogFilter::Fail).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].unit_name, "0002_b.sh");
        assert_eq!(viewer.rows(LogFilter::All).unwrap().len(), 4);
    }

    #[test]
    fn test_rows_without_timestamp_sort_last() {
        let tmp = TempDir::new().unwrap();
        let (viewer, log) = viewer(&tmp);
        fs::create_dir_all(log.path().parent().unwrap()).unwrap();
        fs::write(log.path(), "operator note: executed 0009_manual.sh\n").unwrap();
        log.append(&entry_at(5, "0001_a.sh", Outcome::Executed)).unwrap();

        let rows = viewer.rows(LogFilter::All).unwrap();
        assert_eq!(rows[0].unit_name, "0001_a.sh");
        assert_eq!(rows[1].unit_name, "0009_manual.sh");
    }

    #[test]
    fn test_download_is_verbatim() {
        let tmp = TempDir::new().unwrap();
        let (viewer, log) = viewer(&tmp);
        log.append(&entry_at(5, "0001_a.sh", Outcome::Executed)).unwrap();

        let download = viewer.download().unwrap();
        assert_eq!(download.file_name, "migrations.log");
        assert_eq!(download.bytes, fs::read(log.path()).unwrap());
        assert_eq!(
            download.content_disposition(),
            "attachment; filename=\"migrations.log\""
        );
    }

    #[test]
    fn test_download_of_missing_log_is_empty() {
        let tmp = TempDir::new().unwrap();
        let (viewer, _) = viewer(&tmp);
        assert!(viewer.download().unwrap().bytes.is_empty());
    }

    #[test]
    fn test_clear_leaves_single_audit_entry() {
        let tmp = TempDir::new().unwrap();
        let (viewer, log) = viewer(&tmp);
        log.append(&entry_at(5, "0001_a.sh", Outcome::Executed)).unwrap();
        viewer.clear().unwrap();

        let lines = log.read_lines().unwrap();
        assert_eq!(lines[0], "[]");
        let rows = viewer.rows(LogFilter::All).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].outcome, Some(Outcome::LogCleared));
        assert_eq!(rows[0].unit_name, ADMIN_UNIT_NAME);
        assert!(viewer.rows(LogFilter::Success).unwrap().is_empty());
    }
}
