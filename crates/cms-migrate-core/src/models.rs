//! Data models shared by the storage and runner crates.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

// =============================================================================
// Migration Unit
// =============================================================================

/// A named, orderable work item discovered in the units directory.
///
/// `name` is both the filesystem lookup key and the idempotency key.
/// `source_path` is always the boundary-checked, canonical location.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MigrationUnit {
    pub name: String,
    pub source_path: PathBuf,
}

impl MigrationUnit {
    #[must_use]
    pub fn new(name: impl Into<String>, source_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            source_path: source_path.into(),
        }
    }
}

// =============================================================================
// Audit Log Entry
// =============================================================================

/// Outcome of one executor invocation, as recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Executed,
    AlreadyApplied,
    DryRun,
    Error,
    /// Administrative reset of the display log.
    LogCleared,
}

impl Outcome {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Executed => "executed",
            Self::AlreadyApplied => "already_applied",
            Self::DryRun => "dry_run",
            Self::Error => "error",
            Self::LogCleared => "log_cleared",
        }
    }

    /// Parse an outcome label, accepting the legacy spellings found in older
    /// log files (`success`, `applied`, `skipped`, `fail`, ...).
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "executed" | "success" | "succeeded" | "applied" | "ok" => Some(Self::Executed),
            "already_applied" | "skipped" => Some(Self::AlreadyApplied),
            "dry_run" | "dryrun" | "preview" => Some(Self::DryRun),
            "error" | "fail" | "failed" | "failure" => Some(Self::Error),
            "log_cleared" | "cleared" => Some(Self::LogCleared),
            _ => None,
        }
    }

    /// Outcomes that prove a unit has run to completion at some point.
    #[must_use]
    pub const fn is_success_equivalent(self) -> bool {
        matches!(self, Self::Executed | Self::AlreadyApplied)
    }

    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Error)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable fact about one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub unit_name: String,
    pub outcome: Outcome,
    #[serde(default)]
    pub detail: String,
    pub pid: u32,
}

impl AuditEntry {
    /// Construct an entry stamped with the current time and process id.
    #[must_use]
    pub fn now(unit_name: impl Into<String>, outcome: Outcome, detail: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            unit_name: unit_name.into(),
            outcome,
            detail: detail.into(),
            pid: std::process::id(),
        }
    }
}

// =============================================================================
// Timestamps
// =============================================================================

/// Parse a timestamp as older writers stored it: RFC 3339,
/// `YYYY-MM-DD HH:MM:SS` (UTC assumed), or integer unix seconds.
#[must_use]
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    s.parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
}

/// Serde adapter for [`parse_timestamp`] that also takes a bare JSON integer.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(i64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Secs(secs) => DateTime::<Utc>::from_timestamp(secs, 0)
            .ok_or_else(|| D::Error::custom(format!("timestamp out of range: {secs}"))),
        Raw::Text(text) => parse_timestamp(&text)
            .ok_or_else(|| D::Error::custom(format!("unrecognized timestamp: {text}"))),
    }
}

// =============================================================================
// Lock Record
// =============================================================================

/// How far ahead of local time a lock stamp may be before it counts as stale.
pub const LOCK_CLOCK_SKEW_SECS: i64 = 300;

/// Durable marker for "a run is currently active".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    #[serde(alias = "timestamp", deserialize_with = "deserialize_timestamp")]
    pub acquired_at: DateTime<Utc>,
    #[serde(default)]
    pub host: String,
}

impl LockRecord {
    /// Age of the record relative to `now`; records from the future are age zero.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.acquired_at).to_std().unwrap_or_default()
    }

    /// Expired once the TTL has elapsed, or immediately when stamped further
    /// in the future than [`LOCK_CLOCK_SKEW_SECS`].
    #[must_use]
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        if self.acquired_at > now + chrono::Duration::seconds(LOCK_CLOCK_SKEW_SECS) {
            return true;
        }
        self.age(now) >= ttl
    }
}

// =============================================================================
// Run results
// =============================================================================

/// Short, stable status returned to the admin boundary.
///
/// Detailed error text goes to the audit log only, never into this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Executed,
    AlreadyApplied,
    Failed,
    Locked,
    Invalid,
    Summary { processed: usize, failed: usize },
    LockUnavailable,
    LogUnavailable,
    Unauthorized,
}

impl RunStatus {
    /// Whether the action completed without any unit or infrastructure failure.
    #[must_use]
    pub const fn is_success(self) -> bool {
        match self {
            Self::Executed | Self::AlreadyApplied => true,
            Self::Summary { failed, .. } => failed == 0,
            _ => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Executed => f.write_str("executed"),
            Self::AlreadyApplied => f.write_str("already applied"),
            Self::Failed => f.write_str("failed"),
            Self::Locked => f.write_str("migration already in progress, try again later"),
            Self::Invalid => f.write_str("invalid migration"),
            Self::Summary { processed, failed } => {
                write!(f, "Summary: {processed} migrations processed")?;
                if *failed > 0 {
                    write!(f, ", {failed} failed")?;
                }
                Ok(())
            }
            Self::LockUnavailable => f.write_str("could not acquire migration lock"),
            Self::LogUnavailable => f.write_str("audit log unavailable"),
            Self::Unauthorized => f.write_str("unauthorized"),
        }
    }
}

/// Applied/pending view of one unit, for status listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitState {
    pub name: String,
    pub applied: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_parse_accepts_legacy_labels() {
        assert_eq!(Outcome::parse("executed"), Some(Outcome::Executed));
        assert_eq!(Outcome::parse("SUCCESS"), Some(Outcome::Executed));
        assert_eq!(Outcome::parse("already applied"), Some(Outcome::AlreadyApplied));
        assert_eq!(Outcome::parse("dry-run"), Some(Outcome::DryRun));
        assert_eq!(Outcome::parse("fail"), Some(Outcome::Error));
        assert_eq!(Outcome::parse("info"), None);
    }

    #[test]
    fn test_success_equivalence() {
        assert!(Outcome::Executed.is_success_equivalent());
        assert!(Outcome::AlreadyApplied.is_success_equivalent());
        assert!(!Outcome::DryRun.is_success_equivalent());
        assert!(!Outcome::Error.is_success_equivalent());
        assert!(!Outcome::LogCleared.is_success_equivalent());
    }

    #[test]
    fn test_audit_entry_serializes_snake_case_outcome() {
        let entry = AuditEntry::now("0001_init.sh", Outcome::AlreadyApplied, "");
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["outcome"], "already_applied");
        assert_eq!(json["unit_name"], "0001_init.sh");
        assert_eq!(json["pid"], std::process::id());
    }

    #[test]
    fn test_lock_record_expiry() {
        let now = Utc::now();
        let record = LockRecord {
            pid: 1,
            acquired_at: now - chrono::Duration::minutes(31),
            host: "h".into(),
        };
        assert!(record.is_expired(Duration::from_secs(30 * 60), now));

        let fresh = LockRecord {
            acquired_at: now - chrono::Duration::minutes(5),
            ..record
        };
        assert!(!fresh.is_expired(Duration::from_secs(30 * 60), now));
    }

    #[test]
    fn test_lock_record_accepts_timestamp_alias() {
        let record: LockRecord =
            serde_json::from_str(r#"{"pid":7,"timestamp":"2025-01-01T00:00:00Z","host":"a"}"#)
                .unwrap();
        assert_eq!(record.pid, 7);
        assert_eq!(record.host, "a");
    }

    #[test]
    fn test_lock_record_accepts_unix_seconds_and_plain_datetime() {
        let now = Utc::now().timestamp();
        let record: LockRecord = serde_json::from_str(&format!(
            r#"{{"pid":4242,"timestamp":{now},"host":"web-1"}}"#
        ))
        .unwrap();
        assert_eq!(record.acquired_at.timestamp(), now);
        assert!(!record.is_expired(Duration::from_secs(30 * 60), Utc::now()));

        let quoted: LockRecord =
            serde_json::from_str(&format!(r#"{{"pid":1,"acquired_at":"{now}"}}"#)).unwrap();
        assert_eq!(quoted.acquired_at.timestamp(), now);

        let plain: LockRecord =
            serde_json::from_str(r#"{"pid":1,"timestamp":"2025-01-01 12:30:00"}"#).unwrap();
        assert_eq!(plain.acquired_at.to_rfc3339(), "2025-01-01T12:30:00+00:00");

        assert!(serde_json::from_str::<LockRecord>(r#"{"pid":1,"timestamp":"soon"}"#).is_err());
    }

    #[test]
    fn test_lock_record_far_in_the_future_is_stale() {
        let now = Utc::now();
        let ttl = Duration::from_secs(30 * 60);
        let skewed = LockRecord {
            pid: 1,
            acquired_at: now + chrono::Duration::hours(6),
            host: "h".into(),
        };
        assert!(skewed.is_expired(ttl, now));

        let slightly_ahead = LockRecord {
            acquired_at: now + chrono::Duration::seconds(30),
            ..skewed
        };
        assert!(!slightly_ahead.is_expired(ttl, now));
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp("2024-05-01T10:00:00Z").is_some());
        assert!(parse_timestamp("2024-05-01 10:00:00").is_some());
        assert_eq!(parse_timestamp("1700000000").unwrap().timestamp(), 1_700_000_000);
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_run_status_strings_are_stable() {
        assert_eq!(RunStatus::Executed.to_string(), "executed");
        assert_eq!(RunStatus::AlreadyApplied.to_string(), "already applied");
        assert_eq!(
            RunStatus::Summary {
                processed: 0,
                failed: 0
            }
            .to_string(),
            "Summary: 0 migrations processed"
        );
        assert_eq!(
            RunStatus::Summary {
                processed: 2,
                failed: 1
            }
            .to_string(),
            "Summary: 2 migrations processed, 1 failed"
        );
        assert!(!RunStatus::Locked.is_success());
        assert!(
            !RunStatus::Summary {
                processed: 2,
                failed: 1
            }
            .is_success()
        );
    }
}
