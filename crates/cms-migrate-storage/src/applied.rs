//! Applied-state lookups.
//!
//! A unit counts as applied when the durable ledger lists it, or when the
//! audit log holds a success-equivalent record for it. The ledger survives
//! an administrative log clear; the log scan keeps older installations that
//! predate the ledger working.

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use cms_migrate_core::Config;
use cms_migrate_core::paths::write_file_atomic;

use crate::audit::AuditLogger;
use crate::{Result, StorageError};

const LEDGER_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    applied: BTreeSet<String>,
}

/// Durable set of unit names that have executed successfully.
#[derive(Debug, Clone)]
pub struct AppliedLedger {
    path: PathBuf,
}

impl AppliedLedger {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self::at(config.applied_path.clone())
    }

    #[must_use]
    pub const fn at(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All recorded names, sorted. A missing ledger is empty; a corrupt one is an error.
    pub fn names(&self) -> Result<BTreeSet<String>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(e) => return Err(e.into()),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(BTreeSet::new());
        }
        let file: LedgerFile = serde_json::from_slice(&bytes)?;
        Ok(file.applied)
    }

    pub fn contains(&self, unit_name: &str) -> Result<bool> {
        Ok(self.names()?.contains(unit_name))
    }

    /// Add `unit_name`, rewriting the ledger atomically. Recording twice is a no-op.
    ///
    /// Callers hold the run lock, so read-modify-write does not race.
    pub fn record(&self, unit_name: &str) -> Result<()> {
        let mut applied = self.names()?;
        if !applied.insert(unit_name.to_string()) {
            return Ok(());
        }
        let file = LedgerFile {
            version: LEDGER_VERSION,
            applied,
        };
        let mut bytes = serde_json::to_vec_pretty(&file)?;
        bytes.push(b'\n');
        write_file_atomic(&self.path, &bytes).map_err(StorageError::Io)?;
        tracing::debug!(unit = %unit_name, ledger = %self.path.display(), "recorded applied unit");
        Ok(())
    }
}

/// Answers "has this unit ever run to completion?".
#[derive(Debug, Clone)]
pub struct AppliedStateTracker {
    log: AuditLogger,
    ledger: AppliedLedger,
}

impl AppliedStateTracker {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            log: AuditLogger::new(config),
            ledger: AppliedLedger::new(config),
        }
    }

    #[must_use]
    pub const fn from_parts(log: AuditLogger, ledger: AppliedLedger) -> Self {
        Self { log, ledger }
    }

    #[must_use]
    pub const fn ledger(&self) -> &AppliedLedger {
        &self.ledger
    }

    /// Ledger first, then a scan of the log. Missing or empty files mean "not applied".
    pub fn is_applied(&self, unit_name: &str) -> Result<bool> {
        if self.ledger.contains(unit_name)? {
            return Ok(true);
        }
        Ok(self
            .log
            .records()?
            .iter()
            .any(|r| r.proves_applied(unit_name)))
    }

    /// Every name known to be applied, from either source.
    ///
    /// Legacy log lines contribute the unit name they were parsed with.
    pub fn applied_set(&self) -> Result<BTreeSet<String>> {
        let mut names = self.ledger.names()?;
        for record in self.log.records()? {
            if record.outcome.is_some_and(|o| o.is_success_equivalent())
                && !record.unit_name.is_empty()
            {
                names.insert(record.unit_name);
            }
        }
        Ok(names)
    }
}
