//! Migration Executor: runs one unit through the
//! dry-run / already-applied / executing state machine.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use cms_migrate_core::{AuditEntry, Config, Error, MigrationUnit, Outcome, Result};
use cms_migrate_storage::{AppliedLedger, AppliedStateTracker, AuditLogger};

use crate::invoker::{UnitInvoker, truncate_detail};

/// Terminal state of one executor invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    DryRun,
    AlreadyApplied,
    Executed,
    /// The unit raised; `message` is what was written to the log.
    Failed { message: String },
}

/// Executes units and records each attempt.
///
/// Unit failures are contained and reported as [`ExecOutcome::Failed`].
/// `Err` is reserved for log or ledger failures, which the caller must treat
/// as fatal for the run.
#[derive(Clone)]
pub struct MigrationExecutor {
    log: AuditLogger,
    ledger: AppliedLedger,
    tracker: AppliedStateTracker,
    invoker: Arc<dyn UnitInvoker>,
    detail_max_bytes: usize,
}

impl std::fmt::Debug for MigrationExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationExecutor")
            .field("log", &self.log.path())
            .field("ledger", &self.ledger.path())
            .finish_non_exhaustive()
    }
}

impl MigrationExecutor {
    #[must_use]
    pub fn new(config: &Config, invoker: Arc<dyn UnitInvoker>) -> Self {
        let log = AuditLogger::new(config);
        let ledger = AppliedLedger::new(config);
        Self {
            tracker: AppliedStateTracker::from_parts(log.clone(), ledger.clone()),
            log,
            ledger,
            invoker,
            detail_max_bytes: config.detail_max_bytes,
        }
    }

    #[must_use]
    pub const fn tracker(&self) -> &AppliedStateTracker {
        &self.tracker
    }

    pub fn execute(&self, unit: &MigrationUnit, dry_run: bool) -> Result<ExecOutcome> {
        if dry_run {
            tracing::debug!(unit = %unit.name, "dry run");
            return Ok(ExecOutcome::DryRun);
        }

        if self.tracker.is_applied(&unit.name)? {
            self.record(unit, Outcome::AlreadyApplied, String::new())?;
            tracing::info!(unit = %unit.name, "migration already applied");
            return Ok(ExecOutcome::AlreadyApplied);
        }

        tracing::info!(unit = %unit.name, path = %unit.source_path.display(), "executing migration");
        match self.invoke_contained(unit) {
            Ok(()) => {
                if let Err(e) = self.record(unit, Outcome::Executed, String::new()) {
                    tracing::error!(
                        unit = %unit.name,
                        error = %e,
                        "migration executed but could not be recorded; it may run again"
                    );
                    return Err(e);
                }
                if let Err(e) = self.ledger.record(&unit.name) {
                    tracing::error!(
                        unit = %unit.name,
                        error = %e,
                        "migration executed but the applied ledger could not be updated"
                    );
                    return Err(e.into());
                }
                tracing::info!(unit = %unit.name, "migration executed");
                Ok(ExecOutcome::Executed)
            }
            Err(message) => {
                let message = truncate_detail(&message, self.detail_max_bytes);
                tracing::error!(unit = %unit.name, error = %message, "migration failed");
                self.record(unit, Outcome::Error, message.clone())?;
                Ok(ExecOutcome::Failed { message })
            }
        }
    }

    /// Run the unit body, turning errors and panics into a message.
    fn invoke_contained(&self, unit: &MigrationUnit) -> std::result::Result<(), String> {
        match catch_unwind(AssertUnwindSafe(|| self.invoker.invoke(unit))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(Error::UnitExecution { message, .. })) => Err(message),
            Ok(Err(other)) => Err(other.to_string()),
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(format!("panicked: {msg}"))
            }
        }
    }

    fn record(&self, unit: &MigrationUnit, outcome: Outcome, detail: String) -> Result<()> {
        self.log
            .append(&AuditEntry::now(unit.name.clone(), outcome, detail))
            .map_err(Error::from)
    }
}
