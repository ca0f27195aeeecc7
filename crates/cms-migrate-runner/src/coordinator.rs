//! Run Coordinator: the public operations behind the admin actions.
//!
//! Every mutating operation runs under the run lock, held through a
//! [`LockGuard`](cms_migrate_storage::LockGuard) so it is released on every
//! exit path, panics included.

use std::sync::Arc;

use serde::Serialize;

use cms_migrate_core::{Config, Error, LockRecord, MigrationUnit, Result, RunStatus, UnitState};
use cms_migrate_storage::{LockGuard, LockManager, LogViewer, StorageError, UnitStore};

use crate::executor::{ExecOutcome, MigrationExecutor};
use crate::invoker::{CommandInvoker, UnitInvoker};

/// Applied/pending listing plus the current lock holder.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub units: Vec<UnitState>,
    pub lock_holder: Option<LockRecord>,
}

impl StatusReport {
    pub fn pending(&self) -> impl Iterator<Item = &UnitState> {
        self.units.iter().filter(|u| !u.applied)
    }
}

#[derive(Debug)]
pub struct RunCoordinator {
    units: UnitStore,
    lock: LockManager,
    executor: MigrationExecutor,
    viewer: LogViewer,
}

impl RunCoordinator {
    #[must_use]
    pub fn new(config: &Config, invoker: Arc<dyn UnitInvoker>) -> Self {
        Self {
            units: UnitStore::new(config),
            lock: LockManager::new(config),
            executor: MigrationExecutor::new(config, invoker),
            viewer: LogViewer::new(config),
        }
    }

    /// Coordinator that runs unit files through `config.runner_command`.
    #[must_use]
    pub fn with_command_invoker(config: &Config) -> Self {
        Self::new(config, Arc::new(CommandInvoker::new(config)))
    }

    #[must_use]
    pub const fn lock_manager(&self) -> &LockManager {
        &self.lock
    }

    #[must_use]
    pub const fn log_viewer(&self) -> &LogViewer {
        &self.viewer
    }

    /// `DRY RUN: <name>` for every unit. Takes no lock and writes nothing.
    pub fn preview_all(&self) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        for unit in self.units.list_units()? {
            self.executor.execute(&unit, true)?;
            lines.push(format!("DRY RUN: {}", unit.name));
        }
        Ok(lines)
    }

    /// Execute the first requested unit that is valid and not yet applied.
    ///
    /// Malformed, ignored and missing names are skipped. A name that
    /// resolves outside the units directory rejects the whole request. In
    /// both the rejected and the nothing-left cases the lock is never
    /// touched and the result is [`RunStatus::Invalid`].
    pub fn run_selected(&self, names: &[String]) -> RunStatus {
        let selected = match self.select(names) {
            Ok(selected) if !selected.is_empty() => selected,
            _ => return RunStatus::Invalid,
        };

        let guard = match self.lock() {
            Ok(guard) => guard,
            Err(status) => return status,
        };

        let mut status = RunStatus::AlreadyApplied;
        for unit in &selected {
            match self.executor.execute(unit, false) {
                Ok(ExecOutcome::AlreadyApplied | ExecOutcome::DryRun) => {}
                Ok(ExecOutcome::Executed) => {
                    status = RunStatus::Executed;
                    break;
                }
                Ok(ExecOutcome::Failed { .. }) => {
                    status = RunStatus::Failed;
                    break;
                }
                Err(e) => {
                    status = Self::log_unavailable(&e);
                    break;
                }
            }
        }

        Self::finish(guard);
        status
    }

    /// Execute every pending unit in lexical order under a single lock.
    ///
    /// A failing unit does not stop the batch; a log failure does.
    pub fn run_all(&self) -> RunStatus {
        let guard = match self.lock() {
            Ok(guard) => guard,
            Err(status) => return status,
        };

        let status = match self.units.list_units() {
            Ok(units) => self.run_batch(&units),
            Err(e) => {
                tracing::error!(
                    units_dir = %self.units.units_dir().display(),
                    error = %e,
                    "cannot list migration units"
                );
                RunStatus::Failed
            }
        };

        Self::finish(guard);
        status
    }

    /// Applied/pending state of every unit. Read-only; takes no run lock.
    pub fn status(&self) -> Result<StatusReport> {
        let applied = self.executor.tracker().applied_set()?;
        let units = self
            .units
            .list_units()?
            .into_iter()
            .map(|u| UnitState {
                applied: applied.contains(&u.name),
                name: u.name,
            })
            .collect();
        Ok(StatusReport {
            units,
            lock_holder: self.lock.holder()?,
        })
    }

    fn run_batch(&self, units: &[MigrationUnit]) -> RunStatus {
        let mut processed = 0;
        let mut failed = 0;
        for unit in units {
            match self.executor.execute(unit, false) {
                Ok(ExecOutcome::Executed) => processed += 1,
                Ok(ExecOutcome::Failed { .. }) => failed += 1,
                Ok(ExecOutcome::AlreadyApplied | ExecOutcome::DryRun) => {}
                Err(e) => return Self::log_unavailable(&e),
            }
        }
        tracing::info!(processed, failed, total = units.len(), "migration run finished");
        RunStatus::Summary { processed, failed }
    }

    fn select(&self, names: &[String]) -> Result<Vec<MigrationUnit>> {
        let mut selected: Vec<MigrationUnit> = Vec::new();
        for name in names {
            if self.units.is_ignored(name) {
                tracing::warn!(unit = %name, "skipping ignored migration unit");
                continue;
            }
            match self.units.resolve(name) {
                Ok(unit) => {
                    if !selected.iter().any(|u| u.name == unit.name) {
                        selected.push(unit);
                    }
                }
                Err(e @ StorageError::InvalidPath(_)) => {
                    let e = Error::from(e);
                    tracing::warn!(
                        unit = %name,
                        error_type = e.error_type(),
                        "rejecting request: migration unit escapes the units directory"
                    );
                    return Err(e);
                }
                Err(e) => {
                    let e = Error::from(e);
                    tracing::warn!(
                        unit = %name,
                        error_type = e.error_type(),
                        "skipping requested migration unit"
                    );
                }
            }
        }
        Ok(selected)
    }

    fn lock(&self) -> std::result::Result<LockGuard<'_>, RunStatus> {
        match self.lock.try_lock() {
            Ok(guard) => Ok(guard),
            Err(StorageError::LockBusy { pid, host }) => {
                tracing::info!(holder_pid = pid, holder_host = %host, "migration already in progress");
                Err(RunStatus::Locked)
            }
            Err(e) => {
                let e = Error::from(e);
                tracing::error!(
                    error = %e,
                    error_type = e.error_type(),
                    recoverable = e.is_recoverable(),
                    "could not acquire migration lock"
                );
                Err(RunStatus::LockUnavailable)
            }
        }
    }

    fn finish(guard: LockGuard<'_>) {
        if let Err(e) = guard.release() {
            tracing::warn!(error = %e, "failed to release migration lock");
        }
    }

    fn log_unavailable(err: &Error) -> RunStatus {
        tracing::error!(
            error = %err,
            error_type = err.error_type(),
            recoverable = err.is_recoverable(),
            "audit log unavailable; stopping run"
        );
        RunStatus::LogUnavailable
    }
}
