#![forbid(unsafe_code)]
//! Filesystem storage layer for the CMS migration coordinator.
//!
//! Provides:
//! - Unit discovery and boundary-checked name resolution ([`UnitStore`])
//! - A single expiring run lock written via temp-file + rename ([`LockManager`])
//! - An append-only JSONL audit log guarded by an advisory file lock ([`AuditLogger`])
//! - Applied-state lookups over the log plus a durable applied ledger
//!   ([`AppliedStateTracker`], [`AppliedLedger`])
//! - The read-only log viewer with filter/sort/download/clear ([`LogViewer`])

use std::path::PathBuf;

use thiserror::Error;

pub mod applied;
pub mod audit;
pub mod lock;
pub mod units;
pub mod viewer;

pub use applied::{AppliedLedger, AppliedStateTracker};
pub use audit::{AuditLogger, LogRecord, RecordFormat};
pub use lock::{LockGuard, LockManager, local_host};
pub use units::{UnitStore, is_valid_unit_name};
pub use viewer::{LogDownload, LogFilter, LogViewer};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid unit name: {0}")]
    InvalidUnitName(String),

    #[error("Invalid path: {0}")]
    InvalidPath(PathBuf),

    #[error("Unit not found: {0}")]
    UnitNotFound(String),

    #[error("Lock held by pid {pid} on {host}")]
    LockBusy { pid: u32, host: String },

    #[error("Lock acquisition failed: {0}")]
    LockAcquisition(String),

    #[error("Audit log error: {0}")]
    LogIo(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

impl From<StorageError> for cms_migrate_core::Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Io(e) => Self::Io(e),
            StorageError::Json(e) => Self::Serialization(e),
            StorageError::InvalidUnitName(name) => Self::InvalidUnitName(name),
            StorageError::InvalidPath(path) => Self::InvalidUnit(path.display().to_string()),
            StorageError::UnitNotFound(name) => Self::UnitNotFound(name),
            StorageError::LockBusy { pid, host } => Self::LockBusy { pid, host },
            StorageError::LockAcquisition(msg) => Self::LockAcquisitionFailed(msg),
            StorageError::LogIo(msg) => Self::LogIo(msg),
        }
    }
}
