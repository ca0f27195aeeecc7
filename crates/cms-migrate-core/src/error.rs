//! Error types for the migration coordinator
//!
//! Every variant maps to a stable error code so the admin boundary can report
//! failures without echoing raw messages back to the caller.

use thiserror::Error;

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the migration coordinator
#[derive(Debug, Error)]
pub enum Error {
    // ==========================================================================
    // Validation Errors
    // ==========================================================================
    #[error("Invalid migration unit name: {0}. Must match ^[\\w.-]+$ and carry the unit extension")]
    InvalidUnitName(String),

    #[error("Migration unit resolves outside the units directory: {0}")]
    InvalidUnit(String),

    #[error("Migration unit not found: {0}")]
    UnitNotFound(String),

    // ==========================================================================
    // Lock Errors
    // ==========================================================================
    #[error("Migration lock is held by pid {pid} on {host}")]
    LockBusy { pid: u32, host: String },

    #[error("Failed to acquire migration lock: {0}")]
    LockAcquisitionFailed(String),

    // ==========================================================================
    // Execution Errors
    // ==========================================================================
    #[error("Migration unit {unit} failed: {message}")]
    UnitExecution { unit: String, message: String },

    // ==========================================================================
    // Audit Log Errors
    // ==========================================================================
    #[error("Audit log I/O error: {0}")]
    LogIo(String),

    // ==========================================================================
    // I/O Errors
    // ==========================================================================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // ==========================================================================
    // Authorization
    // ==========================================================================
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

impl Error {
    /// Returns the error type string (for structured responses and logs)
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidUnitName(_) | Self::InvalidUnit(_) => "INVALID_UNIT",
            Self::UnitNotFound(_) => "NOT_FOUND",
            Self::LockBusy { .. } => "LOCK_BUSY",
            Self::LockAcquisitionFailed(_) => "LOCK_FAILED",
            Self::UnitExecution { .. } => "UNIT_FAILED",
            Self::LogIo(_) => "LOG_IO",
            Self::Io(_) => "OS_ERROR",
            Self::Serialization(_) => "TYPE_ERROR",
            Self::Unauthorized(_) => "UNAUTHORIZED",
        }
    }

    /// Returns whether the error is recoverable (can be retried)
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            // Another run holds the lock; retry once it finishes or expires
            Self::LockBusy { .. }
                // Transient filesystem conditions
                | Self::LockAcquisitionFailed(_)
                | Self::LogIo(_)
                | Self::Io(_)
                // The unit itself may be fixed and re-run
                | Self::UnitExecution { .. }
                | Self::UnitNotFound(_)
        )
    }
}
