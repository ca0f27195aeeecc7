#![forbid(unsafe_code)]
//! Execution layer for the CMS migration coordinator.
//!
//! - [`UnitInvoker`]: how a unit body is run (child process or closure)
//! - [`MigrationExecutor`]: per-unit dry-run / already-applied / execute state machine
//! - [`RunCoordinator`]: lock-guarded `preview_all`, `run_selected`, `run_all`, `status`
//! - [`AdminBoundary`]: authorized action dispatch with stable response strings

pub mod boundary;
pub mod coordinator;
pub mod executor;
pub mod gate;
pub mod invoker;

pub use boundary::{AdminBoundary, AdminRequest, AdminResponse};
pub use coordinator::{RunCoordinator, StatusReport};
pub use executor::{ExecOutcome, MigrationExecutor};
pub use gate::{AdminAction, AdminGate, LocalOperator, TokenGate};
pub use invoker::{CommandInvoker, UnitInvoker};
