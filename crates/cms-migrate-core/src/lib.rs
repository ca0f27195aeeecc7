//! Core types, configuration, and models for the CMS migration coordinator
//!
//! This crate provides:
//! - Configuration management (`Config`, environment parsing)
//! - Data models (`MigrationUnit`, `AuditEntry`, `LockRecord`, `RunStatus`)
//! - Path resolution and atomic file writes
//! - Common error types

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod models;
pub mod paths;

// Re-export key types for convenience
pub use config::Config;
pub use error::{Error, Result};
pub use models::{
    AuditEntry, LockRecord, MigrationUnit, Outcome, RunStatus, UnitState, parse_timestamp,
};
