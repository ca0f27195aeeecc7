//! Authorization seam for administrative actions.
//!
//! Authentication and anti-forgery checks belong to the embedding surface;
//! the coordinator only asks an [`AdminGate`] before acting.

use std::fmt;

use cms_migrate_core::{Error, Result};

/// Administrative actions exposed at the action boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdminAction {
    PreviewAll,
    RunSelected,
    ExecuteAll,
    Status,
    ClearLog,
}

impl AdminAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PreviewAll => "preview_all",
            Self::RunSelected => "run_selected",
            Self::ExecuteAll => "execute_all",
            Self::Status => "status",
            Self::ClearLog => "clear_log",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "preview_all" => Some(Self::PreviewAll),
            "run_selected" => Some(Self::RunSelected),
            "execute_all" | "run_all" => Some(Self::ExecuteAll),
            "status" => Some(Self::Status),
            "clear_log" => Some(Self::ClearLog),
            _ => None,
        }
    }

    /// Whether the action can change lock, log or applied state.
    #[must_use]
    pub const fn is_mutating(self) -> bool {
        matches!(self, Self::RunSelected | Self::ExecuteAll | Self::ClearLog)
    }
}

impl fmt::Display for AdminAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decides whether a caller may perform `action`.
pub trait AdminGate: Send + Sync {
    /// `token` is the caller's anti-forgery token, if the surface has one.
    fn authorize(&self, action: AdminAction, token: Option<&str>) -> Result<()>;
}

/// The local operator running the CLI is trusted for every action.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalOperator;

impl AdminGate for LocalOperator {
    fn authorize(&self, _action: AdminAction, _token: Option<&str>) -> Result<()> {
        Ok(())
    }
}

/// Requires a shared token for mutating actions; read-only actions pass.
#[derive(Clone)]
pub struct TokenGate {
    expected: String,
}

impl fmt::Debug for TokenGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGate").finish_non_exhaustive()
    }
}

impl TokenGate {
    #[must_use]
    pub fn new(expected: impl Into<String>) -> Self {
        Self {
            expected: expected.into(),
        }
    }
}

impl AdminGate for TokenGate {
    fn authorize(&self, action: AdminAction, token: Option<&str>) -> Result<()> {
        if !action.is_mutating() {
            return Ok(());
        }
        match token {
            Some(t) if !self.expected.is_empty() && constant_time_eq(t.trim(), &self.expected) => {
                Ok(())
            }
            _ => {
                tracing::warn!(action = %action, "rejected administrative action");
                Err(Error::Unauthorized(action.to_string()))
            }
        }
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes().iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
