//! Administrative action boundary.
//!
//! Maps an action request to a short, stable response string. Detailed
//! errors go to the audit log and tracing output, never into the response.

use cms_migrate_core::RunStatus;

use crate::coordinator::RunCoordinator;
use crate::gate::{AdminAction, AdminGate, LocalOperator};

/// Response text for a successful log clear.
pub const LOG_CLEARED: &str = "log cleared";

/// One form-style request: an action name, optional `migrations[]`, optional token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdminRequest {
    pub action: String,
    pub migrations: Vec<String>,
    pub token: Option<String>,
}

impl AdminRequest {
    #[must_use]
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_migrations(mut self, migrations: Vec<String>) -> Self {
        self.migrations = migrations;
        self
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

#[derive(Debug)]
pub struct AdminBoundary<G = LocalOperator> {
    coordinator: RunCoordinator,
    gate: G,
}

impl<G: AdminGate> AdminBoundary<G> {
    #[must_use]
    pub const fn new(coordinator: RunCoordinator, gate: G) -> Self {
        Self { coordinator, gate }
    }

    #[must_use]
    pub const fn coordinator(&self) -> &RunCoordinator {
        &self.coordinator
    }

    /// Authorize, dispatch, and render the response text.
    pub fn handle(&self, request: &AdminRequest) -> String {
        self.dispatch(request).body
    }

    /// Like [`handle`](Self::handle), keeping the status for callers that map it further.
    pub fn dispatch(&self, request: &AdminRequest) -> AdminResponse {
        let Some(action) = AdminAction::parse(&request.action) else {
            tracing::warn!(action = %request.action, "unknown administrative action");
            return AdminResponse::status(RunStatus::Invalid);
        };
        if self
            .gate
            .authorize(action, request.token.as_deref())
            .is_err()
        {
            return AdminResponse::status(RunStatus::Unauthorized);
        }

        tracing::info!(action = %action, "administrative action");
        match action {
            AdminAction::PreviewAll => match self.coordinator.preview_all() {
                Ok(lines) => AdminResponse::text(lines.join("\n")),
                Err(e) => {
                    tracing::error!(error = %e, "preview failed");
                    AdminResponse::status(RunStatus::Failed)
                }
            },
            AdminAction::RunSelected => {
                AdminResponse::status(self.coordinator.run_selected(&request.migrations))
            }
            AdminAction::ExecuteAll => AdminResponse::status(self.coordinator.run_all()),
            AdminAction::Status => match self
                .coordinator
                .status()
                .and_then(|report| serde_json::to_string(&report).map_err(Into::into))
            {
                Ok(json) => AdminResponse::text(json),
                Err(e) => {
                    tracing::error!(error = %e, "status failed");
                    AdminResponse::status(RunStatus::Failed)
                }
            },
            AdminAction::ClearLog => match self.coordinator.log_viewer().clear() {
                Ok(()) => AdminResponse::text(LOG_CLEARED),
                Err(e) => {
                    tracing::error!(error = %e, "log clear failed");
                    AdminResponse::status(RunStatus::LogUnavailable)
                }
            },
        }
    }
}

/// Response body plus the run status behind it, if the action produced one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminResponse {
    pub body: String,
    /// `None` for read-only actions that completed.
    pub status: Option<RunStatus>,
}

impl AdminResponse {
    fn status(status: RunStatus) -> Self {
        Self {
            body: status.to_string(),
            status: Some(status),
        }
    }

    fn text(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            status: None,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_none_or(RunStatus::is_success)
    }
}
