//! Error taxonomy for shell sessions.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Errors produced while establishing or driving a shell session.
///
/// Establishment errors (`Configuration`, `SandboxLaunch`, `Resource`) are
/// fatal to the session. Per-message errors (`Protocol`, `Write`,
/// `NotRunning`) are reported to the peer and the session continues.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("no usable shell: {0}")]
    Configuration(String),

    #[error("failed to launch sandboxed shell: {0}")]
    SandboxLaunch(String),

    #[error("workspace error: {0}")]
    Resource(String),

    #[error("invalid message: {0}")]
    Protocol(String),

    #[error("failed to write to shell: {0}")]
    Write(#[source] std::io::Error),

    #[error("shell process is no longer running")]
    ChildExited,

    #[error("shell is not running yet")]
    NotRunning,

    #[error("session {0} is already active")]
    SessionBusy(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ShellError {
    /// Short machine-readable code used in log fields.
    pub fn code(&self) -> &'static str {
        match self {
            ShellError::Configuration(_) => "configuration",
            ShellError::SandboxLaunch(_) => "sandbox_launch",
            ShellError::Resource(_) => "resource",
            ShellError::Protocol(_) => "protocol",
            ShellError::Write(_) => "write",
            ShellError::ChildExited => "child_exited",
            ShellError::NotRunning => "not_running",
            ShellError::SessionBusy(_) => "session_busy",
            ShellError::Io(_) => "io",
        }
    }

    /// Whether the error ends the session instead of being reported and skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ShellError::Configuration(_)
                | ShellError::SandboxLaunch(_)
                | ShellError::Resource(_)
                | ShellError::SessionBusy(_)
        )
    }
}

pub type ShellResult<T> = Result<T, ShellError>;

/// JSON body of an HTTP-level rejection.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

impl ErrorBody {
    pub fn new(code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
        }
    }
}

impl ShellError {
    fn status(&self) -> StatusCode {
        match self {
            ShellError::Protocol(_) => StatusCode::BAD_REQUEST,
            ShellError::SessionBusy(_) => StatusCode::CONFLICT,
            ShellError::NotRunning | ShellError::ChildExited => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ShellError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody::new(self.code(), self.to_string());
        (status, Json(body)).into_response()
    }
}
