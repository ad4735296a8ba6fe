//! Error types for the core module.

use serde::Serialize;
use thiserror::Error;

use crate::lifecycle::InvalidTransition;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Stable, machine-readable error kind returned to API/CLI callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    ServerOffline,
    AlreadyRunning,
    NotRunning,
    ExecutionFailed,
    Timeout,
    ConcurrencyRejected,
    InvalidInput,
    InvalidState,
    InUse,
    Conflict,
    Credential,
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::ServerOffline => "server_offline",
            Self::AlreadyRunning => "already_running",
            Self::NotRunning => "not_running",
            Self::ExecutionFailed => "execution_failed",
            Self::Timeout => "timeout",
            Self::ConcurrencyRejected => "concurrency_rejected",
            Self::InvalidInput => "invalid_input",
            Self::InvalidState => "invalid_state",
            Self::InUse => "in_use",
            Self::Conflict => "conflict",
            Self::Credential => "credential",
            Self::Storage => "storage",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during core operations.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    #[error("Server {0} is offline")]
    ServerOffline(String),

    #[error("Application {0} is already running")]
    AlreadyRunning(String),

    #[error("Application {0} is not running")]
    NotRunning(String),

    #[error("Remote command failed for {app}: {message}")]
    ExecutionFailed {
        app: String,
        message: String,
        output: String,
    },

    #[error("Remote command for {app} timed out after {seconds}s; remote result unknown")]
    Timeout { app: String, seconds: u64 },

    #[error("Another lifecycle operation is in progress for {0}")]
    ConcurrencyRejected(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("{0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("{resource} {name} is still referenced by {count} application(s)")]
    InUse {
        resource: &'static str,
        name: String,
        count: usize,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl CoreError {
    pub fn not_found(resource: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    /// Stable error kind for callers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::ServerOffline(_) => ErrorKind::ServerOffline,
            Self::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            Self::NotRunning(_) => ErrorKind::NotRunning,
            Self::ExecutionFailed { .. } => ErrorKind::ExecutionFailed,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ConcurrencyRejected(_) => ErrorKind::ConcurrencyRejected,
            Self::InvalidInput(_) | Self::Config(_) | Self::Toml(_) => ErrorKind::InvalidInput,
            Self::InvalidState(_) | Self::InvalidTransition(_) => ErrorKind::InvalidState,
            Self::InUse { .. } => ErrorKind::InUse,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Credential(_) => ErrorKind::Credential,
            Self::Io(_) | Self::Serialization(_) => ErrorKind::Storage,
        }
    }

    /// Captured remote output (already truncated), if any.
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::ExecutionFailed { output, .. } if !output.is_empty() => Some(output),
            _ => None,
        }
    }
}
