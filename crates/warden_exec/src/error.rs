//! Error types for the remote executor.

use thiserror::Error;

/// Result type alias for executor operations.
pub type ExecResult<T> = Result<T, ExecError>;

/// Errors that can occur while running a remote command.
///
/// A command that ran and exited non-zero is *not* an error; it comes back
/// as a normal [`ExecOutput`](crate::ExecOutput) and the caller decides what
/// it means.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Connection to {target} failed: {message}")]
    Connection { target: String, message: String },

    #[error("Authentication to {target} rejected: {message}")]
    Auth { target: String, message: String },

    #[error("Remote command timed out after {0} seconds")]
    Timeout(u64),

    #[error("Failed to spawn ssh client: {0}")]
    Spawn(String),

    #[error("Invalid remote command: {0}")]
    InvalidCommand(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecError {
    /// True when the remote host could not be reached at all.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// True when the remote outcome is unknown.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
