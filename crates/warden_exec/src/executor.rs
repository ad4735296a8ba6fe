//! Remote executor trait and result types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{RemoteCommand, SshTarget};
use crate::error::ExecResult;

/// Result of a remote command that ran to completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutput {
    /// Exit code reported by the remote shell
    pub exit_code: i64,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Execution start time
    pub started_at: DateTime<Utc>,
    /// Execution end time
    pub finished_at: DateTime<Utc>,
    /// Duration in milliseconds
    pub duration_ms: u64,
}

impl ExecOutput {
    /// Check if execution was successful (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Get combined output (stdout + stderr).
    pub fn combined_output(&self) -> String {
        if self.stdout.is_empty() {
            self.stderr.clone()
        } else if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }

    /// Combined output cut down to at most `max_bytes`, keeping the tail
    /// where compose prints its errors.
    pub fn summary(&self, max_bytes: usize) -> String {
        truncate_tail(self.combined_output().trim(), max_bytes)
    }
}

/// Keep the last `max_bytes` of `text` on a char boundary.
pub fn truncate_tail(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("[truncated]...{}", &text[start..])
}

/// Runs one command on a remote host.
///
/// Implementations must honour `command.timeout_seconds` and report an
/// elapsed timeout as [`ExecError::Timeout`](crate::ExecError::Timeout)
/// rather than guessing at the remote outcome.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn run(&self, target: &SshTarget, command: &RemoteCommand) -> ExecResult<ExecOutput>;
}
