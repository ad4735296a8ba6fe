//! Mock remote executor for testing.
//!
//! Provides a scripted implementation of the RemoteExecutor trait so the
//! orchestrator can be exercised without real hosts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::config::{RemoteCommand, SshTarget};
use crate::error::{ExecError, ExecResult};
use crate::executor::{ExecOutput, RemoteExecutor};

/// Predefined mock response for a remote call.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Command ran and exited with this code
    Exit {
        exit_code: i64,
        stdout: String,
        stderr: String,
    },
    /// Host unreachable
    ConnectionRefused(String),
    /// Key rejected
    AuthRejected(String),
    /// Call exceeded its timeout
    TimedOut,
}

impl MockResponse {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self::Exit {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(exit_code: i64, stderr: impl Into<String>) -> Self {
        Self::Exit {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn connection_refused(message: impl Into<String>) -> Self {
        Self::ConnectionRefused(message.into())
    }

    pub fn auth_rejected(message: impl Into<String>) -> Self {
        Self::AuthRejected(message.into())
    }

    pub fn timed_out() -> Self {
        Self::TimedOut
    }
}

/// Captured call information for verification.
#[derive(Debug, Clone)]
pub struct CapturedCall {
    pub address: String,
    pub port: u16,
    pub user: String,
    pub workdir: Option<String>,
    pub command: String,
    pub timeout_seconds: u64,
}

/// Mock remote executor for testing.
///
/// Responses are consumed in order; once the script runs out every further
/// call succeeds with empty output. Per-host scripts take precedence over
/// the shared script.
#[derive(Clone, Default)]
pub struct MockExecutor {
    /// Shared scripted responses.
    responses: Arc<RwLock<Vec<MockResponse>>>,
    /// Index of the next shared response.
    response_index: Arc<AtomicUsize>,
    /// Responses keyed by host address.
    host_responses: Arc<RwLock<HashMap<String, Vec<MockResponse>>>>,
    /// Simulated latency of every call.
    delay: Arc<RwLock<Option<Duration>>>,
    /// Captured calls for verification.
    captured_calls: Arc<RwLock<Vec<CapturedCall>>>,
}

impl MockExecutor {
    /// Create a new mock executor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a response for the next unscripted call.
    pub fn add_response(self, response: MockResponse) -> Self {
        self.responses.write().push(response);
        self
    }

    /// Set multiple responses.
    pub fn with_responses(self, responses: Vec<MockResponse>) -> Self {
        *self.responses.write() = responses;
        self.response_index.store(0, Ordering::SeqCst);
        self
    }

    /// Script responses for one host only.
    pub fn for_host(self, address: impl Into<String>, responses: Vec<MockResponse>) -> Self {
        self.host_responses.write().insert(address.into(), responses);
        self
    }

    /// Make each call take this long (uses tokio time, so paused clocks apply).
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.write() = Some(delay);
        self
    }

    /// Queue one more response on a shared handle.
    pub fn push_response(&self, response: MockResponse) {
        self.responses.write().push(response);
    }

    /// Clear all captured calls.
    pub fn clear_calls(&self) {
        self.captured_calls.write().clear();
    }

    /// Get all captured calls.
    pub fn get_calls(&self) -> Vec<CapturedCall> {
        self.captured_calls.read().clone()
    }

    /// Get the number of calls made.
    pub fn call_count(&self) -> usize {
        self.captured_calls.read().len()
    }

    /// Calls whose command line contains `needle`.
    pub fn calls_matching(&self, needle: &str) -> Vec<CapturedCall> {
        self.captured_calls
            .read()
            .iter()
            .filter(|c| c.command.contains(needle))
            .cloned()
            .collect()
    }

    /// Record a call.
    fn record_call(&self, call: CapturedCall) {
        self.captured_calls.write().push(call);
    }

    /// Get the next response for a host.
    fn next_response(&self, address: &str) -> MockResponse {
        if let Some(script) = self.host_responses.write().get_mut(address) {
            if !script.is_empty() {
                return script.remove(0);
            }
        }
        let responses = self.responses.read();
        let index = self.response_index.fetch_add(1, Ordering::SeqCst);
        responses
            .get(index)
            .cloned()
            .unwrap_or_else(|| MockResponse::success(""))
    }
}

#[async_trait]
impl RemoteExecutor for MockExecutor {
    async fn run(&self, target: &SshTarget, command: &RemoteCommand) -> ExecResult<ExecOutput> {
        self.record_call(CapturedCall {
            address: target.address.clone(),
            port: target.port,
            user: target.user.clone(),
            workdir: command.workdir.clone(),
            command: command.command.clone(),
            timeout_seconds: command.timeout_seconds,
        });

        let response = self.next_response(&target.address);
        let started_at = Utc::now();

        let delay = *self.delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match response {
            MockResponse::Exit {
                exit_code,
                stdout,
                stderr,
            } => {
                let finished_at = Utc::now();
                Ok(ExecOutput {
                    exit_code,
                    stdout,
                    stderr,
                    started_at,
                    finished_at,
                    duration_ms: delay.map(|d| d.as_millis() as u64).unwrap_or(0),
                })
            }
            MockResponse::ConnectionRefused(message) => Err(ExecError::Connection {
                target: target.display_name(),
                message,
            }),
            MockResponse::AuthRejected(message) => Err(ExecError::Auth {
                target: target.display_name(),
                message,
            }),
            MockResponse::TimedOut => Err(ExecError::Timeout(command.timeout_seconds)),
        }
    }
}
