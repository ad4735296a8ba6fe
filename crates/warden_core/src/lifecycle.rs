//! Application lifecycle state machine.
//!
//! ```text
//!            start                remote ok
//! stopped ─────────► starting ─────────────► running
//!    ▲                  │ remote failed          │ stop / deadline
//!    │                  ▼                        ▼
//!    │   remote ok    error ◄──────────────── stopping
//!    └───────────────────────── stopping ◄─┘ remote failed
//! ```
//!
//! `error` is not terminal: both start and stop are accepted from it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application lifecycle state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AppState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl Default for AppState {
    fn default() -> Self {
        Self::Stopped
    }
}

impl AppState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Error => "error",
        }
    }

    /// A remote call is (or was, before a crash) in flight.
    pub fn is_transitional(&self) -> bool {
        matches!(self, Self::Starting | Self::Stopping)
    }

    /// States an application may be deleted from without stopping it.
    pub fn is_deletable(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}

impl std::fmt::Display for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs that drive the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Start,
    Stop,
    DeadlineElapsed,
    RemoteSucceeded,
    RemoteFailed,
}

impl std::fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::DeadlineElapsed => "deadline-elapsed",
            Self::RemoteSucceeded => "remote-succeeded",
            Self::RemoteFailed => "remote-failed",
        };
        f.write_str(name)
    }
}

/// A transition the state machine does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot apply {event} while {from}")]
pub struct InvalidTransition {
    pub from: AppState,
    pub event: LifecycleEvent,
}

/// Compute the successor state.
pub fn transition(from: AppState, event: LifecycleEvent) -> Result<AppState, InvalidTransition> {
    use AppState::*;
    use LifecycleEvent::*;

    let next = match (from, event) {
        (Stopped | Error, Start) => Starting,
        (Starting, RemoteSucceeded) => Running,
        (Starting, RemoteFailed) => Error,
        (Running | Error, Stop) => Stopping,
        (Running, DeadlineElapsed) => Stopping,
        (Stopping, RemoteSucceeded) => Stopped,
        (Stopping, RemoteFailed) => Error,
        _ => return Err(InvalidTransition { from, event }),
    };
    Ok(next)
}

/// Auto-stop deadline for a run that began at `started_at`.
pub fn deadline_for(started_at: DateTime<Utc>, auto_stop_minutes: u32) -> DateTime<Utc> {
    started_at + Duration::minutes(i64::from(auto_stop_minutes))
}
