//! Compose command presets.
//!
//! Applications are deployed as compose projects in a remote directory; the
//! orchestrator only ever brings them up, takes them down, or probes the host.

use serde::{Deserialize, Serialize};

use crate::config::RemoteCommand;

/// Lifecycle action against a compose project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComposeAction {
    Up,
    Down,
}

impl ComposeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }
}

impl std::fmt::Display for ComposeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds the remote command lines for compose projects.
#[derive(Debug, Clone)]
pub struct ComposeCommands {
    binary: String,
}

impl Default for ComposeCommands {
    fn default() -> Self {
        Self::new("docker-compose")
    }
}

impl ComposeCommands {
    /// `binary` is e.g. `docker-compose` or `docker compose`.
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Command for an action in the given project directory.
    pub fn action(
        &self,
        action: ComposeAction,
        workdir: &str,
        timeout_seconds: u64,
    ) -> RemoteCommand {
        let line = match action {
            ComposeAction::Up => format!("{} up -d", self.binary),
            ComposeAction::Down => format!("{} down", self.binary),
        };
        RemoteCommand::new(line)
            .workdir(workdir)
            .timeout(timeout_seconds)
    }

    pub fn up(&self, workdir: &str, timeout_seconds: u64) -> RemoteCommand {
        self.action(ComposeAction::Up, workdir, timeout_seconds)
    }

    pub fn down(&self, workdir: &str, timeout_seconds: u64) -> RemoteCommand {
        self.action(ComposeAction::Down, workdir, timeout_seconds)
    }

    /// Cheap health probe: number of running containers on the host.
    pub fn probe(timeout_seconds: u64) -> RemoteCommand {
        RemoteCommand::new("docker ps -q | wc -l").timeout(timeout_seconds)
    }
}

/// Parse the output of [`ComposeCommands::probe`].
pub fn parse_container_count(stdout: &str) -> Option<u32> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.parse().ok())
}

/// Quote a value for a POSIX shell using single quotes.
pub fn shell_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}
