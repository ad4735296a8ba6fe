//! Connection targets and remote command configuration.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Private key material for an SSH connection.
///
/// The key is never printed: `Debug` is redacted and there is no `Display`.
#[derive(Clone, PartialEq, Eq)]
pub struct PrivateKey(String);

impl PrivateKey {
    pub fn new(material: impl Into<String>) -> Self {
        Self(material.into())
    }

    /// Raw PEM/OpenSSH text. Only the transport should call this.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

/// Where and as whom to run a remote command.
#[derive(Debug, Clone)]
pub struct SshTarget {
    /// Hostname or IP address
    pub address: String,
    /// SSH port
    pub port: u16,
    /// Login user
    pub user: String,
    /// Key used to authenticate
    pub key: PrivateKey,
}

impl SshTarget {
    pub fn new(address: impl Into<String>, user: impl Into<String>, key: PrivateKey) -> Self {
        Self {
            address: address.into(),
            port: 22,
            user: user.into(),
            key,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// `user@address:port`, used in logs and error messages.
    pub fn display_name(&self) -> String {
        format!("{}@{}:{}", self.user, self.address, self.port)
    }
}

/// A single command to run remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCommand {
    /// Directory to change into before running
    pub workdir: Option<String>,
    /// Shell command line
    pub command: String,
    /// Upper bound on the call, in seconds
    pub timeout_seconds: u64,
}

impl RemoteCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            workdir: None,
            command: command.into(),
            timeout_seconds: 120,
        }
    }

    pub fn workdir(mut self, dir: impl Into<String>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}
