//! Runtime configuration.
//!
//! Loaded from an optional TOML file, then overridden by `WARDEN_*`
//! environment variables. Every field has a default so an empty file (or
//! none at all) is a valid configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;
use warden_exec::{ComposeCommands, SshOptions};

use crate::error::{CoreError, CoreResult};

/// SSH client settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SshConfig {
    pub binary: String,
    pub connect_timeout_secs: u64,
    pub strict_host_key_checking: bool,
    pub known_hosts_file: Option<String>,
    /// Plain TCP connect to the SSH port before each health probe
    pub tcp_preflight: bool,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            binary: "ssh".to_string(),
            connect_timeout_secs: 10,
            strict_host_key_checking: false,
            known_hosts_file: None,
            tcp_preflight: true,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WardenConfig {
    /// Root of the record store and audit log
    pub data_dir: PathBuf,
    /// Private key directory; defaults to `<data_dir>/keys`
    pub keys_dir: Option<PathBuf>,
    /// Passphrase for sealing stored keys; a generated master key is used when unset
    #[serde(skip_serializing)]
    pub encryption_key: Option<String>,
    /// Timeout for compose up/down
    pub remote_timeout_secs: u64,
    /// Timeout for the health probe
    pub health_timeout_secs: u64,
    /// Interval of the daemon health sweep
    pub health_interval_secs: u64,
    /// Interval at which the daemon re-reads deadlines from the store
    pub deadline_resync_secs: u64,
    /// Auto-stop minutes for applications created without one
    pub default_auto_stop_minutes: u32,
    /// Compose binary invoked on the remote host
    pub compose_command: String,
    /// Bytes of remote output kept in errors and audit details
    pub output_limit_bytes: usize,
    pub ssh: SshConfig,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            keys_dir: None,
            encryption_key: None,
            remote_timeout_secs: 120,
            health_timeout_secs: 10,
            health_interval_secs: 60,
            deadline_resync_secs: 15,
            default_auto_stop_minutes: 60,
            compose_command: "docker-compose".to_string(),
            output_limit_bytes: 4096,
            ssh: SshConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".warden"),
        None => PathBuf::from(".warden"),
    }
}

impl WardenConfig {
    /// Load from `path` (if given) and apply environment overrides.
    pub fn load(path: Option<&Path>) -> CoreResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> CoreResult<Self> {
        debug!("Loading configuration from {}", path.display());
        let contents = fs::read_to_string(path).map_err(|e| {
            CoreError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> CoreResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply `WARDEN_*` overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> CoreResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("WARDEN_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("WARDEN_KEYS_DIR") {
            self.keys_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("WARDEN_ENCRYPTION_KEY") {
            self.encryption_key = Some(v);
        }
        if let Some(v) = lookup("WARDEN_REMOTE_TIMEOUT_SECS") {
            self.remote_timeout_secs = parse_env("WARDEN_REMOTE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("WARDEN_HEALTH_TIMEOUT_SECS") {
            self.health_timeout_secs = parse_env("WARDEN_HEALTH_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("WARDEN_HEALTH_INTERVAL_SECS") {
            self.health_interval_secs = parse_env("WARDEN_HEALTH_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("WARDEN_DEADLINE_RESYNC_SECS") {
            self.deadline_resync_secs = parse_env("WARDEN_DEADLINE_RESYNC_SECS", &v)?;
        }
        if let Some(v) = lookup("WARDEN_DEFAULT_AUTO_STOP_MINUTES") {
            self.default_auto_stop_minutes = parse_env("WARDEN_DEFAULT_AUTO_STOP_MINUTES", &v)?;
        }
        if let Some(v) = lookup("WARDEN_COMPOSE_COMMAND") {
            self.compose_command = v;
        }
        if let Some(v) = lookup("WARDEN_OUTPUT_LIMIT_BYTES") {
            self.output_limit_bytes = parse_env("WARDEN_OUTPUT_LIMIT_BYTES", &v)?;
        }
        if let Some(v) = lookup("WARDEN_SSH_BINARY") {
            self.ssh.binary = v;
        }
        if let Some(v) = lookup("WARDEN_STRICT_HOST_KEY_CHECKING") {
            self.ssh.strict_host_key_checking = parse_env("WARDEN_STRICT_HOST_KEY_CHECKING", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.remote_timeout_secs == 0 {
            return Err(CoreError::Config("remote_timeout_secs must be positive".into()));
        }
        if self.health_timeout_secs == 0 {
            return Err(CoreError::Config("health_timeout_secs must be positive".into()));
        }
        if self.default_auto_stop_minutes == 0 {
            return Err(CoreError::Config("default_auto_stop_minutes must be positive".into()));
        }
        if self.encryption_key.as_deref() == Some("") {
            return Err(CoreError::Config("encryption_key must not be empty".into()));
        }
        if self.compose_command.trim().is_empty() {
            return Err(CoreError::Config("compose_command must not be empty".into()));
        }
        Ok(())
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.keys_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("keys"))
    }

    /// Generated key used to seal stored keys when no passphrase is set.
    pub fn master_key_path(&self) -> PathBuf {
        self.data_dir.join("master.key")
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.data_dir.join("audit.jsonl")
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }

    pub fn deadline_resync_interval(&self) -> Duration {
        Duration::from_secs(self.deadline_resync_secs.max(1))
    }

    pub fn ssh_options(&self) -> SshOptions {
        let mut options = SshOptions::new()
            .binary(self.ssh.binary.clone())
            .connect_timeout(self.ssh.connect_timeout_secs)
            .strict_host_key_checking(self.ssh.strict_host_key_checking);
        if let Some(known_hosts) = &self.ssh.known_hosts_file {
            options = options.known_hosts(known_hosts.clone());
        }
        options
    }

    pub fn compose(&self) -> ComposeCommands {
        ComposeCommands::new(self.compose_command.clone())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> CoreResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| CoreError::Config(format!("{} has an invalid value: {}", key, value)))
}
