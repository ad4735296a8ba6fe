//! SSH executor built on the system `ssh` client.
//!
//! Each call materializes the private key in a private temporary file, runs
//! one command through `ssh -i <key> user@host`, and captures stdout/stderr.
//! The remote shell first reports its process group on stderr so that a
//! timed-out command can be terminated on the host.

use std::io::Write;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::compose::shell_quote;
use crate::config::{RemoteCommand, SshTarget};
use crate::error::{ExecError, ExecResult};
use crate::executor::{ExecOutput, RemoteExecutor};

/// Marker printed by the remote shell before the real command runs.
const PGID_MARKER: &str = "warden-pgid:";

/// Exit status `ssh` uses for its own failures.
const SSH_TRANSPORT_FAILURE: i64 = 255;

/// SSH executor options.
#[derive(Debug, Clone)]
pub struct SshOptions {
    /// Path or name of the ssh client binary
    pub ssh_binary: String,
    /// Seconds allowed for the TCP + handshake phase
    pub connect_timeout_secs: u64,
    /// Verify host keys against known_hosts
    pub strict_host_key_checking: bool,
    /// Custom known_hosts file
    pub known_hosts_file: Option<String>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            ssh_binary: "ssh".to_string(),
            connect_timeout_secs: 10,
            strict_host_key_checking: false,
            known_hosts_file: None,
        }
    }
}

impl SshOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn binary(mut self, binary: impl Into<String>) -> Self {
        self.ssh_binary = binary.into();
        self
    }

    pub fn connect_timeout(mut self, seconds: u64) -> Self {
        self.connect_timeout_secs = seconds;
        self
    }

    pub fn strict_host_key_checking(mut self, enabled: bool) -> Self {
        self.strict_host_key_checking = enabled;
        self
    }

    pub fn known_hosts(mut self, path: impl Into<String>) -> Self {
        self.known_hosts_file = Some(path.into());
        self
    }
}

/// Executor that shells out to `ssh`.
pub struct SshExecutor {
    options: SshOptions,
}

impl SshExecutor {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SshOptions {
        &self.options
    }

    /// Build the ssh argument list for one call.
    fn build_args(&self, target: &SshTarget, key_path: &str, script: &str) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            key_path.to_string(),
            "-p".to_string(),
            target.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "IdentitiesOnly=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.options.connect_timeout_secs),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
        ];

        if self.options.strict_host_key_checking {
            args.push("-o".to_string());
            args.push("StrictHostKeyChecking=yes".to_string());
        } else {
            args.push("-o".to_string());
            args.push("StrictHostKeyChecking=no".to_string());
        }

        if let Some(known_hosts) = &self.options.known_hosts_file {
            args.push("-o".to_string());
            args.push(format!("UserKnownHostsFile={}", known_hosts));
        } else if !self.options.strict_host_key_checking {
            args.push("-o".to_string());
            args.push("UserKnownHostsFile=/dev/null".to_string());
        }

        args.push(format!("{}@{}", target.user, target.address));
        args.push(script.to_string());
        args
    }

    /// The script handed to the remote login shell.
    fn remote_script(command: &RemoteCommand) -> String {
        let mut script = format!("printf '{}%s\\n' \"$$\" >&2; ", PGID_MARKER);
        if let Some(dir) = &command.workdir {
            script.push_str(&format!("cd {} && ", shell_quote(dir)));
        }
        script.push_str(&command.command);
        script
    }

    /// Format command for logging.
    fn format_command(&self, args: &[String]) -> String {
        let mut cmd = self.options.ssh_binary.clone();
        for arg in args {
            if arg.contains(' ') || arg.contains('=') {
                cmd.push_str(&format!(" '{}'", arg));
            } else {
                cmd.push_str(&format!(" {}", arg));
            }
        }
        cmd
    }

    /// Write the key to a 0600 temp file that lives for the duration of a call.
    fn write_key_file(target: &SshTarget) -> ExecResult<NamedTempFile> {
        if target.key.is_empty() {
            return Err(ExecError::Auth {
                target: target.display_name(),
                message: "no private key configured".to_string(),
            });
        }
        let mut file = tempfile::Builder::new().prefix("warden-key-").tempfile()?;
        file.write_all(target.key.expose().as_bytes())?;
        if !target.key.expose().ends_with('\n') {
            file.write_all(b"\n")?;
        }
        file.flush()?;
        Ok(file)
    }

    /// Map a failed ssh invocation (exit 255, no remote marker) to an error.
    fn classify_transport_failure(target: &SshTarget, stderr: &str) -> ExecError {
        let message = stderr.trim().to_string();
        let lower = message.to_lowercase();
        if lower.contains("permission denied")
            || lower.contains("too many authentication failures")
            || lower.contains("invalid format")
        {
            ExecError::Auth {
                target: target.display_name(),
                message,
            }
        } else {
            ExecError::Connection {
                target: target.display_name(),
                message,
            }
        }
    }

    /// Kill the remote process group left behind by a timed-out call.
    async fn terminate_remote_group(&self, target: &SshTarget, key_path: &str, pgid: i64) {
        let script = format!(
            "kill -TERM -- -{} 2>/dev/null || kill -TERM {} 2>/dev/null",
            pgid, pgid
        );
        let args = self.build_args(target, key_path, &script);
        let attempt = Command::new(&self.options.ssh_binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();

        let budget = std::time::Duration::from_secs(self.options.connect_timeout_secs.max(1) * 2);
        match tokio::time::timeout(budget, attempt).await {
            Ok(Ok(status)) => debug!(
                "Remote group {} on {} signalled (status {:?})",
                pgid,
                target.display_name(),
                status.code()
            ),
            Ok(Err(e)) => warn!("Could not signal remote group {}: {}", pgid, e),
            Err(_) => warn!(
                "Timed out signalling remote group {} on {}",
                pgid,
                target.display_name()
            ),
        }
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(&self, target: &SshTarget, command: &RemoteCommand) -> ExecResult<ExecOutput> {
        if command.command.trim().is_empty() {
            return Err(ExecError::InvalidCommand("empty command".to_string()));
        }

        let key_file = Self::write_key_file(target)?;
        let key_path = key_file.path().to_string_lossy().to_string();
        let script = Self::remote_script(command);
        let args = self.build_args(target, &key_path, &script);

        info!("Running on {}: {}", target.display_name(), command.command);
        debug!("Command: {}", self.format_command(&args));

        let started_at = Utc::now();
        let mut child = Command::new(&self.options.ssh_binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ExecError::Spawn(format!("{}: {}", self.options.ssh_binary, e))
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let remote_pgid: Arc<Mutex<Option<i64>>> = Arc::new(Mutex::new(None));

        let stdout_task = tokio::spawn(async move {
            let mut output = String::new();
            if let Some(stdout) = stdout {
                let mut reader = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    output.push_str(&line);
                    output.push('\n');
                }
            }
            output
        });

        let pgid_slot = remote_pgid.clone();
        let stderr_task = tokio::spawn(async move {
            let mut output = String::new();
            if let Some(stderr) = stderr {
                let mut reader = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    if let Some(pgid) = line.strip_prefix(PGID_MARKER) {
                        *pgid_slot.lock() = pgid.trim().parse().ok();
                        continue;
                    }
                    output.push_str(&line);
                    output.push('\n');
                }
            }
            output
        });

        let status = match tokio::time::timeout(command.timeout_duration(), child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                stdout_task.abort();
                stderr_task.abort();
                return Err(ExecError::Io(e));
            }
            Err(_) => {
                warn!(
                    "Command on {} exceeded {}s, terminating",
                    target.display_name(),
                    command.timeout_seconds
                );
                let _ = child.kill().await;
                stdout_task.abort();
                stderr_task.abort();
                let pgid = *remote_pgid.lock();
                if let Some(pgid) = pgid {
                    self.terminate_remote_group(target, &key_path, pgid).await;
                }
                return Err(ExecError::Timeout(command.timeout_seconds));
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let finished_at = Utc::now();
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        let exit_code = status.code().unwrap_or(-1) as i64;
        let reached_remote = remote_pgid.lock().is_some();

        if exit_code == SSH_TRANSPORT_FAILURE && !reached_remote {
            return Err(Self::classify_transport_failure(target, &stderr));
        }

        if exit_code == 0 {
            info!("Command on {} completed in {}ms", target.display_name(), duration_ms);
        } else {
            warn!(
                "Command on {} exited with code {} after {}ms",
                target.display_name(),
                exit_code,
                duration_ms
            );
        }

        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr,
            started_at,
            finished_at,
            duration_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PrivateKey;

    fn target() -> SshTarget {
        SshTarget::new("app-01.internal", "deploy", PrivateKey::new("KEY")).port(2222)
    }

    #[test]
    fn test_build_args() {
        let executor = SshExecutor::new(SshOptions::default().connect_timeout(7));
        let args = executor.build_args(&target(), "/tmp/key", "uptime");

        assert_eq!(&args[..4], &["-i", "/tmp/key", "-p", "2222"]);
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ConnectTimeout=7".to_string()));
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert_eq!(args[args.len() - 2], "deploy@app-01.internal");
        assert_eq!(args[args.len() - 1], "uptime");
    }

    #[test]
    fn test_strict_host_keys_with_known_hosts() {
        let options = SshOptions::new()
            .strict_host_key_checking(true)
            .known_hosts("/etc/warden/known_hosts");
        let args = SshExecutor::new(options).build_args(&target(), "/tmp/key", "true");

        assert!(args.contains(&"StrictHostKeyChecking=yes".to_string()));
        assert!(args.contains(&"UserKnownHostsFile=/etc/warden/known_hosts".to_string()));
    }

    #[test]
    fn test_remote_script_quotes_workdir() {
        let cmd = RemoteCommand::new("docker-compose up -d").workdir("/srv/my app");
        let script = SshExecutor::remote_script(&cmd);

        assert!(script.starts_with("printf 'warden-pgid:%s\\n' \"$$\" >&2; "));
        assert!(script.ends_with("cd '/srv/my app' && docker-compose up -d"));
    }

    #[test]
    fn test_classify_transport_failure() {
        let auth = SshExecutor::classify_transport_failure(
            &target(),
            "deploy@app-01.internal: Permission denied (publickey).",
        );
        assert!(matches!(auth, ExecError::Auth { .. }));

        let conn = SshExecutor::classify_transport_failure(
            &target(),
            "ssh: connect to host app-01.internal port 2222: Connection refused",
        );
        assert!(conn.is_connection());
    }

    #[test]
    fn test_format_command_hides_nothing_secret() {
        let executor = SshExecutor::new(SshOptions::default());
        let args = executor.build_args(&target(), "/tmp/key", "uptime");
        let formatted = executor.format_command(&args);
        assert!(!formatted.contains("KEY"));
    }

    #[tokio::test]
    async fn test_empty_key_is_auth_error() {
        let executor = SshExecutor::new(SshOptions::default());
        let target = SshTarget::new("host", "user", PrivateKey::new("  "));
        let result = executor.run(&target, &RemoteCommand::new("true")).await;
        assert!(matches!(result, Err(ExecError::Auth { .. })));
    }

    #[cfg(unix)]
    mod fake_client {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::TempDir;

        /// A stand-in for `ssh` that runs its last argument locally.
        fn fake_ssh(dir: &TempDir) -> String {
            let path = dir.path().join("fake-ssh");
            let script = "#!/bin/sh\neval \"last=\\${$#}\"\nexec /bin/sh -c \"$last\"\n";
            std::fs::write(&path, script).unwrap();
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
            path.to_string_lossy().to_string()
        }

        #[tokio::test]
        async fn test_captures_output_and_exit_code() {
            let dir = TempDir::new().unwrap();
            let executor = SshExecutor::new(SshOptions::new().binary(fake_ssh(&dir)));
            let workdir = dir.path().to_string_lossy().to_string();

            let cmd = RemoteCommand::new("echo started; echo oops >&2; exit 3")
                .workdir(&workdir)
                .timeout(10);
            let output = executor.run(&target(), &cmd).await.unwrap();

            assert_eq!(output.exit_code, 3);
            assert_eq!(output.stdout.trim(), "started");
            assert_eq!(output.stderr.trim(), "oops");
        }

        #[tokio::test]
        async fn test_missing_workdir_is_a_normal_failure() {
            let dir = TempDir::new().unwrap();
            let executor = SshExecutor::new(SshOptions::new().binary(fake_ssh(&dir)));

            let cmd = RemoteCommand::new("true").workdir("/definitely/not/here").timeout(10);
            let output = executor.run(&target(), &cmd).await.unwrap();

            assert!(!output.success());
        }

        #[tokio::test]
        async fn test_timeout_reports_unknown_outcome() {
            let dir = TempDir::new().unwrap();
            let executor = SshExecutor::new(
                SshOptions::new().binary(fake_ssh(&dir)).connect_timeout(1),
            );

            let cmd = RemoteCommand::new("sleep 5").timeout(1);
            let result = executor.run(&target(), &cmd).await;

            assert!(matches!(result, Err(ExecError::Timeout(1))));
        }
    }
}
