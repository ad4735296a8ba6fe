//! # warden_exec
//!
//! Remote command execution for Warden.
//!
//! This crate runs exactly one shell command on a remote host over SSH and
//! reports its exit status and captured output, bounded by a timeout.
//!
//! # Features
//!
//! - **SSH Executor**: drives the system `ssh` client with a per-call key file
//! - **Compose Presets**: `up -d`, `down` and the container-count probe
//! - **Timeout Handling**: timed-out calls terminate the remote process group
//! - **Mock Executor**: scripted responses for tests without real hosts
//!
//! # Example
//!
//! ```rust,no_run
//! use warden_exec::{
//!     ComposeCommands, PrivateKey, RemoteExecutor, SshExecutor, SshOptions, SshTarget,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let executor = SshExecutor::new(SshOptions::default());
//!     let key = PrivateKey::new(std::fs::read_to_string("id_ed25519")?);
//!     let target = SshTarget::new("10.0.0.12", "deploy", key);
//!
//!     let up = ComposeCommands::default().up("/srv/shop", 120);
//!     let output = executor.run(&target, &up).await?;
//!     println!("Exit code: {}", output.exit_code);
//!
//!     Ok(())
//! }
//! ```

pub mod compose;
pub mod config;
pub mod error;
pub mod executor;
pub mod mock;
pub mod ssh;

pub use compose::{parse_container_count, shell_quote, ComposeAction, ComposeCommands};
pub use config::{PrivateKey, RemoteCommand, SshTarget};
pub use error::{ExecError, ExecResult};
pub use executor::{truncate_tail, ExecOutput, RemoteExecutor};
pub use mock::{CapturedCall, MockExecutor, MockResponse};
pub use ssh::{SshExecutor, SshOptions};
