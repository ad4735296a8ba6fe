//! CLI command definitions.
//!
//! This module defines the command structure for the Warden CLI. Lifecycle
//! and admin commands run once and exit; `serve` keeps the deadline
//! scheduler and health sweep alive.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod app;
pub mod audit;
pub mod context;
pub mod project;
pub mod serve;
pub mod server;

/// Warden - start, stop and auto-stop compose apps across SSH servers
#[derive(Parser)]
#[command(name = "warden")]
#[command(version, about = "Warden - fleet application lifecycle orchestrator")]
#[command(long_about = r#"
Warden starts and stops docker-compose applications on remote servers over
SSH, and stops them again automatically once their granted time runs out.

COMMANDS:
  serve     → Run the auto-stop scheduler and periodic health checks
  app       → Create, start, stop and inspect applications
  server    → Register servers and check their reachability
  project   → Group applications into projects
  audit     → Browse the audit trail

Auto-stop deadlines fire only while `warden serve` is running.

EXIT CODES:
  0 - Success
  1 - General error
  2 - Invalid arguments
  3 - Not found
  4 - Rejected (busy, already running, still referenced)
  5 - Remote failure (offline, command failed, timeout)
"#)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true, env = "WARDEN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Name recorded as the actor in the audit trail
    #[arg(short, long, global = true, env = "WARDEN_USER")]
    pub user: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the deadline scheduler and health sweep until interrupted
    Serve(serve::ServeArgs),

    /// Manage applications
    #[command(subcommand)]
    App(app::AppCommand),

    /// Manage servers
    #[command(subcommand)]
    Server(server::ServerCommand),

    /// Manage projects
    #[command(subcommand)]
    Project(project::ProjectCommand),

    /// Inspect the audit trail
    #[command(subcommand)]
    Audit(audit::AuditCommand),
}
