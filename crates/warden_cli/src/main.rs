//! Warden CLI - Main entry point.
//!
//! Exit codes:
//! - 0: Success
//! - 1: General error
//! - 2: Invalid arguments
//! - 3: Not found
//! - 4: Rejected
//! - 5: Remote failure

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use warden_core::{CoreError, ErrorKind};

mod commands;

use commands::context::CommandContext;
use commands::{Cli, Commands};

/// CI-friendly exit codes
pub struct ExitCodes;

impl ExitCodes {
    pub const SUCCESS: u8 = 0;
    pub const GENERAL_ERROR: u8 = 1;
    pub const INVALID_ARGS: u8 = 2;
    pub const NOT_FOUND: u8 = 3;
    pub const REJECTED: u8 = 4;
    pub const REMOTE_FAILURE: u8 = 5;
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    let result = run(cli).await;

    match result {
        Ok(()) => ExitCode::from(ExitCodes::SUCCESS),
        Err(e) => {
            let exit_code = categorize_error(&e);
            eprintln!("❌ Error: {:#}", e);
            ExitCode::from(exit_code)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let ctx = CommandContext::open(cli.config.as_deref(), cli.user, cli.json)?;

    match cli.command {
        Commands::Serve(args) => commands::serve::execute(&ctx, args).await,
        Commands::App(cmd) => commands::app::execute(&ctx, cmd).await,
        Commands::Server(cmd) => commands::server::execute(&ctx, cmd).await,
        Commands::Project(cmd) => commands::project::execute(&ctx, cmd).await,
        Commands::Audit(cmd) => commands::audit::execute(&ctx, cmd).await,
    }
}

fn init_logging(verbose: bool, json: bool) {
    let default_level = if verbose { "warden=debug,warn" } else { "warden=info,warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // A subscriber may already be installed, e.g. under test harnesses.
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        let _ = registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init();
    }
}

/// Categorize error to determine exit code
fn categorize_error(e: &anyhow::Error) -> u8 {
    let Some(core) = e.chain().find_map(|cause| cause.downcast_ref::<CoreError>()) else {
        return ExitCodes::GENERAL_ERROR;
    };

    match core.kind() {
        ErrorKind::NotFound => ExitCodes::NOT_FOUND,
        ErrorKind::InvalidInput => ExitCodes::INVALID_ARGS,
        ErrorKind::AlreadyRunning
        | ErrorKind::NotRunning
        | ErrorKind::ConcurrencyRejected
        | ErrorKind::InvalidState
        | ErrorKind::InUse
        | ErrorKind::Conflict => ExitCodes::REJECTED,
        ErrorKind::ServerOffline | ErrorKind::ExecutionFailed | ErrorKind::Timeout => {
            ExitCodes::REMOTE_FAILURE
        }
        ErrorKind::Credential | ErrorKind::Storage => ExitCodes::GENERAL_ERROR,
    }
}
