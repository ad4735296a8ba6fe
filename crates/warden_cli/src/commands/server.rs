//! Server commands.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use serde_json::json;
use tracing::{info, warn};

use warden_core::{
    CredentialStore, HealthReport, NewServer, Reachability, SecretHandle, ServerInfo, ServerUpdate,
};
use warden_exec::PrivateKey;

use super::context::CommandContext;

#[derive(Subcommand)]
pub enum ServerCommand {
    /// Register a server and store its private key
    Add(AddArgs),
    /// List servers with their last known reachability
    List,
    /// Edit a server
    Update(UpdateArgs),
    /// Remove a server that no application references
    Remove(ServerRef),
    /// Probe one server now
    Check(ServerRef),
    /// Probe every server
    Refresh,
}

#[derive(Args)]
pub struct ServerRef {
    /// Server name or id
    pub server: String,
}

#[derive(Args)]
pub struct AddArgs {
    #[arg(long)]
    pub name: String,

    /// Hostname or IP address
    #[arg(long)]
    pub address: String,

    #[arg(long, default_value_t = 22, value_parser = clap::value_parser!(u16).range(1..))]
    pub port: u16,

    #[arg(long = "ssh-user")]
    pub user: String,

    /// PEM private key to store for this server
    #[arg(long)]
    pub key_file: PathBuf,

    /// Credential handle (defaults to one derived from the name)
    #[arg(long)]
    pub key_handle: Option<String>,
}

#[derive(Args)]
pub struct UpdateArgs {
    /// Server name or id
    pub server: String,

    #[arg(long)]
    pub name: Option<String>,

    #[arg(long)]
    pub address: Option<String>,

    #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
    pub port: Option<u16>,

    #[arg(long = "ssh-user")]
    pub user: Option<String>,

    /// Replace the stored private key
    #[arg(long)]
    pub key_file: Option<PathBuf>,

    /// Point the server at another stored credential
    #[arg(long)]
    pub key_handle: Option<String>,
}

pub async fn execute(ctx: &CommandContext, command: ServerCommand) -> Result<()> {
    match command {
        ServerCommand::Add(args) => add(ctx, args),
        ServerCommand::List => list(ctx),
        ServerCommand::Update(args) => update(ctx, args),
        ServerCommand::Remove(args) => remove(ctx, args),
        ServerCommand::Check(args) => check(ctx, args).await,
        ServerCommand::Refresh => refresh(ctx).await,
    }
}

fn add(ctx: &CommandContext, args: AddArgs) -> Result<()> {
    let handle = SecretHandle::new(
        args.key_handle
            .clone()
            .unwrap_or_else(|| handle_from_name(&args.name)),
    );
    let key = read_key(&args.key_file)?;
    let credentials = ctx.credentials()?;
    credentials
        .store(&handle, &key)
        .context("Failed to store private key")?;

    let new = NewServer {
        name: args.name,
        address: args.address,
        port: Some(args.port),
        user: args.user,
        credential: handle.clone(),
    };
    let server = match ctx.orchestrator.create_server(new, &ctx.requester) {
        Ok(server) => server,
        Err(e) => {
            // Only drop the key if this command introduced the handle.
            if args.key_handle.is_none() {
                if let Err(cleanup) = credentials.remove(&handle) {
                    warn!("Failed to remove key {}: {}", handle.as_str(), cleanup);
                }
            }
            return Err(e.into());
        }
    };
    info!(server = %server.name, "Server registered");

    if ctx.json {
        return ctx.print_json(&server);
    }
    println!("✅ Registered server {} ({})", server.name, server.id);
    println!("   {}", endpoint(&server));
    println!("   Run `warden server check {}` to probe it.", server.name);
    Ok(())
}

fn list(ctx: &CommandContext) -> Result<()> {
    let servers = ctx.orchestrator.list_servers()?;
    if ctx.json {
        return ctx.print_json(&servers);
    }
    if servers.is_empty() {
        println!("No servers.");
        return Ok(());
    }
    println!(
        "{:<20} {:<28} {:<9} {:<11} {}",
        "NAME", "ENDPOINT", "STATUS", "CONTAINERS", "LAST CHECKED"
    );
    for server in &servers {
        println!(
            "{:<20} {:<28} {:<9} {:<11} {}",
            server.name,
            endpoint(server),
            server.reachability,
            server
                .running_containers
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".into()),
            server
                .last_checked
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".into())
        );
    }
    Ok(())
}

fn update(ctx: &CommandContext, args: UpdateArgs) -> Result<()> {
    let id = ctx.resolve_server(&args.server)?;
    if args.key_file.is_some() && args.key_handle.is_none() {
        bail!("--key-file requires --key-handle when updating a server");
    }
    if let (Some(path), Some(handle)) = (&args.key_file, &args.key_handle) {
        let key = read_key(path)?;
        ctx.credentials()?
            .store(&SecretHandle::new(handle.as_str()), &key)
            .context("Failed to store private key")?;
    }

    let update = ServerUpdate {
        name: args.name,
        address: args.address,
        port: args.port,
        user: args.user,
        credential: args.key_handle.map(SecretHandle::new),
    };
    let server = ctx.orchestrator.update_server(id, update, &ctx.requester)?;

    if ctx.json {
        return ctx.print_json(&server);
    }
    println!("✅ Updated server {}", server.name);
    if server.reachability == Reachability::Unknown {
        println!("   Connection settings changed; reachability will be re-checked.");
    }
    Ok(())
}

fn remove(ctx: &CommandContext, args: ServerRef) -> Result<()> {
    let id = ctx.resolve_server(&args.server)?;
    ctx.orchestrator.delete_server(id, &ctx.requester)?;
    if !ctx.json {
        println!("🗑️  Removed server {}", args.server);
    }
    Ok(())
}

async fn check(ctx: &CommandContext, args: ServerRef) -> Result<()> {
    let id = ctx.resolve_server(&args.server)?;
    info!("Checking server: {}", args.server);
    let report = ctx.orchestrator.check_server(id, &ctx.requester).await?;

    if ctx.json {
        return ctx.print_json(&report_json(&report));
    }
    print_report(&report);
    Ok(())
}

async fn refresh(ctx: &CommandContext) -> Result<()> {
    let reports = ctx.orchestrator.refresh_all().await?;
    if ctx.json {
        let values: Vec<_> = reports.iter().map(report_json).collect();
        return ctx.print_json(&values);
    }
    if reports.is_empty() {
        println!("No servers.");
    }
    for report in &reports {
        print_report(report);
    }
    Ok(())
}

fn print_report(report: &HealthReport) {
    let icon = match report.reachability() {
        Reachability::Online => "✅",
        Reachability::Offline => "❌",
        Reachability::Unknown => "❔",
    };
    println!(
        "{} {} is {}: {}",
        icon,
        report.server.name,
        report.reachability(),
        report.detail
    );
}

fn report_json(report: &HealthReport) -> serde_json::Value {
    json!({
        "server": report.server,
        "reachability": report.reachability(),
        "detail": report.detail,
    })
}

fn read_key(path: &Path) -> Result<PrivateKey> {
    let material = fs::read_to_string(path)
        .with_context(|| format!("Failed to read key file {}", path.display()))?;
    let key = PrivateKey::new(material);
    if key.is_empty() {
        bail!("Key file {} is empty", path.display());
    }
    Ok(key)
}

/// Credential handle for a server name: lowercase, unsafe characters
/// replaced with `-`.
fn handle_from_name(name: &str) -> String {
    let handle: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let handle = handle.trim_matches('-');
    if handle.is_empty() {
        "server".to_string()
    } else {
        handle.to_string()
    }
}

fn endpoint(server: &ServerInfo) -> String {
    format!("{}@{}:{}", server.user, server.address, server.port)
}
