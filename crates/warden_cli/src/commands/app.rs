//! Application commands.

use anyhow::Result;
use clap::{Args, Subcommand};
use tracing::info;

use warden_core::{format_elapsed, AppState, ApplicationStatus, ApplicationUpdate, NewApplication};

use super::context::CommandContext;

#[derive(Subcommand)]
pub enum AppCommand {
    /// Register an application
    Create(CreateArgs),
    /// List applications
    List(ListArgs),
    /// Show one application
    Status(AppRef),
    /// Bring an application up
    Start(AppRef),
    /// Take an application down
    Stop(AppRef),
    /// Change the auto-stop duration
    #[command(name = "set-timeout")]
    SetTimeout(SetTimeoutArgs),
    /// Edit an application
    Update(UpdateArgs),
    /// Delete an application
    Delete(DeleteArgs),
}

#[derive(Args)]
pub struct AppRef {
    /// Application name or id
    pub app: String,
}

#[derive(Args)]
pub struct CreateArgs {
    #[arg(long)]
    pub name: String,

    /// Project name or id
    #[arg(long)]
    pub project: String,

    /// Server name or id
    #[arg(long)]
    pub server: String,

    /// Public domain (informational)
    #[arg(long, default_value = "")]
    pub domain: String,

    /// Compose directory on the server
    #[arg(long = "dir")]
    pub working_directory: String,

    /// Minutes before an automatic stop (defaults to configuration)
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub auto_stop: Option<u32>,
}

#[derive(Args)]
pub struct ListArgs {
    /// Only applications of this project
    #[arg(long)]
    pub project: Option<String>,

    /// Only applications on this server
    #[arg(long)]
    pub server: Option<String>,
}

#[derive(Args)]
pub struct SetTimeoutArgs {
    /// Application name or id
    pub app: String,

    /// New auto-stop duration in minutes
    #[arg(value_parser = clap::value_parser!(u32).range(1..))]
    pub minutes: u32,
}

#[derive(Args)]
pub struct UpdateArgs {
    /// Application name or id
    pub app: String,

    #[arg(long)]
    pub name: Option<String>,

    #[arg(long)]
    pub project: Option<String>,

    #[arg(long)]
    pub server: Option<String>,

    #[arg(long)]
    pub domain: Option<String>,

    #[arg(long = "dir")]
    pub working_directory: Option<String>,

    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub auto_stop: Option<u32>,
}

#[derive(Args)]
pub struct DeleteArgs {
    /// Application name or id
    pub app: String,

    /// Stop the application first if it is running
    #[arg(long)]
    pub force: bool,
}

pub async fn execute(ctx: &CommandContext, command: AppCommand) -> Result<()> {
    match command {
        AppCommand::Create(args) => create(ctx, args),
        AppCommand::List(args) => list(ctx, args),
        AppCommand::Status(args) => status(ctx, args),
        AppCommand::Start(args) => start(ctx, args).await,
        AppCommand::Stop(args) => stop(ctx, args).await,
        AppCommand::SetTimeout(args) => set_timeout(ctx, args).await,
        AppCommand::Update(args) => update(ctx, args).await,
        AppCommand::Delete(args) => delete(ctx, args).await,
    }
}

fn create(ctx: &CommandContext, args: CreateArgs) -> Result<()> {
    let new = NewApplication {
        name: args.name,
        project_id: ctx.resolve_project(&args.project)?,
        server_id: ctx.resolve_server(&args.server)?,
        domain: args.domain,
        working_directory: args.working_directory,
        auto_stop_minutes: args.auto_stop,
    };
    let status = ctx.orchestrator.create_application(new, &ctx.requester)?;

    if ctx.json {
        return ctx.print_json(&status);
    }
    println!("✅ Created application {} ({})", status.application.name, status.application.id);
    println!("   Auto-stop: {} min", status.application.auto_stop_minutes);
    Ok(())
}

fn list(ctx: &CommandContext, args: ListArgs) -> Result<()> {
    let apps = match (&args.project, &args.server) {
        (Some(project), _) => {
            let mut apps = ctx.orchestrator.list_by_project(ctx.resolve_project(project)?)?;
            if let Some(server) = &args.server {
                let server_id = ctx.resolve_server(server)?;
                apps.retain(|s| s.application.server_id == server_id);
            }
            apps
        }
        (None, Some(server)) => ctx.orchestrator.list_by_server(ctx.resolve_server(server)?)?,
        (None, None) => ctx.orchestrator.list_applications()?,
    };

    if ctx.json {
        return ctx.print_json(&apps);
    }
    if apps.is_empty() {
        println!("No applications.");
        return Ok(());
    }
    println!("{:<24} {:<10} {:<14} {}", "NAME", "STATE", "REMAINING", "URL");
    for status in &apps {
        println!(
            "{:<24} {:<10} {:<14} {}",
            status.application.name,
            status.application.state,
            remaining(status),
            status.app_url
        );
    }
    Ok(())
}

fn status(ctx: &CommandContext, args: AppRef) -> Result<()> {
    let status = ctx.orchestrator.get_state(ctx.resolve_app(&args.app)?)?;
    if ctx.json {
        return ctx.print_json(&status);
    }
    print_status(ctx, &status)
}

fn print_status(ctx: &CommandContext, status: &ApplicationStatus) -> Result<()> {
    let app = &status.application;
    let server = ctx.orchestrator.get_server(app.server_id)?;
    let project = ctx.orchestrator.get_project(app.project_id)?;

    println!("📦 {} ({})", app.name, app.id);
    println!("   State:      {}", app.state);
    println!("   Project:    {}", project.name);
    println!("   Server:     {} [{}]", server.name, server.reachability);
    println!("   Directory:  {}", app.working_directory);
    if !status.app_url.is_empty() {
        println!("   URL:        {}", status.app_url);
    }
    println!("   Auto-stop:  {} min", app.auto_stop_minutes);
    if let Some(started_at) = app.started_at {
        println!("   Started:    {}", started_at.to_rfc3339());
    }
    if let Some(deadline) = status.deadline_at {
        println!("   Stops at:   {} ({})", deadline.to_rfc3339(), remaining(status));
    } else if app.state == AppState::Running {
        println!("   Stops at:   unknown (is `warden serve` running?)");
    }
    if let Some(error) = &app.last_error {
        println!("   ⚠️  Last error: {}", error);
    }
    Ok(())
}

fn remaining(status: &ApplicationStatus) -> String {
    status
        .remaining_seconds
        .map(format_elapsed)
        .unwrap_or_else(|| "-".to_string())
}

async fn start(ctx: &CommandContext, args: AppRef) -> Result<()> {
    let app_id = ctx.resolve_app(&args.app)?;
    info!("Starting application: {}", args.app);
    let outcome = ctx.orchestrator.start(app_id, &ctx.requester).await?;

    if ctx.json {
        return ctx.print_json(&outcome);
    }
    println!("✅ {} is running", args.app);
    println!("   Granted:  {} min", outcome.duration_granted_minutes);
    println!("   Stops at: {}", outcome.deadline_at.to_rfc3339());
    if !outcome.app_url.is_empty() {
        println!("   URL:      {}", outcome.app_url);
    }
    if !outcome.output.is_empty() {
        println!("\n{}", outcome.output);
    }
    Ok(())
}

async fn stop(ctx: &CommandContext, args: AppRef) -> Result<()> {
    let app_id = ctx.resolve_app(&args.app)?;
    info!("Stopping application: {}", args.app);
    let outcome = ctx.orchestrator.stop(app_id, &ctx.requester).await?;

    if ctx.json {
        return ctx.print_json(&outcome);
    }
    match outcome.ran_for_seconds {
        Some(secs) => println!("✅ {} stopped after {}", args.app, format_elapsed(secs)),
        None => println!("✅ {} is stopped", args.app),
    }
    if !outcome.output.is_empty() {
        println!("\n{}", outcome.output);
    }
    Ok(())
}

async fn set_timeout(ctx: &CommandContext, args: SetTimeoutArgs) -> Result<()> {
    let app_id = ctx.resolve_app(&args.app)?;
    let status = ctx
        .orchestrator
        .update_auto_stop_minutes(app_id, args.minutes, &ctx.requester)
        .await?;

    if ctx.json {
        return ctx.print_json(&status);
    }
    println!("✅ Auto-stop for {} set to {} min", args.app, args.minutes);
    if let Some(deadline) = status.deadline_at {
        println!("   Stops at: {}", deadline.to_rfc3339());
    }
    Ok(())
}

async fn update(ctx: &CommandContext, args: UpdateArgs) -> Result<()> {
    let app_id = ctx.resolve_app(&args.app)?;
    let update = ApplicationUpdate {
        name: args.name,
        project_id: args.project.as_deref().map(|p| ctx.resolve_project(p)).transpose()?,
        server_id: args.server.as_deref().map(|s| ctx.resolve_server(s)).transpose()?,
        domain: args.domain,
        working_directory: args.working_directory,
        auto_stop_minutes: args.auto_stop,
    };
    let status = ctx
        .orchestrator
        .update_application(app_id, update, &ctx.requester)
        .await?;

    if ctx.json {
        return ctx.print_json(&status);
    }
    println!("✅ Updated application {}", status.application.name);
    Ok(())
}

async fn delete(ctx: &CommandContext, args: DeleteArgs) -> Result<()> {
    let app_id = ctx.resolve_app(&args.app)?;
    ctx.orchestrator
        .delete_application(app_id, args.force, &ctx.requester)
        .await?;
    if !ctx.json {
        println!("🗑️  Deleted application {}", args.app);
    }
    Ok(())
}
