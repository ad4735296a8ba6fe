//! Audit trail commands.

use anyhow::Result;
use clap::{Args, Subcommand, ValueEnum};
use uuid::Uuid;

use warden_core::{AuditAction, AuditFilter, AuditOutcome, JsonlAuditSink, ResourceType};

use super::context::CommandContext;

#[derive(Subcommand)]
pub enum AuditCommand {
    /// List audit events, newest first
    List(ListArgs),
}

#[derive(Clone, Copy, ValueEnum)]
pub enum OutcomeArg {
    Success,
    Failure,
}

impl From<OutcomeArg> for AuditOutcome {
    fn from(value: OutcomeArg) -> Self {
        match value {
            OutcomeArg::Success => AuditOutcome::Success,
            OutcomeArg::Failure => AuditOutcome::Failure,
        }
    }
}

#[derive(Args)]
pub struct ListArgs {
    /// Only events by this actor ("system" for automatic stops)
    #[arg(long)]
    pub actor: Option<String>,

    /// Only this action, e.g. start_app or stop_app
    #[arg(long, value_parser = parse_action)]
    pub action: Option<AuditAction>,

    /// Only this resource type: app, server or project
    #[arg(long, value_parser = parse_resource_type)]
    pub resource_type: Option<ResourceType>,

    /// Only events about this resource id
    #[arg(long)]
    pub resource_id: Option<Uuid>,

    #[arg(long, value_enum)]
    pub outcome: Option<OutcomeArg>,

    #[arg(long, default_value_t = 50)]
    pub limit: usize,

    #[arg(long, default_value_t = 0)]
    pub offset: usize,
}

fn parse_action(value: &str) -> Result<AuditAction, String> {
    AuditAction::parse(value).ok_or_else(|| format!("unknown audit action: {}", value))
}

fn parse_resource_type(value: &str) -> Result<ResourceType, String> {
    ResourceType::parse(value).ok_or_else(|| format!("unknown resource type: {}", value))
}

pub async fn execute(ctx: &CommandContext, command: AuditCommand) -> Result<()> {
    match command {
        AuditCommand::List(args) => list(ctx, args),
    }
}

fn list(ctx: &CommandContext, args: ListArgs) -> Result<()> {
    let filter = AuditFilter {
        actor: args.actor,
        action: args.action,
        resource_type: args.resource_type,
        resource_id: args.resource_id,
        outcome: args.outcome.map(Into::into),
    };
    let sink = JsonlAuditSink::open(ctx.config.audit_log_path())?;
    let page = sink.query(&filter, args.limit, args.offset)?;

    if ctx.json {
        return ctx.print_json(&page);
    }
    if page.events.is_empty() {
        println!("No audit events.");
        return Ok(());
    }
    for event in &page.events {
        let icon = match event.outcome {
            AuditOutcome::Success => "✅",
            AuditOutcome::Failure => "❌",
        };
        println!(
            "{} {} {:<10} {:<14} {} {}",
            icon,
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.actor,
            event.action,
            event.resource_name,
            event.detail
        );
    }
    println!(
        "\nShowing {}-{} of {}",
        args.offset + 1,
        args.offset + page.events.len(),
        page.total
    );
    Ok(())
}
