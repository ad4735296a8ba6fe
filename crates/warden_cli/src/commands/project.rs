//! Project commands.

use anyhow::Result;
use clap::{Args, Subcommand};

use warden_core::{NewProject, ProjectUpdate};

use super::context::CommandContext;

#[derive(Subcommand)]
pub enum ProjectCommand {
    /// Create a project
    Add(AddArgs),
    /// List projects
    List,
    /// Rename or describe a project
    Update(UpdateArgs),
    /// Remove a project without applications
    Remove(ProjectRef),
}

#[derive(Args)]
pub struct ProjectRef {
    /// Project name or id
    pub project: String,
}

#[derive(Args)]
pub struct AddArgs {
    /// Project name (unique, case-insensitive)
    pub name: String,

    #[arg(short, long)]
    pub description: Option<String>,
}

#[derive(Args)]
pub struct UpdateArgs {
    /// Project name or id
    pub project: String,

    #[arg(long)]
    pub name: Option<String>,

    /// New description; an empty string clears it
    #[arg(short, long)]
    pub description: Option<String>,
}

pub async fn execute(ctx: &CommandContext, command: ProjectCommand) -> Result<()> {
    match command {
        ProjectCommand::Add(args) => {
            let project = ctx.orchestrator.create_project(
                NewProject {
                    name: args.name,
                    description: args.description,
                },
                &ctx.requester,
            )?;
            if ctx.json {
                return ctx.print_json(&project);
            }
            println!("✅ Created project {} ({})", project.name, project.id);
        }
        ProjectCommand::List => {
            let projects = ctx.orchestrator.list_projects()?;
            if ctx.json {
                return ctx.print_json(&projects);
            }
            if projects.is_empty() {
                println!("No projects.");
            }
            let apps = ctx.orchestrator.list_applications()?;
            for project in &projects {
                let count = apps
                    .iter()
                    .filter(|s| s.application.project_id == project.id)
                    .count();
                println!(
                    "📁 {} ({} apps){}",
                    project.name,
                    count,
                    project
                        .description
                        .as_deref()
                        .map(|d| format!(" - {}", d))
                        .unwrap_or_default()
                );
            }
        }
        ProjectCommand::Update(args) => {
            let id = ctx.resolve_project(&args.project)?;
            let project = ctx.orchestrator.update_project(
                id,
                ProjectUpdate {
                    name: args.name,
                    description: args.description,
                },
                &ctx.requester,
            )?;
            if ctx.json {
                return ctx.print_json(&project);
            }
            println!("✅ Updated project {}", project.name);
        }
        ProjectCommand::Remove(args) => {
            let id = ctx.resolve_project(&args.project)?;
            ctx.orchestrator.delete_project(id, &ctx.requester)?;
            if !ctx.json {
                println!("🗑️  Removed project {}", args.project);
            }
        }
    }
    Ok(())
}
