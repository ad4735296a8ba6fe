//! Shared state for one CLI invocation.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use uuid::Uuid;

use warden_core::{
    AppId, ClientMeta, CoreError, FileCredentialStore, Orchestrator, ProjectId, Requester,
    ServerId, WardenConfig,
};

pub struct CommandContext {
    pub config: WardenConfig,
    pub orchestrator: Arc<Orchestrator>,
    pub requester: Requester,
    pub json: bool,
}

impl CommandContext {
    /// Load configuration and open the store for a one-shot command.
    pub fn open(config_path: Option<&Path>, user: Option<String>, json: bool) -> Result<Self> {
        let config = WardenConfig::load(config_path).context("Failed to load configuration")?;
        let orchestrator = Orchestrator::from_config(&config).with_context(|| {
            format!("Failed to open data directory {}", config.data_dir.display())
        })?;
        // Show deadlines tracked by the daemon; never touches records.
        orchestrator.resync_deadlines()?;

        Ok(Self::from_parts(config, orchestrator, requester_for(user), json))
    }

    pub fn from_parts(
        config: WardenConfig,
        orchestrator: Arc<Orchestrator>,
        requester: Requester,
        json: bool,
    ) -> Self {
        Self {
            config,
            orchestrator,
            requester,
            json,
        }
    }

    pub fn credentials(&self) -> Result<FileCredentialStore> {
        Ok(FileCredentialStore::from_config(&self.config)?)
    }

    /// Application by id or unique name.
    pub fn resolve_app(&self, reference: &str) -> Result<AppId> {
        let apps = self.orchestrator.list_applications()?;
        let candidates = apps
            .iter()
            .map(|s| (s.application.id, s.application.name.as_str()));
        Ok(resolve("Application", reference, candidates)?)
    }

    pub fn resolve_server(&self, reference: &str) -> Result<ServerId> {
        let servers = self.orchestrator.list_servers()?;
        let candidates = servers.iter().map(|s| (s.id, s.name.as_str()));
        Ok(resolve("Server", reference, candidates)?)
    }

    pub fn resolve_project(&self, reference: &str) -> Result<ProjectId> {
        let projects = self.orchestrator.list_projects()?;
        let candidates = projects.iter().map(|p| (p.id, p.name.as_str()));
        Ok(resolve("Project", reference, candidates)?)
    }

    pub fn print_json<T: Serialize>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

fn requester_for(user: Option<String>) -> Requester {
    let username = user
        .or_else(|| std::env::var("USER").ok())
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| "operator".to_string());

    Requester::new(username).with_client(ClientMeta {
        ip: None,
        user_agent: Some(format!("warden-cli/{}", env!("CARGO_PKG_VERSION"))),
    })
}

/// Match `reference` against ids first, then names (case-insensitive).
fn resolve<'a>(
    resource: &'static str,
    reference: &str,
    candidates: impl Iterator<Item = (Uuid, &'a str)>,
) -> Result<Uuid, CoreError> {
    let reference = reference.trim();
    let candidates: Vec<(Uuid, &str)> = candidates.collect();

    if let Ok(id) = Uuid::parse_str(reference) {
        if candidates.iter().any(|(c, _)| *c == id) {
            return Ok(id);
        }
        return Err(CoreError::not_found(resource, id));
    }

    let matches: Vec<Uuid> = candidates
        .iter()
        .filter(|(_, name)| name.eq_ignore_ascii_case(reference))
        .map(|(id, _)| *id)
        .collect();

    match matches.as_slice() {
        [id] => Ok(*id),
        [] => Err(CoreError::not_found(resource, reference)),
        _ => Err(CoreError::Conflict(format!(
            "{} {} names {} records; use the id",
            resource,
            reference,
            matches.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_by_name_and_id() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let candidates = || vec![(a, "web"), (b, "api")].into_iter();

        assert_eq!(resolve("Application", "WEB", candidates()).unwrap(), a);
        assert_eq!(resolve("Application", &b.to_string(), candidates()).unwrap(), b);
    }

    #[test]
    fn test_resolve_missing() {
        let candidates = vec![(Uuid::new_v4(), "edge-1")];
        let err = resolve("Server", "edge-9", candidates.into_iter()).unwrap_err();
        assert!(matches!(err, CoreError::NotFound { resource: "Server", .. }));

        let err = resolve("Server", &Uuid::new_v4().to_string(), std::iter::empty()).unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[test]
    fn test_resolve_ambiguous_name() {
        let candidates = vec![(Uuid::new_v4(), "web"), (Uuid::new_v4(), "web")].into_iter();
        let err = resolve("Application", "web", candidates).unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[test]
    fn test_requester_prefers_explicit_user() {
        let requester = requester_for(Some("alice".into()));
        assert_eq!(requester.username, "alice");
        assert!(requester
            .client
            .user_agent
            .unwrap()
            .starts_with("warden-cli/"));
    }
}
