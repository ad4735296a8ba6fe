//! Append-only audit trail.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::CoreResult;

/// Network metadata of the client that issued a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientMeta {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

/// An authenticated caller. The core trusts the caller's admin gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub username: String,
    pub client: ClientMeta,
}

impl Requester {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            client: ClientMeta::default(),
        }
    }

    pub fn with_client(mut self, client: ClientMeta) -> Self {
        self.client = client;
        self
    }
}

/// Who performed an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    /// The deadline scheduler or recovery.
    System,
    User(Requester),
}

impl Actor {
    pub fn name(&self) -> &str {
        match self {
            Self::System => "system",
            Self::User(requester) => &requester.username,
        }
    }

    fn client(&self) -> ClientMeta {
        match self {
            Self::System => ClientMeta::default(),
            Self::User(requester) => requester.client.clone(),
        }
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    StartApp,
    StopApp,
    CreateServer,
    UpdateServer,
    DeleteServer,
    CheckServer,
    CreateProject,
    UpdateProject,
    DeleteProject,
    CreateApp,
    UpdateApp,
    DeleteApp,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartApp => "start_app",
            Self::StopApp => "stop_app",
            Self::CreateServer => "create_server",
            Self::UpdateServer => "update_server",
            Self::DeleteServer => "delete_server",
            Self::CheckServer => "check_server",
            Self::CreateProject => "create_project",
            Self::UpdateProject => "update_project",
            Self::DeleteProject => "delete_project",
            Self::CreateApp => "create_app",
            Self::UpdateApp => "update_app",
            Self::DeleteApp => "delete_app",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let action = match value {
            "start_app" => Self::StartApp,
            "stop_app" => Self::StopApp,
            "create_server" => Self::CreateServer,
            "update_server" => Self::UpdateServer,
            "delete_server" => Self::DeleteServer,
            "check_server" => Self::CheckServer,
            "create_project" => Self::CreateProject,
            "update_project" => Self::UpdateProject,
            "delete_project" => Self::DeleteProject,
            "create_app" => Self::CreateApp,
            "update_app" => Self::UpdateApp,
            "delete_app" => Self::DeleteApp,
            _ => return None,
        };
        Some(action)
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    App,
    Server,
    Project,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::App => "app",
            Self::Server => "server",
            Self::Project => "project",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "app" => Some(Self::App),
            "server" => Some(Self::Server),
            "project" => Some(Self::Project),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
}

/// One immutable audit record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub id: Uuid,
    pub actor: String,
    pub action: AuditAction,
    pub resource_type: ResourceType,
    pub resource_id: Uuid,
    pub resource_name: String,
    pub detail: String,
    pub outcome: AuditOutcome,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub client: ClientMeta,
}

impl AuditEvent {
    pub fn new(
        actor: &Actor,
        action: AuditAction,
        resource_type: ResourceType,
        resource_id: Uuid,
        resource_name: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor: actor.name().to_string(),
            action,
            resource_type,
            resource_id,
            resource_name: resource_name.into(),
            detail: String::new(),
            outcome: AuditOutcome::Success,
            timestamp: Utc::now(),
            client: actor.client(),
        }
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn failed(mut self) -> Self {
        self.outcome = AuditOutcome::Failure;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Destination for audit events.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent) -> CoreResult<()>;
}

/// Query filter. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub actor: Option<String>,
    pub action: Option<AuditAction>,
    pub resource_type: Option<ResourceType>,
    pub resource_id: Option<Uuid>,
    pub outcome: Option<AuditOutcome>,
}

impl AuditFilter {
    pub fn matches(&self, event: &AuditEvent) -> bool {
        self.actor.as_deref().map_or(true, |a| a == event.actor)
            && self.action.map_or(true, |a| a == event.action)
            && self.resource_type.map_or(true, |t| t == event.resource_type)
            && self.resource_id.map_or(true, |id| id == event.resource_id)
            && self.outcome.map_or(true, |o| o == event.outcome)
    }
}

/// One page of events, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct AuditPage {
    pub events: Vec<AuditEvent>,
    /// Matching events across all pages
    pub total: usize,
}

fn paginate(mut matching: Vec<AuditEvent>, limit: usize, offset: usize) -> AuditPage {
    matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    let total = matching.len();
    let events = matching.into_iter().skip(offset).take(limit).collect();
    AuditPage { events, total }
}

/// JSON-lines audit log.
#[derive(Debug)]
pub struct JsonlAuditSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlAuditSink {
    pub fn open(path: impl Into<PathBuf>) -> CoreResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Filtered, newest-first page of events.
    pub fn query(
        &self,
        filter: &AuditFilter,
        limit: usize,
        offset: usize,
    ) -> CoreResult<AuditPage> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut matching = Vec::new();

        for (number, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEvent>(&line) {
                Ok(event) if filter.matches(&event) => matching.push(event),
                Ok(_) => {}
                Err(e) => warn!("Skipping malformed audit line {}: {}", number + 1, e),
            }
        }

        Ok(paginate(matching, limit, offset))
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, event: AuditEvent) -> CoreResult<()> {
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');
        let mut file = self.file.lock();
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

/// In-memory sink for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events in append order.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn events_for(&self, resource_id: Uuid) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.resource_id == resource_id)
            .cloned()
            .collect()
    }

    pub fn query(&self, filter: &AuditFilter, limit: usize, offset: usize) -> AuditPage {
        let matching = self
            .events
            .lock()
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        paginate(matching, limit, offset)
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) -> CoreResult<()> {
        self.events.lock().push(event);
        Ok(())
    }
}
