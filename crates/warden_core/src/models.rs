//! Fleet records: servers, projects, applications and the views handed to
//! callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::lifecycle::AppState;

pub type ServerId = Uuid;
pub type ProjectId = Uuid;
pub type AppId = Uuid;

/// Opaque reference to a private key held by a credential store.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretHandle(String);

impl SecretHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretHandle({})", self.0)
    }
}

/// Last-probed status of a server.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Reachability {
    #[default]
    Unknown,
    Online,
    Offline,
}

impl Reachability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

impl std::fmt::Display for Reachability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A remote host reachable over SSH.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub id: ServerId,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub user: String,
    pub credential: SecretHandle,
    #[serde(default)]
    pub reachability: Reachability,
    #[serde(default)]
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(default)]
    pub running_containers: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Server {
    pub fn info(&self) -> ServerInfo {
        ServerInfo {
            id: self.id,
            name: self.name.clone(),
            address: self.address.clone(),
            port: self.port,
            user: self.user.clone(),
            reachability: self.reachability,
            last_checked: self.last_checked,
            running_containers: self.running_containers,
        }
    }
}

/// Public server view. Never carries the credential handle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerInfo {
    pub id: ServerId,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub user: String,
    pub reachability: Reachability,
    pub last_checked: Option<DateTime<Utc>>,
    pub running_containers: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct NewServer {
    pub name: String,
    pub address: String,
    pub port: Option<u16>,
    pub user: String,
    pub credential: SecretHandle,
}

impl NewServer {
    pub fn validate(&self) -> CoreResult<()> {
        require_non_empty("server name", &self.name)?;
        require_non_empty("server address", &self.address)?;
        require_non_empty("ssh user", &self.user)?;
        require_non_empty("credential handle", self.credential.as_str())?;
        require_port(self.port)
    }

    pub(crate) fn into_server(self, now: DateTime<Utc>) -> Server {
        Server {
            id: Uuid::new_v4(),
            name: self.name.trim().to_string(),
            address: self.address.trim().to_string(),
            port: self.port.unwrap_or(22),
            user: self.user.trim().to_string(),
            credential: self.credential,
            reachability: Reachability::Unknown,
            last_checked: None,
            running_containers: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial server edit. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct ServerUpdate {
    pub name: Option<String>,
    pub address: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub credential: Option<SecretHandle>,
}

impl ServerUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.address.is_none()
            && self.port.is_none()
            && self.user.is_none()
            && self.credential.is_none()
    }

    pub fn validate(&self) -> CoreResult<()> {
        if let Some(name) = &self.name {
            require_non_empty("server name", name)?;
        }
        if let Some(address) = &self.address {
            require_non_empty("server address", address)?;
        }
        if let Some(user) = &self.user {
            require_non_empty("ssh user", user)?;
        }
        if let Some(credential) = &self.credential {
            require_non_empty("credential handle", credential.as_str())?;
        }
        require_port(self.port)
    }

    /// Apply to `server`. Returns whether the connection endpoint changed.
    pub(crate) fn apply(self, server: &mut Server, now: DateTime<Utc>) -> bool {
        let mut endpoint_changed = false;
        if let Some(name) = self.name {
            server.name = name.trim().to_string();
        }
        if let Some(address) = self.address {
            endpoint_changed |= server.address != address.trim();
            server.address = address.trim().to_string();
        }
        if let Some(port) = self.port {
            endpoint_changed |= server.port != port;
            server.port = port;
        }
        if let Some(user) = self.user {
            endpoint_changed |= server.user != user.trim();
            server.user = user.trim().to_string();
        }
        if let Some(credential) = self.credential {
            endpoint_changed |= server.credential != credential;
            server.credential = credential;
        }
        if endpoint_changed {
            server.reachability = Reachability::Unknown;
            server.running_containers = None;
        }
        server.updated_at = now;
        endpoint_changed
    }
}

/// A named group of applications.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewProject {
    pub name: String,
    pub description: Option<String>,
}

impl NewProject {
    pub fn validate(&self) -> CoreResult<()> {
        require_non_empty("project name", &self.name)
    }

    pub(crate) fn into_project(self, now: DateTime<Utc>) -> Project {
        Project {
            id: Uuid::new_v4(),
            name: self.name.trim().to_string(),
            description: normalize_description(self.description),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial project edit. An empty description clears it.
#[derive(Debug, Clone, Default)]
pub struct ProjectUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
}

impl ProjectUpdate {
    pub fn validate(&self) -> CoreResult<()> {
        if let Some(name) = &self.name {
            require_non_empty("project name", name)?;
        }
        Ok(())
    }

    pub(crate) fn apply(self, project: &mut Project, now: DateTime<Utc>) {
        if let Some(name) = self.name {
            project.name = name.trim().to_string();
        }
        if self.description.is_some() {
            project.description = normalize_description(self.description);
        }
        project.updated_at = now;
    }
}

/// A compose deployment living in one directory on one server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: AppId,
    pub name: String,
    pub project_id: ProjectId,
    pub server_id: ServerId,
    /// Informational URL; never used to route commands.
    pub domain: String,
    pub working_directory: String,
    pub auto_stop_minutes: u32,
    #[serde(default)]
    pub state: AppState,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Set while a process runs a remote call for this application.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<OperationLease>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Claim on an in-flight start or stop.
///
/// Remote calls are bounded by the configured timeout, so a lease past
/// `expires_at` belongs to a process that died mid-operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationLease {
    /// Orchestrator instance running the operation
    pub owner: Uuid,
    pub pid: u32,
    pub since: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl OperationLease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

impl Application {
    /// Browsable URL derived from the domain.
    pub fn app_url(&self) -> String {
        let domain = self.domain.trim();
        if domain.is_empty() || domain.contains("://") {
            domain.to_string()
        } else {
            format!("https://{}", domain)
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewApplication {
    pub name: String,
    pub project_id: ProjectId,
    pub server_id: ServerId,
    pub domain: String,
    pub working_directory: String,
    /// Falls back to the configured default when absent.
    pub auto_stop_minutes: Option<u32>,
}

impl NewApplication {
    pub fn validate(&self) -> CoreResult<()> {
        require_non_empty("application name", &self.name)?;
        require_working_directory(&self.working_directory)?;
        require_minutes(self.auto_stop_minutes)
    }

    pub(crate) fn into_application(self, default_minutes: u32, now: DateTime<Utc>) -> Application {
        Application {
            id: Uuid::new_v4(),
            name: self.name.trim().to_string(),
            project_id: self.project_id,
            server_id: self.server_id,
            domain: self.domain.trim().to_string(),
            working_directory: self.working_directory.trim().to_string(),
            auto_stop_minutes: self.auto_stop_minutes.unwrap_or(default_minutes),
            state: AppState::Stopped,
            started_at: None,
            last_error: None,
            operation: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial application edit. `None` leaves a field unchanged.
///
/// Lifecycle fields are not editable here; `auto_stop_minutes` on a
/// running application goes through the orchestrator so the deadline
/// follows.
#[derive(Debug, Clone, Default)]
pub struct ApplicationUpdate {
    pub name: Option<String>,
    pub project_id: Option<ProjectId>,
    pub server_id: Option<ServerId>,
    pub domain: Option<String>,
    pub working_directory: Option<String>,
    pub auto_stop_minutes: Option<u32>,
}

impl ApplicationUpdate {
    pub fn validate(&self) -> CoreResult<()> {
        if let Some(name) = &self.name {
            require_non_empty("application name", name)?;
        }
        if let Some(dir) = &self.working_directory {
            require_working_directory(dir)?;
        }
        require_minutes(self.auto_stop_minutes)
    }

    /// Whether the edit changes where or how the app is deployed.
    pub fn touches_deployment(&self) -> bool {
        self.server_id.is_some() || self.working_directory.is_some()
    }

    pub(crate) fn apply(self, app: &mut Application, now: DateTime<Utc>) {
        if let Some(name) = self.name {
            app.name = name.trim().to_string();
        }
        if let Some(project_id) = self.project_id {
            app.project_id = project_id;
        }
        if let Some(server_id) = self.server_id {
            app.server_id = server_id;
        }
        if let Some(domain) = self.domain {
            app.domain = domain.trim().to_string();
        }
        if let Some(dir) = self.working_directory {
            app.working_directory = dir.trim().to_string();
        }
        if let Some(minutes) = self.auto_stop_minutes {
            app.auto_stop_minutes = minutes;
        }
        app.updated_at = now;
    }
}

/// Application record plus live scheduler state.
#[derive(Debug, Clone, Serialize)]
pub struct ApplicationStatus {
    #[serde(flatten)]
    pub application: Application,
    pub app_url: String,
    pub deadline_at: Option<DateTime<Utc>>,
    pub remaining_seconds: Option<i64>,
}

/// Result of a successful start.
#[derive(Debug, Clone, Serialize)]
pub struct StartOutcome {
    pub duration_granted_minutes: u32,
    pub deadline_at: DateTime<Utc>,
    pub output: String,
    pub app_url: String,
}

/// Result of a successful (or no-op) stop.
#[derive(Debug, Clone, Serialize)]
pub struct StopOutcome {
    pub output: String,
    /// Run time of the stopped instance; `None` for a no-op stop.
    pub ran_for_seconds: Option<i64>,
}

impl StopOutcome {
    pub fn noop() -> Self {
        Self {
            output: String::new(),
            ran_for_seconds: None,
        }
    }
}

fn require_non_empty(field: &str, value: &str) -> CoreResult<()> {
    if value.trim().is_empty() {
        return Err(CoreError::InvalidInput(format!("{} must not be empty", field)));
    }
    Ok(())
}

fn require_port(port: Option<u16>) -> CoreResult<()> {
    if port == Some(0) {
        return Err(CoreError::InvalidInput("ssh port must be between 1 and 65535".into()));
    }
    Ok(())
}

fn require_minutes(minutes: Option<u32>) -> CoreResult<()> {
    if minutes == Some(0) {
        return Err(CoreError::InvalidInput("auto-stop minutes must be positive".into()));
    }
    Ok(())
}

fn require_working_directory(dir: &str) -> CoreResult<()> {
    require_non_empty("working directory", dir)?;
    if dir.contains('\n') || dir.contains('\0') {
        return Err(CoreError::InvalidInput(
            "working directory must be a single line".into(),
        ));
    }
    Ok(())
}

fn normalize_description(description: Option<String>) -> Option<String> {
    description
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
}
