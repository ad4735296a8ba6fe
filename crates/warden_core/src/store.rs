//! File-per-record JSON store.
//!
//! Layout under the data directory:
//!
//! ```text
//! servers/<uuid>.json
//! projects/<uuid>.json
//! applications/<uuid>.json
//! ```
//!
//! Every write goes to a temporary file in the same directory and is renamed
//! into place, so readers (including other processes) never see a partial
//! record. Reads always go to disk.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::models::{AppId, Application, Project, ProjectId, Server, ServerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Collection {
    Servers,
    Projects,
    Applications,
}

impl Collection {
    fn dir_name(&self) -> &'static str {
        match self {
            Self::Servers => "servers",
            Self::Projects => "projects",
            Self::Applications => "applications",
        }
    }

    fn resource(&self) -> &'static str {
        match self {
            Self::Servers => "Server",
            Self::Projects => "Project",
            Self::Applications => "Application",
        }
    }

    const ALL: [Collection; 3] = [Self::Servers, Self::Projects, Self::Applications];
}

/// Record store rooted at a data directory.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    /// Serializes read-modify-write sections within this process.
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Open (creating directories as needed).
    pub fn open(root: impl Into<PathBuf>) -> CoreResult<Self> {
        let root = root.into();
        for collection in Collection::ALL {
            fs::create_dir_all(root.join(collection.dir_name()))?;
        }
        debug!("Opened record store at {}", root.display());
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // Servers

    pub fn get_server(&self, id: ServerId) -> CoreResult<Server> {
        self.get(Collection::Servers, id)
    }

    pub fn list_servers(&self) -> CoreResult<Vec<Server>> {
        let mut servers: Vec<Server> = self.list(Collection::Servers)?;
        servers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(servers)
    }

    pub fn put_server(&self, server: &Server) -> CoreResult<()> {
        let _guard = self.write_lock.lock();
        self.write(Collection::Servers, server.id, server)
    }

    pub fn update_server<F>(&self, id: ServerId, f: F) -> CoreResult<Server>
    where
        F: FnOnce(&mut Server) -> CoreResult<()>,
    {
        let _guard = self.write_lock.lock();
        let mut server: Server = self.get(Collection::Servers, id)?;
        f(&mut server)?;
        self.write(Collection::Servers, id, &server)?;
        Ok(server)
    }

    pub fn delete_server(&self, id: ServerId) -> CoreResult<()> {
        let _guard = self.write_lock.lock();
        self.delete(Collection::Servers, id)
    }

    // Projects

    pub fn get_project(&self, id: ProjectId) -> CoreResult<Project> {
        self.get(Collection::Projects, id)
    }

    pub fn list_projects(&self) -> CoreResult<Vec<Project>> {
        let mut projects: Vec<Project> = self.list(Collection::Projects)?;
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(projects)
    }

    pub fn find_project_by_name(&self, name: &str) -> CoreResult<Option<Project>> {
        Ok(self
            .list_projects()?
            .into_iter()
            .find(|p| p.name.eq_ignore_ascii_case(name.trim())))
    }

    pub fn put_project(&self, project: &Project) -> CoreResult<()> {
        let _guard = self.write_lock.lock();
        self.write(Collection::Projects, project.id, project)
    }

    pub fn delete_project(&self, id: ProjectId) -> CoreResult<()> {
        let _guard = self.write_lock.lock();
        self.delete(Collection::Projects, id)
    }

    // Applications

    pub fn get_application(&self, id: AppId) -> CoreResult<Application> {
        self.get(Collection::Applications, id)
    }

    pub fn list_applications(&self) -> CoreResult<Vec<Application>> {
        let mut apps: Vec<Application> = self.list(Collection::Applications)?;
        apps.sort_by(|a, b| a.name.cmp(&b.name).then(a.created_at.cmp(&b.created_at)));
        Ok(apps)
    }

    pub fn put_application(&self, app: &Application) -> CoreResult<()> {
        let _guard = self.write_lock.lock();
        self.write(Collection::Applications, app.id, app)
    }

    pub fn update_application<F>(&self, id: AppId, f: F) -> CoreResult<Application>
    where
        F: FnOnce(&mut Application) -> CoreResult<()>,
    {
        let _guard = self.write_lock.lock();
        let mut app: Application = self.get(Collection::Applications, id)?;
        f(&mut app)?;
        self.write(Collection::Applications, id, &app)?;
        Ok(app)
    }

    pub fn delete_application(&self, id: AppId) -> CoreResult<()> {
        let _guard = self.write_lock.lock();
        self.delete(Collection::Applications, id)
    }

    // Generic record I/O

    fn record_path(&self, collection: Collection, id: Uuid) -> PathBuf {
        self.root
            .join(collection.dir_name())
            .join(format!("{}.json", id))
    }

    fn get<T: DeserializeOwned>(&self, collection: Collection, id: Uuid) -> CoreResult<T> {
        let path = self.record_path(collection, id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CoreError::not_found(collection.resource(), id));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&content)?)
    }

    fn list<T: DeserializeOwned>(&self, collection: Collection) -> CoreResult<Vec<T>> {
        let dir = self.root.join(collection.dir_name());
        let mut records = Vec::new();

        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                // Deleted between read_dir and read
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            match serde_json::from_str(&content) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable record {}: {}", path.display(), e),
            }
        }

        Ok(records)
    }

    fn write<T: Serialize>(&self, collection: Collection, id: Uuid, record: &T) -> CoreResult<()> {
        let dir = self.root.join(collection.dir_name());
        let json = serde_json::to_string_pretty(record)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.record_path(collection, id))
            .map_err(|e| e.error)?;
        Ok(())
    }

    fn delete(&self, collection: Collection, id: Uuid) -> CoreResult<()> {
        match fs::remove_file(self.record_path(collection, id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CoreError::not_found(collection.resource(), id))
            }
            Err(e) => Err(e.into()),
        }
    }
}
