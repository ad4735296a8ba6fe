//! Server registry: connection records and last-known reachability.
//!
//! Health checks run a TCP connect to the SSH port first, then the
//! container-count probe through the remote executor. They only ever touch
//! the server record, never application state.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use warden_exec::{parse_container_count, ComposeCommands, RemoteExecutor, SshTarget};

use crate::clock::Clock;
use crate::credentials::CredentialStore;
use crate::error::CoreResult;
use crate::models::{Reachability, Server, ServerId, ServerInfo};
use crate::store::FileStore;

/// Outcome of one health check.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub server: ServerInfo,
    /// Why the server was judged offline, or the probe summary.
    pub detail: String,
}

impl HealthReport {
    pub fn reachability(&self) -> Reachability {
        self.server.reachability
    }
}

/// Registry of servers backed by the record store.
pub struct ServerRegistry {
    store: Arc<FileStore>,
    executor: Arc<dyn RemoteExecutor>,
    credentials: Arc<dyn CredentialStore>,
    clock: Arc<dyn Clock>,
    health_timeout: Duration,
    tcp_preflight: bool,
}

impl ServerRegistry {
    pub fn new(
        store: Arc<FileStore>,
        executor: Arc<dyn RemoteExecutor>,
        credentials: Arc<dyn CredentialStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            executor,
            credentials,
            clock,
            health_timeout: Duration::from_secs(10),
            tcp_preflight: true,
        }
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    pub fn with_tcp_preflight(mut self, enabled: bool) -> Self {
        self.tcp_preflight = enabled;
        self
    }

    pub fn get(&self, id: ServerId) -> CoreResult<ServerInfo> {
        Ok(self.store.get_server(id)?.info())
    }

    pub fn list(&self) -> CoreResult<Vec<ServerInfo>> {
        Ok(self.store.list_servers()?.iter().map(Server::info).collect())
    }

    /// Build the SSH target for `server`, resolving its credential.
    pub fn connect_target(&self, server: &Server) -> CoreResult<SshTarget> {
        let key = self.credentials.resolve(&server.credential)?;
        Ok(SshTarget::new(server.address.clone(), server.user.clone(), key).port(server.port))
    }

    /// Probe one server and persist the result.
    pub async fn check_health(&self, id: ServerId) -> CoreResult<Reachability> {
        Ok(self.check(id).await?.reachability())
    }

    /// Probe one server and persist the result, with the reason.
    pub async fn check(&self, id: ServerId) -> CoreResult<HealthReport> {
        let server = self.store.get_server(id)?;
        let (reachability, containers, detail) = self.probe(&server).await;

        let now = self.clock.now();
        let updated = self.store.update_server(id, |s| {
            s.reachability = reachability;
            s.last_checked = Some(now);
            s.running_containers = match reachability {
                Reachability::Online => containers.or(s.running_containers),
                _ => None,
            };
            Ok(())
        })?;

        if reachability == Reachability::Online {
            debug!(server = %updated.name, "Health check passed: {}", detail);
        } else {
            info!(server = %updated.name, "Server offline: {}", detail);
        }

        Ok(HealthReport {
            server: updated.info(),
            detail,
        })
    }

    async fn probe(&self, server: &Server) -> (Reachability, Option<u32>, String) {
        if self.tcp_preflight {
            if let Err(message) = self.tcp_connect(server).await {
                return (Reachability::Offline, None, message);
            }
        }

        let target = match self.connect_target(server) {
            Ok(target) => target,
            Err(e) => return (Reachability::Offline, None, e.to_string()),
        };

        let probe = ComposeCommands::probe(self.health_timeout.as_secs().max(1));
        match self.executor.run(&target, &probe).await {
            // Any exit status means the shell answered.
            Ok(output) if output.success() => {
                let count = parse_container_count(&output.stdout);
                let detail = match count {
                    Some(n) => format!("{} running container(s)", n),
                    None => "probe output not understood".to_string(),
                };
                (Reachability::Online, count, detail)
            }
            Ok(output) => (
                Reachability::Online,
                None,
                format!("probe exited with {}", output.exit_code),
            ),
            Err(e) => (Reachability::Offline, None, e.to_string()),
        }
    }

    async fn tcp_connect(&self, server: &Server) -> Result<(), String> {
        let addr = (server.address.as_str(), server.port);
        match tokio::time::timeout(self.health_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(format!(
                "network connectivity failed for {}:{}: {}",
                server.address, server.port, e
            )),
            Err(_) => Err(format!(
                "network connectivity to {}:{} timed out",
                server.address, server.port
            )),
        }
    }

    /// Check every server concurrently. A failing check never affects the
    /// others; its last-known record is reported instead.
    pub async fn refresh_all(&self) -> CoreResult<Vec<HealthReport>> {
        let servers = self.store.list_servers()?;
        let checks = servers.iter().map(|server| async move {
            match self.check(server.id).await {
                Ok(report) => report,
                Err(e) => {
                    warn!(server = %server.name, "Health check failed: {}", e);
                    HealthReport {
                        server: server.info(),
                        detail: e.to_string(),
                    }
                }
            }
        });
        Ok(join_all(checks).await)
    }

    /// Record that a lifecycle call could not reach the server.
    pub fn mark_offline(&self, id: ServerId) -> CoreResult<()> {
        let now = self.clock.now();
        let server = self.store.update_server(id, |s| {
            s.reachability = Reachability::Offline;
            s.last_checked = Some(now);
            s.running_containers = None;
            Ok(())
        })?;
        warn!(server = %server.name, "Marked server offline after connection failure");
        Ok(())
    }
}
