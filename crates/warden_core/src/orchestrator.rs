//! Lifecycle orchestrator.
//!
//! Every start or stop of an application runs under that application's
//! lock, held across the remote call:
//!
//! 1. load the record and compute the next state
//! 2. check server reachability (start only)
//! 3. persist the transitional state and run compose on the server
//! 4. settle the record, update the deadline table, write the audit event
//!
//! User requests never wait for a busy lock; they fail with
//! [`CoreError::ConcurrencyRejected`]. The deadline path waits.
//!
//! The lock only covers this process. Across processes sharing a data
//! directory, a transitional record carries an [`OperationLease`] naming
//! the orchestrator that owns it. Other processes reject requests while the
//! lease is live, and only park the record once it has expired.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use warden_exec::{ComposeCommands, ExecError, RemoteExecutor, SshExecutor};

use crate::audit::{
    Actor, AuditAction, AuditEvent, AuditSink, JsonlAuditSink, Requester, ResourceType,
};
use crate::clock::{Clock, SystemClock};
use crate::config::WardenConfig;
use crate::credentials::{CredentialStore, FileCredentialStore};
use crate::error::{CoreError, CoreResult};
use crate::lifecycle::{deadline_for, transition, AppState, LifecycleEvent};
use crate::models::{
    AppId, Application, ApplicationStatus, ApplicationUpdate, NewApplication, NewProject,
    NewServer, OperationLease, Project, ProjectId, ProjectUpdate, Reachability, ServerId,
    ServerInfo, ServerUpdate, StartOutcome, StopOutcome,
};
use crate::registry::{HealthReport, ServerRegistry};
use crate::scheduler::DeadlineScheduler;
use crate::store::FileStore;

/// Detail recorded when the outcome of a remote call cannot be known.
const RESULT_UNKNOWN: &str = "remote result unknown";

/// Slack added to the remote timeout before a lease counts as abandoned.
const LEASE_GRACE_SECS: i64 = 30;

/// Tunables taken from [`WardenConfig`].
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub remote_timeout_secs: u64,
    pub health_timeout_secs: u64,
    pub output_limit_bytes: usize,
    pub default_auto_stop_minutes: u32,
    pub compose: ComposeCommands,
    pub tcp_preflight: bool,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self::from_config(&WardenConfig::default())
    }
}

impl LifecycleSettings {
    pub fn from_config(config: &WardenConfig) -> Self {
        Self {
            remote_timeout_secs: config.remote_timeout_secs,
            health_timeout_secs: config.health_timeout_secs,
            output_limit_bytes: config.output_limit_bytes,
            default_auto_stop_minutes: config.default_auto_stop_minutes,
            compose: config.compose(),
            tcp_preflight: config.ssh.tcp_preflight,
        }
    }
}

/// What [`Orchestrator::recover`] found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Records left mid-operation and parked in `error`
    pub parked: usize,
    /// Records still owned by a live operation, left alone
    pub in_flight: usize,
    /// Deadlines registered for running applications
    pub scheduled: usize,
}

/// Assembles an [`Orchestrator`].
pub struct OrchestratorBuilder {
    store: Arc<FileStore>,
    executor: Arc<dyn RemoteExecutor>,
    credentials: Arc<dyn CredentialStore>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    settings: LifecycleSettings,
}

impl OrchestratorBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(mut self, settings: LifecycleSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn build(self) -> Arc<Orchestrator> {
        let registry = ServerRegistry::new(
            self.store.clone(),
            self.executor.clone(),
            self.credentials,
            self.clock.clone(),
        )
        .with_health_timeout(std::time::Duration::from_secs(self.settings.health_timeout_secs))
        .with_tcp_preflight(self.settings.tcp_preflight);

        Arc::new(Orchestrator {
            instance_id: Uuid::new_v4(),
            scheduler: DeadlineScheduler::new(self.clock.clone()),
            registry,
            store: self.store,
            executor: self.executor,
            audit: self.audit,
            clock: self.clock,
            settings: self.settings,
            locks: Mutex::new(HashMap::new()),
            worker: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }
}

/// Façade over the store, registry, executor, scheduler and audit sink.
pub struct Orchestrator {
    /// Owner recorded in the leases this instance takes
    instance_id: Uuid,
    store: Arc<FileStore>,
    registry: ServerRegistry,
    executor: Arc<dyn RemoteExecutor>,
    audit: Arc<dyn AuditSink>,
    scheduler: DeadlineScheduler,
    clock: Arc<dyn Clock>,
    settings: LifecycleSettings,
    locks: Mutex<HashMap<AppId, Arc<AsyncMutex<()>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Orchestrator {
    pub fn builder(
        store: Arc<FileStore>,
        executor: Arc<dyn RemoteExecutor>,
        credentials: Arc<dyn CredentialStore>,
        audit: Arc<dyn AuditSink>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            store,
            executor,
            credentials,
            audit,
            clock: Arc::new(SystemClock),
            settings: LifecycleSettings::default(),
        }
    }

    /// Wire up the production stack described by `config`.
    pub fn from_config(config: &WardenConfig) -> CoreResult<Arc<Self>> {
        let store = Arc::new(FileStore::open(&config.data_dir)?);
        let executor = Arc::new(SshExecutor::new(config.ssh_options()));
        let credentials = Arc::new(FileCredentialStore::from_config(config)?);
        let audit = Arc::new(JsonlAuditSink::open(config.audit_log_path())?);

        Ok(Self::builder(store, executor, credentials, audit)
            .settings(LifecycleSettings::from_config(config))
            .build())
    }

    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &DeadlineScheduler {
        &self.scheduler
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Bring an application up.
    pub async fn start(&self, app_id: AppId, requester: &Requester) -> CoreResult<StartOutcome> {
        self.ensure_open()?;
        let app = self.store.get_application(app_id)?;
        let _guard = self.try_lock(app_id, &app.name)?;
        // Reload under the lock; the pre-lock read only names the app.
        let app = self.take_over(self.store.get_application(app_id)?)?;
        let actor = Actor::User(requester.clone());

        if app.state == AppState::Running {
            return Err(CoreError::AlreadyRunning(app.name));
        }
        transition(app.state, LifecycleEvent::Start)?;

        let server = self.store.get_server(app.server_id)?;
        let reachability = match server.reachability {
            Reachability::Unknown => self.registry.check_health(server.id).await?,
            known => known,
        };
        if reachability == Reachability::Offline {
            let err = CoreError::ServerOffline(server.name.clone());
            self.record(
                self.app_event(&actor, AuditAction::StartApp, &app)
                    .detail(err.to_string())
                    .failed(),
            );
            return Err(err);
        }

        let target = match self.registry.connect_target(&server) {
            Ok(target) => target,
            Err(e) => {
                self.record(
                    self.app_event(&actor, AuditAction::StartApp, &app)
                        .detail(e.to_string())
                        .failed(),
                );
                return Err(e);
            }
        };

        let lease = self.lease();
        let app = self.store.update_application(app_id, |a| {
            if a.state.is_transitional() {
                return Err(CoreError::ConcurrencyRejected(a.name.clone()));
            }
            a.state = transition(a.state, LifecycleEvent::Start)?;
            a.operation = Some(lease);
            a.last_error = None;
            a.updated_at = self.clock.now();
            Ok(())
        })?;
        info!(app = %app.name, server = %server.name, "Starting application");

        let command = self
            .settings
            .compose
            .up(&app.working_directory, self.settings.remote_timeout_secs);
        let result = self.executor.run(&target, &command).await;

        match result {
            Ok(output) if output.success() => {
                let started_at = self.clock.now();
                let settled = self.store.update_application(app_id, |a| {
                    self.ensure_owned(a)?;
                    a.state = transition(a.state, LifecycleEvent::RemoteSucceeded)?;
                    a.operation = None;
                    a.started_at = Some(started_at);
                    a.updated_at = started_at;
                    Ok(())
                });
                let app = match settled {
                    Ok(app) => app,
                    Err(e) => {
                        return Err(self.settle_lost(&app, &actor, AuditAction::StartApp, e));
                    }
                };
                let deadline_at = deadline_for(started_at, app.auto_stop_minutes);
                self.scheduler.schedule(app_id, deadline_at);

                info!(app = %app.name, deadline = %deadline_at, "Application running");
                self.record(self.app_event(&actor, AuditAction::StartApp, &app).detail(format!(
                    "granted {} min until {}; up took {}ms",
                    app.auto_stop_minutes,
                    deadline_at.to_rfc3339(),
                    output.duration_ms
                )));

                Ok(StartOutcome {
                    duration_granted_minutes: app.auto_stop_minutes,
                    deadline_at,
                    output: output.summary(self.settings.output_limit_bytes),
                    app_url: app.app_url(),
                })
            }
            Ok(output) => {
                let err = CoreError::ExecutionFailed {
                    app: app.name.clone(),
                    message: format!(
                        "{} up exited with {}",
                        self.settings.compose.binary(),
                        output.exit_code
                    ),
                    output: output.summary(self.settings.output_limit_bytes),
                };
                Err(self.settle_failure(&app, &actor, AuditAction::StartApp, err))
            }
            Err(e) => {
                let err = self.transport_failure(&app, e);
                Err(self.settle_failure(&app, &actor, AuditAction::StartApp, err))
            }
        }
    }

    /// Take an application down. A stopped application is left alone.
    pub async fn stop(&self, app_id: AppId, requester: &Requester) -> CoreResult<StopOutcome> {
        self.ensure_open()?;
        let app = self.store.get_application(app_id)?;
        let _guard = self.try_lock(app_id, &app.name)?;
        let app = self.take_over(self.store.get_application(app_id)?)?;
        self.stop_locked(app, &Actor::User(requester.clone()), LifecycleEvent::Stop)
            .await
    }

    /// Deadline path: stop `app_id` as the system if its deadline really
    /// elapsed. Waits for the application lock.
    pub async fn expire(&self, app_id: AppId) -> CoreResult<()> {
        let lock = self.app_lock(app_id);
        let _guard = lock.lock_owned().await;
        if self.is_closed() {
            return Ok(());
        }

        let app = match self.store.get_application(app_id) {
            Ok(app) => app,
            Err(CoreError::NotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        if app.state != AppState::Running {
            debug!(
                app = %app.name,
                state = %app.state,
                "Deadline fired for non-running application"
            );
            return Ok(());
        }
        if self.scheduler.deadline(app_id).is_some() {
            // Rescheduled after this firing was queued.
            return Ok(());
        }
        let Some(started_at) = app.started_at else {
            return Err(CoreError::InvalidState(format!(
                "running application {} has no start time",
                app.name
            )));
        };

        let deadline = deadline_for(started_at, app.auto_stop_minutes);
        if deadline > self.clock.now() {
            debug!(app = %app.name, deadline = %deadline, "Deadline moved; rescheduling");
            self.scheduler.schedule(app_id, deadline);
            return Ok(());
        }

        info!(app = %app.name, "Auto-stop deadline elapsed");
        self.stop_locked(app, &Actor::System, LifecycleEvent::DeadlineElapsed)
            .await
            .map(|_| ())
    }

    async fn stop_locked(
        &self,
        app: Application,
        actor: &Actor,
        event: LifecycleEvent,
    ) -> CoreResult<StopOutcome> {
        match app.state {
            AppState::Stopped => return Ok(StopOutcome::noop()),
            AppState::Starting | AppState::Stopping => {
                return Err(CoreError::ConcurrencyRejected(app.name));
            }
            AppState::Running | AppState::Error => {}
        }
        transition(app.state, event)?;

        let server = self.store.get_server(app.server_id)?;
        let target = match self.registry.connect_target(&server) {
            Ok(target) => target,
            Err(e) => {
                self.record(
                    self.app_event(actor, AuditAction::StopApp, &app)
                        .detail(e.to_string())
                        .failed(),
                );
                return Err(e);
            }
        };

        let lease = self.lease();
        let app = self.store.update_application(app.id, |a| {
            if a.state.is_transitional() {
                return Err(CoreError::ConcurrencyRejected(a.name.clone()));
            }
            a.state = transition(a.state, event)?;
            a.operation = Some(lease);
            a.updated_at = self.clock.now();
            Ok(())
        })?;
        self.scheduler.cancel(app.id);
        info!(app = %app.name, server = %server.name, actor = %actor, "Stopping application");

        let command = self
            .settings
            .compose
            .down(&app.working_directory, self.settings.remote_timeout_secs);
        let result = self.executor.run(&target, &command).await;

        match result {
            Ok(output) if output.success() => {
                let now = self.clock.now();
                let ran_for = app.started_at.map(|s| (now - s).num_seconds().max(0));
                let settled = self.store.update_application(app.id, |a| {
                    self.ensure_owned(a)?;
                    a.state = transition(a.state, LifecycleEvent::RemoteSucceeded)?;
                    a.operation = None;
                    a.started_at = None;
                    a.last_error = None;
                    a.updated_at = now;
                    Ok(())
                });
                let app = match settled {
                    Ok(app) => app,
                    Err(e) => return Err(self.settle_lost(&app, actor, AuditAction::StopApp, e)),
                };

                let mut detail = match ran_for {
                    Some(secs) => format!("ran for {}", format_elapsed(secs)),
                    None => "stopped from error".to_string(),
                };
                if *actor == Actor::System {
                    detail = format!("auto-stop; {}", detail);
                }
                info!(app = %app.name, "Application stopped");
                self.record(self.app_event(actor, AuditAction::StopApp, &app).detail(detail));

                Ok(StopOutcome {
                    output: output.summary(self.settings.output_limit_bytes),
                    ran_for_seconds: ran_for,
                })
            }
            Ok(output) => {
                let err = CoreError::ExecutionFailed {
                    app: app.name.clone(),
                    message: format!(
                        "{} down exited with {}",
                        self.settings.compose.binary(),
                        output.exit_code
                    ),
                    output: output.summary(self.settings.output_limit_bytes),
                };
                Err(self.settle_failure(&app, actor, AuditAction::StopApp, err))
            }
            Err(e) => {
                let err = self.transport_failure(&app, e);
                Err(self.settle_failure(&app, actor, AuditAction::StopApp, err))
            }
        }
    }

    /// Map an executor error, marking the server offline on connection loss.
    fn transport_failure(&self, app: &Application, err: ExecError) -> CoreError {
        match err {
            ExecError::Timeout(seconds) => CoreError::Timeout {
                app: app.name.clone(),
                seconds,
            },
            err => {
                if err.is_connection() {
                    if let Err(e) = self.registry.mark_offline(app.server_id) {
                        warn!(app = %app.name, "Could not mark server offline: {}", e);
                    }
                }
                CoreError::ExecutionFailed {
                    app: app.name.clone(),
                    message: err.to_string(),
                    output: String::new(),
                }
            }
        }
    }

    /// Park the application in `error` after a failed remote call.
    fn settle_failure(
        &self,
        app: &Application,
        actor: &Actor,
        action: AuditAction,
        err: CoreError,
    ) -> CoreError {
        let detail = match &err {
            CoreError::Timeout { seconds, .. } => {
                format!("timed out after {}s: {}", seconds, RESULT_UNKNOWN)
            }
            other => match other.output() {
                Some(output) => format!("{}\n{}", other, output),
                None => other.to_string(),
            },
        };

        let settled = self.store.update_application(app.id, |a| {
            self.ensure_owned(a)?;
            a.state = transition(a.state, LifecycleEvent::RemoteFailed)?;
            a.operation = None;
            a.started_at = None;
            a.last_error = Some(detail.clone());
            a.updated_at = self.clock.now();
            Ok(())
        });
        self.scheduler.cancel(app.id);
        if let Err(e) = settled {
            error!(app = %app.name, "Failed to record lifecycle failure: {}", e);
        }

        warn!(app = %app.name, action = %action, "{}", err);
        self.record(self.app_event(actor, action, app).detail(detail).failed());
        err
    }

    /// The remote call succeeded but the record could not be settled, for
    /// instance because another process parked it meanwhile.
    fn settle_lost(
        &self,
        app: &Application,
        actor: &Actor,
        action: AuditAction,
        err: CoreError,
    ) -> CoreError {
        let step = if action == AuditAction::StartApp { "up" } else { "down" };
        let detail = format!("{} succeeded but the record could not be settled: {}", step, err);
        error!(app = %app.name, action = %action, "{}", detail);
        self.record(self.app_event(actor, action, app).detail(detail).failed());
        err
    }

    fn lease(&self) -> OperationLease {
        let since = self.clock.now();
        let ttl = self.settings.remote_timeout_secs as i64 + LEASE_GRACE_SECS;
        OperationLease {
            owner: self.instance_id,
            pid: std::process::id(),
            since,
            expires_at: since + chrono::Duration::seconds(ttl),
        }
    }

    /// The record must still carry a lease taken by this instance.
    fn ensure_owned(&self, app: &Application) -> CoreResult<()> {
        match &app.operation {
            Some(lease) if lease.owner == self.instance_id => Ok(()),
            _ => Err(CoreError::InvalidState(format!(
                "{} was settled by another process during the remote call",
                app.name
            ))),
        }
    }

    /// Settle a transitional record before acting on it.
    ///
    /// Called with the application lock held, so a lease of this instance
    /// belongs to an operation that was dropped. A live lease of another
    /// instance is rejected. Anything else is parked in `error`.
    fn take_over(&self, app: Application) -> CoreResult<Application> {
        let action = match app.state {
            AppState::Starting => AuditAction::StartApp,
            AppState::Stopping => AuditAction::StopApp,
            _ => return Ok(app),
        };
        if let Some(lease) = &app.operation {
            if lease.owner != self.instance_id && lease.is_live(self.clock.now()) {
                debug!(
                    app = %app.name,
                    owner = %lease.owner,
                    pid = lease.pid,
                    "Operation in flight elsewhere"
                );
                return Err(CoreError::ConcurrencyRejected(app.name));
            }
        }
        self.park(&app, action, &format!("abandoned: {}", RESULT_UNKNOWN))
    }

    /// Change the auto-stop duration. A running application's deadline is
    /// recomputed from its start time.
    pub async fn update_auto_stop_minutes(
        &self,
        app_id: AppId,
        minutes: u32,
        requester: &Requester,
    ) -> CoreResult<ApplicationStatus> {
        if minutes == 0 {
            return Err(CoreError::InvalidInput("auto-stop minutes must be positive".into()));
        }
        let app = self.store.get_application(app_id)?;
        let _guard = self.try_lock(app_id, &app.name)?;

        let previous = app.auto_stop_minutes;
        let app = self.store.update_application(app_id, |a| {
            a.auto_stop_minutes = minutes;
            a.updated_at = self.clock.now();
            Ok(())
        })?;
        self.refresh_deadline(&app);

        self.record(
            self.app_event(&Actor::User(requester.clone()), AuditAction::UpdateApp, &app)
                .detail(format!("auto-stop {} -> {} min", previous, minutes)),
        );
        Ok(self.status_of(app))
    }

    fn refresh_deadline(&self, app: &Application) {
        if let (AppState::Running, Some(started_at)) = (app.state, app.started_at) {
            self.scheduler
                .schedule(app.id, deadline_for(started_at, app.auto_stop_minutes));
        }
    }

    pub fn get_state(&self, app_id: AppId) -> CoreResult<ApplicationStatus> {
        Ok(self.status_of(self.store.get_application(app_id)?))
    }

    pub fn list_applications(&self) -> CoreResult<Vec<ApplicationStatus>> {
        Ok(self
            .store
            .list_applications()?
            .into_iter()
            .map(|a| self.status_of(a))
            .collect())
    }

    pub fn list_by_project(&self, project_id: ProjectId) -> CoreResult<Vec<ApplicationStatus>> {
        self.store.get_project(project_id)?;
        Ok(self
            .list_applications()?
            .into_iter()
            .filter(|s| s.application.project_id == project_id)
            .collect())
    }

    pub fn list_by_server(&self, server_id: ServerId) -> CoreResult<Vec<ApplicationStatus>> {
        self.store.get_server(server_id)?;
        Ok(self
            .list_applications()?
            .into_iter()
            .filter(|s| s.application.server_id == server_id)
            .collect())
    }

    fn status_of(&self, application: Application) -> ApplicationStatus {
        let deadline_at = self.scheduler.deadline(application.id);
        let remaining_seconds = deadline_at.map(|d| (d - self.clock.now()).num_seconds().max(0));
        ApplicationStatus {
            app_url: application.app_url(),
            application,
            deadline_at,
            remaining_seconds,
        }
    }

    // ------------------------------------------------------------------
    // Startup, background work and teardown
    // ------------------------------------------------------------------

    /// Crash recovery: park interrupted records and rebuild deadlines.
    pub fn recover(&self) -> CoreResult<RecoveryReport> {
        let mut report = self.reap_abandoned()?;
        report.scheduled = self.resync_deadlines()?;
        info!(
            parked = report.parked,
            in_flight = report.in_flight,
            scheduled = report.scheduled,
            "Recovered lifecycle state"
        );
        Ok(report)
    }

    /// Park records whose operation died with its process.
    ///
    /// A transitional record is abandoned when its lease is missing or
    /// expired. Records under a live lease, or locked by this instance, are
    /// counted as in flight and left alone.
    pub fn reap_abandoned(&self) -> CoreResult<RecoveryReport> {
        let now = self.clock.now();
        let detail = format!("interrupted: {}", RESULT_UNKNOWN);
        let mut report = RecoveryReport::default();

        for app in self.store.list_applications()? {
            let action = match app.state {
                AppState::Starting => AuditAction::StartApp,
                AppState::Stopping => AuditAction::StopApp,
                AppState::Running if app.started_at.is_none() => AuditAction::StartApp,
                _ => continue,
            };
            let live = app.operation.as_ref().is_some_and(|l| l.is_live(now));
            if app.state.is_transitional() && live {
                report.in_flight += 1;
                continue;
            }
            let Ok(_guard) = self.try_lock(app.id, &app.name) else {
                report.in_flight += 1;
                continue;
            };
            match self.park(&app, action, &detail) {
                Ok(_) => report.parked += 1,
                Err(CoreError::ConcurrencyRejected(_)) => report.in_flight += 1,
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    /// Re-derive the deadline table from the store without touching any
    /// record. Picks up starts and stops made by other processes.
    pub fn resync_deadlines(&self) -> CoreResult<usize> {
        let since = self.scheduler.generation();
        let entries: HashMap<AppId, DateTime<Utc>> = self
            .store
            .list_applications()?
            .into_iter()
            .filter(|a| a.state == AppState::Running)
            .filter_map(|a| {
                a.started_at
                    .map(|s| (a.id, deadline_for(s, a.auto_stop_minutes)))
            })
            .collect();
        let count = entries.len();
        self.scheduler.replace_all(since, entries);
        debug!(count, "Deadline table resynchronized");
        Ok(count)
    }

    /// Start the deadline loop and the task that feeds fired deadlines
    /// back into [`expire`](Self::expire).
    pub fn spawn_deadline_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::channel::<AppId>(64);
        let scheduler_task = tokio::spawn(self.scheduler.clone().run(tx));
        let weak: Weak<Self> = Arc::downgrade(self);

        let dispatcher = tokio::spawn(async move {
            while let Some(app_id) = rx.recv().await {
                let Some(this) = weak.upgrade() else { break };
                tokio::spawn(async move {
                    if let Err(e) = this.expire(app_id).await {
                        warn!(app_id = %app_id, "Auto-stop failed: {}", e);
                    }
                });
            }
        });

        *self.worker.lock() = Some(scheduler_task);
        dispatcher
    }

    /// Stop the deadline loop and park records left mid-operation by this
    /// instance. Operations leased by other live processes are left alone.
    pub async fn shutdown(&self) -> CoreResult<usize> {
        self.closed.store(true, Ordering::SeqCst);
        self.scheduler.stop();
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                warn!("Deadline loop ended abnormally: {}", e);
            }
        }

        let now = self.clock.now();
        let detail = format!("shutdown during operation: {}", RESULT_UNKNOWN);
        let mut parked = 0;
        for app in self.store.list_applications()? {
            let action = match app.state {
                AppState::Starting => AuditAction::StartApp,
                AppState::Stopping => AuditAction::StopApp,
                _ => continue,
            };
            let foreign = app
                .operation
                .as_ref()
                .is_some_and(|l| l.owner != self.instance_id && l.is_live(now));
            if foreign {
                continue;
            }
            match self.park(&app, action, &detail) {
                Ok(_) => parked += 1,
                Err(CoreError::ConcurrencyRejected(_)) => {}
                Err(e) => return Err(e),
            }
        }
        info!(parked, "Orchestrator shut down");
        Ok(parked)
    }

    /// Move `app` to `error`, provided the record has not changed since it
    /// was read.
    fn park(
        &self,
        app: &Application,
        action: AuditAction,
        detail: &str,
    ) -> CoreResult<Application> {
        let app = self.store.update_application(app.id, |a| {
            if a.state != app.state || a.operation != app.operation {
                return Err(CoreError::ConcurrencyRejected(a.name.clone()));
            }
            a.state = AppState::Error;
            a.operation = None;
            a.started_at = None;
            a.last_error = Some(detail.to_string());
            a.updated_at = self.clock.now();
            Ok(())
        })?;
        warn!(app = %app.name, "Parked application in error: {}", detail);
        self.scheduler.cancel(app.id);
        self.record(
            self.app_event(&Actor::System, action, &app)
                .detail(detail)
                .failed(),
        );
        Ok(app)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.is_closed() {
            return Err(CoreError::InvalidState("orchestrator is shutting down".into()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Servers
    // ------------------------------------------------------------------

    pub fn list_servers(&self) -> CoreResult<Vec<ServerInfo>> {
        self.registry.list()
    }

    pub fn get_server(&self, id: ServerId) -> CoreResult<ServerInfo> {
        self.registry.get(id)
    }

    pub fn create_server(&self, new: NewServer, requester: &Requester) -> CoreResult<ServerInfo> {
        new.validate()?;
        let server = new.into_server(self.clock.now());
        self.store.put_server(&server)?;
        info!(server = %server.name, address = %server.address, "Server registered");
        self.record(
            AuditEvent::new(
                &Actor::User(requester.clone()),
                AuditAction::CreateServer,
                ResourceType::Server,
                server.id,
                &server.name,
            )
            .detail(format!("{}@{}:{}", server.user, server.address, server.port))
            .at(self.clock.now()),
        );
        Ok(server.info())
    }

    pub fn update_server(
        &self,
        id: ServerId,
        update: ServerUpdate,
        requester: &Requester,
    ) -> CoreResult<ServerInfo> {
        if update.is_empty() {
            return Err(CoreError::InvalidInput("no server fields to update".into()));
        }
        update.validate()?;
        let now = self.clock.now();
        let mut endpoint_changed = false;
        let server = self.store.update_server(id, |s| {
            endpoint_changed = update.apply(s, now);
            Ok(())
        })?;

        let detail = if endpoint_changed {
            "connection settings changed"
        } else {
            "details changed"
        };
        self.record(
            AuditEvent::new(
                &Actor::User(requester.clone()),
                AuditAction::UpdateServer,
                ResourceType::Server,
                server.id,
                &server.name,
            )
            .detail(detail)
            .at(now),
        );
        Ok(server.info())
    }

    pub fn delete_server(&self, id: ServerId, requester: &Requester) -> CoreResult<()> {
        let server = self.store.get_server(id)?;
        let count = self
            .store
            .list_applications()?
            .iter()
            .filter(|a| a.server_id == id)
            .count();
        if count > 0 {
            return Err(CoreError::InUse {
                resource: "Server",
                name: server.name,
                count,
            });
        }

        self.store.delete_server(id)?;
        info!(server = %server.name, "Server removed");
        self.record(
            AuditEvent::new(
                &Actor::User(requester.clone()),
                AuditAction::DeleteServer,
                ResourceType::Server,
                server.id,
                &server.name,
            )
            .at(self.clock.now()),
        );
        Ok(())
    }

    /// On-demand health check of one server.
    pub async fn check_server(
        &self,
        id: ServerId,
        requester: &Requester,
    ) -> CoreResult<HealthReport> {
        let report = self.registry.check(id).await?;
        let mut event = AuditEvent::new(
            &Actor::User(requester.clone()),
            AuditAction::CheckServer,
            ResourceType::Server,
            report.server.id,
            &report.server.name,
        )
        .detail(format!("{}: {}", report.reachability(), report.detail))
        .at(self.clock.now());
        if report.reachability() != Reachability::Online {
            event = event.failed();
        }
        self.record(event);
        Ok(report)
    }

    /// Health-check every server concurrently.
    pub async fn refresh_all(&self) -> CoreResult<Vec<HealthReport>> {
        self.registry.refresh_all().await
    }

    // ------------------------------------------------------------------
    // Projects
    // ------------------------------------------------------------------

    pub fn list_projects(&self) -> CoreResult<Vec<Project>> {
        self.store.list_projects()
    }

    pub fn get_project(&self, id: ProjectId) -> CoreResult<Project> {
        self.store.get_project(id)
    }

    pub fn create_project(&self, new: NewProject, requester: &Requester) -> CoreResult<Project> {
        new.validate()?;
        if self.store.find_project_by_name(&new.name)?.is_some() {
            return Err(CoreError::Conflict(format!(
                "a project named {} already exists",
                new.name.trim()
            )));
        }
        let project = new.into_project(self.clock.now());
        self.store.put_project(&project)?;
        self.record(
            AuditEvent::new(
                &Actor::User(requester.clone()),
                AuditAction::CreateProject,
                ResourceType::Project,
                project.id,
                &project.name,
            )
            .at(self.clock.now()),
        );
        Ok(project)
    }

    pub fn update_project(
        &self,
        id: ProjectId,
        update: ProjectUpdate,
        requester: &Requester,
    ) -> CoreResult<Project> {
        update.validate()?;
        let mut project = self.store.get_project(id)?;
        if let Some(name) = &update.name {
            if let Some(other) = self.store.find_project_by_name(name)? {
                if other.id != id {
                    return Err(CoreError::Conflict(format!(
                        "a project named {} already exists",
                        name.trim()
                    )));
                }
            }
        }

        update.apply(&mut project, self.clock.now());
        self.store.put_project(&project)?;
        self.record(
            AuditEvent::new(
                &Actor::User(requester.clone()),
                AuditAction::UpdateProject,
                ResourceType::Project,
                project.id,
                &project.name,
            )
            .at(self.clock.now()),
        );
        Ok(project)
    }

    pub fn delete_project(&self, id: ProjectId, requester: &Requester) -> CoreResult<()> {
        let project = self.store.get_project(id)?;
        let count = self
            .store
            .list_applications()?
            .iter()
            .filter(|a| a.project_id == id)
            .count();
        if count > 0 {
            return Err(CoreError::InUse {
                resource: "Project",
                name: project.name,
                count,
            });
        }

        self.store.delete_project(id)?;
        self.record(
            AuditEvent::new(
                &Actor::User(requester.clone()),
                AuditAction::DeleteProject,
                ResourceType::Project,
                project.id,
                &project.name,
            )
            .at(self.clock.now()),
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Applications
    // ------------------------------------------------------------------

    pub fn create_application(
        &self,
        new: NewApplication,
        requester: &Requester,
    ) -> CoreResult<ApplicationStatus> {
        new.validate()?;
        self.store.get_project(new.project_id)?;
        let server = self.store.get_server(new.server_id)?;

        let app = new.into_application(self.settings.default_auto_stop_minutes, self.clock.now());
        self.store.put_application(&app)?;
        info!(app = %app.name, server = %server.name, "Application created");
        self.record(
            self.app_event(&Actor::User(requester.clone()), AuditAction::CreateApp, &app)
                .detail(format!("{} on {}", app.working_directory, server.name)),
        );
        Ok(self.status_of(app))
    }

    pub async fn update_application(
        &self,
        id: AppId,
        update: ApplicationUpdate,
        requester: &Requester,
    ) -> CoreResult<ApplicationStatus> {
        update.validate()?;
        let app = self.store.get_application(id)?;
        let _guard = self.try_lock(id, &app.name)?;
        let app = self.store.get_application(id)?;

        if update.touches_deployment() && !app.state.is_deletable() {
            return Err(CoreError::InvalidState(format!(
                "{} must be stopped before moving it (currently {})",
                app.name, app.state
            )));
        }
        if let Some(project_id) = update.project_id {
            self.store.get_project(project_id)?;
        }
        if let Some(server_id) = update.server_id {
            self.store.get_server(server_id)?;
        }

        let now = self.clock.now();
        let app = self.store.update_application(id, |a| {
            update.apply(a, now);
            Ok(())
        })?;
        self.refresh_deadline(&app);

        self.record(self.app_event(&Actor::User(requester.clone()), AuditAction::UpdateApp, &app));
        Ok(self.status_of(app))
    }

    /// Delete an application. Without `force` it must be stopped (or in
    /// error); with `force` a stop is attempted first and its failure
    /// does not block the delete.
    pub async fn delete_application(
        &self,
        id: AppId,
        force: bool,
        requester: &Requester,
    ) -> CoreResult<()> {
        let app = self.store.get_application(id)?;
        let _guard = self.try_lock(id, &app.name)?;
        let app = self.take_over(self.store.get_application(id)?)?;
        let actor = Actor::User(requester.clone());

        if !app.state.is_deletable() {
            if !force {
                return Err(CoreError::InvalidState(format!(
                    "{} is {}; stop it first or force the delete",
                    app.name, app.state
                )));
            }
            if app.state == AppState::Running {
                if let Err(e) = self.stop_locked(app.clone(), &actor, LifecycleEvent::Stop).await {
                    warn!(app = %app.name, "Best-effort stop before delete failed: {}", e);
                }
            }
        }

        self.scheduler.cancel(id);
        self.store.delete_application(id)?;
        self.locks.lock().remove(&id);
        info!(app = %app.name, "Application deleted");
        self.record(
            self.app_event(&actor, AuditAction::DeleteApp, &app)
                .detail(if force { "forced" } else { "" }),
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn app_lock(&self, app_id: AppId) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(app_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn try_lock(&self, app_id: AppId, name: &str) -> CoreResult<OwnedMutexGuard<()>> {
        self.app_lock(app_id)
            .try_lock_owned()
            .map_err(|_| CoreError::ConcurrencyRejected(name.to_string()))
    }

    fn app_event(&self, actor: &Actor, action: AuditAction, app: &Application) -> AuditEvent {
        AuditEvent::new(actor, action, ResourceType::App, app.id, &app.name).at(self.clock.now())
    }

    fn record(&self, event: AuditEvent) {
        let action = event.action;
        if let Err(e) = self.audit.record(event) {
            error!(action = %action, "Failed to write audit event: {}", e);
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("store", &self.store.root())
            .field("scheduler", &self.scheduler)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// `1h 02m 03s` style rendering of a run time.
pub fn format_elapsed(total_seconds: i64) -> String {
    let total = total_seconds.max(0);
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{}h {:02}m {:02}s", h, m, s)
    } else if m > 0 {
        format!("{}m {:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(0), "0s");
        assert_eq!(format_elapsed(61), "1m 01s");
        assert_eq!(format_elapsed(3723), "1h 02m 03s");
        assert_eq!(format_elapsed(-5), "0s");
    }

    #[test]
    fn test_settings_from_config() {
        let config = WardenConfig {
            remote_timeout_secs: 30,
            default_auto_stop_minutes: 15,
            compose_command: "docker compose".into(),
            ..Default::default()
        };
        let settings = LifecycleSettings::from_config(&config);

        assert_eq!(settings.remote_timeout_secs, 30);
        assert_eq!(settings.default_auto_stop_minutes, 15);
        assert_eq!(settings.compose.binary(), "docker compose");
        assert!(settings.tcp_preflight);
    }
}
