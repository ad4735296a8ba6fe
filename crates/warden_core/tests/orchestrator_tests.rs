//! Integration tests for the lifecycle orchestrator.
//!
//! Remote calls go through the scripted `MockExecutor`; deadline tests run
//! on paused tokio time with a tokio-driven clock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use tempfile::TempDir;
use tokio::sync::Notify;

use uuid::Uuid;
use warden_core::{
    AppId, AppState, ApplicationUpdate, AuditAction, AuditOutcome, Clock, CoreError, ErrorKind,
    FileStore, LifecycleSettings, MemoryAuditSink, MemoryCredentialStore, NewApplication,
    NewProject, NewServer, OperationLease, Orchestrator, Project, Reachability, Requester,
    SecretHandle, ServerInfo, TokioClock,
};
use warden_exec::{
    ExecOutput, ExecResult, MockExecutor, MockResponse, RemoteCommand, RemoteExecutor, SshTarget,
};

struct Harness {
    temp: TempDir,
    orchestrator: Arc<Orchestrator>,
    executor: MockExecutor,
    audit: Arc<MemoryAuditSink>,
    store: Arc<FileStore>,
    clock: Arc<TokioClock>,
    server: ServerInfo,
    project: Project,
}

fn alice() -> Requester {
    Requester::new("alice")
}

fn settings() -> LifecycleSettings {
    LifecycleSettings {
        remote_timeout_secs: 30,
        tcp_preflight: false,
        ..Default::default()
    }
}

fn harness_with(
    executor: Arc<dyn RemoteExecutor>,
    mock: MockExecutor,
    reachability: Reachability,
) -> Harness {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(FileStore::open(temp.path()).unwrap());
    let audit = Arc::new(MemoryAuditSink::new());
    let clock = Arc::new(TokioClock::new());
    let credentials = Arc::new(MemoryCredentialStore::new().with_key("edge-1", "key-material"));

    let orchestrator = Orchestrator::builder(store.clone(), executor, credentials, audit.clone())
        .clock(clock.clone())
        .settings(settings())
        .build();

    let server = orchestrator
        .create_server(
            NewServer {
                name: "edge-1".into(),
                address: "10.0.0.12".into(),
                port: None,
                user: "deploy".into(),
                credential: SecretHandle::new("edge-1"),
            },
            &alice(),
        )
        .unwrap();
    if reachability != Reachability::Unknown {
        store
            .update_server(server.id, |s| {
                s.reachability = reachability;
                Ok(())
            })
            .unwrap();
    }
    let server = orchestrator.get_server(server.id).unwrap();

    let project = orchestrator
        .create_project(
            NewProject {
                name: "shop".into(),
                description: Some("storefront".into()),
            },
            &alice(),
        )
        .unwrap();

    Harness {
        temp,
        orchestrator,
        executor: mock,
        audit,
        store,
        clock,
        server,
        project,
    }
}

fn harness(executor: MockExecutor) -> Harness {
    harness_with(Arc::new(executor.clone()), executor, Reachability::Online)
}

/// A second orchestrator on the same data directory, as another process
/// would open it.
fn peer(h: &Harness, executor: MockExecutor, audit: Arc<MemoryAuditSink>) -> Arc<Orchestrator> {
    let store = Arc::new(FileStore::open(h.temp.path()).unwrap());
    let credentials = Arc::new(MemoryCredentialStore::new().with_key("edge-1", "key-material"));
    Orchestrator::builder(store, Arc::new(executor), credentials, audit)
        .clock(h.clock.clone())
        .settings(settings())
        .build()
}

/// Mark `app_id` as mid-operation under a lease of some other process.
fn lease_elsewhere(h: &Harness, app_id: AppId, state: AppState, ttl: ChronoDuration) {
    let now = h.clock.now();
    h.store
        .update_application(app_id, |a| {
            a.state = state;
            a.operation = Some(OperationLease {
                owner: Uuid::new_v4(),
                pid: 4242,
                since: now,
                expires_at: now + ttl,
            });
            Ok(())
        })
        .unwrap();
}

fn new_app(h: &Harness, minutes: u32) -> AppId {
    h.orchestrator
        .create_application(
            NewApplication {
                name: "web".into(),
                project_id: h.project.id,
                server_id: h.server.id,
                domain: "shop.example.com".into(),
                working_directory: "/srv/shop".into(),
                auto_stop_minutes: Some(minutes),
            },
            &alice(),
        )
        .unwrap()
        .application
        .id
}

/// running <=> start time set <=> exactly one deadline registered
fn assert_invariant(h: &Harness, app_id: AppId) {
    let status = h.orchestrator.get_state(app_id).unwrap();
    let running = status.application.state == AppState::Running;
    assert_eq!(running, status.application.started_at.is_some(), "start time vs state");
    assert_eq!(running, status.deadline_at.is_some(), "deadline vs state");
}

fn state(h: &Harness, app_id: AppId) -> AppState {
    h.orchestrator.get_state(app_id).unwrap().application.state
}

// ============================================================================
// Start / stop
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_start_then_stop() {
    let h = harness(MockExecutor::new().with_responses(vec![
        MockResponse::success("Creating shop_web_1 ... done"),
        MockResponse::success("Removing shop_web_1 ... done"),
    ]));
    let app = new_app(&h, 60);
    assert_invariant(&h, app);

    let started = h.orchestrator.start(app, &alice()).await.unwrap();

    assert_eq!(started.duration_granted_minutes, 60);
    assert_eq!(started.app_url, "https://shop.example.com");
    assert!(started.output.contains("done"));
    assert_eq!(state(&h, app), AppState::Running);
    assert_invariant(&h, app);

    let record = h.store.get_application(app).unwrap();
    let started_at = record.started_at.unwrap();
    assert_eq!(started.deadline_at, started_at + ChronoDuration::minutes(60));

    tokio::time::advance(Duration::from_secs(90)).await;
    let stopped = h.orchestrator.stop(app, &alice()).await.unwrap();

    assert_eq!(stopped.ran_for_seconds, Some(90));
    assert_eq!(state(&h, app), AppState::Stopped);
    assert_invariant(&h, app);

    let calls = h.executor.get_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].command, "docker-compose up -d");
    assert_eq!(calls[0].workdir.as_deref(), Some("/srv/shop"));
    assert_eq!(calls[0].timeout_seconds, 30);
    assert_eq!(calls[1].command, "docker-compose down");

    let events = h.audit.events_for(app);
    let actions: Vec<_> = events.iter().map(|e| e.action).collect();
    assert_eq!(actions, vec![AuditAction::CreateApp, AuditAction::StartApp, AuditAction::StopApp]);
    assert!(events.iter().all(|e| e.actor == "alice" && e.outcome == AuditOutcome::Success));
    assert!(events[2].detail.contains("ran for 1m 30s"));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_starts_run_remote_once() {
    let mock = MockExecutor::new().with_delay(Duration::from_secs(2));
    let h = harness(mock);
    let app = new_app(&h, 60);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let orchestrator = h.orchestrator.clone();
        handles.push(tokio::spawn(async move { orchestrator.start(app, &alice()).await }));
    }

    let mut ok = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert!(
                matches!(e.kind(), ErrorKind::ConcurrencyRejected | ErrorKind::AlreadyRunning),
                "unexpected error: {}",
                e
            ),
        }
    }

    assert_eq!(ok, 1);
    assert_eq!(h.executor.calls_matching("up -d").len(), 1);
    assert_invariant(&h, app);

    let late = h.orchestrator.start(app, &alice()).await.unwrap_err();
    assert_eq!(late.kind(), ErrorKind::AlreadyRunning);
    assert_eq!(h.executor.calls_matching("up -d").len(), 1);
}

/// Holds every remote call until released.
struct GatedExecutor {
    gate: Arc<Notify>,
    inner: MockExecutor,
}

#[async_trait]
impl RemoteExecutor for GatedExecutor {
    async fn run(&self, target: &SshTarget, command: &RemoteCommand) -> ExecResult<ExecOutput> {
        self.gate.notified().await;
        self.inner.run(target, command).await
    }
}

#[tokio::test]
async fn test_stop_during_start_is_rejected() {
    let gate = Arc::new(Notify::new());
    let mock = MockExecutor::new();
    let executor = Arc::new(GatedExecutor {
        gate: gate.clone(),
        inner: mock.clone(),
    });
    let h = harness_with(executor, mock, Reachability::Online);
    let app = new_app(&h, 60);

    let orchestrator = h.orchestrator.clone();
    let start = tokio::spawn(async move { orchestrator.start(app, &alice()).await });

    while state(&h, app) != AppState::Starting {
        tokio::task::yield_now().await;
    }
    let err = h.orchestrator.stop(app, &alice()).await.unwrap_err();
    assert!(matches!(err, CoreError::ConcurrencyRejected(_)));
    let err = h
        .orchestrator
        .update_auto_stop_minutes(app, 5, &alice())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConcurrencyRejected);

    gate.notify_one();
    start.await.unwrap().unwrap();
    assert_eq!(state(&h, app), AppState::Running);
}

#[tokio::test(start_paused = true)]
async fn test_stop_twice_runs_remote_once() {
    let h = harness(MockExecutor::new());
    let app = new_app(&h, 60);
    h.orchestrator.start(app, &alice()).await.unwrap();

    let first = h.orchestrator.stop(app, &alice()).await.unwrap();
    let second = h.orchestrator.stop(app, &alice()).await.unwrap();

    assert!(first.ran_for_seconds.is_some());
    assert_eq!(second.ran_for_seconds, None);
    assert_eq!(h.executor.calls_matching("down").len(), 1);
    assert_invariant(&h, app);
}

#[tokio::test]
async fn test_stop_never_started_is_noop() {
    let h = harness(MockExecutor::new());
    let app = new_app(&h, 60);

    h.orchestrator.stop(app, &alice()).await.unwrap();

    assert_eq!(h.executor.call_count(), 0);
    assert_eq!(h.audit.events_for(app).len(), 1);
}

#[tokio::test]
async fn test_unknown_app() {
    let h = harness(MockExecutor::new());
    let err = h.orchestrator.start(uuid::Uuid::new_v4(), &alice()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

// ============================================================================
// Failure handling
// ============================================================================

#[tokio::test]
async fn test_offline_server_is_rejected_without_remote_call() {
    let mock = MockExecutor::new();
    let h = harness_with(Arc::new(mock.clone()), mock, Reachability::Offline);
    let app = new_app(&h, 60);

    let err = h.orchestrator.start(app, &alice()).await.unwrap_err();

    assert!(matches!(err, CoreError::ServerOffline(ref name) if name == "edge-1"));
    assert_eq!(h.executor.call_count(), 0);
    assert_eq!(state(&h, app), AppState::Stopped);
    assert_invariant(&h, app);

    let last = h.audit.events_for(app).pop().unwrap();
    assert_eq!(last.action, AuditAction::StartApp);
    assert_eq!(last.outcome, AuditOutcome::Failure);
}

#[tokio::test]
async fn test_unknown_reachability_probes_first() {
    let mock = MockExecutor::new().with_responses(vec![
        MockResponse::success("2\n"),
        MockResponse::success("started"),
    ]);
    let h = harness_with(Arc::new(mock.clone()), mock, Reachability::Unknown);
    let app = new_app(&h, 60);

    h.orchestrator.start(app, &alice()).await.unwrap();

    let calls = h.executor.get_calls();
    assert_eq!(calls[0].command, "docker ps -q | wc -l");
    assert_eq!(calls[1].command, "docker-compose up -d");
    let server = h.orchestrator.get_server(h.server.id).unwrap();
    assert_eq!(server.reachability, Reachability::Online);
    assert_eq!(server.running_containers, Some(2));
}

#[tokio::test]
async fn test_unknown_reachability_probe_fails() {
    let mock =
        MockExecutor::new().add_response(MockResponse::connection_refused("no route to host"));
    let h = harness_with(Arc::new(mock.clone()), mock, Reachability::Unknown);
    let app = new_app(&h, 60);

    let err = h.orchestrator.start(app, &alice()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ServerOffline);
    assert_eq!(h.executor.calls_matching("up -d").len(), 0);
    assert_eq!(state(&h, app), AppState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_failed_start_then_retry() {
    let h = harness(MockExecutor::new().with_responses(vec![
        MockResponse::failure(1, "pull access denied for shop/web"),
        MockResponse::success("done"),
    ]));
    let app = new_app(&h, 60);

    let err = h.orchestrator.start(app, &alice()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ExecutionFailed);
    assert!(err.output().unwrap().contains("pull access denied"));
    let record = h.store.get_application(app).unwrap();
    assert_eq!(record.state, AppState::Error);
    assert!(record.last_error.unwrap().contains("pull access denied"));
    assert_invariant(&h, app);

    h.orchestrator.start(app, &alice()).await.unwrap();

    let record = h.store.get_application(app).unwrap();
    assert_eq!(record.state, AppState::Running);
    assert_eq!(record.last_error, None);
    assert_invariant(&h, app);

    let outcomes: Vec<_> = h
        .audit
        .events_for(app)
        .iter()
        .filter(|e| e.action == AuditAction::StartApp)
        .map(|e| e.outcome)
        .collect();
    assert_eq!(outcomes, vec![AuditOutcome::Failure, AuditOutcome::Success]);
}

#[tokio::test]
async fn test_timeout_parks_in_error() {
    let h = harness(MockExecutor::new().add_response(MockResponse::timed_out()));
    let app = new_app(&h, 60);

    let err = h.orchestrator.start(app, &alice()).await.unwrap_err();

    assert!(matches!(err, CoreError::Timeout { seconds: 30, .. }));
    let record = h.store.get_application(app).unwrap();
    assert_eq!(record.state, AppState::Error);
    assert!(record.last_error.unwrap().contains("remote result unknown"));
    assert_invariant(&h, app);
}

#[tokio::test]
async fn test_connection_loss_marks_server_offline() {
    let refused = MockResponse::connection_refused("Connection refused");
    let h = harness(MockExecutor::new().add_response(refused));
    let app = new_app(&h, 60);

    let err = h.orchestrator.start(app, &alice()).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ExecutionFailed);
    assert_eq!(state(&h, app), AppState::Error);
    assert_eq!(
        h.orchestrator.get_server(h.server.id).unwrap().reachability,
        Reachability::Offline
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_stop_then_retry_from_error() {
    let h = harness(MockExecutor::new().with_responses(vec![
        MockResponse::success("up"),
        MockResponse::failure(2, "network shop_default is in use"),
        MockResponse::success("down"),
    ]));
    let app = new_app(&h, 60);
    h.orchestrator.start(app, &alice()).await.unwrap();

    let err = h.orchestrator.stop(app, &alice()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExecutionFailed);
    assert_eq!(state(&h, app), AppState::Error);
    assert_invariant(&h, app);

    h.orchestrator.stop(app, &alice()).await.unwrap();
    assert_eq!(state(&h, app), AppState::Stopped);
    assert_eq!(h.executor.calls_matching("down").len(), 2);
}

// ============================================================================
// Deadlines
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_auto_stop_after_one_minute() {
    let h = harness(MockExecutor::new());
    let _worker = h.orchestrator.spawn_deadline_worker();
    let app = new_app(&h, 1);

    h.orchestrator.start(app, &alice()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(61)).await;

    assert_eq!(state(&h, app), AppState::Stopped);
    assert_invariant(&h, app);
    let stop = h
        .audit
        .events_for(app)
        .into_iter()
        .rev()
        .find(|e| e.action == AuditAction::StopApp)
        .unwrap();
    assert_eq!(stop.actor, "system");
    assert_eq!(stop.outcome, AuditOutcome::Success);
    assert!(stop.detail.starts_with("auto-stop"));
}

#[tokio::test(start_paused = true)]
async fn test_shortened_timeout_fires_exactly_once() {
    let h = harness(MockExecutor::new());
    let _worker = h.orchestrator.spawn_deadline_worker();
    let app = new_app(&h, 60);

    h.orchestrator.start(app, &alice()).await.unwrap();
    let started_at = h.store.get_application(app).unwrap().started_at.unwrap();

    tokio::time::sleep(Duration::from_secs(5 * 60)).await;
    let status = h
        .orchestrator
        .update_auto_stop_minutes(app, 10, &alice())
        .await
        .unwrap();

    assert_eq!(status.deadline_at, Some(started_at + ChronoDuration::minutes(10)));
    let remaining = status.remaining_seconds.unwrap();
    assert!((299..=300).contains(&remaining), "remaining {}", remaining);

    tokio::time::sleep(Duration::from_secs(5 * 60 - 1)).await;
    assert_eq!(state(&h, app), AppState::Running);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(state(&h, app), AppState::Stopped);

    tokio::time::sleep(Duration::from_secs(2 * 3600)).await;
    assert_eq!(h.executor.calls_matching("down").len(), 1);
    let system_stops = h
        .audit
        .events_for(app)
        .iter()
        .filter(|e| e.action == AuditAction::StopApp && e.actor == "system")
        .count();
    assert_eq!(system_stops, 1);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_already_passed_fires_immediately() {
    let h = harness(MockExecutor::new());
    let _worker = h.orchestrator.spawn_deadline_worker();
    let app = new_app(&h, 60);
    h.orchestrator.start(app, &alice()).await.unwrap();

    tokio::time::sleep(Duration::from_secs(15 * 60)).await;
    h.orchestrator
        .update_auto_stop_minutes(app, 10, &alice())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(state(&h, app), AppState::Stopped);
    assert_invariant(&h, app);
}

#[tokio::test(start_paused = true)]
async fn test_manual_stop_cancels_deadline() {
    let h = harness(MockExecutor::new());
    let _worker = h.orchestrator.spawn_deadline_worker();
    let app = new_app(&h, 1);
    h.orchestrator.start(app, &alice()).await.unwrap();

    h.orchestrator.stop(app, &alice()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(h.executor.calls_matching("down").len(), 1);
    assert!(h.orchestrator.scheduler().is_empty());
}

#[tokio::test]
async fn test_update_minutes_rejects_zero() {
    let h = harness(MockExecutor::new());
    let app = new_app(&h, 60);

    let err = h
        .orchestrator
        .update_auto_stop_minutes(app, 0, &alice())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[tokio::test]
async fn test_update_minutes_while_stopped_schedules_nothing() {
    let h = harness(MockExecutor::new());
    let app = new_app(&h, 60);

    let status = h
        .orchestrator
        .update_auto_stop_minutes(app, 15, &alice())
        .await
        .unwrap();

    assert_eq!(status.application.auto_stop_minutes, 15);
    assert_eq!(status.deadline_at, None);
    assert!(h.orchestrator.scheduler().is_empty());
}

// ============================================================================
// Recovery and shutdown
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_recover_parks_interrupted_and_rebuilds_deadlines() {
    let h = harness(MockExecutor::new());
    let interrupted = new_app(&h, 60);
    let running = h
        .orchestrator
        .create_application(
            NewApplication {
                name: "api".into(),
                project_id: h.project.id,
                server_id: h.server.id,
                domain: "api.example.com".into(),
                working_directory: "/srv/api".into(),
                auto_stop_minutes: Some(30),
            },
            &alice(),
        )
        .unwrap()
        .application
        .id;

    let started_at = h.clock.now() - ChronoDuration::minutes(2);
    h.store
        .update_application(interrupted, |a| {
            a.state = AppState::Starting;
            Ok(())
        })
        .unwrap();
    h.store
        .update_application(running, |a| {
            a.state = AppState::Running;
            a.started_at = Some(started_at);
            Ok(())
        })
        .unwrap();

    let report = h.orchestrator.recover().unwrap();

    assert_eq!(report.parked, 1);
    assert_eq!(report.scheduled, 1);
    let parked = h.store.get_application(interrupted).unwrap();
    assert_eq!(parked.state, AppState::Error);
    assert!(parked.last_error.unwrap().starts_with("interrupted"));
    assert_eq!(
        h.orchestrator.scheduler().deadline(running),
        Some(started_at + ChronoDuration::minutes(30))
    );
    assert_invariant(&h, interrupted);
    assert_invariant(&h, running);
    assert_eq!(h.executor.call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_recovered_past_deadline_stops_immediately() {
    let h = harness(MockExecutor::new());
    let app = new_app(&h, 30);
    let started_at = h.clock.now() - ChronoDuration::minutes(45);
    h.store
        .update_application(app, |a| {
            a.state = AppState::Running;
            a.started_at = Some(started_at);
            Ok(())
        })
        .unwrap();

    h.orchestrator.recover().unwrap();
    let _worker = h.orchestrator.spawn_deadline_worker();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(state(&h, app), AppState::Stopped);
    assert_eq!(h.executor.calls_matching("down").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_parks_in_flight_and_closes() {
    let h = harness(MockExecutor::new());
    let _worker = h.orchestrator.spawn_deadline_worker();
    let app = new_app(&h, 60);
    h.store
        .update_application(app, |a| {
            a.state = AppState::Stopping;
            Ok(())
        })
        .unwrap();

    let parked = h.orchestrator.shutdown().await.unwrap();

    assert_eq!(parked, 1);
    assert_eq!(state(&h, app), AppState::Error);
    assert!(h.orchestrator.scheduler().is_stopped());
    let last = h.audit.events_for(app).pop().unwrap();
    assert_eq!(last.actor, "system");
    assert_eq!(last.outcome, AuditOutcome::Failure);

    let err = h.orchestrator.start(app, &alice()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn test_peer_recover_leaves_live_start_alone() {
    let gate = Arc::new(Notify::new());
    let mock = MockExecutor::new();
    let executor = Arc::new(GatedExecutor {
        gate: gate.clone(),
        inner: mock.clone(),
    });
    let h = harness_with(executor, mock, Reachability::Online);
    let app = new_app(&h, 60);
    let other = peer(&h, MockExecutor::new(), Arc::new(MemoryAuditSink::new()));

    let orchestrator = h.orchestrator.clone();
    let start = tokio::spawn(async move { orchestrator.start(app, &alice()).await });
    while state(&h, app) != AppState::Starting {
        tokio::task::yield_now().await;
    }

    let lease = h.store.get_application(app).unwrap().operation.unwrap();
    assert_eq!(lease.owner, h.orchestrator.instance_id());
    assert_eq!(lease.pid, std::process::id());

    let report = other.recover().unwrap();
    assert_eq!(report.parked, 0);
    assert_eq!(report.in_flight, 1);
    assert_eq!(other.shutdown().await.unwrap(), 0);
    assert_eq!(state(&h, app), AppState::Starting);

    gate.notify_one();
    start.await.unwrap().unwrap();
    assert_eq!(state(&h, app), AppState::Running);
    assert_eq!(h.store.get_application(app).unwrap().operation, None);
    assert_invariant(&h, app);
}

#[tokio::test]
async fn test_peer_requests_during_start_are_rejected() {
    let gate = Arc::new(Notify::new());
    let mock = MockExecutor::new();
    let executor = Arc::new(GatedExecutor {
        gate: gate.clone(),
        inner: mock.clone(),
    });
    let h = harness_with(executor, mock, Reachability::Online);
    let app = new_app(&h, 60);
    let other_exec = MockExecutor::new();
    let other = peer(&h, other_exec.clone(), Arc::new(MemoryAuditSink::new()));

    let orchestrator = h.orchestrator.clone();
    let start = tokio::spawn(async move { orchestrator.start(app, &alice()).await });
    while state(&h, app) != AppState::Starting {
        tokio::task::yield_now().await;
    }

    let err = other.start(app, &alice()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConcurrencyRejected);
    let err = other.stop(app, &alice()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConcurrencyRejected);
    let err = other.delete_application(app, true, &alice()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConcurrencyRejected);
    assert_eq!(other_exec.call_count(), 0);

    gate.notify_one();
    start.await.unwrap().unwrap();
    assert_eq!(state(&h, app), AppState::Running);
}

#[tokio::test]
async fn test_start_settled_elsewhere_is_reported() {
    let gate = Arc::new(Notify::new());
    let mock = MockExecutor::new();
    let executor = Arc::new(GatedExecutor {
        gate: gate.clone(),
        inner: mock.clone(),
    });
    let h = harness_with(executor, mock, Reachability::Online);
    let app = new_app(&h, 60);
    let other = peer(&h, MockExecutor::new(), Arc::new(MemoryAuditSink::new()));

    let orchestrator = h.orchestrator.clone();
    let start = tokio::spawn(async move { orchestrator.start(app, &alice()).await });
    while state(&h, app) != AppState::Starting {
        tokio::task::yield_now().await;
    }

    // The lease runs out while the call hangs and the peer reaps it.
    let past = h.clock.now() - ChronoDuration::seconds(1);
    h.store
        .update_application(app, |a| {
            if let Some(lease) = a.operation.as_mut() {
                lease.expires_at = past;
            }
            Ok(())
        })
        .unwrap();
    assert_eq!(other.recover().unwrap().parked, 1);

    gate.notify_one();
    let err = start.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(state(&h, app), AppState::Error);
    assert!(h.orchestrator.scheduler().deadline(app).is_none());
    assert_eq!(h.executor.calls_matching("up -d").len(), 1);

    let last = h.audit.events_for(app).pop().unwrap();
    assert_eq!(last.action, AuditAction::StartApp);
    assert_eq!(last.outcome, AuditOutcome::Failure);
    assert!(last.detail.starts_with("up succeeded"), "{}", last.detail);
}

#[tokio::test(start_paused = true)]
async fn test_live_foreign_lease_rejects_until_expired() {
    let h = harness(MockExecutor::new());
    let app = new_app(&h, 60);
    lease_elsewhere(&h, app, AppState::Stopping, ChronoDuration::seconds(60));

    let err = h.orchestrator.start(app, &alice()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConcurrencyRejected);
    let err = h.orchestrator.stop(app, &alice()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConcurrencyRejected);
    let report = h.orchestrator.reap_abandoned().unwrap();
    assert_eq!((report.parked, report.in_flight), (0, 1));
    assert_eq!(h.executor.call_count(), 0);

    tokio::time::advance(Duration::from_secs(61)).await;

    let report = h.orchestrator.reap_abandoned().unwrap();
    assert_eq!((report.parked, report.in_flight), (1, 0));
    let parked = h.store.get_application(app).unwrap();
    assert_eq!(parked.state, AppState::Error);
    assert_eq!(parked.operation, None);
    assert!(parked.last_error.unwrap().starts_with("interrupted"));
}

#[tokio::test(start_paused = true)]
async fn test_start_takes_over_expired_lease() {
    let h = harness(MockExecutor::new());
    let app = new_app(&h, 60);
    lease_elsewhere(&h, app, AppState::Starting, ChronoDuration::seconds(-1));

    h.orchestrator.start(app, &alice()).await.unwrap();

    assert_eq!(state(&h, app), AppState::Running);
    assert_invariant(&h, app);
    let events = h.audit.events_for(app);
    let abandoned = events
        .iter()
        .find(|e| e.detail.starts_with("abandoned"))
        .unwrap();
    assert_eq!(abandoned.actor, "system");
    assert_eq!(abandoned.outcome, AuditOutcome::Failure);
    assert_eq!(events.last().unwrap().outcome, AuditOutcome::Success);
}

#[tokio::test(start_paused = true)]
async fn test_resync_keeps_deadline_of_concurrent_start() {
    let h = harness(MockExecutor::new());
    let app = new_app(&h, 60);

    // Simulates a resync whose store snapshot predates the start.
    let since = h.orchestrator.scheduler().generation();
    h.orchestrator.start(app, &alice()).await.unwrap();
    h.orchestrator
        .scheduler()
        .replace_all(since, std::collections::HashMap::new());

    assert!(h.orchestrator.scheduler().deadline(app).is_some());
    assert_invariant(&h, app);
}

// ============================================================================
// Administration
// ============================================================================

#[tokio::test]
async fn test_references_block_deletes() {
    let h = harness(MockExecutor::new());
    let app = new_app(&h, 60);

    let err = h.orchestrator.delete_server(h.server.id, &alice()).unwrap_err();
    assert!(matches!(err, CoreError::InUse { count: 1, .. }));
    let err = h.orchestrator.delete_project(h.project.id, &alice()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InUse);

    h.orchestrator.delete_application(app, false, &alice()).await.unwrap();
    h.orchestrator.delete_project(h.project.id, &alice()).unwrap();
    h.orchestrator.delete_server(h.server.id, &alice()).unwrap();
    assert!(h.orchestrator.list_servers().unwrap().is_empty());
}

#[tokio::test]
async fn test_project_names_are_unique() {
    let h = harness(MockExecutor::new());

    let err = h
        .orchestrator
        .create_project(
            NewProject {
                name: "Shop".into(),
                description: None,
            },
            &alice(),
        )
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test(start_paused = true)]
async fn test_delete_running_app_requires_force() {
    let h = harness(MockExecutor::new());
    let app = new_app(&h, 60);
    h.orchestrator.start(app, &alice()).await.unwrap();

    let err = h.orchestrator.delete_application(app, false, &alice()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    h.orchestrator.delete_application(app, true, &alice()).await.unwrap();

    assert_eq!(h.executor.calls_matching("down").len(), 1);
    assert!(h.orchestrator.scheduler().is_empty());
    assert_eq!(h.orchestrator.get_state(app).unwrap_err().kind(), ErrorKind::NotFound);
}

#[tokio::test(start_paused = true)]
async fn test_forced_delete_survives_failed_stop() {
    let h = harness(MockExecutor::new().with_responses(vec![
        MockResponse::success("up"),
        MockResponse::connection_refused("Connection refused"),
    ]));
    let app = new_app(&h, 60);
    h.orchestrator.start(app, &alice()).await.unwrap();

    h.orchestrator.delete_application(app, true, &alice()).await.unwrap();

    assert!(h.orchestrator.list_applications().unwrap().is_empty());
    assert!(h.orchestrator.scheduler().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_moving_running_app_is_rejected() {
    let h = harness(MockExecutor::new());
    let app = new_app(&h, 60);
    h.orchestrator.start(app, &alice()).await.unwrap();

    let err = h
        .orchestrator
        .update_application(
            app,
            ApplicationUpdate {
                working_directory: Some("/srv/shop-v2".into()),
                ..Default::default()
            },
            &alice(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    let status = h
        .orchestrator
        .update_application(
            app,
            ApplicationUpdate {
                domain: Some("shop.example.org".into()),
                ..Default::default()
            },
            &alice(),
        )
        .await
        .unwrap();
    assert_eq!(status.app_url, "https://shop.example.org");
    assert!(status.deadline_at.is_some());
}

#[tokio::test]
async fn test_create_application_validates_references() {
    let h = harness(MockExecutor::new());

    let err = h
        .orchestrator
        .create_application(
            NewApplication {
                name: "web".into(),
                project_id: h.project.id,
                server_id: uuid::Uuid::new_v4(),
                domain: String::new(),
                working_directory: "/srv/web".into(),
                auto_stop_minutes: None,
            },
            &alice(),
        )
        .unwrap_err();

    assert!(matches!(err, CoreError::NotFound { resource: "Server", .. }));
}

#[tokio::test]
async fn test_listing_by_project_and_server() {
    let h = harness(MockExecutor::new());
    let app = new_app(&h, 60);
    let other = h
        .orchestrator
        .create_project(
            NewProject {
                name: "blog".into(),
                description: None,
            },
            &alice(),
        )
        .unwrap();

    let in_shop = h.orchestrator.list_by_project(h.project.id).unwrap();
    assert_eq!(in_shop.len(), 1);
    assert_eq!(in_shop[0].application.id, app);
    assert!(h.orchestrator.list_by_project(other.id).unwrap().is_empty());
    assert_eq!(h.orchestrator.list_by_server(h.server.id).unwrap().len(), 1);
    assert_eq!(
        h.orchestrator.list_by_server(uuid::Uuid::new_v4()).unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[tokio::test]
async fn test_check_server_is_audited() {
    let mock = MockExecutor::new().add_response(MockResponse::success("4"));
    let h = harness_with(Arc::new(mock.clone()), mock, Reachability::Unknown);

    let report = h.orchestrator.check_server(h.server.id, &alice()).await.unwrap();

    assert_eq!(report.reachability(), Reachability::Online);
    let last = h.audit.events_for(h.server.id).pop().unwrap();
    assert_eq!(last.action, AuditAction::CheckServer);
    assert!(last.detail.starts_with("online"));
}
