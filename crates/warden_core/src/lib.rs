//! # warden_core
//!
//! Lifecycle orchestration for containerized applications spread over a
//! fleet of SSH-reachable servers.
//!
//! # Architecture
//!
//! - **Store**: file-per-record JSON persistence of servers, projects and applications
//! - **Registry**: server lookup and health checks
//! - **Lifecycle**: the pure state machine every transition goes through
//! - **Scheduler**: process-wide auto-stop deadlines
//! - **Orchestrator**: serializes start/stop per application and ties it all together
//! - **Audit**: append-only trail of transitions and admin changes
//! - **Credentials**: private keys sealed with AES-256-GCM behind opaque handles
//!
//! # Example
//!
//! ```rust,ignore
//! use warden_core::{Orchestrator, Requester, WardenConfig};
//!
//! let config = WardenConfig::load(None)?;
//! let orchestrator = Orchestrator::from_config(&config)?;
//! orchestrator.recover()?;
//! let _worker = orchestrator.spawn_deadline_worker();
//!
//! let outcome = orchestrator.start(app_id, &Requester::new("alice")).await?;
//! println!("running until {}", outcome.deadline_at);
//! ```

pub mod audit;
pub mod cipher;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod error;
pub mod lifecycle;
pub mod models;
pub mod orchestrator;
pub mod registry;
pub mod scheduler;
pub mod store;

// Re-export main types for convenience
pub use audit::{
    Actor, AuditAction, AuditEvent, AuditFilter, AuditOutcome, AuditPage, AuditSink, ClientMeta,
    JsonlAuditSink, MemoryAuditSink, Requester, ResourceType,
};
pub use cipher::KeyCipher;
pub use clock::{Clock, SystemClock, TokioClock};
pub use config::{SshConfig, WardenConfig};
pub use credentials::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use error::{CoreError, CoreResult, ErrorKind};
pub use lifecycle::{deadline_for, transition, AppState, InvalidTransition, LifecycleEvent};
pub use models::{
    AppId, Application, ApplicationStatus, ApplicationUpdate, NewApplication, NewProject,
    NewServer, OperationLease, Project, ProjectId, ProjectUpdate, Reachability, SecretHandle,
    Server, ServerId, ServerInfo, ServerUpdate, StartOutcome, StopOutcome,
};
pub use orchestrator::{
    format_elapsed, LifecycleSettings, Orchestrator, OrchestratorBuilder, RecoveryReport,
};
pub use registry::{HealthReport, ServerRegistry};
pub use scheduler::DeadlineScheduler;
pub use store::FileStore;
