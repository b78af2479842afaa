//! Wave-based disaster recovery execution engine
//!
//! This crate drives recovery plans against a remote recovery API:
//! - Protection groups and recovery plans with wave dependency validation
//! - Cross-account client factory with cached assumed-role credentials
//! - Conflict detection against active executions and in-flight remote jobs
//! - Job launching with bounded conflict retries
//! - An execution state machine with pause-before-wave and resume tokens
//! - Reconciliation polling with adaptive spacing
//!
//! Every execution write is a conditional write on the record's version;
//! concurrent writers re-read and re-apply instead of overwriting.

#![warn(missing_docs)]

pub mod catalog;
pub mod clients;
pub mod config;
pub mod conflict;
pub mod error;
pub mod launcher;
pub mod model;
pub mod notify;
pub mod orchestrator;
pub mod poller;
pub mod retry;
pub mod scheduler;
pub mod state_machine;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

// Core error types and results
pub use error::{OrchestratorError, OrchestratorResult};

// Configuration exports
pub use config::{LaunchConfig, OrchestratorConfig, SchedulerConfig};

// Data model exports
pub use model::{
    AccountContext, Execution, ExecutionStatus, ExecutionType, JobOutcome, JobStatus,
    LaunchState, ProtectionGroup, RecoveryPlan, ResourceSelector, ResourceStatus, Wave,
    WaveDefinition, WaveStatus,
};

// Remote client exports
pub use clients::{
    ClientConnector, ClientFactory, InventoryApi, RecoveryApi, RemoteApiError, RoleAssumer,
    ServiceKind,
};

// Component exports
pub use catalog::ProtectionCatalog;
pub use conflict::{ConflictDetector, ConflictReport, ResourceConflict};
pub use launcher::{JobLauncher, LaunchRequest};
pub use notify::{CallbackTokens, NotificationEvent, Notifier, Publisher, TokenOutcome};
pub use orchestrator::Orchestrator;
pub use poller::{PollOutcome, ReconciliationPoller, SettleHook};
pub use retry::RetryPolicy;
pub use scheduler::{ExecutionFinder, FinderReport};
pub use state_machine::{ExecutionEngine, StartExecutionRequest};
pub use store::{InMemoryStore, OrchestrationStore};
