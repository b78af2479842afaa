//! Orchestrator facade
//!
//! Wires the catalog, conflict detector, launcher, execution engine, poller
//! and finder over one store and one client factory, and exposes the
//! operations an API layer calls.

use crate::catalog::ProtectionCatalog;
use crate::clients::ClientFactory;
use crate::config::OrchestratorConfig;
use crate::conflict::ConflictDetector;
use crate::error::OrchestratorResult;
use crate::launcher::JobLauncher;
use crate::model::{Execution, ExecutionType};
use crate::notify::{CallbackTokens, Notifier, Publisher};
use crate::poller::{PollOutcome, ReconciliationPoller};
use crate::scheduler::{ExecutionFinder, FinderReport};
use crate::state_machine::{ExecutionEngine, StartExecutionRequest};
use crate::store::OrchestrationStore;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

/// Failover orchestrator
pub struct Orchestrator {
    config: OrchestratorConfig,
    catalog: Arc<ProtectionCatalog>,
    engine: Arc<ExecutionEngine>,
    poller: Arc<ReconciliationPoller>,
    finder: Arc<ExecutionFinder>,
}

impl Orchestrator {
    /// Create new orchestrator
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn OrchestrationStore>,
        factory: Arc<ClientFactory>,
        tokens: Arc<dyn CallbackTokens>,
        publisher: Arc<dyn Publisher>,
    ) -> OrchestratorResult<Self> {
        config.validate()?;

        let detector = Arc::new(ConflictDetector::new(
            store.clone(),
            factory.clone(),
            config.remote_retry.clone(),
        ));
        let catalog = Arc::new(ProtectionCatalog::new(
            store.clone(),
            factory.clone(),
            detector.clone(),
            config.remote_retry.clone(),
        ));
        let launcher = Arc::new(JobLauncher::new(factory.clone(), config.launch.clone()));
        let notifier = Notifier::new(publisher, config.notification_topic.clone());
        let engine = Arc::new(ExecutionEngine::new(
            config.clone(),
            store.clone(),
            factory.clone(),
            catalog.clone(),
            detector,
            launcher,
            tokens,
            notifier,
        ));
        let poller = Arc::new(ReconciliationPoller::new(
            store.clone(),
            factory,
            engine.clone(),
            config.remote_retry.clone(),
            config.max_write_retries,
        ));
        let finder = Arc::new(ExecutionFinder::new(
            store,
            poller.clone(),
            config.scheduler.clone(),
        ));

        info!(topic = %config.notification_topic, "orchestrator initialized");
        Ok(Self {
            config,
            catalog,
            engine,
            poller,
            finder,
        })
    }

    /// Active configuration
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Protection group and plan management
    pub fn catalog(&self) -> &ProtectionCatalog {
        &self.catalog
    }

    /// Execution state machine
    pub fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    /// StartExecution
    pub async fn start_execution(
        &self,
        plan_id: Uuid,
        execution_type: ExecutionType,
    ) -> OrchestratorResult<Execution> {
        self.engine
            .start_execution(StartExecutionRequest::new(plan_id, execution_type))
            .await
    }

    /// StartExecution with every option
    pub async fn start_execution_with(
        &self,
        request: StartExecutionRequest,
    ) -> OrchestratorResult<Execution> {
        self.engine.start_execution(request).await
    }

    /// ResumeExecution
    pub async fn resume_execution(
        &self,
        execution_id: Uuid,
        token: &str,
    ) -> OrchestratorResult<Execution> {
        self.engine.resume_execution(execution_id, token).await
    }

    /// CancelExecution
    pub async fn cancel_execution(&self, execution_id: Uuid) -> OrchestratorResult<Execution> {
        self.engine.cancel_execution(execution_id).await
    }

    /// GetExecution
    pub async fn get_execution(&self, execution_id: Uuid) -> OrchestratorResult<Execution> {
        self.engine.get_execution(execution_id).await
    }

    /// ListActiveExecutions
    pub async fn list_active_executions(&self) -> OrchestratorResult<Vec<Execution>> {
        self.engine.list_active_executions().await
    }

    /// Poll one execution now, regardless of adaptive spacing
    pub async fn poll_execution(&self, execution_id: Uuid) -> OrchestratorResult<PollOutcome> {
        self.poller.poll_execution(execution_id).await
    }

    /// One finder tick at the current time
    pub async fn run_finder_once(&self) -> OrchestratorResult<FinderReport> {
        self.finder.run_once(Utc::now()).await
    }

    /// Drive the finder until `shutdown` flips to `true`
    pub async fn run_finder(&self, shutdown: watch::Receiver<bool>) {
        self.finder.run(shutdown).await
    }
}
