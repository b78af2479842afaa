//! Execution engine

use super::step::{final_status, next_step, Step};
use crate::catalog::ProtectionCatalog;
use crate::clients::{ClientFactory, ResourceScope};
use crate::config::OrchestratorConfig;
use crate::conflict::{ConflictDetector, ConflictReport};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::launcher::{JobLauncher, LaunchRequest};
use crate::model::{
    Execution, ExecutionStatus, ExecutionType, ResourceStatus, Wave, WaveStatus,
};
use crate::notify::{CallbackTokens, NotificationEvent, NotificationMessage, Notifier, TokenOutcome};
use crate::poller::SettleHook;
use crate::retry::retry_remote;
use crate::store::{self, mutate_execution, Mutation, OrchestrationStore};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Parameters for starting an execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartExecutionRequest {
    /// Plan to run
    pub plan_id: Uuid,
    /// Drill or recovery
    pub execution_type: ExecutionType,
    /// Start even if resources already have recovered instances
    #[serde(default)]
    pub allow_existing_instances: bool,
}

impl StartExecutionRequest {
    /// Request without the existing-instance override
    pub fn new(plan_id: Uuid, execution_type: ExecutionType) -> Self {
        Self {
            plan_id,
            execution_type,
            allow_existing_instances: false,
        }
    }

    /// Builder: proceed despite existing recovered instances
    pub fn allowing_existing_instances(mut self) -> Self {
        self.allow_existing_instances = true;
        self
    }
}

/// Owns execution status: start, advance, pause, resume, cancel, finalize
///
/// Every change is a conditional write through [`mutate_execution`], so any
/// number of engines (and pollers) may act on the same execution.
pub struct ExecutionEngine {
    config: OrchestratorConfig,
    store: Arc<dyn OrchestrationStore>,
    factory: Arc<ClientFactory>,
    catalog: Arc<ProtectionCatalog>,
    detector: Arc<ConflictDetector>,
    launcher: Arc<JobLauncher>,
    tokens: Arc<dyn CallbackTokens>,
    notifier: Notifier,
}

impl ExecutionEngine {
    /// Create new execution engine
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn OrchestrationStore>,
        factory: Arc<ClientFactory>,
        catalog: Arc<ProtectionCatalog>,
        detector: Arc<ConflictDetector>,
        launcher: Arc<JobLauncher>,
        tokens: Arc<dyn CallbackTokens>,
        notifier: Notifier,
    ) -> Self {
        Self {
            config,
            store,
            factory,
            catalog,
            detector,
            launcher,
            tokens,
            notifier,
        }
    }

    /// Start a plan
    ///
    /// Group memberships are resolved and snapshotted into the waves, then
    /// checked for conflicts and existing recovered instances before the
    /// execution is created. Once stored, the execution is checked again
    /// against executions admitted before it; on overlap it is cancelled
    /// without launching and the call fails with `Conflict`. The first wave
    /// is launched (or paused) before this returns.
    pub async fn start_execution(
        &self,
        request: StartExecutionRequest,
    ) -> OrchestratorResult<Execution> {
        let plan = self.catalog.get_recovery_plan(request.plan_id).await?;
        let mut definitions = plan.waves.clone();
        definitions.sort_by_key(|w| w.wave_index);

        let mut waves = Vec::with_capacity(definitions.len());
        let mut by_scope: HashMap<ResourceScope, BTreeSet<String>> = HashMap::new();
        let mut owner: HashMap<String, usize> = HashMap::new();

        for definition in &definitions {
            let index = definition.wave_index;
            let group = self
                .catalog
                .get_protection_group(definition.protection_group_id)
                .await?;
            let scope = ProtectionCatalog::group_scope(&group, plan.account.as_ref());
            let members = self.catalog.resolve_members(&group, &scope).await?;

            if members.is_empty() {
                return Err(OrchestratorError::validation(
                    format!("waves[{index}]"),
                    format!("protection group {} resolves to no resources", group.name),
                ));
            }
            if members.len() > self.launcher.max_resources_per_wave() {
                return Err(OrchestratorError::validation(
                    format!("waves[{index}]"),
                    format!(
                        "{} resources exceed the per-wave limit of {}",
                        members.len(),
                        self.launcher.max_resources_per_wave()
                    ),
                ));
            }
            for member in &members {
                if let Some(previous) = owner.insert(member.clone(), index) {
                    return Err(OrchestratorError::validation(
                        format!("waves[{index}]"),
                        format!("{member} is already recovered by wave {previous}"),
                    ));
                }
            }

            by_scope
                .entry(scope.clone())
                .or_default()
                .extend(members.iter().cloned());
            waves.push(Wave::new(
                index,
                group.id,
                scope.region,
                scope.account,
                definition.pause_before_wave,
                members,
            ));
        }

        let mut report = ConflictReport::new();
        for (scope, resource_ids) in &by_scope {
            report.merge(self.detector.check_conflicts(scope, resource_ids, None).await?);
        }
        report.into_result()?;

        self.check_existing_instances(&by_scope, request.allow_existing_instances)
            .await?;

        let mut execution = Execution::new(
            plan.id,
            plan.name.clone(),
            request.execution_type,
            plan.account.clone(),
            waves,
        );
        execution.allow_existing_instances = request.allow_existing_instances;
        execution.version = self.store.create_execution(&execution).await?;

        let admission = self.detector.check_admission(execution.id).await?;
        if !admission.is_clear() {
            self.withdraw(execution.id).await?;
            warn!(
                execution_id = %execution.id,
                plan_id = %plan.id,
                "execution withdrawn, overlapping execution started first"
            );
            admission.into_result()?;
        }

        info!(
            execution_id = %execution.id,
            plan_id = %plan.id,
            waves = execution.waves.len(),
            execution_type = ?execution.execution_type,
            "execution started"
        );
        self.notify(&execution, NotificationEvent::ExecutionStarted)
            .await;

        self.advance(execution.id).await
    }

    /// Move an execution forward as far as it can go right now
    ///
    /// Promotes observed job outcomes, then launches, pauses before or waits
    /// on the first non-terminal wave. With no non-terminal wave left the
    /// execution is finalized.
    pub async fn advance(&self, execution_id: Uuid) -> OrchestratorResult<Execution> {
        let claim_timeout = chrono::Duration::from_std(self.config.launch_claim_timeout)
            .unwrap_or_else(|_| chrono::Duration::minutes(15));

        loop {
            let now = Utc::now();
            let (execution, step) = mutate_execution(
                self.store.as_ref(),
                execution_id,
                self.config.max_write_retries,
                |e| {
                    let (step, changed) = next_step(e, now, claim_timeout)?;
                    Ok(if changed {
                        Mutation::Write(step)
                    } else {
                        Mutation::Skip(step)
                    })
                },
            )
            .await?;

            match step {
                Step::Idle => return Ok(execution),
                Step::Finalize => return self.finalize(execution_id).await,
                Step::Pause { wave_index } => return self.pause_before(execution, wave_index).await,
                Step::Launch {
                    wave_index,
                    claim_id,
                } => {
                    if let Some(execution) = self.launch(&execution, wave_index, claim_id).await? {
                        return Ok(execution);
                    }
                }
            }
        }
    }

    /// Resume a paused execution with the token handed out at pause time
    ///
    /// A token that does not match the stored one (including any token after
    /// a successful resume) is rejected and nothing is launched.
    pub async fn resume_execution(
        &self,
        execution_id: Uuid,
        token: &str,
    ) -> OrchestratorResult<Execution> {
        let (execution, wave_index) = mutate_execution(
            self.store.as_ref(),
            execution_id,
            self.config.max_write_retries,
            |e| {
                if e.status.is_terminal() {
                    return Err(invalid_state(e, "resume"));
                }
                if e.status != ExecutionStatus::Paused || e.resume_token.as_deref() != Some(token) {
                    return Err(OrchestratorError::InvalidResumeToken {
                        execution_id: e.id.to_string(),
                    });
                }
                let wave_index = e.paused_before_wave_index.ok_or_else(|| {
                    OrchestratorError::validation(
                        "paused_before_wave_index",
                        "paused execution has no waiting wave",
                    )
                })?;
                if let Some(wave) = e.wave_mut(wave_index) {
                    wave.approved = true;
                }
                e.resume_token = None;
                e.paused_before_wave_index = None;
                e.transition(ExecutionStatus::Polling)?;
                Ok(Mutation::Write(wave_index))
            },
        )
        .await?;

        info!(execution_id = %execution_id, wave_index, "execution resumed");
        self.resolve_token(token, TokenOutcome::Resumed).await;
        self.notify(&execution, NotificationEvent::ExecutionResumed { wave_index })
            .await;

        self.advance(execution_id).await
    }

    /// Cancel an execution
    ///
    /// Remote jobs already running are left alone. Cancelling a cancelled
    /// execution is a no-op; completed or failed executions are rejected.
    pub async fn cancel_execution(&self, execution_id: Uuid) -> OrchestratorResult<Execution> {
        let (execution, cancelled) = mutate_execution(
            self.store.as_ref(),
            execution_id,
            self.config.max_write_retries,
            |e| match e.status {
                ExecutionStatus::Cancelled => Ok(Mutation::Skip(None)),
                ExecutionStatus::Completed | ExecutionStatus::Failed => {
                    Err(invalid_state(e, "cancel"))
                }
                _ => {
                    for wave in e.waves.iter_mut().filter(|w| !w.status.is_terminal()) {
                        wave.launch_claim = None;
                        wave.transition(WaveStatus::Cancelled)?;
                    }
                    let token = e.resume_token.take();
                    e.paused_before_wave_index = None;
                    e.transition(ExecutionStatus::Cancelled)?;
                    Ok(Mutation::Write(Some(token)))
                }
            },
        )
        .await?;

        match cancelled {
            Some(token) => {
                if let Some(token) = token {
                    self.resolve_token(&token, TokenOutcome::Cancelled).await;
                }
                info!(execution_id = %execution_id, "execution cancelled");
                self.notify(
                    &execution,
                    NotificationEvent::ExecutionFinished {
                        status: ExecutionStatus::Cancelled,
                    },
                )
                .await;
            }
            None => debug!(execution_id = %execution_id, "execution already cancelled"),
        }
        Ok(execution)
    }

    /// Cancel a freshly created execution that lost admission
    async fn withdraw(&self, execution_id: Uuid) -> OrchestratorResult<()> {
        mutate_execution(
            self.store.as_ref(),
            execution_id,
            self.config.max_write_retries,
            |e| {
                if e.status.is_terminal() {
                    return Ok(Mutation::Skip(()));
                }
                for wave in e.waves.iter_mut().filter(|w| !w.status.is_terminal()) {
                    wave.transition(WaveStatus::Cancelled)?;
                }
                e.transition(ExecutionStatus::Cancelled)?;
                Ok(Mutation::Write(()))
            },
        )
        .await?;
        Ok(())
    }

    /// Move an execution to its terminal status once every wave is terminal
    ///
    /// A no-op while any wave is non-terminal or when the execution is
    /// already terminal. Safe to race: only the caller whose write lands
    /// publishes the notification.
    pub async fn finalize(&self, execution_id: Uuid) -> OrchestratorResult<Execution> {
        let (execution, finished) = mutate_execution(
            self.store.as_ref(),
            execution_id,
            self.config.max_write_retries,
            |e| {
                if e.status.is_terminal() || !e.all_waves_terminal() {
                    return Ok(Mutation::Skip(false));
                }
                let status = final_status(e);
                e.resume_token = None;
                e.paused_before_wave_index = None;
                e.transition(status)?;
                Ok(Mutation::Write(true))
            },
        )
        .await?;

        if finished {
            info!(
                execution_id = %execution_id,
                status = %execution.status,
                "execution finished"
            );
            self.notify(
                &execution,
                NotificationEvent::ExecutionFinished {
                    status: execution.status,
                },
            )
            .await;
        } else {
            debug!(execution_id = %execution_id, status = %execution.status, "finalize was a no-op");
        }
        Ok(execution)
    }

    /// Read an execution
    pub async fn get_execution(&self, execution_id: Uuid) -> OrchestratorResult<Execution> {
        self.store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("execution", execution_id))
    }

    /// Executions that are pending, polling or paused
    pub async fn list_active_executions(&self) -> OrchestratorResult<Vec<Execution>> {
        store::list_active_executions(self.store.as_ref()).await
    }

    async fn check_existing_instances(
        &self,
        by_scope: &HashMap<ResourceScope, BTreeSet<String>>,
        allow_existing_instances: bool,
    ) -> OrchestratorResult<()> {
        let mut existing = BTreeSet::new();
        for (scope, resource_ids) in by_scope {
            let client = self.factory.recovery_client(scope).await?;
            let requested: Vec<String> = resource_ids.iter().cloned().collect();
            let servers = retry_remote(
                &self.config.remote_retry,
                "describe_resource_replication_state",
                |_| client.describe_resource_replication_state(&requested),
            )
            .await?;
            existing.extend(
                servers
                    .into_iter()
                    .filter(|s| s.recovery_instance_handle.is_some())
                    .map(|s| s.resource_id),
            );
        }

        if existing.is_empty() {
            return Ok(());
        }
        let resource_ids: Vec<String> = existing.into_iter().collect();
        if allow_existing_instances {
            warn!(
                resources = %resource_ids.join(", "),
                "starting despite existing recovered instances"
            );
            Ok(())
        } else {
            Err(OrchestratorError::ExistingInstances { resource_ids })
        }
    }

    async fn pause_before(
        &self,
        execution: Execution,
        wave_index: usize,
    ) -> OrchestratorResult<Execution> {
        let token = self
            .tokens
            .create_token(execution.id, wave_index, self.config.pause_timeout)
            .await
            .map_err(|e| OrchestratorError::RemoteApi {
                operation: "create_callback_token".to_string(),
                reason: e.to_string(),
            })?;

        let (execution, stored) = mutate_execution(
            self.store.as_ref(),
            execution.id,
            self.config.max_write_retries,
            |e| {
                if e.status.is_terminal() || e.status == ExecutionStatus::Paused {
                    return Ok(Mutation::Skip(false));
                }
                match e.current_wave() {
                    Some(w) if w.wave_index == wave_index && w.awaiting_approval() => {}
                    _ => return Ok(Mutation::Skip(false)),
                }
                e.transition(ExecutionStatus::Paused)?;
                e.paused_before_wave_index = Some(wave_index);
                e.resume_token = Some(token.clone());
                Ok(Mutation::Write(true))
            },
        )
        .await?;

        if stored {
            info!(execution_id = %execution.id, wave_index, "execution paused before wave");
            self.notify(&execution, NotificationEvent::ExecutionPaused { wave_index })
                .await;
        } else {
            debug!(execution_id = %execution.id, wave_index, "pause already recorded elsewhere");
            self.resolve_token(&token, TokenOutcome::Superseded).await;
        }
        Ok(execution)
    }

    /// Launch a claimed wave; `None` when the launch failed and was recorded
    async fn launch(
        &self,
        execution: &Execution,
        wave_index: usize,
        claim_id: Uuid,
    ) -> OrchestratorResult<Option<Execution>> {
        let wave = execution
            .wave(wave_index)
            .ok_or_else(|| OrchestratorError::not_found("wave", wave_index))?;
        let request = LaunchRequest {
            resource_ids: wave.resource_ids.clone(),
            scope: ResourceScope::new(wave.region.clone(), wave.account.clone()),
            is_drill: execution.execution_type.is_drill(),
        };

        match self.launcher.launch_wave(&request).await {
            Ok(job_id) => {
                let (execution, recorded) = mutate_execution(
                    self.store.as_ref(),
                    execution.id,
                    self.config.max_write_retries,
                    |e| {
                        let Some(wave) = e.wave_mut(wave_index) else {
                            return Ok(Mutation::Skip(false));
                        };
                        if wave.status != WaveStatus::Pending || wave.remote_job_id.is_some() {
                            return Ok(Mutation::Skip(false));
                        }
                        wave.remote_job_id = Some(job_id.clone());
                        wave.launch_claim = None;
                        wave.launched_at = Some(Utc::now());
                        wave.resources = wave
                            .resource_ids
                            .iter()
                            .map(ResourceStatus::pending)
                            .collect();
                        wave.transition(WaveStatus::Initiated)?;
                        if e.status == ExecutionStatus::Pending {
                            e.transition(ExecutionStatus::Polling)?;
                        }
                        Ok(Mutation::Write(true))
                    },
                )
                .await?;

                if recorded {
                    info!(
                        execution_id = %execution.id,
                        wave_index,
                        job_id = %job_id,
                        claim_id = %claim_id,
                        "wave launched"
                    );
                    self.notify(
                        &execution,
                        NotificationEvent::WaveLaunched { wave_index, job_id },
                    )
                    .await;
                } else {
                    error!(
                        execution_id = %execution.id,
                        wave_index,
                        job_id = %job_id,
                        "wave moved on while launching; job left unrecorded"
                    );
                }
                Ok(Some(execution))
            }
            Err(launch_error) => {
                error!(
                    execution_id = %execution.id,
                    wave_index,
                    error = %launch_error,
                    "wave launch failed"
                );
                let message = launch_error.to_string();
                mutate_execution(
                    self.store.as_ref(),
                    execution.id,
                    self.config.max_write_retries,
                    |e| {
                        let Some(wave) = e.wave_mut(wave_index) else {
                            return Ok(Mutation::Skip(()));
                        };
                        if wave.status != WaveStatus::Pending {
                            return Ok(Mutation::Skip(()));
                        }
                        wave.launch_claim = None;
                        wave.error = Some(message.clone());
                        wave.transition(WaveStatus::Failed)?;
                        Ok(Mutation::Write(()))
                    },
                )
                .await?;
                Ok(None)
            }
        }
    }

    async fn resolve_token(&self, token: &str, outcome: TokenOutcome) {
        if let Err(e) = self.tokens.resolve_token(token, outcome).await {
            warn!(outcome = ?outcome, error = %e, "failed to resolve callback token");
        }
    }

    async fn notify(&self, execution: &Execution, event: NotificationEvent) {
        self.notifier
            .notify(NotificationMessage {
                execution_id: execution.id,
                plan_id: execution.plan_id,
                plan_name: execution.plan_name.clone(),
                execution_type: execution.execution_type,
                event,
                timestamp: Utc::now(),
            })
            .await;
    }
}

#[async_trait]
impl SettleHook for ExecutionEngine {
    async fn settle(&self, execution_id: Uuid) -> OrchestratorResult<()> {
        self.advance(execution_id).await.map(|_| ())
    }
}

fn invalid_state(execution: &Execution, operation: &str) -> OrchestratorError {
    OrchestratorError::InvalidState {
        execution_id: execution.id.to_string(),
        status: execution.status.to_string(),
        operation: operation.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::RemoteApiError;
    use crate::conflict::ConflictSource;
    use crate::model::{LaunchState, WaveDefinition};
    use crate::testing::{PreemptingStore, TestHarness};

    async fn plan(harness: &TestHarness, waves: &[(&[&str], bool)]) -> Uuid {
        let mut definitions = Vec::new();
        for (i, (resources, pause)) in waves.iter().enumerate() {
            let group = harness.seed_group(&format!("group-{i}"), resources).await.unwrap();
            let mut definition = WaveDefinition::new(i, group.id);
            if *pause {
                definition = definition.with_pause();
            }
            definitions.push(definition);
        }
        harness.seed_plan("plan", definitions).await.unwrap().id
    }

    #[tokio::test]
    async fn test_start_launches_first_wave_only() {
        let harness = TestHarness::new();
        let plan_id = plan(&harness, &[(&["s-1", "s-2"], false), (&["s-3"], false)]).await;
        let engine = harness.engine();

        let execution = engine
            .start_execution(StartExecutionRequest::new(plan_id, ExecutionType::Drill))
            .await
            .unwrap();

        assert_eq!(execution.status, ExecutionStatus::Polling);
        assert_eq!(execution.waves[0].status, WaveStatus::Initiated);
        assert!(execution.waves[0].remote_job_id.is_some());
        assert_eq!(execution.waves[0].resources.len(), 2);
        assert_eq!(execution.waves[1].status, WaveStatus::Pending);
        assert_eq!(harness.recovery.start_calls(), 1);
        assert_eq!(harness.recovery.started_batches()[0], vec!["s-1", "s-2"]);
    }

    #[tokio::test]
    async fn test_start_withdraws_when_overlapping_execution_lands_first() {
        let harness = TestHarness::new();
        let plan_id = plan(&harness, &[(&["s-1", "s-2"], false)]).await;
        let rival = Execution::new(
            Uuid::new_v4(),
            "rival",
            ExecutionType::Drill,
            None,
            vec![Wave::new(
                0,
                Uuid::new_v4(),
                "us-east-1",
                None,
                false,
                vec!["s-2".to_string()],
            )],
        );
        let preempting = Arc::new(PreemptingStore::new(harness.store.clone(), rival.clone()));
        let engine = harness.engine_over(preempting);

        let err = engine
            .start_execution(StartExecutionRequest::new(plan_id, ExecutionType::Drill))
            .await
            .unwrap_err();
        match err {
            OrchestratorError::Conflict { conflicts } => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].resource_id, "s-2");
                assert_eq!(
                    conflicts[0].source,
                    ConflictSource::Execution {
                        execution_id: rival.id,
                        plan_id: rival.plan_id,
                    }
                );
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(harness.recovery.start_calls(), 0);
        let active = store::list_active_executions(harness.store.as_ref())
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, rival.id);

        let withdrawn = harness
            .store
            .list_executions_by_status(ExecutionStatus::Cancelled)
            .await
            .unwrap();
        assert_eq!(withdrawn.len(), 1);
        assert_eq!(withdrawn[0].plan_id, plan_id);
        assert!(withdrawn[0]
            .waves
            .iter()
            .all(|w| w.status == WaveStatus::Cancelled));
        assert!(harness.publisher.events().is_empty());
    }

    #[tokio::test]
    async fn test_start_unknown_plan_is_not_found() {
        let harness = TestHarness::new();
        let err = harness
            .engine()
            .start_execution(StartExecutionRequest::new(Uuid::new_v4(), ExecutionType::Recovery))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_existing_instances_block_start_unless_allowed() {
        let harness = TestHarness::new();
        let plan_id = plan(&harness, &[(&["s-1"], false)]).await;
        harness.recovery.set_existing_instance("s-1", "i-old");
        let engine = harness.engine();

        let err = engine
            .start_execution(StartExecutionRequest::new(plan_id, ExecutionType::Drill))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::ExistingInstances { .. }));
        assert_eq!(harness.store.execution_count(), 0);

        let execution = engine
            .start_execution(
                StartExecutionRequest::new(plan_id, ExecutionType::Drill)
                    .allowing_existing_instances(),
            )
            .await
            .unwrap();
        assert!(execution.allow_existing_instances);
        assert_eq!(execution.status, ExecutionStatus::Polling);
    }

    #[tokio::test]
    async fn test_oversize_wave_rejected_without_truncation() {
        let harness = TestHarness::with_max_resources_per_wave(2);
        let plan_id = plan(&harness, &[(&["s-1", "s-2", "s-3"], false)]).await;
        let err = harness
            .engine()
            .start_execution(StartExecutionRequest::new(plan_id, ExecutionType::Drill))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("per-wave limit"));
        assert_eq!(harness.recovery.start_calls(), 0);
    }

    #[tokio::test]
    async fn test_launch_failure_fails_execution() {
        let harness = TestHarness::new();
        let plan_id = plan(&harness, &[(&["s-1"], false), (&["s-2"], false)]).await;
        harness.recovery.fail_next_start(RemoteApiError::AccessDenied {
            message: "denied".to_string(),
        });

        let execution = harness
            .engine()
            .start_execution(StartExecutionRequest::new(plan_id, ExecutionType::Recovery))
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.waves[0].status, WaveStatus::Failed);
        assert!(execution.waves[0].error.as_ref().unwrap().contains("denied"));
        assert_eq!(execution.waves[1].status, WaveStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_pause_on_first_wave_then_resume() {
        let harness = TestHarness::new();
        let plan_id = plan(&harness, &[(&["s-1"], true)]).await;
        let engine = harness.engine();

        let paused = engine
            .start_execution(StartExecutionRequest::new(plan_id, ExecutionType::Drill))
            .await
            .unwrap();
        assert_eq!(paused.status, ExecutionStatus::Paused);
        assert_eq!(paused.paused_before_wave_index, Some(0));
        assert_eq!(harness.recovery.start_calls(), 0);

        let token = paused.resume_token.clone().unwrap();
        let resumed = engine.resume_execution(paused.id, &token).await.unwrap();
        assert_eq!(resumed.status, ExecutionStatus::Polling);
        assert!(resumed.waves[0].approved);
        assert_eq!(resumed.waves[0].status, WaveStatus::Initiated);
        assert_eq!(harness.tokens.outcome(&token), Some(TokenOutcome::Resumed));
    }

    #[tokio::test]
    async fn test_resume_with_wrong_token_rejected() {
        let harness = TestHarness::new();
        let plan_id = plan(&harness, &[(&["s-1"], true)]).await;
        let engine = harness.engine();
        let paused = engine
            .start_execution(StartExecutionRequest::new(plan_id, ExecutionType::Drill))
            .await
            .unwrap();

        let err = engine.resume_execution(paused.id, "forged").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidResumeToken { .. }));
        let stored = engine.get_execution(paused.id).await.unwrap();
        assert_eq!(stored.status, ExecutionStatus::Paused);
        assert_eq!(harness.recovery.start_calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_paused_execution_resolves_token() {
        let harness = TestHarness::new();
        let plan_id = plan(&harness, &[(&["s-1"], false), (&["s-2"], true)]).await;
        let engine = harness.engine();
        let execution = engine
            .start_execution(StartExecutionRequest::new(plan_id, ExecutionType::Drill))
            .await
            .unwrap();
        let job_id = execution.waves[0].remote_job_id.clone().unwrap();
        harness.recovery.complete_job(&job_id);
        harness.poller(Arc::new(engine)).poll_execution(execution.id).await.unwrap();

        let engine = harness.engine();
        let paused = engine.get_execution(execution.id).await.unwrap();
        assert_eq!(paused.status, ExecutionStatus::Paused);
        let token = paused.resume_token.clone().unwrap();

        let cancelled = engine.cancel_execution(execution.id).await.unwrap();
        assert_eq!(cancelled.status, ExecutionStatus::Cancelled);
        assert!(cancelled.resume_token.is_none());
        assert_eq!(cancelled.waves[1].status, WaveStatus::Cancelled);
        assert_eq!(harness.tokens.outcome(&token), Some(TokenOutcome::Cancelled));

        // repeated cancel is a no-op
        let again = engine.cancel_execution(execution.id).await.unwrap();
        assert_eq!(again.version, cancelled.version);

        let err = engine.resume_execution(execution.id, &token).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_cancel_completed_execution_rejected() {
        let harness = TestHarness::new();
        let plan_id = plan(&harness, &[(&["s-1"], false)]).await;
        let engine = Arc::new(harness.engine());
        let execution = engine
            .start_execution(StartExecutionRequest::new(plan_id, ExecutionType::Drill))
            .await
            .unwrap();
        let job_id = execution.waves[0].remote_job_id.clone().unwrap();
        harness.recovery.complete_job(&job_id);
        let outcome = harness
            .poller(engine.clone())
            .poll_execution(execution.id)
            .await
            .unwrap();
        assert_eq!(outcome.execution.status, ExecutionStatus::Completed);

        let err = engine.cancel_execution(execution.id).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_failed_job_fails_execution() {
        let harness = TestHarness::new();
        let plan_id = plan(&harness, &[(&["s-1", "s-2"], false), (&["s-3"], false)]).await;
        let engine = Arc::new(harness.engine());
        let execution = engine
            .start_execution(StartExecutionRequest::new(plan_id, ExecutionType::Recovery))
            .await
            .unwrap();
        let job_id = execution.waves[0].remote_job_id.clone().unwrap();
        harness
            .recovery
            .set_launch_state(&job_id, "s-2", LaunchState::Failed, None);
        harness.recovery.complete_job(&job_id);

        harness
            .poller(engine.clone())
            .poll_execution(execution.id)
            .await
            .unwrap();
        let finished = engine.get_execution(execution.id).await.unwrap();
        assert_eq!(finished.status, ExecutionStatus::Failed);
        assert_eq!(finished.waves[1].status, WaveStatus::Cancelled);
        assert!(finished.waves[0].error.as_ref().unwrap().contains("s-2"));
        assert_eq!(harness.recovery.start_calls(), 1);
    }

    #[tokio::test]
    async fn test_finalize_is_noop_while_waves_pending() {
        let harness = TestHarness::new();
        let plan_id = plan(&harness, &[(&["s-1"], false)]).await;
        let engine = harness.engine();
        let execution = engine
            .start_execution(StartExecutionRequest::new(plan_id, ExecutionType::Drill))
            .await
            .unwrap();

        let after = engine.finalize(execution.id).await.unwrap();
        assert_eq!(after.status, ExecutionStatus::Polling);
        assert_eq!(after.version, execution.version);
    }
}
