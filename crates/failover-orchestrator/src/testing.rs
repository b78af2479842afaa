//! In-memory doubles for every collaborator, plus a harness wiring them up
//!
//! Used by the unit tests, the integration tests and the benches. Nothing
//! here talks to a network.

use crate::catalog::ProtectionCatalog;
use crate::clients::{
    ClientConnector, ClientFactory, ClientScope, InstanceDetails, InventoryApi, JobParticipant,
    RecoveryApi, RecoveryJob, RemoteApiError, RemoteResult, ReplicationState, RoleAssumer,
    ScopedCredentials, SourceServer,
};
use crate::config::{LaunchConfig, OrchestratorConfig, SchedulerConfig};
use crate::conflict::ConflictDetector;
use crate::error::OrchestratorResult;
use crate::launcher::JobLauncher;
use crate::model::{
    Execution, JobStatus, LaunchState, ProtectionGroup, RecoveryPlan, ResourceSelector,
    WaveDefinition,
};
use crate::notify::{CallbackError, CallbackTokens, Notifier, Publisher, TokenOutcome};
use crate::orchestrator::Orchestrator;
use crate::poller::{ReconciliationPoller, SettleHook};
use crate::retry::RetryPolicy;
use crate::state_machine::ExecutionEngine;
use crate::store::{InMemoryStore, OrchestrationStore, StoreResult};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
struct RecoveryState {
    servers: BTreeMap<String, SourceServer>,
    jobs: BTreeMap<String, RecoveryJob>,
    job_order: Vec<String>,
    next_job: u32,
    start_calls: u32,
    started_batches: Vec<Vec<String>>,
    busy_remaining: u32,
    always_busy: bool,
    start_failure: Option<RemoteApiError>,
    describe_failures: u32,
    describe_failure: Option<RemoteApiError>,
    describe_calls: u32,
    list_jobs_failure: Option<RemoteApiError>,
    latency: Duration,
    terminated: Vec<String>,
}

impl RecoveryState {
    fn create_job(&mut self, resource_ids: &[String], is_drill: bool) -> String {
        self.next_job += 1;
        let job_id = format!("job-{:04}", self.next_job);
        let job = RecoveryJob {
            job_id: job_id.clone(),
            status: JobStatus::Pending,
            is_drill,
            participants: resource_ids
                .iter()
                .map(|id| JobParticipant {
                    resource_id: id.clone(),
                    launch_state: LaunchState::Pending,
                    recovery_instance_handle: None,
                })
                .collect(),
            created_at: Utc::now(),
        };
        self.jobs.insert(job_id.clone(), job);
        self.job_order.push(job_id.clone());
        job_id
    }
}

/// Scriptable recovery API
#[derive(Default)]
pub struct MockRecoveryApi {
    state: Mutex<RecoveryState>,
}

impl MockRecoveryApi {
    /// Empty mock: no servers, no jobs
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a replicating source server
    pub fn add_server(&self, resource_id: &str, tags: &[(&str, &str)]) {
        self.state.lock().servers.insert(
            resource_id.to_string(),
            SourceServer {
                resource_id: resource_id.to_string(),
                hostname: Some(format!("{resource_id}.internal")),
                tags: tags
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                replication_state: ReplicationState::Continuous,
                recovery_instance_handle: None,
            },
        );
    }

    /// Mark a server as already having a recovered instance
    pub fn set_existing_instance(&self, resource_id: &str, handle: &str) {
        if !self.state.lock().servers.contains_key(resource_id) {
            self.add_server(resource_id, &[]);
        }
        if let Some(server) = self.state.lock().servers.get_mut(resource_id) {
            server.recovery_instance_handle = Some(handle.to_string());
        }
    }

    /// Answer the next `count` start calls with a busy conflict
    pub fn set_busy_responses(&self, count: u32) {
        self.state.lock().busy_remaining = count;
    }

    /// Answer every start call with a busy conflict
    pub fn set_always_busy(&self, busy: bool) {
        self.state.lock().always_busy = busy;
    }

    /// Fail the next start call with `error`
    pub fn fail_next_start(&self, error: RemoteApiError) {
        self.state.lock().start_failure = Some(error);
    }

    /// Fail the next `count` describe calls with `error`
    pub fn fail_describe(&self, count: u32, error: RemoteApiError) {
        let mut state = self.state.lock();
        state.describe_failures = count;
        state.describe_failure = Some(error);
    }

    /// Fail every job listing with `error`
    pub fn fail_list_jobs(&self, error: RemoteApiError) {
        self.state.lock().list_jobs_failure = Some(error);
    }

    /// Delay job listings and replication lookups by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Instance handles passed to terminate calls, in order
    pub fn terminated_handles(&self) -> Vec<String> {
        self.state.lock().terminated.clone()
    }

    async fn simulate_latency(&self) {
        let latency = self.state.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    /// Start calls received, including rejected ones
    pub fn start_calls(&self) -> u32 {
        self.state.lock().start_calls
    }

    /// Batches of successful start calls, in order
    pub fn started_batches(&self) -> Vec<Vec<String>> {
        self.state.lock().started_batches.clone()
    }

    /// Every job id created, in order
    pub fn job_ids(&self) -> Vec<String> {
        self.state.lock().job_order.clone()
    }

    /// Describe calls received, including failed ones
    pub fn describe_calls(&self) -> u32 {
        self.state.lock().describe_calls
    }

    /// Create a job without going through `start_recovery_job`
    pub fn start_job_directly(&self, resource_ids: Vec<String>) -> String {
        self.state.lock().create_job(&resource_ids, true)
    }

    /// Register a job started outside the orchestrator
    pub fn add_external_job(&self, job: RecoveryJob) {
        let mut state = self.state.lock();
        state.job_order.push(job.job_id.clone());
        state.jobs.insert(job.job_id.clone(), job);
    }

    /// Set a job's status
    pub fn set_job_status(&self, job_id: &str, status: JobStatus) {
        if let Some(job) = self.state.lock().jobs.get_mut(job_id) {
            job.status = status;
        }
    }

    /// Set one participant's launch state and instance handle
    pub fn set_launch_state(
        &self,
        job_id: &str,
        resource_id: &str,
        launch_state: LaunchState,
        handle: Option<&str>,
    ) {
        if let Some(job) = self.state.lock().jobs.get_mut(job_id) {
            if let Some(p) = job
                .participants
                .iter_mut()
                .find(|p| p.resource_id == resource_id)
            {
                p.launch_state = launch_state;
                p.recovery_instance_handle = handle.map(str::to_string);
            }
        }
    }

    /// Finish a job: unsettled participants launch with handle `i-<resource>`
    pub fn complete_job(&self, job_id: &str) {
        if let Some(job) = self.state.lock().jobs.get_mut(job_id) {
            for p in job.participants.iter_mut() {
                if !p.launch_state.is_settled() {
                    p.launch_state = LaunchState::Launched;
                }
                if p.launch_state == LaunchState::Launched && p.recovery_instance_handle.is_none() {
                    p.recovery_instance_handle = Some(format!("i-{}", p.resource_id));
                }
            }
            job.status = JobStatus::Completed;
        }
    }
}

#[async_trait]
impl RecoveryApi for MockRecoveryApi {
    async fn start_recovery_job(
        &self,
        resource_ids: &[String],
        is_drill: bool,
    ) -> RemoteResult<String> {
        let mut state = self.state.lock();
        state.start_calls += 1;
        if state.always_busy || state.busy_remaining > 0 {
            state.busy_remaining = state.busy_remaining.saturating_sub(1);
            return Err(RemoteApiError::Conflict {
                message: "resources are busy with another job".to_string(),
                resource_ids: resource_ids.to_vec(),
            });
        }
        let engaged: Vec<String> = resource_ids
            .iter()
            .filter(|id| {
                state
                    .jobs
                    .values()
                    .any(|job| !job.is_terminal() && job.involves(id))
            })
            .cloned()
            .collect();
        if !engaged.is_empty() {
            return Err(RemoteApiError::Conflict {
                message: "resources are part of a job in progress".to_string(),
                resource_ids: engaged,
            });
        }
        if let Some(error) = state.start_failure.take() {
            return Err(error);
        }
        state.started_batches.push(resource_ids.to_vec());
        Ok(state.create_job(resource_ids, is_drill))
    }

    async fn describe_job(&self, job_id: &str) -> RemoteResult<RecoveryJob> {
        let mut state = self.state.lock();
        state.describe_calls += 1;
        if state.describe_failures > 0 {
            state.describe_failures -= 1;
            if let Some(error) = state.describe_failure.clone() {
                return Err(error);
            }
        }
        state
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| RemoteApiError::NotFound {
                message: format!("job {job_id}"),
            })
    }

    async fn list_jobs_in_progress(&self) -> RemoteResult<Vec<RecoveryJob>> {
        self.simulate_latency().await;
        let state = self.state.lock();
        if let Some(error) = state.list_jobs_failure.clone() {
            return Err(error);
        }
        Ok(state
            .job_order
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .filter(|job| !job.is_terminal())
            .cloned()
            .collect())
    }

    async fn describe_resource_replication_state(
        &self,
        resource_ids: &[String],
    ) -> RemoteResult<Vec<SourceServer>> {
        self.simulate_latency().await;
        let state = self.state.lock();
        Ok(resource_ids
            .iter()
            .filter_map(|id| state.servers.get(id))
            .cloned()
            .collect())
    }

    async fn list_source_servers(&self) -> RemoteResult<Vec<SourceServer>> {
        Ok(self.state.lock().servers.values().cloned().collect())
    }

    async fn terminate_recovered_instances(
        &self,
        instance_handles: &[String],
    ) -> RemoteResult<String> {
        if instance_handles.is_empty() {
            return Err(RemoteApiError::Validation {
                message: "no recovery instances given".to_string(),
            });
        }
        let mut state = self.state.lock();
        for server in state.servers.values_mut() {
            if server
                .recovery_instance_handle
                .as_ref()
                .is_some_and(|h| instance_handles.contains(h))
            {
                server.recovery_instance_handle = None;
            }
        }
        state.terminated.extend(instance_handles.iter().cloned());
        let job_id = state.create_job(&[], false);
        if let Some(job) = state.jobs.get_mut(&job_id) {
            job.status = JobStatus::Completed;
        }
        Ok(job_id)
    }
}

/// Inventory API backed by a map of handles
#[derive(Default)]
pub struct MockInventoryApi {
    instances: Mutex<HashMap<String, InstanceDetails>>,
    calls: Mutex<u32>,
}

impl MockInventoryApi {
    /// Empty inventory
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance
    pub fn add_instance(&self, details: InstanceDetails) {
        self.instances.lock().insert(details.handle.clone(), details);
    }

    /// Lookups received
    pub fn calls(&self) -> u32 {
        *self.calls.lock()
    }
}

#[async_trait]
impl InventoryApi for MockInventoryApi {
    async fn describe_instances(
        &self,
        handles: &[String],
    ) -> RemoteResult<HashMap<String, InstanceDetails>> {
        *self.calls.lock() += 1;
        let instances = self.instances.lock();
        Ok(handles
            .iter()
            .filter_map(|h| instances.get(h).map(|d| (h.clone(), d.clone())))
            .collect())
    }
}

/// Connector handing out the same clients for every scope
pub struct StaticConnector {
    recovery: Arc<dyn RecoveryApi>,
    inventory: Arc<dyn InventoryApi>,
    scopes: Mutex<Vec<ClientScope>>,
}

impl StaticConnector {
    /// Connector over fixed clients
    pub fn new(recovery: Arc<dyn RecoveryApi>, inventory: Arc<dyn InventoryApi>) -> Self {
        Self {
            recovery,
            inventory,
            scopes: Mutex::new(Vec::new()),
        }
    }

    /// Every scope a client was requested for
    pub fn scopes(&self) -> Vec<ClientScope> {
        self.scopes.lock().clone()
    }
}

impl ClientConnector for StaticConnector {
    fn recovery_client(&self, scope: &ClientScope) -> Arc<dyn RecoveryApi> {
        self.scopes.lock().push(scope.clone());
        self.recovery.clone()
    }

    fn inventory_client(&self, scope: &ClientScope) -> Arc<dyn InventoryApi> {
        self.scopes.lock().push(scope.clone());
        self.inventory.clone()
    }
}

/// One recorded role assumption
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssumeRoleCall {
    /// Role assumed
    pub role_arn: String,
    /// Session name presented
    pub session_name: String,
    /// External id presented
    pub external_id: String,
}

/// Role assumer issuing synthetic credentials
pub struct StaticRoleAssumer {
    lifetime: chrono::Duration,
    failure: Mutex<Option<RemoteApiError>>,
    calls: Mutex<Vec<AssumeRoleCall>>,
}

impl StaticRoleAssumer {
    /// Credentials valid for one hour
    pub fn new() -> Self {
        Self::with_lifetime(chrono::Duration::hours(1))
    }

    /// Credentials valid for `lifetime`
    pub fn with_lifetime(lifetime: chrono::Duration) -> Self {
        Self {
            lifetime,
            failure: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Fail every assumption with `error`
    pub fn fail_with(&self, error: RemoteApiError) {
        *self.failure.lock() = Some(error);
    }

    /// Assumptions attempted
    pub fn calls(&self) -> Vec<AssumeRoleCall> {
        self.calls.lock().clone()
    }
}

impl Default for StaticRoleAssumer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RoleAssumer for StaticRoleAssumer {
    async fn assume_role(
        &self,
        role_arn: &str,
        session_name: &str,
        external_id: &str,
    ) -> Result<ScopedCredentials, RemoteApiError> {
        self.calls.lock().push(AssumeRoleCall {
            role_arn: role_arn.to_string(),
            session_name: session_name.to_string(),
            external_id: external_id.to_string(),
        });
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }
        Ok(ScopedCredentials {
            access_key_id: format!("ASIA{}", self.calls.lock().len()),
            secret_access_key: "secret".to_string(),
            session_token: "session".to_string(),
            expires_at: Utc::now() + self.lifetime,
        })
    }
}

/// Publisher recording every message
#[derive(Default)]
pub struct RecordingPublisher {
    messages: Mutex<Vec<(String, String)>>,
    failing: Mutex<bool>,
    failed_attempts: Mutex<u32>,
}

impl RecordingPublisher {
    /// Publisher that accepts everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every publish while `failing`
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    /// Published `(topic, body)` pairs
    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().clone()
    }

    /// Rejected publishes
    pub fn failed_attempts(&self) -> u32 {
        *self.failed_attempts.lock()
    }

    /// `event` field of every published body
    pub fn events(&self) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .filter_map(|(_, body)| serde_json::from_str::<serde_json::Value>(body).ok())
            .filter_map(|v| v["event"].as_str().map(str::to_string))
            .collect()
    }

    /// Published bodies for one execution
    pub fn events_for(&self, execution_id: Uuid) -> Vec<serde_json::Value> {
        let id = execution_id.to_string();
        self.messages
            .lock()
            .iter()
            .filter_map(|(_, body)| serde_json::from_str::<serde_json::Value>(body).ok())
            .filter(|v| v["execution_id"].as_str() == Some(id.as_str()))
            .collect()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, topic: &str, message: &str) -> Result<(), CallbackError> {
        if *self.failing.lock() {
            *self.failed_attempts.lock() += 1;
            return Err(CallbackError {
                operation: "publish".to_string(),
                reason: "topic unavailable".to_string(),
            });
        }
        self.messages
            .lock()
            .push((topic.to_string(), message.to_string()));
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct TokenRecord {
    execution_id: Uuid,
    wave_index: usize,
    timeout: Duration,
    outcome: Option<TokenOutcome>,
}

/// Callback tokens held in memory
#[derive(Default)]
pub struct InMemoryCallbackTokens {
    tokens: Mutex<HashMap<String, TokenRecord>>,
}

impl InMemoryCallbackTokens {
    /// Empty token registry
    pub fn new() -> Self {
        Self::default()
    }

    /// How `token` was resolved, if it was
    pub fn outcome(&self, token: &str) -> Option<TokenOutcome> {
        self.tokens.lock().get(token).and_then(|r| r.outcome)
    }

    /// Timeout `token` was issued with
    pub fn timeout_of(&self, token: &str) -> Option<Duration> {
        self.tokens.lock().get(token).map(|r| r.timeout)
    }

    /// Tokens issued for an execution, as `(token, wave_index)`
    pub fn issued_for(&self, execution_id: Uuid) -> Vec<(String, usize)> {
        let mut issued: Vec<_> = self
            .tokens
            .lock()
            .iter()
            .filter(|(_, r)| r.execution_id == execution_id)
            .map(|(t, r)| (t.clone(), r.wave_index))
            .collect();
        issued.sort_by_key(|(_, wave)| *wave);
        issued
    }
}

#[async_trait]
impl CallbackTokens for InMemoryCallbackTokens {
    async fn create_token(
        &self,
        execution_id: Uuid,
        wave_index: usize,
        timeout: Duration,
    ) -> Result<String, CallbackError> {
        let token = format!("cb-{}", Uuid::new_v4().simple());
        self.tokens.lock().insert(
            token.clone(),
            TokenRecord {
                execution_id,
                wave_index,
                timeout,
                outcome: None,
            },
        );
        Ok(token)
    }

    async fn resolve_token(&self, token: &str, outcome: TokenOutcome) -> Result<(), CallbackError> {
        let mut tokens = self.tokens.lock();
        let record = tokens.get_mut(token).ok_or_else(|| CallbackError {
            operation: "resolve_token".to_string(),
            reason: "unknown token".to_string(),
        })?;
        if record.outcome.is_some() {
            return Err(CallbackError {
                operation: "resolve_token".to_string(),
                reason: "token already resolved".to_string(),
            });
        }
        record.outcome = Some(outcome);
        Ok(())
    }
}

/// Store that lets a competing writer win the next `interfering_writes`
/// execution updates
pub struct InterferingStore {
    inner: Arc<InMemoryStore>,
    remaining: Mutex<usize>,
}

impl InterferingStore {
    /// Wrap `inner`
    pub fn new(inner: Arc<InMemoryStore>, interfering_writes: usize) -> Self {
        Self {
            inner,
            remaining: Mutex::new(interfering_writes),
        }
    }
}

#[async_trait]
impl OrchestrationStore for InterferingStore {
    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<Execution>> {
        self.inner.get_execution(id).await
    }

    async fn create_execution(&self, execution: &Execution) -> StoreResult<u64> {
        self.inner.create_execution(execution).await
    }

    async fn update_execution(&self, execution: &Execution) -> StoreResult<u64> {
        let interfere = {
            let mut remaining = self.remaining.lock();
            if *remaining > 0 {
                *remaining -= 1;
                true
            } else {
                false
            }
        };
        if interfere {
            if let Some(current) = self.inner.get_execution(execution.id).await? {
                self.inner.update_execution(&current).await?;
            }
        }
        self.inner.update_execution(execution).await
    }

    async fn list_executions_by_status(
        &self,
        status: crate::model::ExecutionStatus,
    ) -> StoreResult<Vec<Execution>> {
        self.inner.list_executions_by_status(status).await
    }

    async fn get_protection_group(&self, id: Uuid) -> StoreResult<Option<ProtectionGroup>> {
        self.inner.get_protection_group(id).await
    }

    async fn put_protection_group(&self, group: &ProtectionGroup) -> StoreResult<u64> {
        self.inner.put_protection_group(group).await
    }

    async fn delete_protection_group(&self, id: Uuid, expected_version: u64) -> StoreResult<()> {
        self.inner.delete_protection_group(id, expected_version).await
    }

    async fn list_protection_groups(&self) -> StoreResult<Vec<ProtectionGroup>> {
        self.inner.list_protection_groups().await
    }

    async fn get_recovery_plan(&self, id: Uuid) -> StoreResult<Option<RecoveryPlan>> {
        self.inner.get_recovery_plan(id).await
    }

    async fn put_recovery_plan(&self, plan: &RecoveryPlan) -> StoreResult<u64> {
        self.inner.put_recovery_plan(plan).await
    }

    async fn delete_recovery_plan(&self, id: Uuid, expected_version: u64) -> StoreResult<()> {
        self.inner.delete_recovery_plan(id, expected_version).await
    }

    async fn list_recovery_plans(&self) -> StoreResult<Vec<RecoveryPlan>> {
        self.inner.list_recovery_plans().await
    }
}

/// Store that slips `rival` in just ahead of the next execution create
///
/// Models a concurrent start whose record lands after this start's conflict
/// check but before its own write.
pub struct PreemptingStore {
    inner: Arc<InMemoryStore>,
    rival: Mutex<Option<Execution>>,
}

impl PreemptingStore {
    /// Wrap `inner`
    pub fn new(inner: Arc<InMemoryStore>, rival: Execution) -> Self {
        Self {
            inner,
            rival: Mutex::new(Some(rival)),
        }
    }
}

#[async_trait]
impl OrchestrationStore for PreemptingStore {
    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<Execution>> {
        self.inner.get_execution(id).await
    }

    async fn create_execution(&self, execution: &Execution) -> StoreResult<u64> {
        let rival = self.rival.lock().take();
        if let Some(rival) = rival {
            self.inner.create_execution(&rival).await?;
        }
        self.inner.create_execution(execution).await
    }

    async fn update_execution(&self, execution: &Execution) -> StoreResult<u64> {
        self.inner.update_execution(execution).await
    }

    async fn list_executions_by_status(
        &self,
        status: crate::model::ExecutionStatus,
    ) -> StoreResult<Vec<Execution>> {
        self.inner.list_executions_by_status(status).await
    }

    async fn get_protection_group(&self, id: Uuid) -> StoreResult<Option<ProtectionGroup>> {
        self.inner.get_protection_group(id).await
    }

    async fn put_protection_group(&self, group: &ProtectionGroup) -> StoreResult<u64> {
        self.inner.put_protection_group(group).await
    }

    async fn delete_protection_group(&self, id: Uuid, expected_version: u64) -> StoreResult<()> {
        self.inner.delete_protection_group(id, expected_version).await
    }

    async fn list_protection_groups(&self) -> StoreResult<Vec<ProtectionGroup>> {
        self.inner.list_protection_groups().await
    }

    async fn get_recovery_plan(&self, id: Uuid) -> StoreResult<Option<RecoveryPlan>> {
        self.inner.get_recovery_plan(id).await
    }

    async fn put_recovery_plan(&self, plan: &RecoveryPlan) -> StoreResult<u64> {
        self.inner.put_recovery_plan(plan).await
    }

    async fn delete_recovery_plan(&self, id: Uuid, expected_version: u64) -> StoreResult<()> {
        self.inner.delete_recovery_plan(id, expected_version).await
    }

    async fn list_recovery_plans(&self) -> StoreResult<Vec<RecoveryPlan>> {
        self.inner.list_recovery_plans().await
    }
}

/// Settle hook that only records calls, standing in for a slow state machine
#[derive(Default)]
pub struct RecordingSettleHook {
    calls: Mutex<Vec<Uuid>>,
}

impl RecordingSettleHook {
    /// New hook
    pub fn new() -> Self {
        Self::default()
    }

    /// Executions settled, in call order
    pub fn calls(&self) -> Vec<Uuid> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl SettleHook for RecordingSettleHook {
    async fn settle(&self, execution_id: Uuid) -> OrchestratorResult<()> {
        self.calls.lock().push(execution_id);
        Ok(())
    }
}

/// Configuration with millisecond backoffs
pub fn fast_config() -> OrchestratorConfig {
    let fast = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
        backoff_multiplier: 2.0,
        jitter_factor: 0.0,
    };
    OrchestratorConfig {
        launch: LaunchConfig {
            conflict_retry: RetryPolicy {
                max_attempts: 4,
                ..fast.clone()
            },
            max_resources_per_wave: 100,
        },
        remote_retry: fast,
        scheduler: SchedulerConfig {
            tick_interval: Duration::from_millis(10),
            base_poll_interval: Duration::from_secs(1),
            idle_threshold: 2,
            max_staleness: Duration::from_secs(8),
            max_concurrent_polls: 4,
        },
        ..OrchestratorConfig::default()
    }
}

/// Every double wired to one shared store and client factory
pub struct TestHarness {
    /// Configuration handed to every component
    pub config: OrchestratorConfig,
    /// Shared store
    pub store: Arc<InMemoryStore>,
    /// Recovery API double
    pub recovery: Arc<MockRecoveryApi>,
    /// Inventory API double
    pub inventory: Arc<MockInventoryApi>,
    /// Connector behind the factory
    pub connector: Arc<StaticConnector>,
    /// Role assumer behind the factory
    pub assumer: Arc<StaticRoleAssumer>,
    /// Callback tokens
    pub tokens: Arc<InMemoryCallbackTokens>,
    /// Notification sink
    pub publisher: Arc<RecordingPublisher>,
    factory: Arc<ClientFactory>,
}

impl TestHarness {
    /// Harness over [`fast_config`]
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    /// Harness with a smaller per-wave batch limit
    pub fn with_max_resources_per_wave(limit: usize) -> Self {
        let mut config = fast_config();
        config.launch.max_resources_per_wave = limit;
        Self::with_config(config)
    }

    /// Harness over `config`
    pub fn with_config(config: OrchestratorConfig) -> Self {
        let recovery = Arc::new(MockRecoveryApi::new());
        let inventory = Arc::new(MockInventoryApi::new());
        let connector = Arc::new(StaticConnector::new(recovery.clone(), inventory.clone()));
        let assumer = Arc::new(StaticRoleAssumer::new());
        let factory = Arc::new(ClientFactory::new(
            connector.clone(),
            assumer.clone(),
            config.role_session_name.clone(),
            config.credential_refresh_margin,
        ));
        Self {
            config,
            store: Arc::new(InMemoryStore::new()),
            recovery,
            inventory,
            connector,
            assumer,
            tokens: Arc::new(InMemoryCallbackTokens::new()),
            publisher: Arc::new(RecordingPublisher::new()),
            factory,
        }
    }

    /// Shared client factory
    pub fn factory(&self) -> Arc<ClientFactory> {
        self.factory.clone()
    }

    /// Conflict detector over the shared store
    pub fn detector(&self) -> Arc<ConflictDetector> {
        Arc::new(ConflictDetector::new(
            self.store.clone(),
            self.factory(),
            self.config.remote_retry.clone(),
        ))
    }

    /// Catalog over the shared store
    pub fn catalog(&self) -> ProtectionCatalog {
        ProtectionCatalog::new(
            self.store.clone(),
            self.factory(),
            self.detector(),
            self.config.remote_retry.clone(),
        )
    }

    /// Execution engine over the shared doubles
    pub fn engine(&self) -> ExecutionEngine {
        self.engine_over(self.store.clone())
    }

    /// Execution engine whose catalog, detector and state all go through `store`
    pub fn engine_over(&self, store: Arc<dyn OrchestrationStore>) -> ExecutionEngine {
        let detector = Arc::new(ConflictDetector::new(
            store.clone(),
            self.factory(),
            self.config.remote_retry.clone(),
        ));
        let catalog = ProtectionCatalog::new(
            store.clone(),
            self.factory(),
            detector.clone(),
            self.config.remote_retry.clone(),
        );
        ExecutionEngine::new(
            self.config.clone(),
            store,
            self.factory(),
            Arc::new(catalog),
            detector,
            Arc::new(JobLauncher::new(self.factory(), self.config.launch.clone())),
            self.tokens.clone(),
            Notifier::new(self.publisher.clone(), self.config.notification_topic.clone()),
        )
    }

    /// Poller settling through `hook`
    pub fn poller(&self, hook: Arc<dyn SettleHook>) -> ReconciliationPoller {
        ReconciliationPoller::new(
            self.store.clone(),
            self.factory(),
            hook,
            self.config.remote_retry.clone(),
            self.config.max_write_retries,
        )
    }

    /// Fully wired orchestrator
    pub fn orchestrator(&self) -> OrchestratorResult<Orchestrator> {
        Orchestrator::new(
            self.config.clone(),
            self.store.clone(),
            self.factory(),
            self.tokens.clone(),
            self.publisher.clone(),
        )
    }

    /// Register `resources` remotely and create an explicit group over them
    /// in `us-east-1`
    pub async fn seed_group(
        &self,
        name: &str,
        resources: &[&str],
    ) -> OrchestratorResult<ProtectionGroup> {
        for resource in resources {
            self.recovery.add_server(resource, &[]);
        }
        self.catalog()
            .create_protection_group(ProtectionGroup::new(
                name,
                "us-east-1",
                None,
                ResourceSelector::Explicit(resources.iter().map(|r| r.to_string()).collect()),
            ))
            .await
    }

    /// Save a plan over existing groups
    pub async fn seed_plan(
        &self,
        name: &str,
        waves: Vec<WaveDefinition>,
    ) -> OrchestratorResult<RecoveryPlan> {
        self.catalog()
            .save_recovery_plan(RecoveryPlan::new(name, None, waves))
            .await
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
