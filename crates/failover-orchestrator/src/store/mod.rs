//! Durable store interface
//!
//! Every write is conditional on the record's `version`: a stale writer gets
//! `ConditionFailed` instead of overwriting newer state. Executions carry a
//! secondary index on status so the finder never scans.

pub mod memory;

pub use memory::InMemoryStore;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::{Execution, ExecutionStatus, ProtectionGroup, RecoveryPlan};
use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Errors returned by a store implementation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Stored version did not match the expected version
    #[error("condition failed on {record} {id}: expected version {expected_version}")]
    ConditionFailed {
        record: &'static str,
        id: Uuid,
        expected_version: u64,
    },

    /// Create targeted an existing record
    #[error("{record} already exists: {id}")]
    AlreadyExists { record: &'static str, id: Uuid },

    /// Update or delete targeted a missing record
    #[error("{record} not found: {id}")]
    NotFound { record: &'static str, id: Uuid },

    /// Backend failure
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Store result type
pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for OrchestratorError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::ConditionFailed {
                record,
                id,
                expected_version,
            } => OrchestratorError::ConsistencyViolation {
                record: record.to_string(),
                id: id.to_string(),
                expected_version,
            },
            StoreError::AlreadyExists { record, id } => OrchestratorError::ConsistencyViolation {
                record: record.to_string(),
                id: id.to_string(),
                expected_version: 0,
            },
            StoreError::NotFound { record, id } => OrchestratorError::not_found(record, id),
            StoreError::Backend(details) => OrchestratorError::StorageError { details },
        }
    }
}

/// Durable store with conditional writes
///
/// Versioning: `create_*` requires `version == 0` and stores version 1;
/// `update_*`/`put_*` succeed only when the stored version equals the
/// record's `version`, and return the new version.
#[async_trait]
pub trait OrchestrationStore: Send + Sync {
    /// Read an execution
    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<Execution>>;

    /// Create an execution; fails if the id exists
    ///
    /// Assigns `admission_seq`. A record with a lower sequence must already be
    /// visible to readers by the time a higher one is created.
    async fn create_execution(&self, execution: &Execution) -> StoreResult<u64>;

    /// Conditionally replace an execution
    async fn update_execution(&self, execution: &Execution) -> StoreResult<u64>;

    /// Executions with `status`, via the status index
    async fn list_executions_by_status(
        &self,
        status: ExecutionStatus,
    ) -> StoreResult<Vec<Execution>>;

    /// Read a protection group
    async fn get_protection_group(&self, id: Uuid) -> StoreResult<Option<ProtectionGroup>>;

    /// Create (`version == 0`) or conditionally replace a protection group
    async fn put_protection_group(&self, group: &ProtectionGroup) -> StoreResult<u64>;

    /// Conditionally delete a protection group
    async fn delete_protection_group(&self, id: Uuid, expected_version: u64) -> StoreResult<()>;

    /// All protection groups
    async fn list_protection_groups(&self) -> StoreResult<Vec<ProtectionGroup>>;

    /// Read a recovery plan
    async fn get_recovery_plan(&self, id: Uuid) -> StoreResult<Option<RecoveryPlan>>;

    /// Create (`version == 0`) or conditionally replace a recovery plan
    async fn put_recovery_plan(&self, plan: &RecoveryPlan) -> StoreResult<u64>;

    /// Conditionally delete a recovery plan
    async fn delete_recovery_plan(&self, id: Uuid, expected_version: u64) -> StoreResult<()>;

    /// All recovery plans
    async fn list_recovery_plans(&self) -> StoreResult<Vec<RecoveryPlan>>;
}

/// Outcome of a mutation closure
#[derive(Debug)]
pub enum Mutation<R> {
    /// Persist the modified execution
    Write(R),
    /// Nothing to persist
    Skip(R),
}

/// Executions that can still change, across all active statuses
pub async fn list_active_executions(
    store: &dyn OrchestrationStore,
) -> OrchestratorResult<Vec<Execution>> {
    let mut active: Vec<Execution> = Vec::new();
    for status in ExecutionStatus::ACTIVE {
        for execution in store.list_executions_by_status(status).await? {
            // an execution that moved between listings shows up twice
            if !active.iter().any(|e| e.id == execution.id) {
                active.push(execution);
            }
        }
    }
    active.sort_by_key(|e| e.created_at);
    Ok(active)
}

/// Read-modify-write an execution under optimistic concurrency
///
/// `mutate` runs against a fresh copy on every attempt, so it must derive its
/// decision from the execution it is given. Transition tables are checked
/// before each write. Losing a race re-reads and re-applies; after
/// `max_attempts` losses the call fails with an exhausted `TransientRemote`.
pub async fn mutate_execution<R, F>(
    store: &dyn OrchestrationStore,
    execution_id: Uuid,
    max_attempts: u32,
    mut mutate: F,
) -> OrchestratorResult<(Execution, R)>
where
    F: FnMut(&mut Execution) -> OrchestratorResult<Mutation<R>>,
{
    let max_attempts = max_attempts.max(1);
    let mut last_version = 0;

    for attempt in 1..=max_attempts {
        let current = store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("execution", execution_id))?;
        last_version = current.version;

        let mut next = current.clone();
        match mutate(&mut next)? {
            Mutation::Skip(result) => return Ok((current, result)),
            Mutation::Write(result) => {
                next.validate_successor_of(&current)?;
                next.version = current.version;
                next.updated_at = Utc::now();
                match store.update_execution(&next).await {
                    Ok(version) => {
                        next.version = version;
                        return Ok((next, result));
                    }
                    Err(StoreError::ConditionFailed { .. }) => {
                        debug!(
                            execution_id = %execution_id,
                            attempt,
                            "conditional write lost a race, re-reading"
                        );
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    // the version race is internal; callers see a retryable busy condition
    Err(OrchestratorError::TransientRemote {
        operation: "update_execution".to_string(),
        attempts: max_attempts,
        retry_exhausted: true,
        reason: format!(
            "execution {execution_id} kept changing concurrently (last seen version {last_version})"
        ),
    })
}
