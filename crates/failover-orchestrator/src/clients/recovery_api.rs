//! Remote recovery API and inventory API interfaces

use crate::error::OrchestratorError;
use crate::model::{JobStatus, LaunchState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Errors returned by the remote APIs, classified for retry decisions
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteApiError {
    /// Resource busy / conflicting request
    #[error("conflict: {message}")]
    Conflict {
        message: String,
        resource_ids: Vec<String>,
    },
    /// Request throttled
    #[error("throttled: {message}")]
    Throttled { message: String },
    /// Request timed out
    #[error("timeout: {message}")]
    Timeout { message: String },
    /// Server-side failure
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String },
    /// Target does not exist
    #[error("not found: {message}")]
    NotFound { message: String },
    /// Request rejected as invalid
    #[error("validation: {message}")]
    Validation { message: String },
    /// Caller lacks permission
    #[error("access denied: {message}")]
    AccessDenied { message: String },
}

impl RemoteApiError {
    /// Resource-busy responses
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Throttling, timeouts and server-side failures
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Throttled { .. } | Self::Timeout { .. } | Self::ServiceUnavailable { .. }
        )
    }

    /// Map onto the orchestrator taxonomy after `attempts` calls
    pub fn into_orchestrator_error(
        self,
        operation: &str,
        attempts: u32,
        retry_exhausted: bool,
    ) -> OrchestratorError {
        if self.is_transient() {
            return OrchestratorError::TransientRemote {
                operation: operation.to_string(),
                attempts,
                retry_exhausted,
                reason: self.to_string(),
            };
        }
        match self {
            Self::NotFound { message } => OrchestratorError::not_found("remote resource", message),
            Self::Validation { message } => OrchestratorError::validation(operation, message),
            other => OrchestratorError::RemoteApi {
                operation: operation.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

/// Result type for remote calls
pub type RemoteResult<T> = Result<T, RemoteApiError>;

/// A resource's membership in a remote job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParticipant {
    /// Protected resource ID
    pub resource_id: String,
    /// Launch state
    pub launch_state: LaunchState,
    /// Recovered instance, once one exists
    pub recovery_instance_handle: Option<String>,
}

/// Remote recovery job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryJob {
    /// Job ID
    pub job_id: String,
    /// Job status
    pub status: JobStatus,
    /// Drill job
    pub is_drill: bool,
    /// Participating resources
    pub participants: Vec<JobParticipant>,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
}

impl RecoveryJob {
    /// Whether the job has finished
    pub fn is_terminal(&self) -> bool {
        self.status == JobStatus::Completed
    }

    /// Whether the job involves `resource_id`
    pub fn involves(&self, resource_id: &str) -> bool {
        self.participants.iter().any(|p| p.resource_id == resource_id)
    }
}

/// Replication health of a source server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicationState {
    /// Initial sync running
    InitialSync,
    /// Continuously replicating
    Continuous,
    /// Replication stalled
    Stalled,
    /// Disconnected
    Disconnected,
}

/// Protected resource as known to the recovery API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceServer {
    /// Resource ID
    pub resource_id: String,
    /// Source hostname
    pub hostname: Option<String>,
    /// Resource tags
    pub tags: BTreeMap<String, String>,
    /// Replication state
    pub replication_state: ReplicationState,
    /// Existing recovered instance, if one was launched earlier
    pub recovery_instance_handle: Option<String>,
}

/// Recovery API operations used by the engine
#[async_trait]
pub trait RecoveryApi: Send + Sync {
    /// Start one recovery job for the whole batch
    async fn start_recovery_job(&self, resource_ids: &[String], is_drill: bool)
        -> RemoteResult<String>;

    /// Describe a job and its per-resource launch states
    async fn describe_job(&self, job_id: &str) -> RemoteResult<RecoveryJob>;

    /// Jobs currently running in the account/region
    async fn list_jobs_in_progress(&self) -> RemoteResult<Vec<RecoveryJob>>;

    /// Replication state of specific resources; unknown ids are omitted
    async fn describe_resource_replication_state(
        &self,
        resource_ids: &[String],
    ) -> RemoteResult<Vec<SourceServer>>;

    /// Every source server, for tag-based selection
    async fn list_source_servers(&self) -> RemoteResult<Vec<SourceServer>>;

    /// Terminate recovered instances; returns the id of the terminate job
    async fn terminate_recovered_instances(
        &self,
        instance_handles: &[String],
    ) -> RemoteResult<String>;
}

/// Recovered instance details from the inventory API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceDetails {
    /// Instance handle
    pub handle: String,
    /// Private address
    pub address: Option<String>,
    /// Display name
    pub display_name: Option<String>,
    /// Instance type
    pub instance_type: Option<String>,
    /// Launch time
    pub launch_time: Option<DateTime<Utc>>,
}

/// Compute inventory operations used for enrichment
#[async_trait]
pub trait InventoryApi: Send + Sync {
    /// Batch lookup by handle; unknown handles are omitted
    async fn describe_instances(
        &self,
        handles: &[String],
    ) -> RemoteResult<HashMap<String, InstanceDetails>>;
}
