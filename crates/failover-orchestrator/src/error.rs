//! Failover orchestration error types

use crate::conflict::ResourceConflict;
use thiserror::Error;

/// Failover orchestration error types
///
/// Variants map onto the operator-facing taxonomy: configuration problems are
/// surfaced immediately, conflicts become 409-style responses, transient remote
/// failures are retried up to a bound, and consistency violations are expected
/// races that callers re-read and retry.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Bad plan, group or role configuration
    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    /// Request failed validation
    #[error("Validation failed for {field}: {reason}")]
    ValidationError { field: String, reason: String },

    /// One or more resources are engaged elsewhere
    #[error("Resource conflict: {}", summarize_conflicts(.conflicts))]
    Conflict { conflicts: Vec<ResourceConflict> },

    /// Resources already have recovered instances and no override was given
    #[error(
        "{} resource(s) already have recovered instances: {}",
        .resource_ids.len(),
        .resource_ids.join(", ")
    )]
    ExistingInstances { resource_ids: Vec<String> },

    /// Remote call failed with a retryable condition
    #[error(
        "Transient remote error during {operation} after {attempts} attempt(s){}: {reason}",
        exhausted_suffix(.retry_exhausted)
    )]
    TransientRemote {
        operation: String,
        attempts: u32,
        retry_exhausted: bool,
        reason: String,
    },

    /// Remote call failed with a non-retryable condition
    #[error("Remote API error during {operation}: {reason}")]
    RemoteApi { operation: String, reason: String },

    /// Conditional write lost to a concurrent writer
    #[error("Consistency violation on {record} {id}: expected version {expected_version}")]
    ConsistencyViolation {
        record: String,
        id: String,
        expected_version: u64,
    },

    /// Plan, group, execution or resource not found
    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    /// Role assumption into a target account failed
    #[error("Cross-account authentication failed for {account_id} ({role_name}): {reason}")]
    CrossAccountAuth {
        account_id: String,
        role_name: String,
        reason: String,
    },

    /// Launch retries exhausted on busy responses
    #[error("Launch failed after {attempts} attempt(s): {last_conflict}")]
    LaunchFailed { attempts: u32, last_conflict: String },

    /// Status change not permitted by the transition table
    #[error("Invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    /// Operation not permitted in the execution's current status
    #[error("Cannot {operation} execution {execution_id} in status {status}")]
    InvalidState {
        execution_id: String,
        status: String,
        operation: String,
    },

    /// Resume token does not match the stored token
    #[error("Resume token rejected for execution {execution_id}")]
    InvalidResumeToken { execution_id: String },

    /// Storage backend failure
    #[error("Storage error: {details}")]
    StorageError { details: String },

    /// JSON serialization/deserialization error
    #[error("JSON error: {source}")]
    JsonError {
        #[from]
        source: serde_json::Error,
    },
}

/// Failover orchestration result type
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

impl OrchestratorError {
    /// Shorthand for a `NotFound` error
    pub fn not_found(kind: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.to_string(),
        }
    }

    /// Shorthand for a `ValidationError`
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Whether the caller may retry the operation unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConsistencyViolation { .. }
                | Self::TransientRemote {
                    retry_exhausted: false,
                    ..
                }
        )
    }

    /// Whether the error carries detail meant for an operator
    pub fn is_user_facing(&self) -> bool {
        !matches!(self, Self::ConsistencyViolation { .. })
    }

    /// HTTP status an API layer should map this error to
    pub fn http_status_hint(&self) -> u16 {
        match self {
            Self::ConfigurationError { .. }
            | Self::ValidationError { .. }
            | Self::InvalidTransition { .. } => 400,
            Self::CrossAccountAuth { .. } => 403,
            Self::NotFound { .. } => 404,
            Self::Conflict { .. }
            | Self::ExistingInstances { .. }
            | Self::InvalidState { .. }
            | Self::InvalidResumeToken { .. }
            | Self::ConsistencyViolation { .. } => 409,
            Self::TransientRemote { .. } | Self::LaunchFailed { .. } => 503,
            Self::RemoteApi { .. } => 502,
            Self::StorageError { .. } | Self::JsonError { .. } => 500,
        }
    }
}

fn exhausted_suffix(retry_exhausted: &bool) -> &'static str {
    if *retry_exhausted {
        " (retries exhausted)"
    } else {
        ""
    }
}

fn summarize_conflicts(conflicts: &[ResourceConflict]) -> String {
    if conflicts.is_empty() {
        return "no details".to_string();
    }
    conflicts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
