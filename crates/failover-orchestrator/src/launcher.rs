//! Retry-aware job launcher
//!
//! One `start_recovery_job` call per wave batch. Busy responses are retried
//! with exponential backoff up to the configured attempt bound; every other
//! remote error fails the launch immediately.

use crate::clients::{ClientFactory, RemoteApiError, ResourceScope};
use crate::config::LaunchConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::retry::{retry_with_backoff, RetryError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info};

/// A wave batch to launch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchRequest {
    /// Resources recovered under the one job
    pub resource_ids: Vec<String>,
    /// Where the resources live
    pub scope: ResourceScope,
    /// Launch in drill mode
    pub is_drill: bool,
}

/// Starts exactly one remote job per wave
pub struct JobLauncher {
    factory: Arc<ClientFactory>,
    config: LaunchConfig,
}

impl JobLauncher {
    /// Create new job launcher
    pub fn new(factory: Arc<ClientFactory>, config: LaunchConfig) -> Self {
        Self { factory, config }
    }

    /// Largest batch accepted by [`launch_wave`](Self::launch_wave)
    pub fn max_resources_per_wave(&self) -> usize {
        self.config.max_resources_per_wave
    }

    /// Launch the batch and return the remote job id
    pub async fn launch_wave(&self, request: &LaunchRequest) -> OrchestratorResult<String> {
        self.validate(request)?;
        let client = self.factory.recovery_client(&request.scope).await?;

        let result = retry_with_backoff(
            &self.config.conflict_retry,
            "start_recovery_job",
            RemoteApiError::is_conflict,
            |_| client.start_recovery_job(&request.resource_ids, request.is_drill),
        )
        .await;

        match result {
            Ok(job_id) => {
                info!(
                    job_id = %job_id,
                    scope = %request.scope,
                    resources = request.resource_ids.len(),
                    drill = request.is_drill,
                    "launched recovery job"
                );
                Ok(job_id)
            }
            Err(RetryError::Exhausted {
                attempts,
                last_error,
            }) => {
                error!(
                    scope = %request.scope,
                    attempts,
                    error = %last_error,
                    "launch gave up on busy resources"
                );
                Err(OrchestratorError::LaunchFailed {
                    attempts,
                    last_conflict: last_error.to_string(),
                })
            }
            Err(RetryError::Fatal { attempts, error }) => {
                error!(scope = %request.scope, error = %error, "launch rejected");
                Err(error.into_orchestrator_error("start_recovery_job", attempts, false))
            }
        }
    }

    fn validate(&self, request: &LaunchRequest) -> OrchestratorResult<()> {
        if request.resource_ids.is_empty() {
            return Err(OrchestratorError::validation(
                "resource_ids",
                "a wave must contain at least one resource",
            ));
        }
        if request.resource_ids.len() > self.config.max_resources_per_wave {
            return Err(OrchestratorError::validation(
                "resource_ids",
                format!(
                    "{} resources exceed the per-wave limit of {}",
                    request.resource_ids.len(),
                    self.config.max_resources_per_wave
                ),
            ));
        }
        let mut seen = HashSet::new();
        if let Some(duplicate) = request.resource_ids.iter().find(|id| !seen.insert(*id)) {
            return Err(OrchestratorError::validation(
                "resource_ids",
                format!("{duplicate} appears more than once"),
            ));
        }
        Ok(())
    }
}
