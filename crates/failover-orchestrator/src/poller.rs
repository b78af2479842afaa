//! Reconciliation poller
//!
//! Brings in-flight waves up to date with their remote jobs. The poller
//! writes wave and resource fields only: it never sets an execution status
//! and never moves a wave to a terminal status. A terminal job is recorded
//! as the wave's `job_outcome`, and the settle hook (the state machine)
//! decides what that means.

use crate::clients::{ClientFactory, ResourceScope};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::{
    Execution, ExecutionStatus, JobOutcome, JobStatus, LaunchState, ResourceStatus, Wave,
    WaveStatus,
};
use crate::retry::{retry_remote, RetryPolicy};
use crate::store::{mutate_execution, Mutation, OrchestrationStore};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Called after every poll write so the owner of execution status can react
#[async_trait]
pub trait SettleHook: Send + Sync {
    /// Settle the execution: promote outcomes, advance, finalize
    async fn settle(&self, execution_id: Uuid) -> OrchestratorResult<()>;
}

/// Result of polling one execution
#[derive(Debug, Clone)]
pub struct PollOutcome {
    /// Execution after the poll and settle
    pub execution: Execution,
    /// Whether any wave or resource field changed
    pub changed: bool,
}

/// Reconciliation poller
pub struct ReconciliationPoller {
    store: Arc<dyn OrchestrationStore>,
    factory: Arc<ClientFactory>,
    settle: Arc<dyn SettleHook>,
    remote_retry: RetryPolicy,
    max_write_retries: u32,
}

impl ReconciliationPoller {
    /// Create new poller
    pub fn new(
        store: Arc<dyn OrchestrationStore>,
        factory: Arc<ClientFactory>,
        settle: Arc<dyn SettleHook>,
        remote_retry: RetryPolicy,
        max_write_retries: u32,
    ) -> Self {
        Self {
            store,
            factory,
            settle,
            remote_retry,
            max_write_retries,
        }
    }

    /// Observe one wave's remote job and return the updated wave
    ///
    /// Waves that are not in flight come back unchanged. Inventory
    /// enrichment is optional: a failed lookup is logged and skipped.
    pub async fn poll_wave(&self, execution: &Execution, wave: &Wave) -> OrchestratorResult<Wave> {
        if !wave.status.is_in_flight() {
            return Ok(wave.clone());
        }
        let job_id = wave.remote_job_id.as_deref().ok_or_else(|| {
            OrchestratorError::validation(
                format!("waves[{}].remote_job_id", wave.wave_index),
                "in-flight wave has no remote job",
            )
        })?;

        let scope = ResourceScope::new(wave.region.clone(), wave.account.clone());
        let client = self.factory.recovery_client(&scope).await?;
        let job = retry_remote(&self.remote_retry, "describe_job", |_| {
            client.describe_job(job_id)
        })
        .await?;

        let mut updated = wave.clone();
        for resource_id in &wave.resource_ids {
            if !updated.resources.iter().any(|r| &r.resource_id == resource_id) {
                updated.resources.push(ResourceStatus::pending(resource_id));
            }
        }
        for participant in &job.participants {
            let index = match updated
                .resources
                .iter()
                .position(|r| r.resource_id == participant.resource_id)
            {
                Some(index) => index,
                None => {
                    updated
                        .resources
                        .push(ResourceStatus::pending(&participant.resource_id));
                    updated.resources.len() - 1
                }
            };
            let resource = &mut updated.resources[index];
            resource.launch_state = participant.launch_state;
            if participant.recovery_instance_handle.is_some() {
                resource.recovered_instance_handle = participant.recovery_instance_handle.clone();
            }
        }

        self.enrich(&scope, &mut updated.resources, execution.id).await;

        if job.status != JobStatus::Pending && updated.status == WaveStatus::Initiated {
            updated.transition(WaveStatus::Started)?;
        }

        let total = job.participants.len().max(wave.resource_ids.len()).max(1);
        let settled = job
            .participants
            .iter()
            .filter(|p| p.launch_state.is_settled())
            .count();
        let observed = if job.is_terminal() {
            100
        } else {
            ((settled * 100 / total) as u8).min(99)
        };
        updated.progress_percent = updated.progress_percent.max(observed);

        if job.is_terminal() && updated.job_outcome.is_none() {
            let failed_resources: Vec<String> = updated
                .resources
                .iter()
                .filter(|r| r.launch_state != LaunchState::Launched)
                .map(|r| r.resource_id.clone())
                .collect();
            updated.job_outcome = Some(if failed_resources.is_empty() {
                JobOutcome::Succeeded
            } else {
                JobOutcome::Failed { failed_resources }
            });
            info!(
                execution_id = %execution.id,
                wave_index = wave.wave_index,
                job_id,
                outcome = ?updated.job_outcome,
                "observed terminal recovery job"
            );
        }

        Ok(updated)
    }

    /// Poll every in-flight wave of a polling execution, record what was
    /// observed, then hand the execution to the settle hook
    pub async fn poll_execution(&self, execution_id: Uuid) -> OrchestratorResult<PollOutcome> {
        let execution = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("execution", execution_id))?;
        if execution.status != ExecutionStatus::Polling {
            debug!(execution_id = %execution_id, status = %execution.status, "not polling, skipped");
            return Ok(PollOutcome {
                execution,
                changed: false,
            });
        }

        let mut observed = Vec::new();
        for wave in execution.waves.iter().filter(|w| w.status.is_in_flight()) {
            observed.push(self.poll_wave(&execution, wave).await?);
        }

        let now = Utc::now();
        let (_, changed) = mutate_execution(
            self.store.as_ref(),
            execution_id,
            self.max_write_retries,
            |e| {
                if e.status.is_terminal() {
                    return Ok(Mutation::Skip(false));
                }
                let mut changed = false;
                for fresh in &observed {
                    let Some(current) = e.wave_mut(fresh.wave_index) else {
                        continue;
                    };
                    // The state machine may have settled or cancelled it meanwhile.
                    if !current.status.is_in_flight() || current.remote_job_id != fresh.remote_job_id {
                        continue;
                    }
                    changed |= merge_observation(current, fresh)?;
                }
                e.poll.last_polled_at = Some(now);
                e.poll.unchanged_polls = if changed {
                    0
                } else {
                    e.poll.unchanged_polls.saturating_add(1)
                };
                Ok(Mutation::Write(changed))
            },
        )
        .await?;

        self.settle.settle(execution_id).await?;

        let execution = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("execution", execution_id))?;
        Ok(PollOutcome { execution, changed })
    }

    async fn enrich(&self, scope: &ResourceScope, resources: &mut [ResourceStatus], execution_id: Uuid) {
        let handles: Vec<String> = resources
            .iter()
            .filter_map(|r| r.recovered_instance_handle.clone())
            .collect();
        if handles.is_empty() {
            return;
        }

        let details = match self.factory.inventory_client(scope).await {
            Ok(client) => {
                retry_remote(&self.remote_retry, "describe_instances", |_| {
                    client.describe_instances(&handles)
                })
                .await
            }
            Err(e) => Err(e),
        };
        let details = match details {
            Ok(details) => details,
            Err(e) => {
                warn!(execution_id = %execution_id, error = %e, "instance enrichment skipped");
                return;
            }
        };

        for resource in resources.iter_mut() {
            let Some(found) = resource
                .recovered_instance_handle
                .as_ref()
                .and_then(|h| details.get(h))
            else {
                continue;
            };
            if found.address.is_some() {
                resource.address = found.address.clone();
            }
            if found.display_name.is_some() {
                resource.display_name = found.display_name.clone();
            }
            if found.instance_type.is_some() {
                resource.instance_type = found.instance_type.clone();
            }
            if found.launch_time.is_some() {
                resource.launch_timestamp = found.launch_time;
            }
        }
    }
}

/// Copy poller-owned fields from `fresh` into `current`; returns whether anything changed
fn merge_observation(current: &mut Wave, fresh: &Wave) -> OrchestratorResult<bool> {
    let mut changed = false;

    if fresh.status != current.status && !fresh.status.is_terminal() {
        current.transition(fresh.status)?;
        changed = true;
    }
    if current.resources != fresh.resources {
        current.resources = fresh.resources.clone();
        changed = true;
    }
    if fresh.progress_percent > current.progress_percent {
        current.progress_percent = fresh.progress_percent;
        changed = true;
    }
    if current.job_outcome.is_none() && fresh.job_outcome.is_some() {
        current.job_outcome = fresh.job_outcome.clone();
        changed = true;
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{InstanceDetails, RemoteApiError};
    use crate::model::ExecutionType;
    use crate::testing::{RecordingSettleHook, TestHarness};

    async fn launched_execution(harness: &TestHarness, resources: &[&str]) -> Execution {
        let job_id = harness
            .recovery
            .start_job_directly(resources.iter().map(|r| r.to_string()).collect());
        let mut wave = Wave::new(
            0,
            Uuid::new_v4(),
            "us-east-1",
            None,
            false,
            resources.iter().map(|r| r.to_string()).collect(),
        );
        wave.remote_job_id = Some(job_id);
        wave.status = WaveStatus::Initiated;
        let mut execution = Execution::new(Uuid::new_v4(), "plan", ExecutionType::Drill, None, vec![wave]);
        execution.status = ExecutionStatus::Polling;
        harness.store.create_execution(&execution).await.unwrap();
        harness.store.get_execution(execution.id).await.unwrap().unwrap()
    }

    fn poller(harness: &TestHarness, hook: Arc<RecordingSettleHook>) -> ReconciliationPoller {
        harness.poller(hook)
    }

    #[tokio::test]
    async fn test_poll_wave_merges_membership_and_progress() {
        let harness = TestHarness::new();
        let execution = launched_execution(&harness, &["s-1", "s-2"]).await;
        let job_id = execution.waves[0].remote_job_id.clone().unwrap();
        harness.recovery.set_job_status(&job_id, JobStatus::Started);
        harness
            .recovery
            .set_launch_state(&job_id, "s-1", LaunchState::Launched, Some("i-1"));
        harness.inventory.add_instance(InstanceDetails {
            handle: "i-1".to_string(),
            address: Some("10.0.0.5".to_string()),
            display_name: Some("db-1".to_string()),
            instance_type: Some("m5.large".to_string()),
            launch_time: Some(Utc::now()),
        });

        let poller = poller(&harness, Arc::new(RecordingSettleHook::new()));
        let wave = poller.poll_wave(&execution, &execution.waves[0]).await.unwrap();

        assert_eq!(wave.status, WaveStatus::Started);
        assert_eq!(wave.progress_percent, 50);
        assert!(wave.job_outcome.is_none());
        let s1 = wave.resources.iter().find(|r| r.resource_id == "s-1").unwrap();
        assert_eq!(s1.address.as_deref(), Some("10.0.0.5"));
        assert_eq!(s1.display_name.as_deref(), Some("db-1"));
        let s2 = wave.resources.iter().find(|r| r.resource_id == "s-2").unwrap();
        assert!(s2.recovered_instance_handle.is_none());
        assert!(s2.address.is_none());
    }

    #[tokio::test]
    async fn test_progress_capped_until_terminal() {
        let harness = TestHarness::new();
        let execution = launched_execution(&harness, &["s-1"]).await;
        let job_id = execution.waves[0].remote_job_id.clone().unwrap();
        harness
            .recovery
            .set_launch_state(&job_id, "s-1", LaunchState::Launched, Some("i-1"));
        harness.recovery.set_job_status(&job_id, JobStatus::Started);

        let poller = poller(&harness, Arc::new(RecordingSettleHook::new()));
        let wave = poller.poll_wave(&execution, &execution.waves[0]).await.unwrap();
        assert_eq!(wave.progress_percent, 99);

        harness.recovery.set_job_status(&job_id, JobStatus::Completed);
        let wave = poller.poll_wave(&execution, &wave).await.unwrap();
        assert_eq!(wave.progress_percent, 100);
        assert_eq!(wave.job_outcome, Some(JobOutcome::Succeeded));
        // terminal status belongs to the state machine
        assert_eq!(wave.status, WaveStatus::Started);
    }

    #[tokio::test]
    async fn test_poll_execution_never_writes_terminal_status() {
        let harness = TestHarness::new();
        let execution = launched_execution(&harness, &["s-1"]).await;
        let job_id = execution.waves[0].remote_job_id.clone().unwrap();
        harness.recovery.complete_job(&job_id);

        let hook = Arc::new(RecordingSettleHook::new());
        let outcome = poller(&harness, hook.clone())
            .poll_execution(execution.id)
            .await
            .unwrap();

        assert!(outcome.changed);
        assert_eq!(outcome.execution.status, ExecutionStatus::Polling);
        assert_eq!(outcome.execution.waves[0].status, WaveStatus::Started);
        assert_eq!(outcome.execution.waves[0].job_outcome, Some(JobOutcome::Succeeded));
        assert_eq!(hook.calls(), vec![execution.id]);
    }

    #[tokio::test]
    async fn test_unchanged_polls_are_counted() {
        let harness = TestHarness::new();
        let execution = launched_execution(&harness, &["s-1"]).await;
        let poller = poller(&harness, Arc::new(RecordingSettleHook::new()));

        // first poll fills in resource membership, the second sees nothing new
        let first = poller.poll_execution(execution.id).await.unwrap();
        assert!(first.changed);
        assert_eq!(first.execution.poll.unchanged_polls, 0);

        let second = poller.poll_execution(execution.id).await.unwrap();
        assert!(!second.changed);
        assert_eq!(second.execution.poll.unchanged_polls, 1);
        assert!(second.execution.poll.last_polled_at.is_some());
    }

    #[tokio::test]
    async fn test_transient_describe_errors_are_retried() {
        let harness = TestHarness::new();
        let execution = launched_execution(&harness, &["s-1"]).await;
        harness.recovery.fail_describe(
            2,
            RemoteApiError::Throttled {
                message: "rate".to_string(),
            },
        );

        let poller = poller(&harness, Arc::new(RecordingSettleHook::new()));
        assert!(poller.poll_wave(&execution, &execution.waves[0]).await.is_ok());
        assert_eq!(harness.recovery.describe_calls(), 3);
    }

    #[tokio::test]
    async fn test_describe_retry_exhaustion_surfaces() {
        let harness = TestHarness::new();
        let execution = launched_execution(&harness, &["s-1"]).await;
        harness.recovery.fail_describe(
            100,
            RemoteApiError::ServiceUnavailable {
                message: "down".to_string(),
            },
        );

        let err = poller(&harness, Arc::new(RecordingSettleHook::new()))
            .poll_execution(execution.id)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::TransientRemote {
                retry_exhausted: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_non_polling_execution_skipped() {
        let harness = TestHarness::new();
        let execution = launched_execution(&harness, &["s-1"]).await;
        let mut stored = harness.store.get_execution(execution.id).await.unwrap().unwrap();
        stored.transition(ExecutionStatus::Cancelled).unwrap();
        stored.waves[0].transition(WaveStatus::Cancelled).unwrap();
        harness.store.update_execution(&stored).await.unwrap();

        let hook = Arc::new(RecordingSettleHook::new());
        let outcome = poller(&harness, hook.clone())
            .poll_execution(execution.id)
            .await
            .unwrap();
        assert!(!outcome.changed);
        assert!(hook.calls().is_empty());
        assert_eq!(harness.recovery.describe_calls(), 0);
    }

    #[test]
    fn test_merge_never_regresses_progress() {
        let mut current = Wave::new(0, Uuid::new_v4(), "r", None, false, vec!["s-1".to_string()]);
        current.status = WaveStatus::Started;
        current.progress_percent = 60;
        let mut fresh = current.clone();
        fresh.progress_percent = 40;
        assert!(!merge_observation(&mut current, &fresh).unwrap());
        assert_eq!(current.progress_percent, 60);
    }
}
