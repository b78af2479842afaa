//! Conflict detector
//!
//! `check_conflicts` is best-effort: two starts can both pass it. Each start
//! then stores its execution and runs `check_admission`, which only the
//! later-admitted of two overlapping executions fails.

use super::dependencies::DependencyGraph;
use super::{ConflictReport, ConflictSource};
use crate::clients::{ClientFactory, ResourceScope};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::model::{ProtectionGroup, RecoveryPlan, ResourceSelector, Wave};
use crate::retry::{retry_remote, RetryPolicy};
use crate::store::{list_active_executions, OrchestrationStore};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Detects resources engaged by other executions, live remote jobs or groups
pub struct ConflictDetector {
    store: Arc<dyn OrchestrationStore>,
    factory: Arc<ClientFactory>,
    remote_retry: RetryPolicy,
}

impl ConflictDetector {
    /// Create new conflict detector
    pub fn new(
        store: Arc<dyn OrchestrationStore>,
        factory: Arc<ClientFactory>,
        remote_retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            factory,
            remote_retry,
        }
    }

    /// Check `resource_ids` in `scope` against active executions and remote jobs
    ///
    /// `exclude_execution` is left out of both checks, including the remote
    /// jobs it launched.
    pub async fn check_conflicts(
        &self,
        scope: &ResourceScope,
        resource_ids: &BTreeSet<String>,
        exclude_execution: Option<Uuid>,
    ) -> OrchestratorResult<ConflictReport> {
        let mut report = ConflictReport::new();
        if resource_ids.is_empty() {
            return Ok(report);
        }

        let mut known_jobs = HashSet::new();
        for execution in list_active_executions(self.store.as_ref()).await? {
            known_jobs.extend(execution.waves.iter().filter_map(|w| w.remote_job_id.clone()));
            if Some(execution.id) == exclude_execution {
                continue;
            }
            for wave in execution.waves.iter().filter(|w| in_scope(w, scope)) {
                for resource_id in wave.resource_ids.iter().filter(|r| resource_ids.contains(*r)) {
                    report.push(
                        resource_id.clone(),
                        ConflictSource::Execution {
                            execution_id: execution.id,
                            plan_id: execution.plan_id,
                        },
                    );
                }
            }
        }

        let client = self.factory.recovery_client(scope).await?;
        let jobs = retry_remote(&self.remote_retry, "list_jobs_in_progress", |_| {
            client.list_jobs_in_progress()
        })
        .await?;

        for job in jobs.iter().filter(|j| !j.is_terminal()) {
            // Jobs owned by active executions are already reported (or excluded) above.
            if known_jobs.contains(&job.job_id) {
                continue;
            }
            for participant in &job.participants {
                if resource_ids.contains(&participant.resource_id) {
                    report.push(
                        participant.resource_id.clone(),
                        ConflictSource::RemoteJob {
                            job_id: job.job_id.clone(),
                        },
                    );
                }
            }
        }

        if report.is_clear() {
            debug!(scope = %scope, resources = resource_ids.len(), "no conflicts");
        } else {
            info!(
                scope = %scope,
                conflicts = report.conflicts().len(),
                "conflicting resources detected"
            );
        }
        Ok(report)
    }

    /// Overlaps between a stored execution and those admitted before it
    ///
    /// Run right after `execution_id` is created and before anything is
    /// launched for it. Executions admitted later are ignored; they run this
    /// check themselves and see this one.
    pub async fn check_admission(&self, execution_id: Uuid) -> OrchestratorResult<ConflictReport> {
        let admitted = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("execution", execution_id))?;

        let mut report = ConflictReport::new();
        for earlier in list_active_executions(self.store.as_ref())
            .await?
            .into_iter()
            .filter(|e| e.id != admitted.id && e.admission_seq < admitted.admission_seq)
        {
            for wave in &admitted.waves {
                let same_scope = |w: &&Wave| w.region == wave.region && w.account == wave.account;
                for other in earlier.waves.iter().filter(same_scope) {
                    for resource_id in wave
                        .resource_ids
                        .iter()
                        .filter(|r| other.resource_ids.contains(*r))
                    {
                        report.push(
                            resource_id.clone(),
                            ConflictSource::Execution {
                                execution_id: earlier.id,
                                plan_id: earlier.plan_id,
                            },
                        );
                    }
                }
            }
        }

        if !report.is_clear() {
            info!(
                execution_id = %execution_id,
                admission_seq = admitted.admission_seq,
                conflicts = report.conflicts().len(),
                "overlapping execution admitted first"
            );
        }
        Ok(report)
    }

    /// Structural validation of a plan's waves, run before it is saved
    ///
    /// Wave indices must be unique and contiguous from zero, every
    /// `depends_on` link must name an earlier wave, and the dependency graph
    /// must be acyclic.
    pub fn check_plan(&self, plan: &RecoveryPlan) -> OrchestratorResult<()> {
        if plan.waves.is_empty() {
            return Err(OrchestratorError::validation(
                "waves",
                "a recovery plan needs at least one wave",
            ));
        }

        let mut indices: Vec<usize> = plan.waves.iter().map(|w| w.wave_index).collect();
        indices.sort_unstable();
        if indices.iter().copied().ne(0..plan.waves.len()) {
            return Err(OrchestratorError::validation(
                "waves",
                format!("wave indices must be unique and contiguous from 0, got {indices:?}"),
            ));
        }

        let (graph, dangling) = DependencyGraph::from_plan(plan);
        if let Some((wave, missing)) = dangling.first() {
            return Err(OrchestratorError::validation(
                format!("waves[{wave}].depends_on"),
                format!("wave {missing} does not exist"),
            ));
        }

        if let Some(cycle) = graph.find_cycle() {
            let path = cycle
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(OrchestratorError::validation(
                "waves",
                format!("circular wave dependency: {path}"),
            ));
        }

        if let Some((wave, later)) = graph.forward_dependencies().first() {
            return Err(OrchestratorError::validation(
                format!("waves[{wave}].depends_on"),
                format!("wave {wave} cannot depend on later wave {later}"),
            ));
        }

        Ok(())
    }

    /// Explicit members of `group` already selected by another group in the
    /// same region and account
    pub async fn check_group_membership(
        &self,
        group: &ProtectionGroup,
    ) -> OrchestratorResult<ConflictReport> {
        let mut report = ConflictReport::new();
        let ResourceSelector::Explicit(members) = &group.selector else {
            return Ok(report);
        };

        for other in self.store.list_protection_groups().await? {
            if other.id == group.id || other.region != group.region || other.account != group.account {
                continue;
            }
            if let ResourceSelector::Explicit(other_members) = &other.selector {
                for resource_id in members.intersection(other_members) {
                    report.push(
                        resource_id.clone(),
                        ConflictSource::ProtectionGroup {
                            group_id: other.id,
                            name: other.name.clone(),
                        },
                    );
                }
            }
        }
        Ok(report)
    }
}

fn in_scope(wave: &Wave, scope: &ResourceScope) -> bool {
    wave.region == scope.region && wave.account == scope.account
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{JobParticipant, RecoveryJob};
    use crate::model::{
        Execution, ExecutionStatus, ExecutionType, JobStatus, LaunchState, Wave, WaveDefinition,
    };
    use crate::store::InMemoryStore;
    use crate::testing::TestHarness;
    use chrono::Utc;

    fn ids(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn detector(harness: &TestHarness) -> ConflictDetector {
        ConflictDetector::new(
            harness.store.clone(),
            harness.factory(),
            harness.config.remote_retry.clone(),
        )
    }

    async fn active_execution(store: &InMemoryStore, resources: &[&str]) -> Execution {
        let execution = Execution::new(
            Uuid::new_v4(),
            "running",
            ExecutionType::Drill,
            None,
            vec![Wave::new(
                0,
                Uuid::new_v4(),
                "us-east-1",
                None,
                false,
                resources.iter().map(|r| r.to_string()).collect(),
            )],
        );
        store.create_execution(&execution).await.unwrap();
        execution
    }

    #[tokio::test]
    async fn test_active_execution_conflict_names_execution() {
        let harness = TestHarness::new();
        let running = active_execution(&harness.store, &["s-1", "s-2"]).await;
        let detector = detector(&harness);

        let report = detector
            .check_conflicts(
                &ResourceScope::new("us-east-1", None),
                &ids(&["s-2", "s-3"]),
                None,
            )
            .await
            .unwrap();

        assert_eq!(report.conflicts().len(), 1);
        assert_eq!(report.conflicts()[0].resource_id, "s-2");
        assert_eq!(report.execution_ids(), BTreeSet::from([running.id]));
    }

    #[tokio::test]
    async fn test_same_resource_id_in_other_region_is_not_a_conflict() {
        let harness = TestHarness::new();
        active_execution(&harness.store, &["s-1"]).await;

        let report = detector(&harness)
            .check_conflicts(&ResourceScope::new("us-west-2", None), &ids(&["s-1"]), None)
            .await
            .unwrap();
        assert!(report.is_clear());

        let other_account = ResourceScope::new(
            "us-east-1",
            Some(crate::model::AccountContext::new("222233334444", "DrRole")),
        );
        let report = detector(&harness)
            .check_conflicts(&other_account, &ids(&["s-1"]), None)
            .await
            .unwrap();
        assert!(report.is_clear());
    }

    #[tokio::test]
    async fn test_admission_conflicts_only_with_earlier_executions() {
        let harness = TestHarness::new();
        let first = active_execution(&harness.store, &["s-1", "s-2"]).await;
        let second = active_execution(&harness.store, &["s-2", "s-3"]).await;
        let unrelated = active_execution(&harness.store, &["s-9"]).await;
        let detector = detector(&harness);

        assert!(detector.check_admission(first.id).await.unwrap().is_clear());
        assert!(detector.check_admission(unrelated.id).await.unwrap().is_clear());

        let report = detector.check_admission(second.id).await.unwrap();
        assert_eq!(report.resource_ids(), BTreeSet::from(["s-2"]));
        assert_eq!(report.execution_ids(), BTreeSet::from([first.id]));
    }

    #[tokio::test]
    async fn test_admission_ignores_finished_earlier_execution() {
        let harness = TestHarness::new();
        let first = active_execution(&harness.store, &["s-1"]).await;
        let second = active_execution(&harness.store, &["s-1"]).await;

        let mut stored = harness.store.get_execution(first.id).await.unwrap().unwrap();
        stored.waves[0].status = crate::model::WaveStatus::Cancelled;
        stored.status = ExecutionStatus::Cancelled;
        harness.store.update_execution(&stored).await.unwrap();

        assert!(detector(&harness)
            .check_admission(second.id)
            .await
            .unwrap()
            .is_clear());
    }

    #[tokio::test]
    async fn test_excluded_and_terminal_executions_ignored() {
        let harness = TestHarness::new();
        let running = active_execution(&harness.store, &["s-1"]).await;
        let finished = active_execution(&harness.store, &["s-1"]).await;
        let mut stored = harness.store.get_execution(finished.id).await.unwrap().unwrap();
        stored.waves[0].status = crate::model::WaveStatus::Cancelled;
        stored.status = ExecutionStatus::Cancelled;
        harness.store.update_execution(&stored).await.unwrap();

        let report = detector(&harness)
            .check_conflicts(
                &ResourceScope::new("us-east-1", None),
                &ids(&["s-1"]),
                Some(running.id),
            )
            .await
            .unwrap();
        assert!(report.is_clear());
    }

    #[tokio::test]
    async fn test_remote_job_in_progress_conflicts() {
        let harness = TestHarness::new();
        harness.recovery.add_external_job(RecoveryJob {
            job_id: "job-external".to_string(),
            status: JobStatus::Started,
            is_drill: false,
            participants: vec![JobParticipant {
                resource_id: "s-5".to_string(),
                launch_state: LaunchState::InProgress,
                recovery_instance_handle: None,
            }],
            created_at: Utc::now(),
        });

        let report = detector(&harness)
            .check_conflicts(
                &ResourceScope::new("us-east-1", None),
                &ids(&["s-5", "s-6"]),
                None,
            )
            .await
            .unwrap();
        assert_eq!(report.conflicts().len(), 1);
        assert_eq!(
            report.conflicts()[0].source,
            ConflictSource::RemoteJob {
                job_id: "job-external".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_jobs_listing_failure_surfaces() {
        let harness = TestHarness::new();
        harness.recovery.fail_list_jobs(crate::clients::RemoteApiError::AccessDenied {
            message: "denied".to_string(),
        });
        let err = detector(&harness)
            .check_conflicts(&ResourceScope::new("us-east-1", None), &ids(&["s-1"]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::RemoteApi { .. }));
    }

    #[test]
    fn test_check_plan_rejects_cycle() {
        let harness = TestHarness::new();
        let g = Uuid::new_v4();
        let plan = RecoveryPlan::new(
            "cyclic",
            None,
            vec![
                WaveDefinition::new(0, g).depending_on([1]),
                WaveDefinition::new(1, g).depending_on([0]),
            ],
        );
        let err = detector(&harness).check_plan(&plan).unwrap_err();
        assert!(err.to_string().contains("circular wave dependency"));
    }

    #[test]
    fn test_check_plan_rejects_gaps_and_forward_links() {
        let harness = TestHarness::new();
        let detector = detector(&harness);
        let g = Uuid::new_v4();

        let gap = RecoveryPlan::new(
            "gap",
            None,
            vec![WaveDefinition::new(0, g), WaveDefinition::new(2, g)],
        );
        assert!(detector.check_plan(&gap).is_err());

        let forward = RecoveryPlan::new(
            "forward",
            None,
            vec![WaveDefinition::new(0, g).depending_on([1]), WaveDefinition::new(1, g)],
        );
        let err = detector.check_plan(&forward).unwrap_err();
        assert!(err.to_string().contains("later wave 1"));

        let empty = RecoveryPlan::new("empty", None, vec![]);
        assert!(detector.check_plan(&empty).is_err());

        let ok = RecoveryPlan::new(
            "ok",
            None,
            vec![WaveDefinition::new(0, g), WaveDefinition::new(1, g).depending_on([0])],
        );
        assert!(detector.check_plan(&ok).is_ok());
    }

    #[tokio::test]
    async fn test_group_overlap_in_same_region() {
        let harness = TestHarness::new();
        let existing = ProtectionGroup::new(
            "db",
            "us-east-1",
            None,
            ResourceSelector::Explicit(ids(&["s-1", "s-2"])),
        );
        harness.store.put_protection_group(&existing).await.unwrap();
        let detector = detector(&harness);

        let overlapping = ProtectionGroup::new(
            "db-copy",
            "us-east-1",
            None,
            ResourceSelector::Explicit(ids(&["s-2"])),
        );
        let report = detector.check_group_membership(&overlapping).await.unwrap();
        assert_eq!(report.resource_ids(), BTreeSet::from(["s-2"]));

        let other_region = ProtectionGroup::new(
            "db-west",
            "us-west-2",
            None,
            ResourceSelector::Explicit(ids(&["s-2"])),
        );
        assert!(detector
            .check_group_membership(&other_region)
            .await
            .unwrap()
            .is_clear());
    }
}
