//! Execution, wave and resource records

use super::account::AccountContext;
use super::status::{ExecutionStatus, ExecutionType, JobOutcome, LaunchState, WaveStatus};
use crate::error::{OrchestratorError, OrchestratorResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Observed state of one protected resource inside a wave
///
/// Filled in two passes: job membership first, inventory enrichment once an
/// instance handle exists. Missing enrichment is normal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatus {
    /// Protected resource ID
    pub resource_id: String,
    /// Launch state reported by the remote job
    pub launch_state: LaunchState,
    /// Recovered instance handle
    pub recovered_instance_handle: Option<String>,
    /// Recovered instance address
    pub address: Option<String>,
    /// Recovered instance display name
    pub display_name: Option<String>,
    /// Recovered instance type
    pub instance_type: Option<String>,
    /// Recovered instance launch time
    pub launch_timestamp: Option<DateTime<Utc>>,
}

impl ResourceStatus {
    /// Membership-only record
    pub fn pending(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            launch_state: LaunchState::Pending,
            recovered_instance_handle: None,
            address: None,
            display_name: None,
            instance_type: None,
            launch_timestamp: None,
        }
    }
}

/// Marker written before a wave is launched so that only one caller launches it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchClaim {
    /// Claim ID
    pub claim_id: Uuid,
    /// When the claim was taken
    pub claimed_at: DateTime<Utc>,
}

/// One batch of resources recovered under a single remote job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wave {
    /// Position in the execution
    pub wave_index: usize,
    /// Group this wave recovers
    pub protection_group_id: Uuid,
    /// Region of the group
    pub region: String,
    /// Effective account context
    pub account: Option<AccountContext>,
    /// Operator approval required before launch
    pub pause_before_wave: bool,
    /// Approval given through resume
    pub approved: bool,
    /// Resource membership snapshotted at execution start
    pub resource_ids: Vec<String>,
    /// Wave status
    pub status: WaveStatus,
    /// The wave's single remote job
    pub remote_job_id: Option<String>,
    /// Outstanding launch claim
    pub launch_claim: Option<LaunchClaim>,
    /// Terminal job outcome observed by the poller, not yet settled
    pub job_outcome: Option<JobOutcome>,
    /// Monotonic progress, 100 only once the job is terminal
    pub progress_percent: u8,
    /// Per-resource status
    pub resources: Vec<ResourceStatus>,
    /// Launch timestamp
    pub launched_at: Option<DateTime<Utc>>,
    /// Terminal timestamp
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure detail
    pub error: Option<String>,
}

impl Wave {
    /// Pending wave over a resource snapshot
    pub fn new(
        wave_index: usize,
        protection_group_id: Uuid,
        region: impl Into<String>,
        account: Option<AccountContext>,
        pause_before_wave: bool,
        resource_ids: Vec<String>,
    ) -> Self {
        Self {
            wave_index,
            protection_group_id,
            region: region.into(),
            account,
            pause_before_wave,
            approved: false,
            resource_ids,
            status: WaveStatus::Pending,
            remote_job_id: None,
            launch_claim: None,
            job_outcome: None,
            progress_percent: 0,
            resources: Vec::new(),
            launched_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Whether the wave needs an operator resume before it may launch
    pub fn awaiting_approval(&self) -> bool {
        self.status == WaveStatus::Pending && self.pause_before_wave && !self.approved
    }

    /// Move to `next`, enforcing the transition table
    pub fn transition(&mut self, next: WaveStatus) -> OrchestratorResult<()> {
        self.status.ensure_transition(next, self.wave_index)?;
        if next.is_terminal() && !self.status.is_terminal() {
            self.completed_at = Some(Utc::now());
            if next == WaveStatus::Completed {
                self.progress_percent = 100;
            }
        }
        self.status = next;
        Ok(())
    }
}

/// Adaptive polling bookkeeping, written by the poller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollBookkeeping {
    /// Last poll
    pub last_polled_at: Option<DateTime<Utc>>,
    /// Consecutive polls that changed nothing
    pub unchanged_polls: u32,
}

/// One run of a recovery plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// Execution ID
    pub id: Uuid,
    /// Plan being executed
    pub plan_id: Uuid,
    /// Plan name at start
    pub plan_name: String,
    /// Drill or recovery
    pub execution_type: ExecutionType,
    /// Status; written only by the state machine
    pub status: ExecutionStatus,
    /// Plan-level account context
    pub account: Option<AccountContext>,
    /// All waves, created up front in `Pending`
    pub waves: Vec<Wave>,
    /// Wave waiting on resume
    pub paused_before_wave_index: Option<usize>,
    /// Resume token, present only while paused
    pub resume_token: Option<String>,
    /// Start despite resources with existing recovered instances
    pub allow_existing_instances: bool,
    /// Poller bookkeeping
    pub poll: PollBookkeeping,
    /// Optimistic-concurrency version, managed by the store
    pub version: u64,
    /// Order in which the store made the execution visible; assigned on create
    #[serde(default)]
    pub admission_seq: u64,
    /// Created timestamp
    pub created_at: DateTime<Utc>,
    /// Updated timestamp
    pub updated_at: DateTime<Utc>,
    /// Terminal timestamp
    pub completed_at: Option<DateTime<Utc>>,
}

impl Execution {
    /// Create new pending execution
    pub fn new(
        plan_id: Uuid,
        plan_name: impl Into<String>,
        execution_type: ExecutionType,
        account: Option<AccountContext>,
        waves: Vec<Wave>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            plan_id,
            plan_name: plan_name.into(),
            execution_type,
            status: ExecutionStatus::Pending,
            account,
            waves,
            paused_before_wave_index: None,
            resume_token: None,
            allow_existing_instances: false,
            poll: PollBookkeeping::default(),
            version: 0,
            admission_seq: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Whether the execution can still change
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// First non-terminal wave
    pub fn current_wave(&self) -> Option<&Wave> {
        self.waves.iter().find(|w| !w.status.is_terminal())
    }

    /// Wave by index
    pub fn wave(&self, wave_index: usize) -> Option<&Wave> {
        self.waves.iter().find(|w| w.wave_index == wave_index)
    }

    /// Mutable wave by index
    pub fn wave_mut(&mut self, wave_index: usize) -> Option<&mut Wave> {
        self.waves.iter_mut().find(|w| w.wave_index == wave_index)
    }

    /// Whether every wave is terminal
    pub fn all_waves_terminal(&self) -> bool {
        self.waves.iter().all(|w| w.status.is_terminal())
    }

    /// Union of all snapshotted resources
    pub fn resource_ids(&self) -> BTreeSet<String> {
        self.waves
            .iter()
            .flat_map(|w| w.resource_ids.iter().cloned())
            .collect()
    }

    /// Resource-weighted progress across waves
    pub fn progress_percent(&self) -> u8 {
        let total: usize = self.waves.iter().map(|w| w.resource_ids.len().max(1)).sum();
        if total == 0 {
            return 0;
        }
        let done: usize = self
            .waves
            .iter()
            .map(|w| {
                let weight = w.resource_ids.len().max(1);
                if w.status.is_terminal() {
                    weight * 100
                } else {
                    weight * usize::from(w.progress_percent)
                }
            })
            .sum();
        (done / total).min(100) as u8
    }

    /// Move to `next`, enforcing the transition table
    pub fn transition(&mut self, next: ExecutionStatus) -> OrchestratorResult<()> {
        self.status.ensure_transition(next)?;
        if next.is_terminal() && !self.status.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        self.status = next;
        Ok(())
    }

    /// Check that `self` is a legal successor of `previous`
    ///
    /// Run before every conditional write.
    pub fn validate_successor_of(&self, previous: &Execution) -> OrchestratorResult<()> {
        previous.status.ensure_transition(self.status)?;
        if self.waves.len() != previous.waves.len() {
            return Err(OrchestratorError::validation(
                "waves",
                "wave list cannot change after creation",
            ));
        }
        for (before, after) in previous.waves.iter().zip(&self.waves) {
            if before.wave_index != after.wave_index {
                return Err(OrchestratorError::validation(
                    "waves",
                    "wave order cannot change after creation",
                ));
            }
            before.status.ensure_transition(after.status, after.wave_index)?;
            if before.remote_job_id.is_some() && before.remote_job_id != after.remote_job_id {
                return Err(OrchestratorError::validation(
                    format!("waves[{}].remote_job_id", after.wave_index),
                    "a wave's remote job id cannot be replaced",
                ));
            }
        }
        if self.status != ExecutionStatus::Paused && self.resume_token.is_some() {
            return Err(OrchestratorError::validation(
                "resume_token",
                "resume token may only be set while paused",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wave(index: usize, resources: &[&str]) -> Wave {
        Wave::new(
            index,
            Uuid::new_v4(),
            "us-east-1",
            None,
            false,
            resources.iter().map(|r| r.to_string()).collect(),
        )
    }

    fn execution() -> Execution {
        Execution::new(
            Uuid::new_v4(),
            "plan",
            ExecutionType::Drill,
            None,
            vec![wave(0, &["s-1", "s-2"]), wave(1, &["s-3"])],
        )
    }

    #[test]
    fn test_current_wave_is_first_non_terminal() {
        let mut exec = execution();
        assert_eq!(exec.current_wave().map(|w| w.wave_index), Some(0));

        exec.waves[0].status = WaveStatus::Completed;
        assert_eq!(exec.current_wave().map(|w| w.wave_index), Some(1));

        exec.waves[1].status = WaveStatus::Cancelled;
        assert!(exec.current_wave().is_none());
        assert!(exec.all_waves_terminal());
    }

    #[test]
    fn test_resource_ids_union() {
        let exec = execution();
        let ids: Vec<_> = exec.resource_ids().into_iter().collect();
        assert_eq!(ids, vec!["s-1", "s-2", "s-3"]);
    }

    #[test]
    fn test_progress_weighted_by_resources() {
        let mut exec = execution();
        assert_eq!(exec.progress_percent(), 0);
        exec.waves[0].status = WaveStatus::Completed;
        // two of three resources done
        assert_eq!(exec.progress_percent(), 66);
        exec.waves[1].progress_percent = 50;
        assert_eq!(exec.progress_percent(), 83);
    }

    #[test]
    fn test_wave_transition_sets_completion() {
        let mut w = wave(0, &["s-1"]);
        w.transition(WaveStatus::Initiated).unwrap();
        assert!(w.completed_at.is_none());
        w.transition(WaveStatus::Completed).unwrap();
        assert!(w.completed_at.is_some());
        assert_eq!(w.progress_percent, 100);
        assert!(w.transition(WaveStatus::Started).is_err());
    }

    #[test]
    fn test_awaiting_approval() {
        let mut w = wave(0, &["s-1"]);
        assert!(!w.awaiting_approval());
        w.pause_before_wave = true;
        assert!(w.awaiting_approval());
        w.approved = true;
        assert!(!w.awaiting_approval());
    }

    #[test]
    fn test_validate_successor_rejects_regression() {
        let before = execution();
        let mut after = before.clone();
        after.status = ExecutionStatus::Polling;
        after.waves[0].status = WaveStatus::Initiated;
        after.waves[0].remote_job_id = Some("job-1".to_string());
        assert!(after.validate_successor_of(&before).is_ok());

        let mut regressed = after.clone();
        regressed.waves[0].status = WaveStatus::Pending;
        assert!(regressed.validate_successor_of(&after).is_err());

        let mut replaced = after.clone();
        replaced.waves[0].remote_job_id = Some("job-2".to_string());
        assert!(replaced.validate_successor_of(&after).is_err());
    }

    #[test]
    fn test_validate_successor_rejects_token_outside_pause() {
        let before = execution();
        let mut after = before.clone();
        after.status = ExecutionStatus::Polling;
        after.resume_token = Some("token".to_string());
        assert!(after.validate_successor_of(&before).is_err());
    }

    #[test]
    fn test_execution_roundtrip_json() {
        let exec = execution();
        let json = serde_json::to_string(&exec).unwrap();
        let parsed: Execution = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, exec);
    }
}
