//! Pure wave-progression decisions
//!
//! Everything here runs inside a conditional-write closure, so it only looks
//! at the execution it is handed and may run more than once per call.

use crate::error::OrchestratorResult;
use crate::model::{Execution, ExecutionStatus, JobOutcome, LaunchClaim, WaveStatus};
use chrono::{DateTime, Duration, Utc};
use tracing::warn;
use uuid::Uuid;

/// What the engine does after settling an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Waiting on a remote job, an operator or another launcher
    Idle,
    /// No non-terminal wave left
    Finalize,
    /// Next wave needs approval
    Pause {
        /// Wave waiting on approval
        wave_index: usize,
    },
    /// Next wave was claimed by this caller
    Launch {
        /// Claimed wave
        wave_index: usize,
        /// Claim written to the wave
        claim_id: Uuid,
    },
}

/// Promote observed job outcomes to wave status
///
/// A failed wave cancels every wave that has not launched. Returns whether
/// anything changed.
pub fn settle_outcomes(execution: &mut Execution) -> OrchestratorResult<bool> {
    let mut changed = false;

    for wave in execution.waves.iter_mut() {
        if !wave.status.is_in_flight() {
            continue;
        }
        match wave.job_outcome.clone() {
            Some(JobOutcome::Succeeded) => {
                wave.transition(WaveStatus::Completed)?;
                changed = true;
            }
            Some(JobOutcome::Failed { failed_resources }) => {
                wave.error = Some(format!(
                    "{} resource(s) failed to launch: {}",
                    failed_resources.len(),
                    failed_resources.join(", ")
                ));
                wave.transition(WaveStatus::Failed)?;
                changed = true;
            }
            None => {}
        }
    }

    if execution.waves.iter().any(|w| w.status == WaveStatus::Failed) {
        for wave in execution
            .waves
            .iter_mut()
            .filter(|w| w.status == WaveStatus::Pending)
        {
            wave.launch_claim = None;
            wave.transition(WaveStatus::Cancelled)?;
            changed = true;
        }
    }

    Ok(changed)
}

/// Decide the next step, claiming the next wave when it is ready to launch
///
/// Returns the step and whether `execution` was modified.
pub fn next_step(
    execution: &mut Execution,
    now: DateTime<Utc>,
    claim_timeout: Duration,
) -> OrchestratorResult<(Step, bool)> {
    if execution.status.is_terminal() || execution.status == ExecutionStatus::Paused {
        return Ok((Step::Idle, false));
    }

    let changed = settle_outcomes(execution)?;

    let Some(wave) = execution.current_wave() else {
        return Ok((Step::Finalize, changed));
    };
    let wave_index = wave.wave_index;

    if wave.status.is_in_flight() {
        return Ok((Step::Idle, changed));
    }
    if wave.awaiting_approval() {
        return Ok((Step::Pause { wave_index }, changed));
    }
    if let Some(claim) = &wave.launch_claim {
        if now - claim.claimed_at < claim_timeout {
            return Ok((Step::Idle, changed));
        }
        warn!(
            execution_id = %execution.id,
            wave_index,
            claim_id = %claim.claim_id,
            "taking over stale launch claim"
        );
    }

    let claim_id = Uuid::new_v4();
    if let Some(wave) = execution.wave_mut(wave_index) {
        wave.launch_claim = Some(LaunchClaim {
            claim_id,
            claimed_at: now,
        });
    }
    Ok((
        Step::Launch {
            wave_index,
            claim_id,
        },
        true,
    ))
}

/// Terminal status for an execution whose waves are all terminal
pub fn final_status(execution: &Execution) -> ExecutionStatus {
    if execution
        .waves
        .iter()
        .all(|w| w.status == WaveStatus::Completed)
    {
        ExecutionStatus::Completed
    } else if execution
        .waves
        .iter()
        .any(|w| w.status == WaveStatus::Failed)
    {
        ExecutionStatus::Failed
    } else {
        ExecutionStatus::Cancelled
    }
}
