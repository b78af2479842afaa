//! Closed status enums and their transition tables

use crate::error::{OrchestratorError, OrchestratorResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Execution kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionType {
    /// Non-disruptive drill; recovered instances are expected to be torn down
    Drill,
    /// Real recovery
    Recovery,
}

impl ExecutionType {
    /// Whether remote jobs are launched in drill mode
    pub fn is_drill(self) -> bool {
        matches!(self, Self::Drill)
    }
}

/// Execution lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// Created, no wave launched yet
    Pending,
    /// At least one wave launched; finder polls these
    Polling,
    /// Waiting for an operator to resume before the next wave
    Paused,
    /// All waves completed
    Completed,
    /// At least one wave failed
    Failed,
    /// Cancelled by an operator
    Cancelled,
}

impl ExecutionStatus {
    /// Every status, in declaration order
    pub const ALL: [ExecutionStatus; 6] = [
        Self::Pending,
        Self::Polling,
        Self::Paused,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Statuses an execution can still leave
    pub const ACTIVE: [ExecutionStatus; 3] = [Self::Pending, Self::Polling, Self::Paused];

    /// Whether the status is final
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Transition table
    pub fn can_transition_to(self, next: Self) -> bool {
        use ExecutionStatus::*;
        if self == next {
            return true;
        }
        match self {
            Pending => matches!(next, Polling | Paused | Completed | Failed | Cancelled),
            Polling => matches!(next, Paused | Completed | Failed | Cancelled),
            Paused => matches!(next, Polling | Failed | Cancelled),
            Completed | Failed | Cancelled => false,
        }
    }

    /// Validate a transition, producing `InvalidTransition` on failure
    pub fn ensure_transition(self, next: Self) -> OrchestratorResult<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidTransition {
                entity: "execution".to_string(),
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Polling => "POLLING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Wave lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaveStatus {
    /// Not launched
    Pending,
    /// Remote job started, job id recorded
    Initiated,
    /// Remote job reported progress
    Started,
    /// Verified complete by the state machine
    Completed,
    /// Launch or job failed
    Failed,
    /// Cancelled with its execution
    Cancelled,
}

impl WaveStatus {
    /// Whether the status is final
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a remote job is running for the wave
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Initiated | Self::Started)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Initiated => 1,
            Self::Started => 2,
            Self::Completed | Self::Failed | Self::Cancelled => 3,
        }
    }

    /// Transition table; forward-only, terminal states are sinks
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        // Pending may only fail or be cancelled on its way to a terminal state,
        // it can never complete without a job.
        if self == Self::Pending && next == Self::Completed {
            return false;
        }
        next.rank() > self.rank()
    }

    /// Validate a transition, producing `InvalidTransition` on failure
    pub fn ensure_transition(self, next: Self, wave_index: usize) -> OrchestratorResult<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidTransition {
                entity: format!("wave {wave_index}"),
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for WaveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Initiated => "INITIATED",
            Self::Started => "STARTED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Remote job status as reported by the recovery API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Accepted, not yet running
    Pending,
    /// Running
    Started,
    /// Finished; per-resource launch states tell success from failure
    Completed,
}

/// Per-resource launch state inside a remote job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LaunchState {
    /// Queued in the job
    Pending,
    /// Conversion/launch in progress
    InProgress,
    /// Recovered instance launched
    Launched,
    /// Launch failed
    Failed,
    /// Recovered instance terminated
    Terminated,
}

impl LaunchState {
    /// Whether the resource will not change further within its job
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Launched | Self::Failed | Self::Terminated)
    }
}

/// Outcome of a remote job once it reports terminal, as observed by the poller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobOutcome {
    /// Every resource launched
    Succeeded,
    /// One or more resources did not launch
    Failed {
        /// Resources that failed to launch
        failed_resources: Vec<String>,
    },
}
