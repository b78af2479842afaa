//! Orchestrator configuration types and defaults

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Job launcher configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchConfig {
    /// Backoff applied to busy/conflict responses from the recovery API
    pub conflict_retry: RetryPolicy,
    /// Largest batch a single recovery job accepts
    pub max_resources_per_wave: usize,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            conflict_retry: RetryPolicy {
                max_attempts: 5,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(30),
                backoff_multiplier: 2.0,
                jitter_factor: 0.1,
            },
            max_resources_per_wave: 100,
        }
    }
}

/// Finder/scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often the finder wakes up
    pub tick_interval: Duration,
    /// Poll spacing for executions that are still changing
    pub base_poll_interval: Duration,
    /// Unchanged polls before spacing starts to grow
    pub idle_threshold: u32,
    /// Upper bound on spacing so slow jobs are never starved
    pub max_staleness: Duration,
    /// Polls dispatched concurrently per tick
    pub max_concurrent_polls: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            base_poll_interval: Duration::from_secs(30),
            idle_threshold: 3,
            max_staleness: Duration::from_secs(300),
            max_concurrent_polls: 10,
        }
    }
}

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Job launcher settings
    pub launch: LaunchConfig,
    /// Backoff for read-only remote calls that hit throttling or timeouts
    pub remote_retry: RetryPolicy,
    /// Finder settings
    pub scheduler: SchedulerConfig,
    /// Lifetime of a pause callback token
    pub pause_timeout: Duration,
    /// Age after which an unfinished launch claim may be taken over
    pub launch_claim_timeout: Duration,
    /// Re-read/re-apply attempts when a conditional write loses a race
    pub max_write_retries: u32,
    /// Topic for lifecycle notifications
    pub notification_topic: String,
    /// Session name used for role assumption
    pub role_session_name: String,
    /// Refresh cached assumed credentials this long before they expire
    pub credential_refresh_margin: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            launch: LaunchConfig::default(),
            remote_retry: RetryPolicy::default(),
            scheduler: SchedulerConfig::default(),
            pause_timeout: Duration::from_secs(365 * 24 * 60 * 60),
            launch_claim_timeout: Duration::from_secs(15 * 60),
            max_write_retries: 5,
            notification_topic: "failover-orchestration-events".to_string(),
            role_session_name: "failover-orchestrator".to_string(),
            credential_refresh_margin: Duration::from_secs(5 * 60),
        }
    }
}

impl OrchestratorConfig {
    /// Parse from JSON; missing fields take defaults
    pub fn from_json_str(json: &str) -> OrchestratorResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> OrchestratorResult<()> {
        let fail = |message: &str| {
            Err(OrchestratorError::ConfigurationError {
                message: message.to_string(),
            })
        };

        if self.launch.max_resources_per_wave == 0 {
            return fail("launch.max_resources_per_wave must be at least 1");
        }
        if self.launch.conflict_retry.max_attempts == 0 {
            return fail("launch.conflict_retry.max_attempts must be at least 1");
        }
        if self.remote_retry.max_attempts == 0 {
            return fail("remote_retry.max_attempts must be at least 1");
        }
        for policy in [&self.launch.conflict_retry, &self.remote_retry] {
            if policy.backoff_multiplier < 1.0 {
                return fail("backoff_multiplier must be >= 1.0");
            }
            if !(0.0..=1.0).contains(&policy.jitter_factor) {
                return fail("jitter_factor must be within 0.0..=1.0");
            }
        }
        if self.scheduler.max_concurrent_polls == 0 {
            return fail("scheduler.max_concurrent_polls must be at least 1");
        }
        if self.scheduler.max_staleness < self.scheduler.base_poll_interval {
            return fail("scheduler.max_staleness must be >= scheduler.base_poll_interval");
        }
        if self.max_write_retries == 0 {
            return fail("max_write_retries must be at least 1");
        }
        if self.pause_timeout.is_zero() {
            return fail("pause_timeout must be non-zero");
        }
        if self.notification_topic.trim().is_empty() {
            return fail("notification_topic must not be empty");
        }
        if self.role_session_name.trim().is_empty() {
            return fail("role_session_name must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.launch.max_resources_per_wave, 100);
        assert_eq!(config.pause_timeout.as_secs(), 31_536_000);
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config =
            OrchestratorConfig::from_json_str(r#"{"notification_topic":"dr-events"}"#).unwrap();
        assert_eq!(config.notification_topic, "dr-events");
        assert_eq!(config.max_write_retries, 5);
    }

    #[test]
    fn test_invalid_batch_limit_rejected() {
        let mut config = OrchestratorConfig::default();
        config.launch.max_resources_per_wave = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_resources_per_wave"));
    }

    #[test]
    fn test_staleness_below_base_rejected() {
        let mut config = OrchestratorConfig::default();
        config.scheduler.max_staleness = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_json_is_json_error() {
        let err = OrchestratorConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, OrchestratorError::JsonError { .. }));
    }
}
