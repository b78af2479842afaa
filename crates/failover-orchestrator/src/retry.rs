//! Explicit retry loop with exponential backoff
//!
//! Callers classify errors before a retry is attempted; anything the
//! classifier rejects fails on the spot.

use crate::clients::{RemoteApiError, RemoteResult};
use crate::error::OrchestratorResult;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first call
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Delay ceiling
    pub max_delay: Duration,
    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,
    /// Random extra delay as a fraction of the computed delay (0.0 disables)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based), without jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter_factor <= 0.0 {
            return delay;
        }
        let range = (delay.as_millis() as f64 * self.jitter_factor) as u64;
        if range == 0 {
            return delay;
        }
        delay + Duration::from_millis(fastrand::u64(0..range))
    }
}

/// Why a retried operation gave up
#[derive(Debug, Clone, PartialEq)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Error from the final attempt
        last_error: E,
    },
    /// An attempt failed with an error the classifier would not retry
    Fatal {
        /// Attempts made, including the fatal one
        attempts: u32,
        /// The fatal error
        error: E,
    },
}

impl<E> RetryError<E> {
    /// Attempts made before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::Fatal { attempts, .. } => *attempts,
        }
    }

    /// The underlying error
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last_error, .. } => last_error,
            Self::Fatal { error, .. } => error,
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the policy
/// runs out of attempts
pub async fn retry_with_backoff<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    operation: &str,
    is_retryable: C,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => {
                if !is_retryable(&error) {
                    return Err(RetryError::Fatal {
                        attempts: attempt,
                        error,
                    });
                }
                if attempt >= max_attempts {
                    warn!(operation, attempts = attempt, %error, "retries exhausted");
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last_error: error,
                    });
                }

                let delay = policy.jittered(policy.delay_for_attempt(attempt));
                debug!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "retryable failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Retry a remote read on throttling, timeouts and server-side failures
///
/// Anything else fails on the first attempt. Exhaustion surfaces as
/// `TransientRemote` with `retry_exhausted` set.
pub async fn retry_remote<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    op: F,
) -> OrchestratorResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = RemoteResult<T>>,
{
    retry_with_backoff(policy, operation, RemoteApiError::is_transient, op)
        .await
        .map_err(|e| {
            let attempts = e.attempts();
            let exhausted = matches!(e, RetryError::Exhausted { .. });
            e.into_inner()
                .into_orchestrator_error(operation, attempts, exhausted)
        })
}
