//! Execution finder
//!
//! Each tick lists polling executions from the status index and polls the
//! ones that are due. Executions that stop changing are polled less often,
//! never less often than `max_staleness`. The finder never writes execution
//! status; a failing execution is reported and its siblings still get polled.

use crate::config::SchedulerConfig;
use crate::error::OrchestratorResult;
use crate::model::{Execution, ExecutionStatus};
use crate::poller::ReconciliationPoller;
use crate::store::OrchestrationStore;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What one finder tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinderReport {
    /// Polling executions found
    pub examined: usize,
    /// Executions polled
    pub polled: Vec<Uuid>,
    /// Executions not yet due
    pub skipped: Vec<Uuid>,
    /// Executions whose poll failed, with the error
    pub failures: Vec<(Uuid, String)>,
}

/// Periodic driver for the reconciliation poller
pub struct ExecutionFinder {
    store: Arc<dyn OrchestrationStore>,
    poller: Arc<ReconciliationPoller>,
    config: SchedulerConfig,
}

impl ExecutionFinder {
    /// Create new finder
    pub fn new(
        store: Arc<dyn OrchestrationStore>,
        poller: Arc<ReconciliationPoller>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            poller,
            config,
        }
    }

    /// Spacing after `unchanged_polls` consecutive polls with no change
    ///
    /// Base interval up to `idle_threshold`, then doubling per extra unchanged
    /// poll, capped at `max_staleness`.
    pub fn poll_interval(&self, unchanged_polls: u32) -> Duration {
        let base = self.config.base_poll_interval;
        if unchanged_polls <= self.config.idle_threshold {
            return base;
        }
        let doublings = (unchanged_polls - self.config.idle_threshold).min(16);
        base.saturating_mul(1u32 << doublings)
            .min(self.config.max_staleness)
    }

    /// Whether `execution` should be polled at `now`
    pub fn is_due(&self, execution: &Execution, now: DateTime<Utc>) -> bool {
        let Some(last) = execution.poll.last_polled_at else {
            return true;
        };
        let interval = chrono::Duration::from_std(self.poll_interval(execution.poll.unchanged_polls))
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        now - last >= interval
    }

    /// Poll every due execution once, concurrently
    pub async fn run_once(&self, now: DateTime<Utc>) -> OrchestratorResult<FinderReport> {
        let executions = self
            .store
            .list_executions_by_status(ExecutionStatus::Polling)
            .await?;

        let mut report = FinderReport {
            examined: executions.len(),
            ..FinderReport::default()
        };
        let mut due = Vec::new();
        for execution in &executions {
            if self.is_due(execution, now) {
                due.push(execution.id);
            } else {
                report.skipped.push(execution.id);
            }
        }

        let results: Vec<(Uuid, OrchestratorResult<_>)> = stream::iter(due)
            .map(|execution_id| {
                let poller = self.poller.clone();
                async move { (execution_id, poller.poll_execution(execution_id).await) }
            })
            .buffer_unordered(self.config.max_concurrent_polls.max(1))
            .collect()
            .await;

        for (execution_id, result) in results {
            match result {
                Ok(_) => report.polled.push(execution_id),
                Err(e) => {
                    warn!(execution_id = %execution_id, error = %e, "poll failed");
                    report.failures.push((execution_id, e.to_string()));
                }
            }
        }

        debug!(
            examined = report.examined,
            polled = report.polled.len(),
            skipped = report.skipped.len(),
            failed = report.failures.len(),
            "finder tick complete"
        );
        Ok(report)
    }

    /// Run ticks on `tick_interval` until `shutdown` flips to `true`
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = self.config.tick_interval.as_secs(), "execution finder started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once(Utc::now()).await {
                        error!(error = %e, "finder tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("execution finder stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExecutionType, Wave, WaveStatus};
    use crate::testing::{RecordingSettleHook, TestHarness};

    fn finder(harness: &TestHarness) -> ExecutionFinder {
        let poller = Arc::new(harness.poller(Arc::new(RecordingSettleHook::new())));
        ExecutionFinder::new(harness.store.clone(), poller, harness.config.scheduler.clone())
    }

    async fn polling_execution(harness: &TestHarness, job_id: Option<String>) -> Execution {
        let mut wave = Wave::new(0, Uuid::new_v4(), "us-east-1", None, false, vec!["s-1".to_string()]);
        wave.status = WaveStatus::Initiated;
        wave.remote_job_id = Some(
            job_id.unwrap_or_else(|| harness.recovery.start_job_directly(vec!["s-1".to_string()])),
        );
        let mut execution = Execution::new(Uuid::new_v4(), "plan", ExecutionType::Drill, None, vec![wave]);
        execution.status = ExecutionStatus::Polling;
        harness.store.create_execution(&execution).await.unwrap();
        execution
    }

    #[test]
    fn test_interval_backs_off_and_caps() {
        let harness = TestHarness::new();
        let finder = finder(&harness);
        let base = harness.config.scheduler.base_poll_interval;
        let threshold = harness.config.scheduler.idle_threshold;

        assert_eq!(finder.poll_interval(0), base);
        assert_eq!(finder.poll_interval(threshold), base);
        assert_eq!(finder.poll_interval(threshold + 1), base * 2);
        assert_eq!(finder.poll_interval(threshold + 2), base * 4);
        assert_eq!(
            finder.poll_interval(threshold + 40),
            harness.config.scheduler.max_staleness
        );
    }

    #[tokio::test]
    async fn test_recently_polled_execution_is_skipped() {
        let harness = TestHarness::new();
        let finder = finder(&harness);
        let execution = polling_execution(&harness, None).await;

        let now = Utc::now();
        let first = finder.run_once(now).await.unwrap();
        assert_eq!(first.polled, vec![execution.id]);

        let second = finder.run_once(now).await.unwrap();
        assert!(second.polled.is_empty());
        assert_eq!(second.skipped, vec![execution.id]);

        let later = now + chrono::Duration::from_std(harness.config.scheduler.max_staleness).unwrap();
        let third = finder.run_once(later).await.unwrap();
        assert_eq!(third.polled, vec![execution.id]);
    }

    #[tokio::test]
    async fn test_failing_execution_does_not_block_siblings() {
        let harness = TestHarness::new();
        let finder = finder(&harness);
        let healthy = polling_execution(&harness, None).await;
        let broken = polling_execution(&harness, Some("job-missing".to_string())).await;

        let report = finder.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.polled, vec![healthy.id]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, broken.id);
    }

    #[tokio::test]
    async fn test_only_polling_executions_examined() {
        let harness = TestHarness::new();
        let finder = finder(&harness);
        let pending = Execution::new(
            Uuid::new_v4(),
            "plan",
            ExecutionType::Drill,
            None,
            vec![Wave::new(0, Uuid::new_v4(), "us-east-1", None, true, vec!["s-1".to_string()])],
        );
        harness.store.create_execution(&pending).await.unwrap();

        let report = finder.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.examined, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let harness = TestHarness::new();
        let finder = Arc::new(finder(&harness));
        polling_execution(&harness, None).await;

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let finder = finder.clone();
            async move { finder.run(rx).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(harness.recovery.describe_calls() >= 1);
    }
}
