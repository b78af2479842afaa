//! Callback tokens and lifecycle notifications
//!
//! Pausing before a wave hands out a durable callback token; nothing blocks
//! while the execution waits. Notifications are fire-and-forget: a failed
//! publish is logged and the orchestration carries on.

use crate::model::{ExecutionStatus, ExecutionType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Failure from a callback or publish primitive
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} failed: {reason}")]
pub struct CallbackError {
    /// Operation that failed
    pub operation: String,
    /// Reason
    pub reason: String,
}

/// How a callback token was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenOutcome {
    /// Operator resumed the execution
    Resumed,
    /// Execution was cancelled while paused
    Cancelled,
    /// Token lost a race and was never stored
    Superseded,
}

/// Durable callback primitive backing pause-before-wave
#[async_trait]
pub trait CallbackTokens: Send + Sync {
    /// Issue an opaque token valid for `timeout`
    async fn create_token(
        &self,
        execution_id: Uuid,
        wave_index: usize,
        timeout: Duration,
    ) -> Result<String, CallbackError>;

    /// Resolve a previously issued token
    async fn resolve_token(&self, token: &str, outcome: TokenOutcome) -> Result<(), CallbackError>;
}

/// Message publishing primitive
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish `message` to `topic`
    async fn publish(&self, topic: &str, message: &str) -> Result<(), CallbackError>;
}

/// Lifecycle event kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NotificationEvent {
    /// Execution created
    ExecutionStarted,
    /// Wave launched
    WaveLaunched {
        /// Wave index
        wave_index: usize,
        /// Remote job
        job_id: String,
    },
    /// Execution waiting for an operator before a wave
    ExecutionPaused {
        /// Wave waiting on approval
        wave_index: usize,
    },
    /// Operator resumed
    ExecutionResumed {
        /// Wave being launched
        wave_index: usize,
    },
    /// Execution reached a terminal status
    ExecutionFinished {
        /// Final status
        status: ExecutionStatus,
    },
}

/// Published notification body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    /// Execution ID
    pub execution_id: Uuid,
    /// Plan ID
    pub plan_id: Uuid,
    /// Plan name
    pub plan_name: String,
    /// Drill or recovery
    pub execution_type: ExecutionType,
    /// Event
    #[serde(flatten)]
    pub event: NotificationEvent,
    /// When the event happened
    pub timestamp: DateTime<Utc>,
}

/// Fire-and-forget notifier over a [`Publisher`]
#[derive(Clone)]
pub struct Notifier {
    publisher: Arc<dyn Publisher>,
    topic: String,
}

impl Notifier {
    /// Create new notifier publishing to `topic`
    pub fn new(publisher: Arc<dyn Publisher>, topic: impl Into<String>) -> Self {
        Self {
            publisher,
            topic: topic.into(),
        }
    }

    /// Publish `message`; failures are logged, never returned
    pub async fn notify(&self, message: NotificationMessage) {
        let body = match serde_json::to_string(&message) {
            Ok(body) => body,
            Err(e) => {
                warn!(execution_id = %message.execution_id, error = %e, "failed to encode notification");
                return;
            }
        };

        match self.publisher.publish(&self.topic, &body).await {
            Ok(()) => debug!(
                execution_id = %message.execution_id,
                topic = %self.topic,
                "published notification"
            ),
            Err(e) => warn!(
                execution_id = %message.execution_id,
                topic = %self.topic,
                error = %e,
                "notification publish failed"
            ),
        }
    }
}
