//! Error types for the job engine and instance lifecycle.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use super::job::JobType;

/// Coarse classification used to decide retry versus terminal handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Caller mistake; never retried.
    Validation,
    /// Concurrent duplicate operation; surfaced as a conflict.
    OperationInProgress,
    /// Network failure, 5xx or 429 from upstream.
    TransientUpstream,
    /// 4xx (other than 429) from upstream.
    PermanentUpstream,
    /// Upstream deemed unhealthy by the circuit breaker.
    CircuitOpen,
    /// A handler or upstream call exceeded its budget.
    Timeout,
    /// Webhook receiver unreachable or erroring.
    Delivery,
    /// Everything else: storage, configuration, missing records.
    Internal,
}

/// Errors produced by orchestrator components.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Request rejected before any work was scheduled.
    #[error("validation error: {0}")]
    Validation(String),
    /// Referenced job or instance does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Another mutating operation already holds the instance's operation token.
    #[error("operation {operation_id} already in progress for instance {instance_id}")]
    OperationInProgress {
        /// Instance the request targeted.
        instance_id: Uuid,
        /// Token currently held.
        operation_id: Uuid,
    },
    /// Retryable upstream failure.
    #[error("transient upstream error{}: {message}", status_suffix(.status))]
    TransientUpstream {
        /// HTTP status, if a response was received.
        status: Option<u16>,
        /// Error detail.
        message: String,
        /// Provider-supplied `Retry-After`.
        retry_after: Option<Duration>,
    },
    /// Non-retryable upstream failure.
    #[error("permanent upstream error{}: {message}", status_suffix(.status))]
    PermanentUpstream {
        /// HTTP status, if a response was received.
        status: Option<u16>,
        /// Error detail.
        message: String,
    },
    /// Call rejected without reaching the dependency.
    #[error("circuit open for {dependency}, retry in {retry_in:?}")]
    CircuitOpen {
        /// Name of the guarded dependency.
        dependency: String,
        /// Remaining cooldown.
        retry_in: Duration,
    },
    /// Operation exceeded its time budget.
    #[error("timed out: {0}")]
    Timeout(String),
    /// Webhook delivery failed after all attempts.
    #[error("webhook delivery failed: {0}")]
    Delivery(String),
    /// Persistence collaborator failure.
    #[error("storage error: {0}")]
    Storage(String),
    /// A job or instance transition that the state machine forbids.
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    /// No handler registered for a job type.
    #[error("no handler registered for job type {0}")]
    MissingHandler(JobType),
    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Component is shutting down.
    #[error("shutting down")]
    Shutdown,
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

impl OrchestratorError {
    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::OperationInProgress { .. } => ErrorKind::OperationInProgress,
            Self::TransientUpstream { .. } => ErrorKind::TransientUpstream,
            Self::PermanentUpstream { .. } => ErrorKind::PermanentUpstream,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Delivery(_) => ErrorKind::Delivery,
            Self::NotFound(_)
            | Self::Storage(_)
            | Self::InvalidTransition(_)
            | Self::MissingHandler(_)
            | Self::InvalidConfig(_)
            | Self::Shutdown => ErrorKind::Internal,
        }
    }

    /// Whether the owning job should be retried with backoff.
    ///
    /// Storage failures are retried as well: the record is still intact and
    /// the next attempt may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientUpstream { .. } | Self::Timeout(_) | Self::Storage(_)
        )
    }

    /// Whether the circuit breaker should count this as a dependency failure.
    #[must_use]
    pub const fn counts_as_upstream_failure(&self) -> bool {
        matches!(self, Self::TransientUpstream { .. } | Self::Timeout(_))
    }

    /// Provider-supplied retry hint, if any.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::TransientUpstream { retry_after, .. } => *retry_after,
            Self::CircuitOpen { retry_in, .. } => Some(*retry_in),
            _ => None,
        }
    }

    /// Build a transient error from any displayable cause.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientUpstream {
            status: None,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Wrap a storage-layer failure.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("serialization: {err}"))
    }
}

/// Result alias for orchestrator operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
