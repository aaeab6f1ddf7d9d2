//! Job records, payloads and handler outcomes.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{ErrorKind, OrchestratorError};
use crate::webhook::WebhookNotification;

/// Job identifier.
pub type JobId = Uuid;
/// Internal instance identifier.
pub type InstanceId = Uuid;
/// Operation token identifier.
pub type OperationId = Uuid;

/// Kind of work a job performs. Each kind has exactly one registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Create the instance upstream and begin startup.
    CreateInstance,
    /// Start a stopped or exited instance.
    StartInstance,
    /// Stop a running instance.
    StopInstance,
    /// Delete the instance upstream and mark it terminated.
    DeleteInstance,
    /// Poll the provider until a starting instance is running.
    MonitorInstance,
    /// Deliver a lifecycle webhook.
    SendWebhook,
    /// Re-check idleness and stop the instance if still idle.
    AutoStopCheck,
    /// Migrate an exited instance to fresh capacity.
    MigrationCheck,
}

impl JobType {
    /// Every job type, used to verify handler registration at startup.
    pub const ALL: [Self; 8] = [
        Self::CreateInstance,
        Self::StartInstance,
        Self::StopInstance,
        Self::DeleteInstance,
        Self::MonitorInstance,
        Self::SendWebhook,
        Self::AutoStopCheck,
        Self::MigrationCheck,
    ];

    /// Stable snake_case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreateInstance => "create_instance",
            Self::StartInstance => "start_instance",
            Self::StopInstance => "stop_instance",
            Self::DeleteInstance => "delete_instance",
            Self::MonitorInstance => "monitor_instance",
            Self::SendWebhook => "send_webhook",
            Self::AutoStopCheck => "auto_stop_check",
            Self::MigrationCheck => "migration_check",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be dequeued (possibly not before `next_retry_at`).
    Pending,
    /// Claimed by the worker pool.
    Processing,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully; will not be retried.
    Failed,
}

impl JobStatus {
    /// Whether the job has reached a final state.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Queue ordering band. Higher bands are dequeued first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work such as scheduler checks.
    Low,
    /// Default band.
    #[default]
    Normal,
    /// User-facing creation and startup.
    High,
}

/// Type-specific job data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    /// See [`JobType::CreateInstance`].
    CreateInstance {
        /// Target instance.
        instance_id: InstanceId,
        /// Operation token held for the duration of create + startup.
        operation_id: OperationId,
    },
    /// See [`JobType::StartInstance`].
    StartInstance {
        /// Target instance.
        instance_id: InstanceId,
        /// Operation token held until the instance is running.
        operation_id: OperationId,
    },
    /// See [`JobType::StopInstance`].
    StopInstance {
        /// Target instance.
        instance_id: InstanceId,
        /// Operation token held until the instance is stopped.
        operation_id: OperationId,
    },
    /// See [`JobType::DeleteInstance`].
    DeleteInstance {
        /// Target instance.
        instance_id: InstanceId,
        /// Operation token held until the instance is terminated.
        operation_id: OperationId,
    },
    /// See [`JobType::MonitorInstance`].
    MonitorInstance {
        /// Target instance.
        instance_id: InstanceId,
        /// Operation being monitored.
        operation_id: OperationId,
        /// Startup fails with a timeout once this passes.
        deadline: DateTime<Utc>,
    },
    /// See [`JobType::SendWebhook`].
    SendWebhook {
        /// Receiver URL.
        url: String,
        /// Notification body.
        notification: WebhookNotification,
        /// Lifecycle-critical notifications get a higher retry ceiling.
        critical: bool,
    },
    /// See [`JobType::AutoStopCheck`].
    AutoStopCheck {
        /// Target instance.
        instance_id: InstanceId,
        /// Idle threshold the scheduler evaluated.
        threshold_minutes: u64,
    },
    /// See [`JobType::MigrationCheck`].
    MigrationCheck {
        /// Target instance.
        instance_id: InstanceId,
    },
}

impl JobPayload {
    /// Job type tag for this payload.
    #[must_use]
    pub const fn job_type(&self) -> JobType {
        match self {
            Self::CreateInstance { .. } => JobType::CreateInstance,
            Self::StartInstance { .. } => JobType::StartInstance,
            Self::StopInstance { .. } => JobType::StopInstance,
            Self::DeleteInstance { .. } => JobType::DeleteInstance,
            Self::MonitorInstance { .. } => JobType::MonitorInstance,
            Self::SendWebhook { .. } => JobType::SendWebhook,
            Self::AutoStopCheck { .. } => JobType::AutoStopCheck,
            Self::MigrationCheck { .. } => JobType::MigrationCheck,
        }
    }

    /// Instance this payload targets, if any.
    #[must_use]
    pub const fn instance_id(&self) -> Option<InstanceId> {
        match self {
            Self::CreateInstance { instance_id, .. }
            | Self::StartInstance { instance_id, .. }
            | Self::StopInstance { instance_id, .. }
            | Self::DeleteInstance { instance_id, .. }
            | Self::MonitorInstance { instance_id, .. }
            | Self::AutoStopCheck { instance_id, .. }
            | Self::MigrationCheck { instance_id } => Some(*instance_id),
            Self::SendWebhook { .. } => None,
        }
    }

    /// Operation token this payload carries, if any.
    #[must_use]
    pub const fn operation_id(&self) -> Option<OperationId> {
        match self {
            Self::CreateInstance { operation_id, .. }
            | Self::StartInstance { operation_id, .. }
            | Self::StopInstance { operation_id, .. }
            | Self::DeleteInstance { operation_id, .. }
            | Self::MonitorInstance { operation_id, .. } => Some(*operation_id),
            _ => None,
        }
    }
}

/// A persisted unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier.
    pub id: JobId,
    /// Type tag, always equal to `payload.job_type()`.
    pub job_type: JobType,
    /// Type-specific data.
    pub payload: JobPayload,
    /// Current status.
    pub status: JobStatus,
    /// Ordering band.
    pub priority: Priority,
    /// Attempts consumed so far.
    pub attempts: u32,
    /// Attempt ceiling.
    pub max_attempts: u32,
    /// Enqueue time.
    pub created_at: DateTime<Utc>,
    /// Monotonic enqueue counter; breaks `created_at` ties.
    #[serde(default)]
    pub sequence: u64,
    /// Last time the job was claimed.
    pub processed_at: Option<DateTime<Utc>>,
    /// Time the job reached Completed or Failed.
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest time a Pending job may be dequeued.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Most recent failure reason.
    pub last_error: Option<String>,
}

impl Job {
    /// Build a fresh Pending job.
    #[must_use]
    pub fn new(payload: JobPayload, priority: Priority, max_attempts: u32, sequence: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: payload.job_type(),
            payload,
            status: JobStatus::Pending,
            priority,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            created_at: Utc::now(),
            sequence,
            processed_at: None,
            completed_at: None,
            next_retry_at: None,
            last_error: None,
        }
    }

    /// Pending and not waiting on a retry delay.
    #[must_use]
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.next_retry_at.is_none_or(|at| at <= now)
    }

    /// Context handed to the handler for this execution.
    #[must_use]
    pub const fn context(&self) -> JobContext {
        JobContext {
            job_id: self.id,
            job_type: self.job_type,
            attempt: self.attempts + 1,
            max_attempts: self.max_attempts,
        }
    }
}

/// Per-execution information passed to a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobContext {
    /// Job being executed.
    pub job_id: JobId,
    /// Its type.
    pub job_type: JobType,
    /// 1-based attempt number of this execution.
    pub attempt: u32,
    /// Attempt ceiling.
    pub max_attempts: u32,
}

impl JobContext {
    /// Whether a retryable failure of this execution will be final.
    #[must_use]
    pub const fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

/// What a handler reports back to the worker pool. Retry decisions are data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Work done.
    Success,
    /// Try again after backoff (or after `retry_after` when the provider said so).
    RetryableFailure {
        /// Failure detail.
        reason: String,
        /// Provider-supplied delay overriding the computed backoff.
        retry_after: Option<Duration>,
    },
    /// Give up now.
    PermanentFailure {
        /// Failure detail.
        reason: String,
    },
    /// Re-run later without consuming an attempt.
    Deferred {
        /// Why the job is being re-queued.
        reason: String,
        /// Delay before the job becomes ready again.
        delay: Duration,
    },
}

impl HandlerOutcome {
    /// Retryable failure without a provider hint.
    pub fn retry(reason: impl Into<String>) -> Self {
        Self::RetryableFailure {
            reason: reason.into(),
            retry_after: None,
        }
    }

    /// Permanent failure.
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::PermanentFailure {
            reason: reason.into(),
        }
    }

    /// Translate a classified error into an outcome.
    ///
    /// Circuit-open rejections never reached the dependency, so they defer
    /// instead of consuming an attempt.
    #[must_use]
    pub fn from_error(err: &OrchestratorError) -> Self {
        match err.kind() {
            ErrorKind::CircuitOpen => Self::Deferred {
                reason: err.to_string(),
                delay: err.retry_after().unwrap_or(Duration::from_secs(1)),
            },
            _ if err.is_retryable() => Self::RetryableFailure {
                reason: err.to_string(),
                retry_after: err.retry_after(),
            },
            _ => Self::permanent(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start_payload() -> JobPayload {
        JobPayload::StartInstance {
            instance_id: Uuid::new_v4(),
            operation_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn payload_tags_match_types() {
        let payload = start_payload();
        assert_eq!(payload.job_type(), JobType::StartInstance);
        assert!(payload.instance_id().is_some());
        assert!(payload.operation_id().is_some());

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "start_instance");
    }

    #[test]
    fn priority_ordering() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn ready_respects_retry_time() {
        let mut job = Job::new(start_payload(), Priority::Normal, 3, 0);
        let now = Utc::now();
        assert!(job.is_ready(now));
        job.next_retry_at = Some(now + chrono::Duration::seconds(10));
        assert!(!job.is_ready(now));
        assert!(job.is_ready(now + chrono::Duration::seconds(11)));
        job.status = JobStatus::Processing;
        assert!(!job.is_ready(now + chrono::Duration::seconds(11)));
    }

    #[test]
    fn outcome_from_error() {
        let open = OrchestratorError::CircuitOpen {
            dependency: "provider".into(),
            retry_in: Duration::from_secs(7),
        };
        assert!(matches!(
            HandlerOutcome::from_error(&open),
            HandlerOutcome::Deferred { delay, .. } if delay == Duration::from_secs(7)
        ));

        let throttled = OrchestratorError::TransientUpstream {
            status: Some(429),
            message: "slow down".into(),
            retry_after: Some(Duration::from_secs(30)),
        };
        assert!(matches!(
            HandlerOutcome::from_error(&throttled),
            HandlerOutcome::RetryableFailure { retry_after: Some(d), .. }
                if d == Duration::from_secs(30)
        ));

        let invalid = OrchestratorError::Validation("no product".into());
        assert!(matches!(
            HandlerOutcome::from_error(&invalid),
            HandlerOutcome::PermanentFailure { .. }
        ));
    }

    #[test]
    fn context_counts_from_one() {
        let job = Job::new(start_payload(), Priority::High, 2, 0);
        let ctx = job.context();
        assert_eq!(ctx.attempt, 1);
        assert!(!ctx.is_final_attempt());
    }
}
