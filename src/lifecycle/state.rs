//! Instance record and its state machine.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{InstanceId, OperationId, OrchestratorError, OrchestratorResult};
use crate::infra::provider::CreateInstanceRequest;
use crate::util::clock::{elapsed_between, to_chrono};

/// Managed instance status.
///
/// ```text
/// Creating -> Created -> Starting -> Running -> Stopping -> Stopped
///                           |           |                     |
///                           v           v                     v
///                         Failed      Exited  -------------> Starting
/// any non-terminal -> Terminated, any non-terminal -> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Record exists, upstream create pending.
    Creating,
    /// Created upstream, not yet booting.
    Created,
    /// Booting upstream.
    Starting,
    /// Up.
    Running,
    /// Stop requested.
    Stopping,
    /// Stopped by request.
    Stopped,
    /// Reclaimed by the provider (spot preemption).
    Exited,
    /// Terminal: an operation failed.
    Failed,
    /// Terminal: deleted.
    Terminated,
}

impl InstanceStatus {
    /// Failed or Terminated.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Terminated)
    }

    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use InstanceStatus::{
            Created, Creating, Exited, Failed, Running, Starting, Stopped, Stopping, Terminated,
        };
        match (self, next) {
            (Failed, Terminated) => true,
            (Failed | Terminated, _) => false,
            (_, Terminated | Failed) => true,
            (Creating, Created)
            | (Created | Stopped | Exited, Starting)
            | (Created | Starting | Stopped | Exited, Running)
            | (Running, Stopping | Exited)
            | (Stopping, Stopped) => true,
            _ => false,
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Exited => "exited",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Creation parameters; immutable once the record exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Unique display name.
    pub name: String,
    /// Product (GPU SKU).
    pub product_id: String,
    /// Container image.
    pub image: String,
    /// Exposed ports.
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Container environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Preferred region.
    #[serde(default)]
    pub region: Option<String>,
    /// Receiver for this instance's notifications.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

impl InstanceConfig {
    /// Minimal configuration.
    pub fn new(
        name: impl Into<String>,
        product_id: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            product_id: product_id.into(),
            image: image.into(),
            ports: Vec::new(),
            env: BTreeMap::new(),
            region: None,
            webhook_url: None,
        }
    }

    /// Reject obviously unusable requests before anything is stored.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::Validation`] naming the offending field.
    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.name.trim().is_empty() {
            return Err(OrchestratorError::Validation("name must not be empty".into()));
        }
        if self.product_id.trim().is_empty() {
            return Err(OrchestratorError::Validation("product_id must not be empty".into()));
        }
        if self.image.trim().is_empty() {
            return Err(OrchestratorError::Validation("image must not be empty".into()));
        }
        if self.ports.contains(&0) {
            return Err(OrchestratorError::Validation("port 0 is not allowed".into()));
        }
        if let Some(url) = &self.webhook_url {
            validate_webhook_url(url)?;
        }
        Ok(())
    }

    /// Provider create request for this configuration.
    #[must_use]
    pub fn to_create_request(&self) -> CreateInstanceRequest {
        CreateInstanceRequest {
            name: self.name.clone(),
            product_id: self.product_id.clone(),
            image_url: self.image.clone(),
            ports: self.ports.clone(),
            envs: self.env.clone(),
            region: self.region.clone(),
        }
    }
}

/// Reject non-http(s) webhook receivers.
///
/// # Errors
///
/// [`OrchestratorError::Validation`].
pub fn validate_webhook_url(url: &str) -> OrchestratorResult<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(OrchestratorError::Validation(format!(
            "webhook_url `{url}` is not an http(s) URL"
        )))
    }
}

/// Lifecycle timestamps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceTimestamps {
    /// Record creation.
    pub created: Option<DateTime<Utc>>,
    /// Last entry into Starting.
    pub started: Option<DateTime<Utc>>,
    /// Last entry into Running.
    pub ready: Option<DateTime<Utc>>,
    /// Last entry into Stopping.
    pub stopping: Option<DateTime<Utc>>,
    /// Last entry into Stopped.
    pub stopped: Option<DateTime<Utc>>,
    /// Entry into Failed.
    pub failed: Option<DateTime<Utc>>,
    /// Entry into Terminated.
    pub terminated: Option<DateTime<Utc>>,
}

/// Kind of in-flight operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Create + first startup.
    Create,
    /// Start of a stopped or exited instance.
    Start,
    /// Stop.
    Stop,
    /// Delete.
    Delete,
    /// Spot migration.
    Migrate,
}

/// Bookkeeping for the in-flight operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveOperation {
    /// What is running.
    pub kind: OperationKind,
    /// When it was accepted.
    pub started_at: DateTime<Utc>,
    /// Per-request notification receiver.
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Startup deadline override.
    #[serde(default)]
    pub max_wait_secs: Option<u64>,
}

/// Persisted instance record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceState {
    /// Internal id.
    pub id: InstanceId,
    /// Assigned once created upstream.
    pub provider_instance_id: Option<String>,
    /// Display name, unique among live instances.
    pub name: String,
    /// Current status.
    pub status: InstanceStatus,
    /// Creation parameters.
    pub config: InstanceConfig,
    /// Lifecycle timestamps.
    pub timestamps: InstanceTimestamps,
    /// Last activity reported by the caller.
    pub last_used_at: Option<DateTime<Utc>>,
    /// Mutual-exclusion token; set while an operation is in flight.
    pub active_operation_id: Option<OperationId>,
    /// Details of the operation holding the token.
    #[serde(default)]
    pub operation: Option<ActiveOperation>,
    /// Most recent failure reason.
    #[serde(default)]
    pub last_error: Option<String>,
    /// When `status` last changed.
    #[serde(default)]
    pub status_changed_at: Option<DateTime<Utc>>,
}

impl InstanceState {
    /// Fresh record in Creating.
    #[must_use]
    pub fn new(config: InstanceConfig, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider_instance_id: None,
            name: config.name.clone(),
            status: InstanceStatus::Creating,
            config,
            timestamps: InstanceTimestamps {
                created: Some(now),
                ..InstanceTimestamps::default()
            },
            last_used_at: None,
            active_operation_id: None,
            operation: None,
            last_error: None,
            status_changed_at: Some(now),
        }
    }

    /// Move to `next`, stamping the matching timestamp.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::InvalidTransition`] for an illegal move.
    pub fn transition(
        &mut self,
        next: InstanceStatus,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(OrchestratorError::InvalidTransition(format!(
                "instance {} cannot go from {} to {next}",
                self.id, self.status
            )));
        }
        self.status_changed_at = Some(now);
        let stamp = match next {
            InstanceStatus::Starting => &mut self.timestamps.started,
            InstanceStatus::Running => &mut self.timestamps.ready,
            InstanceStatus::Stopping => &mut self.timestamps.stopping,
            InstanceStatus::Stopped => &mut self.timestamps.stopped,
            InstanceStatus::Failed => &mut self.timestamps.failed,
            InstanceStatus::Terminated => &mut self.timestamps.terminated,
            InstanceStatus::Creating | InstanceStatus::Created | InstanceStatus::Exited => {
                self.status = next;
                return Ok(());
            }
        };
        *stamp = Some(now);
        self.status = next;
        Ok(())
    }

    /// Take the operation token.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::OperationInProgress`] if another operation holds it.
    pub fn acquire_operation(
        &mut self,
        kind: OperationKind,
        now: DateTime<Utc>,
        webhook_url: Option<String>,
        max_wait_secs: Option<u64>,
    ) -> OrchestratorResult<OperationId> {
        if let Some(operation_id) = self.active_operation_id {
            return Err(OrchestratorError::OperationInProgress {
                instance_id: self.id,
                operation_id,
            });
        }
        let operation_id = Uuid::new_v4();
        self.active_operation_id = Some(operation_id);
        self.operation = Some(ActiveOperation {
            kind,
            started_at: now,
            webhook_url,
            max_wait_secs,
        });
        Ok(operation_id)
    }

    /// Whether `operation_id` currently holds the token.
    #[must_use]
    pub fn holds(&self, operation_id: OperationId) -> bool {
        self.active_operation_id == Some(operation_id)
    }

    /// Drop the token.
    pub fn release_operation(&mut self) {
        self.active_operation_id = None;
        self.operation = None;
    }

    /// Latest of last use, ready and started: the point idleness is measured from.
    #[must_use]
    pub fn idle_since(&self) -> Option<DateTime<Utc>> {
        [self.last_used_at, self.timestamps.ready, self.timestamps.started]
            .into_iter()
            .flatten()
            .max()
    }

    /// Running and idle for longer than `threshold_minutes` at `now`.
    #[must_use]
    pub fn is_idle(&self, threshold_minutes: u64, now: DateTime<Utc>) -> bool {
        if self.status != InstanceStatus::Running {
            return false;
        }
        let threshold = std::time::Duration::from_secs(threshold_minutes.saturating_mul(60));
        self.idle_since()
            .is_some_and(|since| elapsed_between(since, now) > threshold)
    }

    /// When the record reached its terminal state.
    #[must_use]
    pub fn terminal_at(&self) -> Option<DateTime<Utc>> {
        match self.status {
            InstanceStatus::Terminated => self.timestamps.terminated,
            InstanceStatus::Failed => self.timestamps.failed,
            _ => None,
        }
    }

    /// Terminal and past `retention` at `now`.
    #[must_use]
    pub fn retention_expired(&self, retention: std::time::Duration, now: DateTime<Utc>) -> bool {
        self.terminal_at()
            .is_some_and(|at| at + to_chrono(retention) <= now)
    }

    /// Elapsed time of the current operation.
    #[must_use]
    pub fn operation_elapsed(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        self.operation
            .as_ref()
            .map(|op| elapsed_between(op.started_at, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use InstanceStatus::*;

    fn state() -> InstanceState {
        InstanceState::new(InstanceConfig::new("gpu-1", "p1", "img"), Utc::now())
    }

    #[test]
    fn normal_path_is_legal() {
        let path = [Creating, Created, Starting, Running, Stopping, Stopped];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn terminal_states_are_sticky() {
        assert!(!Terminated.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Starting));
        assert!(Failed.can_transition_to(Terminated));
        assert!(!Running.can_transition_to(Creating));
        assert!(Starting.can_transition_to(Failed));
        assert!(Running.can_transition_to(Exited));
    }

    #[test]
    fn transition_stamps_timestamps() {
        let mut s = state();
        let now = Utc::now();
        s.transition(Created, now).unwrap();
        s.transition(Starting, now).unwrap();
        s.transition(Running, now).unwrap();
        assert_eq!(s.timestamps.started, Some(now));
        assert_eq!(s.timestamps.ready, Some(now));
        assert_eq!(s.status_changed_at, Some(now));
        assert!(s.transition(Creating, now).is_err());
    }

    #[test]
    fn second_operation_is_rejected() {
        let mut s = state();
        let now = Utc::now();
        let op = s.acquire_operation(OperationKind::Start, now, None, None).unwrap();
        let err = s
            .acquire_operation(OperationKind::Stop, now, None, None)
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::OperationInProgress { operation_id, .. } if operation_id == op
        ));
        s.release_operation();
        assert!(s.acquire_operation(OperationKind::Stop, now, None, None).is_ok());
    }

    #[test]
    fn idleness_uses_latest_activity() {
        let mut s = state();
        let now = Utc::now();
        s.status = Running;
        s.timestamps.started = Some(now - chrono::Duration::minutes(60));
        s.timestamps.ready = Some(now - chrono::Duration::minutes(55));
        s.last_used_at = Some(now - chrono::Duration::minutes(25));
        assert!(s.is_idle(20, now));
        s.last_used_at = Some(now - chrono::Duration::minutes(5));
        assert!(!s.is_idle(20, now));
        s.status = Stopped;
        s.last_used_at = Some(now - chrono::Duration::minutes(25));
        assert!(!s.is_idle(20, now));
    }

    #[test]
    fn config_validation() {
        assert!(InstanceConfig::new("gpu-1", "p1", "img").validate().is_ok());
        assert!(InstanceConfig::new("", "p1", "img").validate().is_err());
        let mut cfg = InstanceConfig::new("gpu-1", "p1", "img");
        cfg.webhook_url = Some("ftp://x".into());
        assert!(cfg.validate().is_err());
    }
}
