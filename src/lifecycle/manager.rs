//! Instance lifecycle: request-side mutations, handler-side transitions,
//! and reconciliation against the provider.
//!
//! Records live in an in-memory index guarded by a `parking_lot::Mutex` and
//! are written through to the [`KvStore`] before a call returns. Every
//! read-modify-write runs on a copy under the lock and is swapped in only if
//! the change is legal, so a rejected change never leaves a half-applied
//! record behind.
//!
//! The operation token (`active_operation_id`) is the only concurrency guard
//! between operations on one instance. Handler-side transitions name the
//! operation they belong to and are refused once that operation no longer
//! holds the token.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::state::{
    validate_webhook_url, InstanceConfig, InstanceState, InstanceStatus, OperationKind,
};
use crate::config::{LifecycleConfig, MigrationConfig};
use crate::core::{
    InstanceId, JobPayload, JobQueue, JobType, OperationId, OrchestratorError, OrchestratorResult,
    Priority,
};
use crate::infra::provider::{ProviderInstance, ProviderStatus};
use crate::infra::store::{self, KvStore, INSTANCE_PREFIX, MIGRATION_COOLDOWN_PREFIX};
use crate::util::clock::{elapsed_between, to_chrono};
use crate::webhook::{WebhookDetail, WebhookEvent, WebhookNotification};

/// Per-request start options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartOptions {
    /// Notification receiver for this operation only.
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Startup deadline override, in seconds.
    #[serde(default)]
    pub max_wait_secs: Option<u64>,
}

/// What a reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Local records looked at.
    pub examined: usize,
    /// Status updated from the provider's view.
    pub updated: usize,
    /// Missing upstream, marked Terminated.
    pub terminated: usize,
    /// Missing upstream, record deleted.
    pub removed: usize,
    /// Terminal records deleted after retention.
    pub purged: usize,
    /// Skipped because an operation is in flight or the record changed
    /// after the provider list was taken.
    pub skipped: usize,
    /// Orphaned operation tokens released.
    pub released: usize,
}

impl ReconcileReport {
    /// Whether the pass changed anything.
    #[must_use]
    pub const fn changed(&self) -> bool {
        self.updated + self.terminated + self.removed + self.purged + self.released > 0
    }
}

/// Where and what to notify after a transition; captured before the token
/// is released so the per-operation receiver is not lost.
struct Notice {
    url: Option<String>,
    operation_id: Option<OperationId>,
    elapsed: Option<Duration>,
}

fn instance_key(id: InstanceId) -> String {
    format!("{INSTANCE_PREFIX}{id}")
}

fn cooldown_key(id: InstanceId) -> String {
    format!("{MIGRATION_COOLDOWN_PREFIX}{id}")
}

/// Status an instance should move to given the provider's view, if any.
fn reconciled_status(local: InstanceStatus, remote: ProviderStatus) -> Option<InstanceStatus> {
    use InstanceStatus as L;
    match remote {
        ProviderStatus::Running => {
            matches!(local, L::Created | L::Starting | L::Stopped | L::Exited).then_some(L::Running)
        }
        ProviderStatus::Exited => match local {
            L::Running => Some(L::Exited),
            L::Stopping => Some(L::Stopped),
            _ => None,
        },
        ProviderStatus::Failed => (!local.is_terminal()).then_some(L::Failed),
        _ => None,
    }
}

/// Owner of every instance record.
pub struct InstanceLifecycle {
    config: LifecycleConfig,
    migration: MigrationConfig,
    default_webhook_url: Option<String>,
    store: Arc<dyn KvStore>,
    queue: Arc<JobQueue>,
    instances: Mutex<HashMap<InstanceId, InstanceState>>,
}

impl InstanceLifecycle {
    /// Create an empty lifecycle writing through to `store`.
    pub fn new(config: LifecycleConfig, store: Arc<dyn KvStore>, queue: Arc<JobQueue>) -> Self {
        Self {
            config,
            migration: MigrationConfig::default(),
            default_webhook_url: None,
            store,
            queue,
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Migration cooldown policy.
    #[must_use]
    pub fn with_migration_policy(mut self, migration: MigrationConfig) -> Self {
        self.migration = migration;
        self
    }

    /// Receiver for instances without a URL of their own.
    #[must_use]
    pub fn with_default_webhook_url(mut self, url: Option<String>) -> Self {
        self.default_webhook_url = url;
        self
    }

    /// Lifecycle policy in effect.
    pub const fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Queue this lifecycle enqueues into.
    pub const fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Load persisted records. Returns how many were loaded.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot be read.
    pub async fn recover(&self) -> OrchestratorResult<usize> {
        let persisted: Vec<InstanceState> =
            store::list_json(self.store.as_ref(), INSTANCE_PREFIX).await?;
        let mut instances = self.instances.lock();
        for state in persisted {
            instances.insert(state.id, state);
        }
        info!(instances = instances.len(), "instance records recovered from store");
        Ok(instances.len())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Snapshot of one record.
    pub fn get(&self, id: InstanceId) -> Option<InstanceState> {
        self.instances.lock().get(&id).cloned()
    }

    /// Look up by id, or by name among records (live ones preferred).
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::NotFound`].
    pub fn find(&self, id_or_name: &str) -> OrchestratorResult<InstanceState> {
        let instances = self.instances.lock();
        if let Ok(id) = Uuid::parse_str(id_or_name) {
            if let Some(state) = instances.get(&id) {
                return Ok(state.clone());
            }
        }
        instances
            .values()
            .filter(|s| s.name == id_or_name)
            .max_by_key(|s| (!s.status.is_terminal(), s.timestamps.created))
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(format!("instance {id_or_name}")))
    }

    /// Every record, oldest first.
    pub fn list(&self) -> Vec<InstanceState> {
        let mut out: Vec<InstanceState> = self.instances.lock().values().cloned().collect();
        out.sort_by_key(|s| (s.timestamps.created, s.id));
        out
    }

    /// Whether `id` is Running and idle longer than `threshold_minutes`.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::NotFound`].
    pub fn is_eligible_for_auto_stop(
        &self,
        id: InstanceId,
        threshold_minutes: u64,
    ) -> OrchestratorResult<bool> {
        self.is_eligible_for_auto_stop_at(id, threshold_minutes, Utc::now())
    }

    /// [`Self::is_eligible_for_auto_stop`] evaluated at `now`.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::NotFound`].
    pub fn is_eligible_for_auto_stop_at(
        &self,
        id: InstanceId,
        threshold_minutes: u64,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<bool> {
        self.instances
            .lock()
            .get(&id)
            .map(|s| s.is_idle(threshold_minutes, now))
            .ok_or_else(|| OrchestratorError::NotFound(format!("instance {id}")))
    }

    /// Whether `id` is Exited, idle, and past its migration cooldown at `now`.
    ///
    /// # Errors
    ///
    /// Store read failures.
    pub async fn is_eligible_for_migration(
        &self,
        id: InstanceId,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<bool> {
        let eligible_state = self
            .get(id)
            .is_some_and(|s| s.status == InstanceStatus::Exited && s.active_operation_id.is_none());
        if !eligible_state {
            return Ok(false);
        }
        let last: Option<DateTime<Utc>> =
            store::get_json(self.store.as_ref(), &cooldown_key(id)).await?;
        let min_interval = Duration::from_secs(self.migration.min_interval_secs);
        Ok(last.is_none_or(|at| elapsed_between(at, now) >= min_interval))
    }

    // ------------------------------------------------------------------
    // Request-side mutations
    // ------------------------------------------------------------------

    /// Create a record in Creating and enqueue its CreateInstance job.
    ///
    /// # Errors
    ///
    /// `Validation` for a bad config or a name already used by a live
    /// instance; storage errors.
    pub async fn create_instance(
        &self,
        config: InstanceConfig,
    ) -> OrchestratorResult<InstanceState> {
        config.validate()?;
        let now = Utc::now();
        let (state, operation_id) = {
            let mut instances = self.instances.lock();
            if instances
                .values()
                .any(|s| s.name == config.name && !s.status.is_terminal())
            {
                return Err(OrchestratorError::Validation(format!(
                    "instance name `{}` is already in use",
                    config.name
                )));
            }
            let mut state = InstanceState::new(config, now);
            let operation_id = state.acquire_operation(OperationKind::Create, now, None, None)?;
            instances.insert(state.id, state.clone());
            (state, operation_id)
        };
        let id = state.id;

        if let Err(e) = self.persist(&state).await {
            self.instances.lock().remove(&id);
            return Err(e);
        }
        let payload = JobPayload::CreateInstance {
            instance_id: id,
            operation_id,
        };
        if let Err(e) = self.queue.enqueue(payload, Priority::High).await {
            self.instances.lock().remove(&id);
            if let Err(cleanup) = self.store.delete(&instance_key(id)).await {
                warn!(
                    instance_id = %id,
                    error = %cleanup,
                    "failed to remove record after enqueue failure"
                );
            }
            return Err(e);
        }
        info!(
            instance_id = %id,
            name = %state.name,
            operation_id = %operation_id,
            "instance creation accepted"
        );
        let notice = self.notice(&state, now);
        self.notify(&state, WebhookEvent::Initiated, notice, None).await;
        Ok(state)
    }

    /// Take the token and enqueue StartInstance.
    ///
    /// # Errors
    ///
    /// `OperationInProgress` while another operation holds the token,
    /// `Validation` unless the instance is Created, Stopped or Exited.
    pub async fn start_instance(
        &self,
        id_or_name: &str,
        opts: StartOptions,
    ) -> OrchestratorResult<OperationId> {
        if let Some(url) = &opts.webhook_url {
            validate_webhook_url(url)?;
        }
        let id = self.find(id_or_name)?.id;
        let (state, operation_id) = self
            .update(id, |state, now| {
                let operation_id = state.acquire_operation(
                    OperationKind::Start,
                    now,
                    opts.webhook_url.clone(),
                    opts.max_wait_secs,
                )?;
                if !matches!(
                    state.status,
                    InstanceStatus::Created | InstanceStatus::Stopped | InstanceStatus::Exited
                ) {
                    return Err(OrchestratorError::Validation(format!(
                        "instance {id} is {} and cannot be started",
                        state.status
                    )));
                }
                Ok(operation_id)
            })
            .await?;
        self.enqueue_operation(
            &state,
            JobPayload::StartInstance {
                instance_id: id,
                operation_id,
            },
            Priority::High,
        )
        .await?;
        info!(instance_id = %id, operation_id = %operation_id, "instance start accepted");
        let notice = self.notice(&state, Utc::now());
        self.notify(&state, WebhookEvent::Initiated, notice, None).await;
        Ok(operation_id)
    }

    /// Take the token, move to Stopping, and enqueue StopInstance.
    ///
    /// # Errors
    ///
    /// `OperationInProgress` while another operation holds the token,
    /// `Validation` unless the instance is Running.
    pub async fn stop_instance(&self, id_or_name: &str) -> OrchestratorResult<OperationId> {
        let id = self.find(id_or_name)?.id;
        let (state, operation_id) = self
            .update(id, |state, now| {
                let operation_id = state.acquire_operation(OperationKind::Stop, now, None, None)?;
                if state.status != InstanceStatus::Running {
                    return Err(OrchestratorError::Validation(format!(
                        "instance {id} is {} and cannot be stopped",
                        state.status
                    )));
                }
                state.transition(InstanceStatus::Stopping, now)?;
                Ok(operation_id)
            })
            .await?;
        self.enqueue_operation(
            &state,
            JobPayload::StopInstance {
                instance_id: id,
                operation_id,
            },
            Priority::Normal,
        )
        .await?;
        info!(instance_id = %id, operation_id = %operation_id, "instance stop accepted");
        Ok(operation_id)
    }

    /// Take the token and enqueue DeleteInstance.
    ///
    /// # Errors
    ///
    /// `OperationInProgress` while another operation holds the token,
    /// `Validation` if the instance is already Terminated.
    pub async fn delete_instance(&self, id_or_name: &str) -> OrchestratorResult<OperationId> {
        let id = self.find(id_or_name)?.id;
        let (state, operation_id) = self
            .update(id, |state, now| {
                let operation_id = state.acquire_operation(OperationKind::Delete, now, None, None)?;
                if state.status == InstanceStatus::Terminated {
                    return Err(OrchestratorError::Validation(format!(
                        "instance {id} is already terminated"
                    )));
                }
                Ok(operation_id)
            })
            .await?;
        self.enqueue_operation(
            &state,
            JobPayload::DeleteInstance {
                instance_id: id,
                operation_id,
            },
            Priority::Normal,
        )
        .await?;
        info!(instance_id = %id, operation_id = %operation_id, "instance delete accepted");
        Ok(operation_id)
    }

    /// Record caller activity; later timestamps win.
    ///
    /// # Errors
    ///
    /// `NotFound`; storage errors.
    pub async fn record_last_used(
        &self,
        id: InstanceId,
        at: DateTime<Utc>,
    ) -> OrchestratorResult<()> {
        self.update(id, |state, _| {
            if state.last_used_at.is_none_or(|prev| at > prev) {
                state.last_used_at = Some(at);
            }
            Ok(())
        })
        .await
        .map(|_| ())
    }

    // ------------------------------------------------------------------
    // Handler-side transitions
    // ------------------------------------------------------------------

    /// Creating → Created with the provider id.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` if `operation_id` no longer holds the token.
    pub async fn mark_created(
        &self,
        id: InstanceId,
        operation_id: OperationId,
        provider_instance_id: String,
    ) -> OrchestratorResult<InstanceState> {
        let (state, ()) = self
            .update(id, |state, now| {
                ensure_holds(state, operation_id)?;
                state.transition(InstanceStatus::Created, now)?;
                state.provider_instance_id = Some(provider_instance_id);
                Ok(())
            })
            .await?;
        info!(
            instance_id = %id,
            provider_instance_id = ?state.provider_instance_id,
            "instance created upstream"
        );
        Ok(state)
    }

    /// Move to Starting after the provider accepted a create/start/migrate.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` if `operation_id` no longer holds the token.
    pub async fn mark_starting(
        &self,
        id: InstanceId,
        operation_id: OperationId,
    ) -> OrchestratorResult<InstanceState> {
        let (state, notice) = self
            .update(id, |state, now| {
                ensure_holds(state, operation_id)?;
                state.transition(InstanceStatus::Starting, now)?;
                Ok(self.notice(state, now))
            })
            .await?;
        debug!(instance_id = %id, "instance starting");
        self.notify(&state, WebhookEvent::Progress, notice, None).await;
        Ok(state)
    }

    /// Starting → Running; releases the token and sends the completion notice.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` if `operation_id` no longer holds the token.
    pub async fn mark_running(
        &self,
        id: InstanceId,
        operation_id: OperationId,
    ) -> OrchestratorResult<InstanceState> {
        let (state, notice) = self
            .update(id, |state, now| {
                ensure_holds(state, operation_id)?;
                let notice = self.notice(state, now);
                state.transition(InstanceStatus::Running, now)?;
                state.release_operation();
                state.last_error = None;
                Ok(notice)
            })
            .await?;
        info!(
            instance_id = %id,
            startup_ms = notice.elapsed.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            "instance running"
        );
        self.notify(&state, WebhookEvent::Completed, notice, None).await;
        Ok(state)
    }

    /// Stopping → Stopped; releases the token.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` if `operation_id` no longer holds the token.
    pub async fn mark_stopped(
        &self,
        id: InstanceId,
        operation_id: OperationId,
    ) -> OrchestratorResult<InstanceState> {
        let (state, notice) = self
            .update(id, |state, now| {
                ensure_holds(state, operation_id)?;
                let notice = self.notice(state, now);
                state.transition(InstanceStatus::Stopped, now)?;
                state.release_operation();
                Ok(notice)
            })
            .await?;
        info!(instance_id = %id, "instance stopped");
        self.notify(&state, WebhookEvent::Stopped, notice, None).await;
        Ok(state)
    }

    /// → Terminated; releases the token.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` if `operation_id` no longer holds the token.
    pub async fn mark_terminated(
        &self,
        id: InstanceId,
        operation_id: OperationId,
    ) -> OrchestratorResult<InstanceState> {
        let (state, notice) = self
            .update(id, |state, now| {
                ensure_holds(state, operation_id)?;
                let notice = self.notice(state, now);
                state.transition(InstanceStatus::Terminated, now)?;
                state.release_operation();
                Ok(notice)
            })
            .await?;
        info!(instance_id = %id, "instance terminated");
        self.notify(&state, WebhookEvent::Terminated, notice, None).await;
        Ok(state)
    }

    /// Move to Failed and release the token. A no-op returning `None` when
    /// `operation_id` no longer holds it.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub async fn fail_operation(
        &self,
        id: InstanceId,
        operation_id: OperationId,
        reason: &str,
    ) -> OrchestratorResult<Option<InstanceState>> {
        let result = self
            .update(id, |state, now| {
                ensure_holds(state, operation_id)?;
                let notice = self.notice(state, now);
                state.transition(InstanceStatus::Failed, now)?;
                state.release_operation();
                state.last_error = Some(reason.to_string());
                Ok(notice)
            })
            .await;
        match result {
            Ok((state, notice)) => {
                warn!(instance_id = %id, operation_id = %operation_id, reason, "instance failed");
                self.notify(&state, WebhookEvent::Failed, notice, Some(reason.to_string()))
                    .await;
                Ok(Some(state))
            }
            Err(OrchestratorError::InvalidTransition(_) | OrchestratorError::NotFound(_)) => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Release the token without changing status.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub async fn abort_operation(
        &self,
        id: InstanceId,
        operation_id: OperationId,
        reason: &str,
    ) -> OrchestratorResult<()> {
        let result = self
            .update(id, |state, _| {
                ensure_holds(state, operation_id)?;
                state.release_operation();
                state.last_error = Some(reason.to_string());
                Ok(())
            })
            .await;
        match result {
            Ok(_) => {
                warn!(instance_id = %id, operation_id = %operation_id, reason, "operation aborted");
                Ok(())
            }
            Err(OrchestratorError::InvalidTransition(_) | OrchestratorError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Enqueue a MonitorInstance job for the operation, with its startup
    /// deadline counted from now.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` if `operation_id` no longer holds the token;
    /// queue errors.
    pub async fn schedule_monitor(
        &self,
        id: InstanceId,
        operation_id: OperationId,
    ) -> OrchestratorResult<()> {
        let state = self
            .get(id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("instance {id}")))?;
        ensure_holds(&state, operation_id)?;
        if self.queue.has_active(JobType::MonitorInstance, id) {
            return Ok(());
        }
        let budget = state
            .operation
            .as_ref()
            .and_then(|op| op.max_wait_secs)
            .map_or_else(|| self.config.startup_timeout(), Duration::from_secs);
        let deadline = Utc::now() + to_chrono(budget);
        self.queue
            .enqueue(
                JobPayload::MonitorInstance {
                    instance_id: id,
                    operation_id,
                    deadline,
                },
                Priority::Low,
            )
            .await?;
        Ok(())
    }

    /// Take the token for a migration and record the cooldown. Returns the
    /// operation already running if a previous attempt of the same
    /// migration still holds it, or `None` when the instance is no longer
    /// eligible.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub async fn begin_migration(&self, id: InstanceId) -> OrchestratorResult<Option<OperationId>> {
        if let Some(state) = self.get(id) {
            if let (Some(op), Some(active)) = (state.active_operation_id, &state.operation) {
                return Ok((active.kind == OperationKind::Migrate).then_some(op));
            }
        }
        let now = Utc::now();
        if !self.is_eligible_for_migration(id, now).await? {
            return Ok(None);
        }
        let result = self
            .update(id, |state, now| {
                if state.status != InstanceStatus::Exited {
                    return Err(OrchestratorError::InvalidTransition(format!(
                        "instance {id} is {}, not exited",
                        state.status
                    )));
                }
                state.acquire_operation(OperationKind::Migrate, now, None, None)
            })
            .await;
        let operation_id = match result {
            Ok((_, op)) => op,
            Err(
                OrchestratorError::InvalidTransition(_)
                | OrchestratorError::OperationInProgress { .. },
            ) => {
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        store::set_json(
            self.store.as_ref(),
            &cooldown_key(id),
            &now,
            Some(Duration::from_secs(self.migration.cooldown_ttl_secs)),
        )
        .await?;
        info!(instance_id = %id, operation_id = %operation_id, "migration started");
        Ok(Some(operation_id))
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Bring local records in line with a provider instance list fetched
    /// just now. See [`Self::reconcile_with_provider_at`].
    ///
    /// # Errors
    ///
    /// Stops at the first storage error; changes made before it persist.
    pub async fn reconcile_with_provider(
        &self,
        provider_instances: &[ProviderInstance],
    ) -> OrchestratorResult<ReconcileReport> {
        self.reconcile_with_provider_at(provider_instances, Utc::now())
            .await
    }

    /// Bring local records in line with the provider's instance list as it
    /// stood at `fetched_at`.
    ///
    /// Records with an operation in flight are skipped. A token with no job
    /// left to finish its operation is released once it is older than the
    /// orphan grace period. Records whose status changed after `fetched_at`
    /// are skipped, since the list cannot speak for them. Records missing
    /// upstream are deleted when `remove_obsolete` is set or the instance
    /// never started, and marked Terminated otherwise. Terminal records are
    /// deleted once their retention window has passed.
    ///
    /// Every change is re-checked against the record under the lock; a
    /// record that took a token or moved on since the pass began is
    /// skipped, not overwritten.
    ///
    /// # Errors
    ///
    /// Stops at the first storage error; changes made before it persist.
    pub async fn reconcile_with_provider_at(
        &self,
        provider_instances: &[ProviderInstance],
        fetched_at: DateTime<Utc>,
    ) -> OrchestratorResult<ReconcileReport> {
        let now = Utc::now();
        let upstream: HashMap<&str, ProviderStatus> = provider_instances
            .iter()
            .filter(|p| p.status != ProviderStatus::Removed)
            .map(|p| (p.id.as_str(), p.status))
            .collect();
        let retention = self.config.terminal_retention();
        let grace = to_chrono(self.config.orphan_grace());
        let mut report = ReconcileReport::default();

        for local in self.list() {
            report.examined += 1;
            let id = local.id;

            if let Some(operation_id) = local.active_operation_id {
                let accepted_at = local.operation.as_ref().map(|op| op.started_at);
                let orphaned = !self.queue.has_active_for_instance(id)
                    && accepted_at.is_none_or(|at| at + grace <= now);
                if orphaned {
                    self.abort_operation(id, operation_id, "no job left to finish the operation")
                        .await?;
                    report.released += 1;
                } else {
                    report.skipped += 1;
                }
                continue;
            }

            if local.status.is_terminal() {
                if local.retention_expired(retention, now)
                    && self.remove_unchanged(id, local.status, now).await?
                {
                    report.purged += 1;
                }
                continue;
            }

            if local.status_changed_at.is_some_and(|at| at > fetched_at) {
                report.skipped += 1;
                continue;
            }

            let remote = local
                .provider_instance_id
                .as_deref()
                .and_then(|pid| upstream.get(pid).copied());
            let handled = match remote {
                Some(remote) => match reconciled_status(local.status, remote) {
                    Some(next) => {
                        let applied = self
                            .apply_reconciled(id, local.status, next, fetched_at)
                            .await?;
                        report.updated += usize::from(applied);
                        applied
                    }
                    None => true,
                },
                None if self.config.remove_obsolete || local.timestamps.started.is_none() => {
                    let removed = self.remove_unchanged(id, local.status, fetched_at).await?;
                    report.removed += usize::from(removed);
                    removed
                }
                None => {
                    let applied = self
                        .apply_reconciled(id, local.status, InstanceStatus::Terminated, fetched_at)
                        .await?;
                    report.terminated += usize::from(applied);
                    applied
                }
            };
            if !handled {
                report.skipped += 1;
            }
        }

        if report.changed() {
            info!(?report, "reconciliation applied changes");
        } else {
            debug!(examined = report.examined, "reconciliation found nothing to change");
        }
        Ok(report)
    }

    /// Names of provider instances the orchestrator does not track.
    pub fn untracked<'a>(
        &self,
        provider_instances: &'a [ProviderInstance],
    ) -> Vec<&'a ProviderInstance> {
        let tracked: HashSet<String> = self
            .instances
            .lock()
            .values()
            .filter_map(|s| s.provider_instance_id.clone())
            .collect();
        provider_instances
            .iter()
            .filter(|p| !tracked.contains(&p.id))
            .collect()
    }

    /// Move a record to `next` if it is still as the pass saw it. Returns
    /// whether the change was applied.
    async fn apply_reconciled(
        &self,
        id: InstanceId,
        seen: InstanceStatus,
        next: InstanceStatus,
        fetched_at: DateTime<Utc>,
    ) -> OrchestratorResult<bool> {
        let result = self
            .update(id, |state, now| {
                ensure_unchanged(state, seen, fetched_at)?;
                let notice = self.notice(state, now);
                state.transition(next, now)?;
                Ok(notice)
            })
            .await;
        let (state, notice) = match result {
            Ok(applied) => applied,
            Err(
                OrchestratorError::InvalidTransition(reason) | OrchestratorError::NotFound(reason),
            ) => {
                debug!(
                    instance_id = %id,
                    status = %next,
                    reason = %reason,
                    "reconciled status not applied"
                );
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        info!(instance_id = %id, status = %next, "status reconciled from provider");
        let event = match next {
            InstanceStatus::Exited => Some(WebhookEvent::Exited),
            InstanceStatus::Failed => Some(WebhookEvent::Failed),
            InstanceStatus::Terminated => Some(WebhookEvent::Terminated),
            InstanceStatus::Stopped => Some(WebhookEvent::Stopped),
            _ => None,
        };
        if let Some(event) = event {
            self.notify(&state, event, notice, None).await;
        }
        Ok(true)
    }

    /// Delete a record if it is still as the pass saw it. Returns whether it
    /// was deleted.
    async fn remove_unchanged(
        &self,
        id: InstanceId,
        seen: InstanceStatus,
        cutoff: DateTime<Utc>,
    ) -> OrchestratorResult<bool> {
        let removed = {
            let mut instances = self.instances.lock();
            match instances.get(&id) {
                Some(state) if ensure_unchanged(state, seen, cutoff).is_ok() => {
                    instances.remove(&id)
                }
                _ => None,
            }
        };
        let Some(removed) = removed else {
            debug!(instance_id = %id, "record changed during reconciliation; kept");
            return Ok(false);
        };
        if let Err(e) = self.store.delete(&instance_key(id)).await {
            self.instances.lock().entry(id).or_insert(removed);
            return Err(e);
        }
        debug!(instance_id = %id, "instance record removed");
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Apply `change` to a copy of the record, swap it in, and persist.
    async fn update<R, F>(
        &self,
        id: InstanceId,
        change: F,
    ) -> OrchestratorResult<(InstanceState, R)>
    where
        F: FnOnce(&mut InstanceState, DateTime<Utc>) -> OrchestratorResult<R>,
    {
        let (previous, updated, out) = {
            let mut instances = self.instances.lock();
            let current = instances
                .get_mut(&id)
                .ok_or_else(|| OrchestratorError::NotFound(format!("instance {id}")))?;
            let mut next = current.clone();
            let out = change(&mut next, Utc::now())?;
            let previous = std::mem::replace(current, next.clone());
            (previous, next, out)
        };
        if let Err(e) = self.persist(&updated).await {
            let mut instances = self.instances.lock();
            if let Some(current) = instances.get_mut(&id) {
                if *current == updated {
                    *current = previous;
                }
            }
            return Err(e);
        }
        Ok((updated, out))
    }

    async fn persist(&self, state: &InstanceState) -> OrchestratorResult<()> {
        store::set_json(self.store.as_ref(), &instance_key(state.id), state, None).await
    }

    /// Enqueue the job for an accepted operation, releasing the token again
    /// if the job cannot be queued.
    async fn enqueue_operation(
        &self,
        state: &InstanceState,
        payload: JobPayload,
        priority: Priority,
    ) -> OrchestratorResult<()> {
        let operation_id = payload.operation_id();
        if let Err(e) = self.queue.enqueue(payload, priority).await {
            if let Some(op) = operation_id {
                let rollback = self
                    .update(state.id, |s, _| {
                        ensure_holds(s, op)?;
                        s.release_operation();
                        Ok(())
                    })
                    .await;
                if let Err(rollback) = rollback {
                    warn!(
                        instance_id = %state.id,
                        error = %rollback,
                        "failed to release token after enqueue failure"
                    );
                }
            }
            return Err(e);
        }
        Ok(())
    }

    fn notice(&self, state: &InstanceState, now: DateTime<Utc>) -> Notice {
        let url = state
            .operation
            .as_ref()
            .and_then(|op| op.webhook_url.clone())
            .or_else(|| state.config.webhook_url.clone())
            .or_else(|| self.default_webhook_url.clone());
        Notice {
            url,
            operation_id: state.active_operation_id,
            elapsed: state.operation_elapsed(now),
        }
    }

    /// Queue a webhook job. Failures are logged and never block state.
    async fn notify(
        &self,
        state: &InstanceState,
        event: WebhookEvent,
        notice: Notice,
        error: Option<String>,
    ) {
        let Some(url) = notice.url else {
            debug!(instance_id = %state.id, ?event, "no webhook receiver configured");
            return;
        };
        let detail = WebhookDetail {
            operation_id: notice.operation_id,
            provider_instance_id: state.provider_instance_id.clone(),
            elapsed_ms: notice
                .elapsed
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            error,
            message: None,
        };
        let notification = WebhookNotification::new(state.id, state.status, event, detail);
        let payload = JobPayload::SendWebhook {
            url,
            notification,
            critical: event.is_critical(),
        };
        if let Err(e) = self.queue.enqueue(payload, Priority::Normal).await {
            warn!(instance_id = %state.id, ?event, error = %e, "failed to queue webhook");
        }
    }
}

/// The record has no operation in flight, is still in `seen`, and has not
/// changed status after `cutoff`.
fn ensure_unchanged(
    state: &InstanceState,
    seen: InstanceStatus,
    cutoff: DateTime<Utc>,
) -> OrchestratorResult<()> {
    let moved = state.status != seen || state.status_changed_at.is_some_and(|at| at > cutoff);
    if state.active_operation_id.is_none() && !moved {
        Ok(())
    } else {
        Err(OrchestratorError::InvalidTransition(format!(
            "instance {} changed since it was listed",
            state.id
        )))
    }
}

fn ensure_holds(state: &InstanceState, operation_id: OperationId) -> OrchestratorResult<()> {
    if state.holds(operation_id) {
        Ok(())
    } else {
        Err(OrchestratorError::InvalidTransition(format!(
            "operation {operation_id} no longer holds instance {}",
            state.id
        )))
    }
}
