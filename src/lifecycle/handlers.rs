//! Job handlers that drive instances through the provider.
//!
//! Every handler first checks that the job's operation still holds the
//! instance's token; a job whose operation was superseded finishes as a
//! no-op. Provider calls go through the [`ResilienceGate`] and their errors
//! become outcomes via [`HandlerOutcome::from_error`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use super::manager::InstanceLifecycle;
use super::state::{InstanceState, InstanceStatus, OperationKind};
use crate::core::{
    HandlerOutcome, InstanceId, Job, JobContext, JobHandler, JobPayload, JobType, OperationId,
    OrchestratorError, OrchestratorResult, WorkerPool,
};
use crate::infra::provider::{ProviderApi, ProviderStatus};
use crate::resilience::ResilienceGate;
use crate::webhook::{WebhookDispatcher, WebhookNotification};

/// Collaborators shared by every lifecycle handler.
#[derive(Clone)]
pub struct HandlerContext {
    /// Owner of instance records.
    pub lifecycle: Arc<InstanceLifecycle>,
    /// Upstream provider.
    pub provider: Arc<dyn ProviderApi>,
    /// Guard in front of `provider`.
    pub gate: Arc<ResilienceGate>,
    /// Notification delivery.
    pub dispatcher: Arc<WebhookDispatcher>,
}

/// Register a handler for every job type on `pool`.
pub fn register_lifecycle_handlers(pool: &WorkerPool, ctx: HandlerContext) {
    let handler = Arc::new(LifecycleHandler { ctx });
    for job_type in JobType::ALL {
        pool.register_handler(job_type, Arc::clone(&handler) as Arc<dyn JobHandler>);
    }
}

/// Lifecycle job execution, dispatched on the payload.
pub struct LifecycleHandler {
    ctx: HandlerContext,
}

/// Short-circuit a handler with an outcome.
macro_rules! outcome {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(err) => return HandlerOutcome::from_error(&err),
        }
    };
}

impl LifecycleHandler {
    /// Build a handler over `ctx`.
    pub const fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }

    /// Current record if `operation_id` still holds its token.
    fn holding(&self, instance_id: InstanceId, operation_id: OperationId) -> Option<InstanceState> {
        let state = self.ctx.lifecycle.get(instance_id)?;
        if state.holds(operation_id) {
            Some(state)
        } else {
            debug!(%instance_id, %operation_id, "operation superseded, skipping job");
            None
        }
    }

    fn provider_id(state: &InstanceState) -> OrchestratorResult<String> {
        state.provider_instance_id.clone().ok_or_else(|| {
            OrchestratorError::InvalidTransition(format!(
                "instance {} has no provider id",
                state.id
            ))
        })
    }

    async fn create(&self, instance_id: InstanceId, operation_id: OperationId) -> HandlerOutcome {
        let Some(mut state) = self.holding(instance_id, operation_id) else {
            return HandlerOutcome::Success;
        };
        if state.provider_instance_id.is_none() {
            let request = state.config.to_create_request();
            let provider = &self.ctx.provider;
            let provider_id = outcome!(
                self.ctx
                    .gate
                    .execute(|| provider.create_instance(&request))
                    .await
            );
            state = outcome!(
                self.ctx
                    .lifecycle
                    .mark_created(instance_id, operation_id, provider_id)
                    .await
            );
        }
        if state.status != InstanceStatus::Starting {
            outcome!(self.ctx.lifecycle.mark_starting(instance_id, operation_id).await);
        }
        outcome!(self.ctx.lifecycle.schedule_monitor(instance_id, operation_id).await);
        HandlerOutcome::Success
    }

    async fn start(&self, instance_id: InstanceId, operation_id: OperationId) -> HandlerOutcome {
        let Some(state) = self.holding(instance_id, operation_id) else {
            return HandlerOutcome::Success;
        };
        if state.status != InstanceStatus::Starting {
            let provider_id = outcome!(Self::provider_id(&state));
            let provider = &self.ctx.provider;
            outcome!(
                self.ctx
                    .gate
                    .execute(|| provider.start_instance(&provider_id))
                    .await
            );
            outcome!(self.ctx.lifecycle.mark_starting(instance_id, operation_id).await);
        }
        outcome!(self.ctx.lifecycle.schedule_monitor(instance_id, operation_id).await);
        HandlerOutcome::Success
    }

    async fn stop(&self, instance_id: InstanceId, operation_id: OperationId) -> HandlerOutcome {
        let Some(state) = self.holding(instance_id, operation_id) else {
            return HandlerOutcome::Success;
        };
        let provider_id = outcome!(Self::provider_id(&state));
        let provider = &self.ctx.provider;
        outcome!(
            self.ctx
                .gate
                .execute(|| provider.stop_instance(&provider_id))
                .await
        );
        outcome!(self.ctx.lifecycle.mark_stopped(instance_id, operation_id).await);
        HandlerOutcome::Success
    }

    async fn delete(&self, instance_id: InstanceId, operation_id: OperationId) -> HandlerOutcome {
        let Some(state) = self.holding(instance_id, operation_id) else {
            return HandlerOutcome::Success;
        };
        if let Some(provider_id) = state.provider_instance_id.as_deref() {
            let provider = &self.ctx.provider;
            match self
                .ctx
                .gate
                .execute(|| provider.delete_instance(provider_id))
                .await
            {
                Ok(()) => {}
                Err(OrchestratorError::PermanentUpstream {
                    status: Some(404), ..
                }) => debug!(%instance_id, provider_id, "already gone upstream"),
                Err(e) => return HandlerOutcome::from_error(&e),
            }
        }
        outcome!(self.ctx.lifecycle.mark_terminated(instance_id, operation_id).await);
        HandlerOutcome::Success
    }

    async fn monitor(
        &self,
        instance_id: InstanceId,
        operation_id: OperationId,
        deadline: chrono::DateTime<Utc>,
    ) -> HandlerOutcome {
        let Some(state) = self.holding(instance_id, operation_id) else {
            return HandlerOutcome::Success;
        };
        if Utc::now() >= deadline {
            return HandlerOutcome::permanent(format!(
                "startup timed out after {}s",
                state
                    .operation_elapsed(Utc::now())
                    .map_or(0, |d| d.as_secs())
            ));
        }
        let provider_id = outcome!(Self::provider_id(&state));
        let provider = &self.ctx.provider;
        let remote = outcome!(
            self.ctx
                .gate
                .execute(|| provider.get_instance(&provider_id))
                .await
        );
        let poll = self.ctx.lifecycle.config().monitor_poll_interval();
        match remote.status {
            ProviderStatus::Running => {
                outcome!(self.ctx.lifecycle.mark_running(instance_id, operation_id).await);
                HandlerOutcome::Success
            }
            ProviderStatus::Failed | ProviderStatus::Removed | ProviderStatus::Exited => {
                HandlerOutcome::permanent(format!(
                    "instance {provider_id} reported {:?} during startup",
                    remote.status
                ))
            }
            status => HandlerOutcome::Deferred {
                reason: format!("instance {provider_id} is {status:?}"),
                delay: poll,
            },
        }
    }

    async fn send_webhook(
        &self,
        url: &str,
        notification: &WebhookNotification,
        critical: bool,
    ) -> HandlerOutcome {
        let config = self.ctx.dispatcher.config();
        match self
            .ctx
            .dispatcher
            .send_notification(
                url,
                notification,
                config.secret.as_deref(),
                config.max_retries(critical),
            )
            .await
        {
            Ok(_) => HandlerOutcome::Success,
            Err(e) => HandlerOutcome::permanent(e.to_string()),
        }
    }

    async fn auto_stop_check(
        &self,
        instance_id: InstanceId,
        threshold_minutes: u64,
    ) -> HandlerOutcome {
        match self
            .ctx
            .lifecycle
            .is_eligible_for_auto_stop(instance_id, threshold_minutes)
        {
            Ok(true) => {}
            Ok(false) | Err(_) => return HandlerOutcome::Success,
        }
        match self.ctx.lifecycle.stop_instance(&instance_id.to_string()).await {
            Ok(operation_id) => {
                info!(%instance_id, %operation_id, threshold_minutes, "idle instance auto-stopped");
                HandlerOutcome::Success
            }
            Err(
                OrchestratorError::OperationInProgress { .. }
                | OrchestratorError::NotFound(_)
                | OrchestratorError::Validation(_),
            ) => HandlerOutcome::Success,
            Err(e) => HandlerOutcome::from_error(&e),
        }
    }

    async fn migration_check(&self, instance_id: InstanceId) -> HandlerOutcome {
        let begun = outcome!(self.ctx.lifecycle.begin_migration(instance_id).await);
        let Some(operation_id) = begun else {
            return HandlerOutcome::Success;
        };
        let Some(state) = self.holding(instance_id, operation_id) else {
            return HandlerOutcome::Success;
        };
        if state.status == InstanceStatus::Exited {
            let provider_id = outcome!(Self::provider_id(&state));
            let provider = &self.ctx.provider;
            outcome!(
                self.ctx
                    .gate
                    .execute(|| provider.migrate_instance(&provider_id))
                    .await
            );
            info!(%instance_id, provider_id, "migration accepted by provider");
            outcome!(self.ctx.lifecycle.mark_starting(instance_id, operation_id).await);
        }
        outcome!(self.ctx.lifecycle.schedule_monitor(instance_id, operation_id).await);
        HandlerOutcome::Success
    }
}

#[async_trait]
impl JobHandler for LifecycleHandler {
    async fn execute(&self, payload: JobPayload, ctx: JobContext) -> HandlerOutcome {
        debug!(
            job_id = %ctx.job_id,
            job_type = %ctx.job_type,
            attempt = ctx.attempt,
            "handling job"
        );
        match payload {
            JobPayload::CreateInstance {
                instance_id,
                operation_id,
            } => self.create(instance_id, operation_id).await,
            JobPayload::StartInstance {
                instance_id,
                operation_id,
            } => self.start(instance_id, operation_id).await,
            JobPayload::StopInstance {
                instance_id,
                operation_id,
            } => self.stop(instance_id, operation_id).await,
            JobPayload::DeleteInstance {
                instance_id,
                operation_id,
            } => self.delete(instance_id, operation_id).await,
            JobPayload::MonitorInstance {
                instance_id,
                operation_id,
                deadline,
            } => self.monitor(instance_id, operation_id, deadline).await,
            JobPayload::SendWebhook {
                url,
                notification,
                critical,
            } => self.send_webhook(&url, &notification, critical).await,
            JobPayload::AutoStopCheck {
                instance_id,
                threshold_minutes,
            } => self.auto_stop_check(instance_id, threshold_minutes).await,
            JobPayload::MigrationCheck { instance_id } => self.migration_check(instance_id).await,
        }
    }

    async fn on_failed(&self, job: &Job) {
        let reason = job.last_error.as_deref().unwrap_or("job failed");
        let lifecycle = &self.ctx.lifecycle;
        let result = match &job.payload {
            JobPayload::MigrationCheck { instance_id } => {
                let migrating = lifecycle.get(*instance_id).and_then(|s| {
                    s.operation
                        .as_ref()
                        .filter(|op| op.kind == OperationKind::Migrate)
                        .and(s.active_operation_id)
                });
                match migrating {
                    Some(op) => lifecycle.abort_operation(*instance_id, op, reason).await,
                    None => Ok(()),
                }
            }
            payload => match (payload.instance_id(), payload.operation_id()) {
                (Some(instance_id), Some(op)) => lifecycle
                    .fail_operation(instance_id, op, reason)
                    .await
                    .map(|_| ()),
                _ => Ok(()),
            },
        };
        if let Err(e) = result {
            warn!(job_id = %job.id, error = %e, "failed to record job failure on instance");
        }
    }
}
