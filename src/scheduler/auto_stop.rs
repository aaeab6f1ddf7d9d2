//! Stops running instances nobody has used for a while.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::PeriodicTask;
use crate::config::AutoStopConfig;
use crate::core::{InstanceId, JobPayload, JobType, OrchestratorResult, Priority};
use crate::lifecycle::{InstanceLifecycle, InstanceState};

/// Enqueues an AutoStopCheck for every idle Running instance.
pub struct AutoStopScheduler {
    lifecycle: Arc<InstanceLifecycle>,
    config: AutoStopConfig,
}

impl AutoStopScheduler {
    /// Scheduler over `lifecycle`.
    pub fn new(lifecycle: Arc<InstanceLifecycle>, config: AutoStopConfig) -> Self {
        Self { lifecycle, config }
    }

    /// Instances idle longer than `threshold_minutes` at `now` with no
    /// operation in flight.
    pub fn select_idle(
        instances: &[InstanceState],
        threshold_minutes: u64,
        now: DateTime<Utc>,
    ) -> Vec<InstanceId> {
        instances
            .iter()
            .filter(|s| s.active_operation_id.is_none() && s.is_idle(threshold_minutes, now))
            .map(|s| s.id)
            .collect()
    }

    /// Evaluate every instance at `now` and enqueue checks. Returns how many
    /// were enqueued.
    ///
    /// # Errors
    ///
    /// Queue persistence failures.
    pub async fn run_at(&self, now: DateTime<Utc>) -> OrchestratorResult<usize> {
        let threshold = self.config.idle_threshold_minutes;
        let queue = self.lifecycle.queue();
        let mut enqueued = 0;
        for instance_id in Self::select_idle(&self.lifecycle.list(), threshold, now) {
            if queue.has_active(JobType::AutoStopCheck, instance_id) {
                debug!(%instance_id, "auto-stop check already pending");
                continue;
            }
            queue
                .enqueue(
                    JobPayload::AutoStopCheck {
                        instance_id,
                        threshold_minutes: threshold,
                    },
                    Priority::Low,
                )
                .await?;
            enqueued += 1;
        }
        Ok(enqueued)
    }
}

#[async_trait]
impl PeriodicTask for AutoStopScheduler {
    fn name(&self) -> &'static str {
        "auto_stop"
    }

    async fn run_once(&self) -> OrchestratorResult<usize> {
        self.run_at(Utc::now()).await
    }
}
