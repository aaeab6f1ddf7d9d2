//! Moves reclaimed spot instances onto fresh capacity.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::PeriodicTask;
use crate::core::{JobPayload, JobType, OrchestratorResult, Priority};
use crate::lifecycle::{InstanceLifecycle, InstanceStatus};

/// Enqueues a MigrationCheck for every Exited instance past its cooldown.
pub struct MigrationScheduler {
    lifecycle: Arc<InstanceLifecycle>,
}

impl MigrationScheduler {
    /// Scheduler over `lifecycle`; cooldowns come from its migration policy.
    pub fn new(lifecycle: Arc<InstanceLifecycle>) -> Self {
        Self { lifecycle }
    }

    /// Evaluate every instance at `now` and enqueue checks.
    ///
    /// # Errors
    ///
    /// Store reads of cooldown records and queue persistence failures.
    pub async fn run_at(&self, now: DateTime<Utc>) -> OrchestratorResult<usize> {
        let queue = self.lifecycle.queue();
        let mut enqueued = 0;
        let exited = self
            .lifecycle
            .list()
            .into_iter()
            .filter(|s| s.status == InstanceStatus::Exited && s.active_operation_id.is_none());
        for state in exited {
            let instance_id = state.id;
            if !self.lifecycle.is_eligible_for_migration(instance_id, now).await? {
                debug!(%instance_id, "migration cooling down");
                continue;
            }
            if queue.has_active(JobType::MigrationCheck, instance_id) {
                continue;
            }
            queue
                .enqueue(JobPayload::MigrationCheck { instance_id }, Priority::Low)
                .await?;
            enqueued += 1;
        }
        Ok(enqueued)
    }
}

#[async_trait]
impl PeriodicTask for MigrationScheduler {
    fn name(&self) -> &'static str {
        "migration"
    }

    async fn run_once(&self) -> OrchestratorResult<usize> {
        self.run_at(Utc::now()).await
    }
}
