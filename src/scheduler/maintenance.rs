//! Reconciliation with the provider and finished-job purging.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use super::PeriodicTask;
use crate::core::OrchestratorResult;
use crate::infra::provider::ProviderApi;
use crate::lifecycle::{InstanceLifecycle, ReconcileReport};
use crate::resilience::ResilienceGate;

/// Result of one maintenance tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Reconciliation outcome.
    pub reconcile: ReconcileReport,
    /// Provider instances nobody tracks.
    pub untracked: usize,
    /// Finished jobs removed.
    pub purged_jobs: usize,
}

/// Lists provider instances, reconciles records, and purges old jobs.
pub struct MaintenanceScheduler {
    lifecycle: Arc<InstanceLifecycle>,
    provider: Arc<dyn ProviderApi>,
    gate: Arc<ResilienceGate>,
    job_retention: Duration,
}

impl MaintenanceScheduler {
    /// Scheduler purging finished jobs older than `job_retention`.
    pub fn new(
        lifecycle: Arc<InstanceLifecycle>,
        provider: Arc<dyn ProviderApi>,
        gate: Arc<ResilienceGate>,
        job_retention: Duration,
    ) -> Self {
        Self {
            lifecycle,
            provider,
            gate,
            job_retention,
        }
    }

    /// One full maintenance pass.
    ///
    /// # Errors
    ///
    /// Provider listing failures (including an open circuit) abort the pass
    /// before anything changes; storage errors abort it midway.
    pub async fn run_pass(&self) -> OrchestratorResult<MaintenanceReport> {
        let provider = &self.provider;
        // taken before the call so changes made while it is in flight count as newer
        let fetched_at = Utc::now();
        let remote = self.gate.execute(|| provider.list_instances()).await?;
        let untracked = self.lifecycle.untracked(&remote).len();
        let reconcile = self
            .lifecycle
            .reconcile_with_provider_at(&remote, fetched_at)
            .await?;
        let purged_jobs = self
            .lifecycle
            .queue()
            .purge_finished(self.job_retention)
            .await?;
        if untracked > 0 {
            info!(untracked, "provider reports instances this orchestrator does not track");
        }
        Ok(MaintenanceReport {
            reconcile,
            untracked,
            purged_jobs,
        })
    }
}

#[async_trait]
impl PeriodicTask for MaintenanceScheduler {
    fn name(&self) -> &'static str {
        "maintenance"
    }

    async fn run_once(&self) -> OrchestratorResult<usize> {
        let report = self.run_pass().await?;
        let r = &report.reconcile;
        Ok(r.updated + r.terminated + r.removed + r.purged + r.released + report.purged_jobs)
    }
}
