//! Periodic producers that inspect instance records and enqueue follow-up
//! jobs.
//!
//! Each scheduler is a [`PeriodicTask`] driven by its own ticker and
//! cancellation token. A tick runs to completion (or its timeout) before the
//! next one can fire; ticks missed meanwhile are skipped, not queued.

pub mod auto_stop;
pub mod maintenance;
pub mod migration;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::OrchestratorResult;

pub use auto_stop::AutoStopScheduler;
pub use maintenance::{MaintenanceReport, MaintenanceScheduler};
pub use migration::MigrationScheduler;

/// One scheduler's unit of periodic work.
#[async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Run one tick. Returns how many jobs or records it acted on.
    async fn run_once(&self) -> OrchestratorResult<usize>;
}

/// Spawn `task` on a fixed `period`, stopping when `cancel` fires.
///
/// The first tick fires one full period after spawning.
pub fn spawn_periodic(
    task: Arc<dyn PeriodicTask>,
    period: Duration,
    run_timeout: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // interval fires immediately; consume that tick
        ticker.tick().await;

        info!(
            scheduler = task.name(),
            interval_secs = period.as_secs(),
            "scheduler started"
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!(scheduler = task.name(), "scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    run_tick(task.as_ref(), run_timeout).await;
                }
            }
        }
    })
}

async fn run_tick(task: &dyn PeriodicTask, run_timeout: Duration) {
    match tokio::time::timeout(run_timeout, task.run_once()).await {
        Ok(Ok(0)) => debug!(scheduler = task.name(), "tick found nothing to do"),
        Ok(Ok(n)) => info!(scheduler = task.name(), acted_on = n, "tick completed"),
        Ok(Err(e)) => warn!(scheduler = task.name(), error = %e, "tick failed"),
        Err(_) => warn!(
            scheduler = task.name(),
            timeout_secs = run_timeout.as_secs(),
            "tick timed out"
        ),
    }
}

/// Running schedulers, stopped together.
pub struct SchedulerSet {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    run_timeout: Duration,
}

impl SchedulerSet {
    /// Empty set; every tick gets `run_timeout`.
    pub fn new(run_timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            handles: Vec::new(),
            run_timeout,
        }
    }

    /// Start `task` on `period`.
    pub fn spawn(&mut self, task: Arc<dyn PeriodicTask>, period: Duration) {
        let handle = spawn_periodic(task, period, self.run_timeout, self.cancel.child_token());
        self.handles.push(handle);
    }

    /// Number of running schedulers.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether no scheduler was started.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Cancel every scheduler and wait for their loops to exit. A tick in
    /// progress is dropped at its next await point.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "scheduler task ended abnormally");
            }
        }
    }
}
