//! Bounded-concurrency worker pool driving the job queue.
//!
//! A single dispatch loop wakes on its poll interval (or earlier, when a job
//! is enqueued or a slot frees up), claims ready jobs while fewer than
//! `max_concurrent_jobs` handlers are running, and launches each handler as
//! its own tokio task.
//!
//! # Key Features
//!
//! - **Hard ceiling**: never more than `max_concurrent_jobs` handlers in flight
//! - **Timeout backstop**: a handler that overruns its per-type budget is
//!   aborted and the job is marked retryable-failed
//! - **Outcomes as data**: handlers return [`HandlerOutcome`]; the pool maps
//!   it onto the queue's transitions
//! - **Clean shutdown**: in-flight jobs drain up to a deadline, anything still
//!   running after that is aborted and returned to Pending

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::{OrchestratorError, OrchestratorResult};
use super::executor::{FnHandler, JobHandler};
use super::job::{HandlerOutcome, Job, JobContext, JobId, JobPayload, JobStatus, JobType};
use super::job_queue::JobQueue;
use crate::config::WorkerPoolConfig;

/// Statistics about pool utilization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Concurrency ceiling.
    pub max_concurrent_jobs: usize,
    /// Handlers currently running.
    pub running: usize,
    /// Jobs claimed since start.
    pub dispatched: u64,
    /// Jobs that completed.
    pub completed: u64,
    /// Jobs that ended Failed.
    pub failed: u64,
    /// Failed attempts that were re-queued.
    pub retried: u64,
    /// Jobs deferred without consuming an attempt.
    pub deferred: u64,
    /// Handlers aborted by the timeout backstop.
    pub timed_out: u64,
}

/// Result of [`WorkerPool::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every in-flight handler finished before the deadline.
    pub drained: bool,
    /// Jobs returned to Pending because they were still running at the deadline.
    pub reset_jobs: usize,
}

#[derive(Debug, Default)]
struct PoolCounters {
    dispatched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    deferred: AtomicU64,
    timed_out: AtomicU64,
}

struct PoolInner {
    config: WorkerPoolConfig,
    queue: Arc<JobQueue>,
    handlers: RwLock<HashMap<JobType, Arc<dyn JobHandler>>>,
    /// Claimed jobs and the abort handle of their handler task, once spawned.
    in_flight: Mutex<HashMap<JobId, Option<AbortHandle>>>,
    running: watch::Sender<usize>,
    slot_freed: Notify,
    accepting: AtomicBool,
    forced: AtomicBool,
    counters: PoolCounters,
}

/// Bounded worker pool.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    cancel: CancellationToken,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a stopped pool over `queue`.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidConfig`] if the configuration is invalid.
    pub fn new(config: WorkerPoolConfig, queue: Arc<JobQueue>) -> OrchestratorResult<Self> {
        config.validate().map_err(OrchestratorError::InvalidConfig)?;
        let (running, _) = watch::channel(0);
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                queue,
                handlers: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                running,
                slot_freed: Notify::new(),
                accepting: AtomicBool::new(true),
                forced: AtomicBool::new(false),
                counters: PoolCounters::default(),
            }),
            cancel: CancellationToken::new(),
            loop_handle: Mutex::new(None),
        })
    }

    /// Register (or replace) the handler for `job_type`.
    pub fn register_handler(&self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        self.inner.handlers.write().insert(job_type, handler);
        debug!(%job_type, "job handler registered");
    }

    /// Register an async closure as the handler for `job_type`.
    pub fn register_fn<F, Fut>(&self, job_type: JobType, f: F)
    where
        F: Fn(JobPayload, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerOutcome> + Send + 'static,
    {
        self.register_handler(job_type, Arc::new(FnHandler::new(f)));
    }

    /// Fail unless every [`JobType`] has a handler.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::MissingHandler`] naming the first unregistered type.
    pub fn validate_handlers(&self) -> OrchestratorResult<()> {
        let handlers = self.inner.handlers.read();
        match JobType::ALL.iter().find(|t| !handlers.contains_key(t)) {
            Some(missing) => Err(OrchestratorError::MissingHandler(*missing)),
            None => Ok(()),
        }
    }

    /// Start the dispatch loop.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::MissingHandler`] if a job type has no handler;
    /// [`OrchestratorError::Shutdown`] if the pool was already shut down.
    pub fn start(&self) -> OrchestratorResult<()> {
        self.validate_handlers()?;
        if !self.inner.accepting.load(Ordering::Acquire) {
            return Err(OrchestratorError::Shutdown);
        }
        let mut handle = self.loop_handle.lock();
        if handle.is_some() {
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        let cancel = self.cancel.clone();
        *handle = Some(tokio::spawn(run_loop(inner, cancel)));
        info!(
            max_concurrent_jobs = self.inner.config.max_concurrent_jobs,
            poll_interval_ms = self.inner.config.poll_interval_ms,
            "worker pool started"
        );
        Ok(())
    }

    /// Claim and launch ready jobs until the queue is empty or the pool is
    /// full. Returns how many were launched. The dispatch loop calls this on
    /// every wake; it is public so callers can drive the pool by hand, and
    /// concurrent callers share the same concurrency ceiling.
    pub async fn dispatch_ready(&self) -> usize {
        self.inner.dispatch_ready().await
    }

    /// Wait until no handler is running, up to `timeout`. Returns whether the
    /// pool went idle in time.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.inner.running.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0)).await;
        waited.is_ok()
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let c = &self.inner.counters;
        PoolStats {
            max_concurrent_jobs: self.inner.config.max_concurrent_jobs,
            running: *self.inner.running.borrow(),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            deferred: c.deferred.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
        }
    }

    /// Stop dispatching, wait up to `timeout` for running handlers, then abort
    /// stragglers and return their jobs to Pending.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        if !self.inner.accepting.swap(false, Ordering::AcqRel) {
            return ShutdownReport {
                drained: *self.inner.running.borrow() == 0,
                reset_jobs: 0,
            };
        }
        info!(
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "shutting down worker pool"
        );
        self.cancel.cancel();
        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "dispatch loop ended abnormally");
            }
        }

        if self.wait_idle(timeout).await {
            info!("worker pool drained");
            return ShutdownReport {
                drained: true,
                reset_jobs: 0,
            };
        }

        self.inner.forced.store(true, Ordering::Release);
        let stragglers: Vec<(JobId, Option<AbortHandle>)> =
            self.inner.in_flight.lock().drain().collect();
        let mut reset_jobs = 0;
        for (job_id, abort) in stragglers {
            if let Some(abort) = abort {
                abort.abort();
            }
            match self.inner.queue.reset_to_pending(job_id).await {
                Ok(_) => {
                    reset_jobs += 1;
                    warn!(job_id = %job_id, "job still running at shutdown, returned to pending");
                }
                Err(OrchestratorError::InvalidTransition(_)) => {}
                Err(e) => error!(job_id = %job_id, error = %e, "failed to reset job at shutdown"),
            }
        }
        ShutdownReport {
            drained: false,
            reset_jobs,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_loop(inner: Arc<PoolInner>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.config.poll_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            () = inner.queue.notified() => {}
            () = inner.slot_freed.notified() => {}
        }
        inner.dispatch_ready().await;
    }
    debug!("dispatch loop exited");
}

impl PoolInner {
    /// Take a slot if the pool is below its ceiling. The check and the
    /// increment happen under the channel's lock.
    fn reserve_slot(&self) -> bool {
        let max = self.config.max_concurrent_jobs;
        self.running.send_if_modified(|n| {
            if *n < max {
                *n += 1;
                true
            } else {
                false
            }
        })
    }

    /// Give back a slot that was reserved but never used.
    fn unreserve_slot(&self) {
        self.running.send_modify(|n| *n = n.saturating_sub(1));
    }

    fn handler(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.read().get(&job_type).cloned()
    }

    async fn dispatch_ready(self: &Arc<Self>) -> usize {
        let mut launched = 0;
        while self.accepting.load(Ordering::Acquire) && self.reserve_slot() {
            match self.queue.dequeue_next().await {
                Ok(Some(job)) => {
                    self.launch(job);
                    launched += 1;
                }
                Ok(None) => {
                    self.unreserve_slot();
                    break;
                }
                Err(e) => {
                    self.unreserve_slot();
                    warn!(error = %e, "dequeue failed");
                    break;
                }
            }
        }
        launched
    }

    /// Run `job` in the slot reserved for it.
    fn launch(self: &Arc<Self>, job: Job) {
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        self.in_flight.lock().insert(job.id, None);
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let job_id = job.id;
            inner.run_job(job).await;
            inner.in_flight.lock().remove(&job_id);
            inner.running.send_modify(|n| *n = n.saturating_sub(1));
            inner.slot_freed.notify_one();
        });
    }

    async fn run_job(&self, job: Job) {
        let ctx = job.context();
        let Some(handler) = self.handler(job.job_type) else {
            let outcome = HandlerOutcome::permanent(format!("no handler for {}", job.job_type));
            self.apply_outcome(&job, None, outcome).await;
            return;
        };

        let timeout = self.config.timeout_for(job.job_type);
        let task_handler = Arc::clone(&handler);
        let payload = job.payload.clone();
        let mut task = tokio::spawn(async move { task_handler.execute(payload, ctx).await });
        if let Some(slot) = self.in_flight.lock().get_mut(&job.id) {
            *slot = Some(task.abort_handle());
        }
        if self.forced.load(Ordering::Acquire) {
            task.abort();
        }

        debug!(job_id = %job.id, job_type = %job.job_type, attempt = ctx.attempt, "executing job");
        let outcome = match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join)) if join.is_cancelled() => {
                debug!(job_id = %job.id, "handler aborted during shutdown");
                return;
            }
            Ok(Err(join)) => {
                error!(job_id = %job.id, error = %join, "handler panicked");
                HandlerOutcome::retry(format!("handler panicked: {join}"))
            }
            Err(_) => {
                task.abort();
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!(job_id = %job.id, job_type = %job.job_type, ?timeout, "handler timed out");
                HandlerOutcome::retry(format!("handler exceeded {}s timeout", timeout.as_secs()))
            }
        };
        self.apply_outcome(&job, Some(handler), outcome).await;
    }

    async fn apply_outcome(
        &self,
        job: &Job,
        handler: Option<Arc<dyn JobHandler>>,
        outcome: HandlerOutcome,
    ) {
        let id = job.id;
        let result = match outcome {
            HandlerOutcome::Success => self.queue.mark_completed(id).await,
            HandlerOutcome::RetryableFailure {
                reason,
                retry_after: Some(delay),
            } => self.queue.mark_retry_after(id, &reason, delay).await,
            HandlerOutcome::RetryableFailure {
                reason,
                retry_after: None,
            } => self.queue.mark_failed(id, &reason, true).await,
            HandlerOutcome::PermanentFailure { reason } => {
                self.queue.mark_failed(id, &reason, false).await
            }
            HandlerOutcome::Deferred { reason, delay } => {
                self.queue.defer(id, delay, &reason).await
            }
        };

        let updated = match result {
            Ok(updated) => updated,
            Err(e) => {
                error!(job_id = %id, error = %e, "failed to record job outcome");
                return;
            }
        };
        match updated.status {
            JobStatus::Completed => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            JobStatus::Failed => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                if let Some(handler) = handler {
                    handler.on_failed(&updated).await;
                }
            }
            JobStatus::Pending if updated.attempts > job.attempts => {
                self.counters.retried.fetch_add(1, Ordering::Relaxed);
            }
            JobStatus::Pending => {
                self.counters.deferred.fetch_add(1, Ordering::Relaxed);
            }
            JobStatus::Processing => {}
        }
    }
}
