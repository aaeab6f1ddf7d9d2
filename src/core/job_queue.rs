//! Durable priority job queue with retry/backoff bookkeeping.
//!
//! Jobs live in an in-memory index guarded by a `parking_lot::Mutex` and are
//! written through to the [`KvStore`] on every transition before the call
//! returns. Selection and the Pending→Processing flip happen under one lock,
//! so a job can never be claimed twice.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::error::{OrchestratorError, OrchestratorResult};
use super::job::{InstanceId, Job, JobId, JobPayload, JobStatus, JobType, Priority};
use crate::config::QueueConfig;
use crate::infra::store::{self, KvStore, JOB_PREFIX};
use crate::util::backoff::exponential_backoff;
use crate::util::clock::{elapsed_between, to_chrono};

/// Selection criteria for [`JobQueue::list`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    /// Only jobs in this status.
    pub status: Option<JobStatus>,
    /// Only jobs of this type.
    pub job_type: Option<JobType>,
    /// Only jobs targeting this instance.
    pub instance_id: Option<InstanceId>,
    /// Maximum number of results (oldest first).
    pub limit: Option<usize>,
}

impl JobFilter {
    fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|s| job.status == s)
            && self.job_type.is_none_or(|t| job.job_type == t)
            && self
                .instance_id
                .is_none_or(|id| job.payload.instance_id() == Some(id))
    }
}

/// Queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs waiting to run.
    pub pending: usize,
    /// Jobs claimed by the pool.
    pub processing: usize,
    /// Jobs finished successfully.
    pub completed: usize,
    /// Jobs finished unsuccessfully.
    pub failed: usize,
    /// Job count per type, all statuses.
    pub by_type: BTreeMap<JobType, usize>,
}

/// Ordering key: highest priority first, then oldest, then lowest sequence.
fn dequeue_key(job: &Job) -> (Priority, Reverse<DateTime<Utc>>, Reverse<u64>) {
    (job.priority, Reverse(job.created_at), Reverse(job.sequence))
}

fn job_key(id: JobId) -> String {
    format!("{JOB_PREFIX}{id}")
}

/// Priority job queue owned by one process.
pub struct JobQueue {
    config: QueueConfig,
    store: Arc<dyn KvStore>,
    jobs: Mutex<HashMap<JobId, Job>>,
    sequence: AtomicU64,
    notify: Notify,
}

impl JobQueue {
    /// Create an empty queue writing through to `store`.
    pub fn new(config: QueueConfig, store: Arc<dyn KvStore>) -> Self {
        Self {
            config,
            store,
            jobs: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    /// Retry policy in effect.
    pub const fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Load persisted jobs. Jobs left in Processing by a previous process are
    /// returned to Pending so they run again. Returns how many were reset.
    ///
    /// # Errors
    ///
    /// Fails if the store cannot be read or written.
    pub async fn recover(&self) -> OrchestratorResult<usize> {
        let persisted: Vec<Job> = store::list_json(self.store.as_ref(), JOB_PREFIX).await?;
        let mut reset = Vec::new();
        let mut max_sequence = 0;
        {
            let mut jobs = self.jobs.lock();
            for mut job in persisted {
                max_sequence = max_sequence.max(job.sequence);
                if job.status == JobStatus::Processing {
                    job.status = JobStatus::Pending;
                    job.next_retry_at = None;
                    reset.push(job.clone());
                }
                jobs.insert(job.id, job);
            }
        }
        self.sequence.fetch_max(max_sequence + 1, Ordering::SeqCst);
        for job in &reset {
            self.persist(job).await?;
        }
        info!(
            total = self.jobs.lock().len(),
            reset = reset.len(),
            "job queue recovered from store"
        );
        if !reset.is_empty() {
            self.notify.notify_one();
        }
        Ok(reset.len())
    }

    /// Enqueue with the configured attempt ceiling.
    ///
    /// # Errors
    ///
    /// Fails if the job cannot be persisted; nothing is queued in that case.
    pub async fn enqueue(
        &self,
        payload: JobPayload,
        priority: Priority,
    ) -> OrchestratorResult<JobId> {
        self.enqueue_with(payload, priority, self.config.max_attempts)
            .await
    }

    /// Enqueue with an explicit attempt ceiling.
    ///
    /// # Errors
    ///
    /// Fails if the job cannot be persisted; nothing is queued in that case.
    pub async fn enqueue_with(
        &self,
        payload: JobPayload,
        priority: Priority,
        max_attempts: u32,
    ) -> OrchestratorResult<JobId> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let job = Job::new(payload, priority, max_attempts, sequence);
        let id = job.id;
        self.persist(&job).await?;
        debug!(job_id = %id, job_type = %job.job_type, ?priority, "job enqueued");
        self.jobs.lock().insert(id, job);
        self.notify.notify_one();
        Ok(id)
    }

    /// Snapshot of one job.
    pub fn get(&self, id: JobId) -> Option<Job> {
        self.jobs.lock().get(&id).cloned()
    }

    /// Jobs matching `filter`, oldest first.
    pub fn list(&self, filter: &JobFilter) -> Vec<Job> {
        let mut out: Vec<Job> = self
            .jobs
            .lock()
            .values()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        out.sort_by_key(|j| (j.created_at, j.sequence));
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        out
    }

    /// Whether a Pending or Processing job of `job_type` targets `instance_id`.
    pub fn has_active(&self, job_type: JobType, instance_id: InstanceId) -> bool {
        self.jobs.lock().values().any(|j| {
            j.job_type == job_type
                && !j.status.is_finished()
                && j.payload.instance_id() == Some(instance_id)
        })
    }

    /// Whether any Pending or Processing job targets `instance_id`.
    pub fn has_active_for_instance(&self, instance_id: InstanceId) -> bool {
        self.jobs
            .lock()
            .values()
            .any(|j| !j.status.is_finished() && j.payload.instance_id() == Some(instance_id))
    }

    /// Claim the next ready job.
    ///
    /// # Errors
    ///
    /// Fails if the claim cannot be persisted; the job stays Pending.
    pub async fn dequeue_next(&self) -> OrchestratorResult<Option<Job>> {
        self.dequeue_next_at(Utc::now()).await
    }

    /// Claim the next job ready at `now`.
    ///
    /// # Errors
    ///
    /// Fails if the claim cannot be persisted; the job stays Pending.
    pub async fn dequeue_next_at(&self, now: DateTime<Utc>) -> OrchestratorResult<Option<Job>> {
        let claimed = {
            let mut jobs = self.jobs.lock();
            let Some(id) = jobs
                .values()
                .filter(|j| j.is_ready(now))
                .max_by_key(|j| dequeue_key(j))
                .map(|j| j.id)
            else {
                return Ok(None);
            };
            let Some(job) = jobs.get_mut(&id) else {
                return Ok(None);
            };
            let previous = job.clone();
            job.status = JobStatus::Processing;
            job.processed_at = Some(now);
            (previous, job.clone())
        };
        let (previous, job) = claimed;
        if let Err(e) = self.persist(&job).await {
            self.restore(&previous, JobStatus::Processing);
            return Err(e);
        }
        debug!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts + 1,
            "job claimed"
        );
        Ok(Some(job))
    }

    /// Processing → Completed.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::InvalidTransition`] unless the job is Processing;
    /// storage errors leave the job Processing.
    pub async fn mark_completed(&self, id: JobId) -> OrchestratorResult<Job> {
        let job = self
            .transition(id, |job, now| {
                job.attempts += 1;
                job.status = JobStatus::Completed;
                job.completed_at = Some(now);
                job.next_retry_at = None;
            })
            .await?;
        debug!(job_id = %id, attempts = job.attempts, "job completed");
        Ok(job)
    }

    /// Record a failed attempt. Retryable failures are re-queued with
    /// exponential backoff until the attempt ceiling; everything else fails now.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::InvalidTransition`] unless the job is Processing.
    pub async fn mark_failed(
        &self,
        id: JobId,
        error: &str,
        retryable: bool,
    ) -> OrchestratorResult<Job> {
        self.record_failure(id, error, retryable, None).await
    }

    /// Retryable failure whose delay comes from the provider (`Retry-After`)
    /// instead of the computed backoff.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::InvalidTransition`] unless the job is Processing.
    pub async fn mark_retry_after(
        &self,
        id: JobId,
        error: &str,
        delay: Duration,
    ) -> OrchestratorResult<Job> {
        self.record_failure(id, error, true, Some(delay)).await
    }

    async fn record_failure(
        &self,
        id: JobId,
        error: &str,
        retryable: bool,
        retry_after: Option<Duration>,
    ) -> OrchestratorResult<Job> {
        let base = self.config.base_delay();
        let cap = self.config.max_delay();
        let job = self
            .transition(id, |job, now| {
                job.attempts += 1;
                job.last_error = Some(error.to_string());
                if retryable && job.attempts < job.max_attempts {
                    let delay = retry_after
                        .unwrap_or_else(|| exponential_backoff(base, job.attempts, cap));
                    job.status = JobStatus::Pending;
                    job.next_retry_at = Some(now + to_chrono(delay));
                } else {
                    job.status = JobStatus::Failed;
                    job.completed_at = Some(now);
                    job.next_retry_at = None;
                }
            })
            .await?;
        match job.status {
            JobStatus::Pending => {
                let delay = job
                    .next_retry_at
                    .map(|at| elapsed_between(Utc::now(), at))
                    .unwrap_or_default();
                info!(
                    job_id = %id,
                    job_type = %job.job_type,
                    attempts = job.attempts,
                    max_attempts = job.max_attempts,
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error,
                    "job failed, retry scheduled"
                );
            }
            _ => warn!(
                job_id = %id,
                job_type = %job.job_type,
                attempts = job.attempts,
                retryable,
                error,
                "job failed permanently"
            ),
        }
        Ok(job)
    }

    /// Processing → Pending after `delay` without consuming an attempt.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::InvalidTransition`] unless the job is Processing.
    pub async fn defer(&self, id: JobId, delay: Duration, reason: &str) -> OrchestratorResult<Job> {
        let job = self
            .transition(id, |job, now| {
                job.status = JobStatus::Pending;
                job.next_retry_at = Some(now + to_chrono(delay));
                job.last_error = Some(reason.to_string());
            })
            .await?;
        debug!(
            job_id = %id,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            reason,
            "job deferred"
        );
        Ok(job)
    }

    /// Processing → Pending immediately, without consuming an attempt. Used
    /// when the pool abandons a job during shutdown.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::InvalidTransition`] unless the job is Processing.
    pub async fn reset_to_pending(&self, id: JobId) -> OrchestratorResult<Job> {
        self.transition(id, |job, _| {
            job.status = JobStatus::Pending;
            job.next_retry_at = None;
        })
        .await
    }

    /// Counters by status and type.
    pub fn stats(&self) -> QueueStats {
        let jobs = self.jobs.lock();
        let mut stats = QueueStats::default();
        for job in jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
            *stats.by_type.entry(job.job_type).or_default() += 1;
        }
        stats
    }

    /// Delete Completed/Failed jobs that finished more than `older_than` ago.
    ///
    /// # Errors
    ///
    /// Fails on the first store error; jobs purged before it stay purged.
    pub async fn purge_finished(&self, older_than: Duration) -> OrchestratorResult<usize> {
        let cutoff = Utc::now() - to_chrono(older_than);
        let expired: Vec<JobId> = self
            .jobs
            .lock()
            .values()
            .filter(|j| j.status.is_finished() && j.completed_at.is_some_and(|at| at < cutoff))
            .map(|j| j.id)
            .collect();
        for id in &expired {
            self.store.delete(&job_key(*id)).await?;
            self.jobs.lock().remove(id);
        }
        if !expired.is_empty() {
            info!(purged = expired.len(), "purged finished jobs");
        }
        Ok(expired.len())
    }

    /// Resolves after the next enqueue (or immediately if one happened since
    /// the last call).
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Apply `change` to a Processing job, persist it, and return the result.
    async fn transition<F>(&self, id: JobId, change: F) -> OrchestratorResult<Job>
    where
        F: FnOnce(&mut Job, DateTime<Utc>),
    {
        let (previous, updated) = {
            let mut jobs = self.jobs.lock();
            let job = jobs
                .get_mut(&id)
                .ok_or_else(|| OrchestratorError::NotFound(format!("job {id}")))?;
            if job.status != JobStatus::Processing {
                return Err(OrchestratorError::InvalidTransition(format!(
                    "job {id} is {:?}, expected Processing",
                    job.status
                )));
            }
            let previous = job.clone();
            change(job, Utc::now());
            (previous, job.clone())
        };
        if let Err(e) = self.persist(&updated).await {
            self.restore(&previous, updated.status);
            return Err(e);
        }
        if updated.status == JobStatus::Pending {
            self.notify.notify_one();
        }
        Ok(updated)
    }

    /// Roll the index back to `previous` if nothing else changed it since.
    fn restore(&self, previous: &Job, expected_status: JobStatus) {
        let mut jobs = self.jobs.lock();
        if let Some(current) = jobs.get_mut(&previous.id) {
            if current.status == expected_status {
                *current = previous.clone();
            }
        }
    }

    async fn persist(&self, job: &Job) -> OrchestratorResult<()> {
        store::set_json(self.store.as_ref(), &job_key(job.id), job, None).await
    }
}
