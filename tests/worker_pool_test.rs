//! Integration tests for WorkerPool running over a JobQueue
//!
//! These tests validate real-world functionality including:
//! - Priority-ordered execution with a single worker
//! - Bounded concurrency under load, including manual dispatch
//! - Retry with backoff until success or exhaustion
//! - Deferral that does not consume attempts
//! - Graceful shutdown

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use instance_orchestrator::config::{QueueConfig, WorkerPoolConfig};
use instance_orchestrator::core::{
    HandlerOutcome, Job, JobContext, JobHandler, JobPayload, JobQueue, JobStatus, JobType, Priority,
    WorkerPool,
};
use instance_orchestrator::infra::InMemoryStore;
use parking_lot::Mutex;
use uuid::Uuid;

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn queue_config() -> QueueConfig {
    QueueConfig {
        max_attempts: 3,
        base_delay_ms: 10,
        max_delay_ms: 40,
        ..QueueConfig::default()
    }
}

fn setup(pool_config: WorkerPoolConfig) -> (Arc<JobQueue>, WorkerPool) {
    let queue = Arc::new(JobQueue::new(queue_config(), Arc::new(InMemoryStore::new())));
    let pool = WorkerPool::new(pool_config.with_poll_interval_ms(10), Arc::clone(&queue)).unwrap();
    for job_type in JobType::ALL {
        pool.register_fn(job_type, |_, _| async { HandlerOutcome::Success });
    }
    (queue, pool)
}

fn check(instance_id: Uuid) -> JobPayload {
    JobPayload::MigrationCheck { instance_id }
}

async fn wait_finished(queue: &JobQueue, ids: &[instance_orchestrator::core::JobId]) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if ids
            .iter()
            .all(|id| queue.get(*id).is_some_and(|j| j.status.is_finished()))
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("jobs did not finish in time");
}

// ============================================================================
// TEST HANDLERS
// ============================================================================

/// Records the order instances were handled in.
struct Recorder(Arc<Mutex<Vec<Uuid>>>);

#[async_trait]
impl JobHandler for Recorder {
    async fn execute(&self, payload: JobPayload, _ctx: JobContext) -> HandlerOutcome {
        if let Some(id) = payload.instance_id() {
            self.0.lock().push(id);
        }
        HandlerOutcome::Success
    }
}

/// Fails retryably until `succeed_on`, then succeeds.
struct Flaky {
    succeed_on: u32,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl JobHandler for Flaky {
    async fn execute(&self, _payload: JobPayload, ctx: JobContext) -> HandlerOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if ctx.attempt >= self.succeed_on {
            HandlerOutcome::Success
        } else {
            HandlerOutcome::retry(format!("503 on attempt {}", ctx.attempt))
        }
    }
}

/// Tracks peak concurrency.
struct Gauge {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl JobHandler for Gauge {
    async fn execute(&self, _payload: JobPayload, _ctx: JobContext) -> HandlerOutcome {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        HandlerOutcome::Success
    }
}

/// Always fails for good, counting `on_failed` calls.
struct Rejecting(Arc<AtomicU32>);

#[async_trait]
impl JobHandler for Rejecting {
    async fn execute(&self, _payload: JobPayload, _ctx: JobContext) -> HandlerOutcome {
        HandlerOutcome::permanent("422 unprocessable")
    }

    async fn on_failed(&self, job: &Job) {
        assert_eq!(job.status, JobStatus::Failed);
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[tokio::test]
async fn single_worker_runs_jobs_in_priority_order() {
    let (queue, pool) = setup(WorkerPoolConfig::new().with_max_concurrent_jobs(1));
    let order = Arc::new(Mutex::new(Vec::new()));
    pool.register_handler(JobType::MigrationCheck, Arc::new(Recorder(Arc::clone(&order))));

    let low = Uuid::new_v4();
    let normal = Uuid::new_v4();
    let high = Uuid::new_v4();
    let ids = vec![
        queue.enqueue(check(low), Priority::Low).await.unwrap(),
        queue.enqueue(check(normal), Priority::Normal).await.unwrap(),
        queue.enqueue(check(high), Priority::High).await.unwrap(),
    ];

    pool.start().unwrap();
    wait_finished(&queue, &ids).await;
    assert_eq!(*order.lock(), vec![high, normal, low]);
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn concurrency_never_exceeds_ceiling() {
    let (queue, pool) = setup(WorkerPoolConfig::new().with_max_concurrent_jobs(3));
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    pool.register_handler(
        JobType::MigrationCheck,
        Arc::new(Gauge {
            current: Arc::clone(&current),
            peak: Arc::clone(&peak),
        }),
    );

    let mut ids = Vec::new();
    for _ in 0..12 {
        ids.push(queue.enqueue(check(Uuid::new_v4()), Priority::Normal).await.unwrap());
    }
    pool.start().unwrap();
    wait_finished(&queue, &ids).await;

    assert_eq!(peak.load(Ordering::SeqCst), 3);
    assert_eq!(pool.stats().completed, 12);
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn manual_dispatch_shares_the_ceiling_with_the_loop() {
    let (queue, pool) = setup(WorkerPoolConfig::new().with_max_concurrent_jobs(2));
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    pool.register_handler(
        JobType::MigrationCheck,
        Arc::new(Gauge {
            current: Arc::clone(&current),
            peak: Arc::clone(&peak),
        }),
    );

    let mut ids = Vec::new();
    for _ in 0..16 {
        ids.push(queue.enqueue(check(Uuid::new_v4()), Priority::Normal).await.unwrap());
    }
    let pool = Arc::new(pool);
    pool.start().unwrap();
    let dispatchers: Vec<_> = (0..4)
        .map(|_| {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                for _ in 0..20 {
                    pool.dispatch_ready().await;
                    assert!(pool.stats().running <= 2);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
        })
        .collect();
    for dispatcher in dispatchers {
        dispatcher.await.unwrap();
    }
    wait_finished(&queue, &ids).await;

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(pool.stats().completed, 16);
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn retryable_failures_complete_on_later_attempt() {
    let (queue, pool) = setup(WorkerPoolConfig::new());
    let calls = Arc::new(AtomicU32::new(0));
    pool.register_handler(
        JobType::MigrationCheck,
        Arc::new(Flaky {
            succeed_on: 3,
            calls: Arc::clone(&calls),
        }),
    );

    let id = queue.enqueue(check(Uuid::new_v4()), Priority::Normal).await.unwrap();
    pool.start().unwrap();
    wait_finished(&queue, &[id]).await;

    let job = queue.get(id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(pool.stats().retried, 2);
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn retries_stop_at_max_attempts() {
    let (queue, pool) = setup(WorkerPoolConfig::new());
    let calls = Arc::new(AtomicU32::new(0));
    pool.register_handler(
        JobType::MigrationCheck,
        Arc::new(Flaky {
            succeed_on: u32::MAX,
            calls: Arc::clone(&calls),
        }),
    );

    let id = queue.enqueue(check(Uuid::new_v4()), Priority::Normal).await.unwrap();
    pool.start().unwrap();
    wait_finished(&queue, &[id]).await;

    let job = queue.get(id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 3);
    assert!(job.last_error.unwrap().contains("attempt 3"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn permanent_failure_is_not_retried() {
    let (queue, pool) = setup(WorkerPoolConfig::new());
    let failed = Arc::new(AtomicU32::new(0));
    pool.register_handler(JobType::MigrationCheck, Arc::new(Rejecting(Arc::clone(&failed))));

    let id = queue.enqueue(check(Uuid::new_v4()), Priority::Normal).await.unwrap();
    pool.start().unwrap();
    wait_finished(&queue, &[id]).await;
    // let the completion callback run
    tokio::time::sleep(Duration::from_millis(20)).await;

    let job = queue.get(id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert_eq!(failed.load(Ordering::SeqCst), 1);
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn deferral_does_not_consume_attempts() {
    let (queue, pool) = setup(WorkerPoolConfig::new());
    let runs = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&runs);
    pool.register_fn(JobType::MigrationCheck, move |_, _| {
        let counter = Arc::clone(&counter);
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 5 {
                HandlerOutcome::Deferred {
                    reason: "circuit open".into(),
                    delay: Duration::from_millis(5),
                }
            } else {
                HandlerOutcome::Success
            }
        }
    });

    let id = queue.enqueue(check(Uuid::new_v4()), Priority::Normal).await.unwrap();
    pool.start().unwrap();
    wait_finished(&queue, &[id]).await;

    let job = queue.get(id).unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 1);
    assert_eq!(runs.load(Ordering::SeqCst), 6);
    assert_eq!(pool.stats().deferred, 5);
    pool.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn shutdown_drains_running_handlers() {
    let (queue, pool) = setup(WorkerPoolConfig::new());
    pool.register_fn(JobType::MigrationCheck, |_, _| async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        HandlerOutcome::Success
    });
    let id = queue.enqueue(check(Uuid::new_v4()), Priority::Normal).await.unwrap();
    pool.start().unwrap();
    pool.dispatch_ready().await;

    let report = pool.shutdown(Duration::from_secs(2)).await;
    assert!(report.drained);
    assert_eq!(report.reset_jobs, 0);
    assert_eq!(queue.get(id).unwrap().status, JobStatus::Completed);
}
