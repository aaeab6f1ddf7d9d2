//! Core job model, queue and worker pool.

pub mod error;
pub mod executor;
pub mod job;
pub mod job_queue;
pub mod worker_pool;

pub use error::{AppResult, ErrorKind, OrchestratorError, OrchestratorResult};
pub use executor::{FnHandler, JobHandler};
pub use job::{
    HandlerOutcome, InstanceId, Job, JobContext, JobId, JobPayload, JobStatus, JobType,
    OperationId, Priority,
};
pub use job_queue::{JobFilter, JobQueue, QueueStats};
pub use worker_pool::{PoolStats, ShutdownReport, WorkerPool};
