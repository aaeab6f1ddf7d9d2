//! Job handler trait and closure adapter.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use super::job::{HandlerOutcome, Job, JobContext, JobPayload};

/// Executes one job type.
///
/// Handlers never raise: every path returns a [`HandlerOutcome`] and the
/// worker pool turns it into a queue transition.
///
/// # Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use instance_orchestrator::core::{HandlerOutcome, JobContext, JobHandler, JobPayload};
///
/// struct Noop;
///
/// #[async_trait]
/// impl JobHandler for Noop {
///     async fn execute(&self, _payload: JobPayload, _ctx: JobContext) -> HandlerOutcome {
///         HandlerOutcome::Success
///     }
/// }
/// ```
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Run one attempt of a job.
    async fn execute(&self, payload: JobPayload, ctx: JobContext) -> HandlerOutcome;

    /// Called once after the job reached Failed for good (permanent failure,
    /// or a retryable one on its last attempt). Used to release resources the
    /// job was holding.
    async fn on_failed(&self, _job: &Job) {}
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut>
where
    F: Fn(JobPayload, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    /// Wrap `f`.
    pub const fn new(f: F) -> Self {
        Self { f, _fut: PhantomData }
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F, Fut>
where
    F: Fn(JobPayload, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    async fn execute(&self, payload: JobPayload, ctx: JobContext) -> HandlerOutcome {
        (self.f)(payload, ctx).await
    }
}
