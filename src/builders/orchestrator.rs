//! Wire every component from an [`OrchestratorConfig`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use crate::config::{OrchestratorConfig, StoreBackendConfig};
use crate::core::{AppResult, JobQueue, ShutdownReport, WorkerPool};
use crate::infra::provider::{HttpProvider, ProviderApi};
use crate::infra::store::{FileStore, InMemoryStore, KvStore};
use crate::lifecycle::{register_lifecycle_handlers, HandlerContext, InstanceLifecycle};
use crate::resilience::ResilienceGate;
use crate::scheduler::{
    AutoStopScheduler, MaintenanceScheduler, MigrationScheduler, SchedulerSet,
};
use crate::webhook::{HttpTransport, WebhookDispatcher, WebhookTransport};

/// Name the provider's breaker and logs use.
pub const PROVIDER_DEPENDENCY: &str = "provider";

/// Builds a running [`Orchestrator`].
///
/// Collaborators not injected are built from the config: the store from
/// `store.backend`, the provider as an [`HttpProvider`], the webhook
/// transport as an [`HttpTransport`].
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    store: Option<Arc<dyn KvStore>>,
    provider: Option<Arc<dyn ProviderApi>>,
    transport: Option<Arc<dyn WebhookTransport>>,
    schedulers: bool,
}

impl OrchestratorBuilder {
    /// Start from `config`.
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            store: None,
            provider: None,
            transport: None,
            schedulers: true,
        }
    }

    /// Use `store` instead of the configured backend.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use `provider` instead of an HTTP client.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn ProviderApi>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Use `transport` for webhook delivery.
    #[must_use]
    pub fn with_webhook_transport(mut self, transport: Arc<dyn WebhookTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Skip the periodic schedulers regardless of their `enabled` flags.
    #[must_use]
    pub const fn without_schedulers(mut self) -> Self {
        self.schedulers = false;
        self
    }

    /// Build, recover persisted state, and start the pool and schedulers.
    ///
    /// # Errors
    ///
    /// Invalid configuration, an unreachable store, or a failed recovery.
    pub async fn start(self) -> AppResult<Orchestrator> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

        let store: Arc<dyn KvStore> = match self.store {
            Some(store) => store,
            None => match config.store.backend {
                StoreBackendConfig::InMemory => Arc::new(InMemoryStore::new()),
                StoreBackendConfig::File => Arc::new(
                    FileStore::open(&config.store.path, config.store.stream.clone())
                        .context("opening file store")?,
                ),
            },
        };
        store.ping().await.context("store unreachable")?;

        let provider: Arc<dyn ProviderApi> = match self.provider {
            Some(provider) => provider,
            None => Arc::new(
                HttpProvider::new(&config.provider).context("building provider client")?,
            ),
        };
        let transport: Arc<dyn WebhookTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(
                HttpTransport::new(Duration::from_millis(config.webhook.request_timeout_ms))
                    .context("building webhook client")?,
            ),
        };

        let queue = Arc::new(JobQueue::new(config.queue.clone(), Arc::clone(&store)));
        let replayed_jobs = queue.recover().await.context("recovering jobs")?;

        let lifecycle = Arc::new(
            InstanceLifecycle::new(config.lifecycle.clone(), Arc::clone(&store), Arc::clone(&queue))
                .with_migration_policy(config.schedulers.migration.clone())
                .with_default_webhook_url(config.webhook.default_url.clone()),
        );
        let recovered_instances = lifecycle.recover().await.context("recovering instances")?;

        let gate = Arc::new(ResilienceGate::new(PROVIDER_DEPENDENCY, &config.resilience));
        let dispatcher = Arc::new(WebhookDispatcher::new(transport, config.webhook.clone()));

        let pool = WorkerPool::new(config.pool.clone(), Arc::clone(&queue))?;
        register_lifecycle_handlers(
            &pool,
            HandlerContext {
                lifecycle: Arc::clone(&lifecycle),
                provider: Arc::clone(&provider),
                gate: Arc::clone(&gate),
                dispatcher: Arc::clone(&dispatcher),
            },
        );
        pool.start()?;

        let sched = &config.schedulers;
        let mut schedulers = SchedulerSet::new(Duration::from_secs(sched.run_timeout_secs));
        if self.schedulers {
            if sched.auto_stop.enabled {
                let task = AutoStopScheduler::new(Arc::clone(&lifecycle), sched.auto_stop.clone());
                schedulers.spawn(
                    Arc::new(task),
                    Duration::from_secs(sched.auto_stop.interval_secs),
                );
            }
            if sched.migration.enabled {
                let task = MigrationScheduler::new(Arc::clone(&lifecycle));
                schedulers.spawn(
                    Arc::new(task),
                    Duration::from_secs(sched.migration.interval_secs),
                );
            }
            if sched.maintenance.enabled {
                let task = MaintenanceScheduler::new(
                    Arc::clone(&lifecycle),
                    Arc::clone(&provider),
                    Arc::clone(&gate),
                    config.queue.finished_retention(),
                );
                schedulers.spawn(
                    Arc::new(task),
                    Duration::from_secs(sched.maintenance.interval_secs),
                );
            }
        }

        info!(
            replayed_jobs,
            recovered_instances,
            max_concurrent_jobs = config.pool.max_concurrent_jobs,
            schedulers = schedulers.len(),
            "orchestrator started"
        );

        Ok(Orchestrator {
            config,
            store,
            queue,
            pool,
            lifecycle,
            gate,
            dispatcher,
            provider,
            schedulers,
        })
    }
}

/// Every running component.
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn KvStore>,
    queue: Arc<JobQueue>,
    pool: WorkerPool,
    lifecycle: Arc<InstanceLifecycle>,
    gate: Arc<ResilienceGate>,
    dispatcher: Arc<WebhookDispatcher>,
    provider: Arc<dyn ProviderApi>,
    schedulers: SchedulerSet,
}

impl Orchestrator {
    /// Configuration the orchestrator was built from.
    pub const fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Persistence collaborator.
    pub const fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Job queue.
    pub const fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Worker pool.
    pub const fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Instance records.
    pub const fn lifecycle(&self) -> &Arc<InstanceLifecycle> {
        &self.lifecycle
    }

    /// Gate in front of the provider.
    pub const fn gate(&self) -> &Arc<ResilienceGate> {
        &self.gate
    }

    /// Webhook dispatcher.
    pub const fn dispatcher(&self) -> &Arc<WebhookDispatcher> {
        &self.dispatcher
    }

    /// Upstream provider.
    pub const fn provider(&self) -> &Arc<dyn ProviderApi> {
        &self.provider
    }

    /// Stop the schedulers, then drain the pool within the configured
    /// shutdown timeout.
    pub async fn shutdown(self) -> ShutdownReport {
        self.schedulers.shutdown().await;
        let timeout = Duration::from_millis(self.config.pool.shutdown_timeout_ms);
        let report = self.pool.shutdown(timeout).await;
        info!(drained = report.drained, reset_jobs = report.reset_jobs, "orchestrator stopped");
        report
    }
}
