//! Configuration models for the queue, pool, upstream dependencies and schedulers.

pub mod engine;
pub mod lifecycle;
pub mod upstream;

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use engine::{QueueConfig, StoreBackendConfig, StoreConfig, WorkerPoolConfig};
pub use lifecycle::{
    AutoStopConfig, LifecycleConfig, MaintenanceConfig, MigrationConfig, SchedulersConfig,
};
pub use upstream::{
    CircuitBreakerConfig, ProviderConfig, RateLimiterConfig, ResilienceConfig, WebhookConfig,
};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "ORCHESTRATOR_";

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Job queue retry policy.
    pub queue: QueueConfig,
    /// Worker pool sizing.
    pub pool: WorkerPoolConfig,
    /// Circuit breaker and rate limiter.
    pub resilience: ResilienceConfig,
    /// Webhook delivery.
    pub webhook: WebhookConfig,
    /// Instance lifecycle policy.
    pub lifecycle: LifecycleConfig,
    /// Periodic schedulers.
    pub schedulers: SchedulersConfig,
    /// Upstream provider endpoint.
    pub provider: ProviderConfig,
    /// Persistence backend.
    pub store: StoreConfig,
}

impl OrchestratorConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.queue.validate().map_err(|e| format!("queue invalid: {e}"))?;
        self.pool.validate().map_err(|e| format!("pool invalid: {e}"))?;
        self.resilience
            .validate()
            .map_err(|e| format!("resilience invalid: {e}"))?;
        self.webhook
            .validate()
            .map_err(|e| format!("webhook invalid: {e}"))?;
        self.lifecycle
            .validate()
            .map_err(|e| format!("lifecycle invalid: {e}"))?;
        self.schedulers
            .validate()
            .map_err(|e| format!("schedulers invalid: {e}"))?;
        self.provider
            .validate()
            .map_err(|e| format!("provider invalid: {e}"))?;
        self.store.validate().map_err(|e| format!("store invalid: {e}"))?;
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration for a process.
    ///
    /// Reads `.env` if present, starts from the JSON file named by
    /// `ORCHESTRATOR_CONFIG_FILE` (or defaults), then applies the remaining
    /// `ORCHESTRATOR_*` overrides and validates.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        let mut cfg = match env::var(format!("{ENV_PREFIX}CONFIG_FILE")) {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path)
                    .map_err(|e| format!("cannot read {path}: {e}"))?;
                serde_json::from_str(&raw).map_err(|e| format!("parse error in {path}: {e}"))?
            }
            Err(_) => Self::default(),
        };
        cfg.apply_overrides(|name| env::var(format!("{ENV_PREFIX}{name}")).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply overrides from a lookup function keyed by the unprefixed variable name.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), String>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("PROVIDER_BASE_URL") {
            self.provider.base_url = url;
        }
        if let Some(key) = lookup("PROVIDER_API_KEY") {
            self.provider.api_key = Some(key);
        }
        if let Some(secret) = lookup("WEBHOOK_SECRET") {
            self.webhook.secret = Some(secret);
        }
        if let Some(url) = lookup("WEBHOOK_URL") {
            self.webhook.default_url = Some(url);
        }
        if let Some(path) = lookup("STORE_PATH") {
            self.store.path = PathBuf::from(path);
            self.store.backend = StoreBackendConfig::File;
        }
        if let Some(raw) = lookup("MAX_CONCURRENT_JOBS") {
            self.pool.max_concurrent_jobs = parse_number("MAX_CONCURRENT_JOBS", &raw)?;
        }
        if let Some(raw) = lookup("POLL_INTERVAL_MS") {
            self.pool.poll_interval_ms = parse_number("POLL_INTERVAL_MS", &raw)?;
        }
        if let Some(raw) = lookup("MAX_ATTEMPTS") {
            self.queue.max_attempts = parse_number("MAX_ATTEMPTS", &raw)?;
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, String> {
    raw.trim()
        .parse()
        .map_err(|_| format!("{ENV_PREFIX}{name} must be a number, got `{raw}`"))
}
