//! Job queue, worker pool and store configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::JobType;

/// Retry policy and retention for the job queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Attempts before a retryable failure becomes permanent.
    pub max_attempts: u32,
    /// Backoff base; attempt `n` waits `base * 2^(n-1)`.
    pub base_delay_ms: u64,
    /// Backoff ceiling.
    pub max_delay_ms: u64,
    /// Completed/Failed jobs older than this are purged by maintenance.
    pub finished_retention_hours: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            finished_retention_hours: 24,
        }
    }
}

impl QueueConfig {
    /// Validate queue configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be greater than 0".into());
        }
        if self.base_delay_ms == 0 {
            return Err("base_delay_ms must be greater than 0".into());
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err("max_delay_ms must be at least base_delay_ms".into());
        }
        Ok(())
    }

    /// Backoff base.
    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Backoff ceiling.
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Age past which finished jobs are purged.
    #[must_use]
    pub const fn finished_retention(&self) -> Duration {
        Duration::from_secs(self.finished_retention_hours * 3600)
    }
}

/// Worker pool sizing and timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Hard ceiling on concurrently running handlers.
    pub max_concurrent_jobs: usize,
    /// Dispatch loop wake interval.
    pub poll_interval_ms: u64,
    /// Handler timeout for types without an override.
    pub default_job_timeout_secs: u64,
    /// Per-type handler timeouts.
    pub job_timeouts_secs: BTreeMap<JobType, u64>,
    /// Drain budget used by `Orchestrator::shutdown`.
    pub shutdown_timeout_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        let mut job_timeouts_secs = BTreeMap::new();
        job_timeouts_secs.insert(JobType::MonitorInstance, 60);
        job_timeouts_secs.insert(JobType::SendWebhook, 180);
        job_timeouts_secs.insert(JobType::AutoStopCheck, 60);
        Self {
            max_concurrent_jobs: 10,
            poll_interval_ms: 1_000,
            default_job_timeout_secs: 300,
            job_timeouts_secs,
            shutdown_timeout_ms: 30_000,
        }
    }
}

impl WorkerPoolConfig {
    /// Create a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the concurrency ceiling.
    #[must_use]
    pub const fn with_max_concurrent_jobs(mut self, n: usize) -> Self {
        self.max_concurrent_jobs = n;
        self
    }

    /// Set the poll interval.
    #[must_use]
    pub const fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Override the handler timeout for one job type.
    #[must_use]
    pub fn with_job_timeout(mut self, job_type: JobType, timeout: Duration) -> Self {
        self.job_timeouts_secs
            .insert(job_type, timeout.as_secs().max(1));
        self
    }

    /// Validate pool configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_jobs == 0 {
            return Err("max_concurrent_jobs must be greater than 0".into());
        }
        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be greater than 0".into());
        }
        if self.default_job_timeout_secs == 0 {
            return Err("default_job_timeout_secs must be greater than 0".into());
        }
        if let Some((job_type, _)) = self.job_timeouts_secs.iter().find(|(_, s)| **s == 0) {
            return Err(format!("timeout for {job_type} must be greater than 0"));
        }
        Ok(())
    }

    /// Handler timeout for `job_type`.
    #[must_use]
    pub fn timeout_for(&self, job_type: JobType) -> Duration {
        Duration::from_secs(
            self.job_timeouts_secs
                .get(&job_type)
                .copied()
                .unwrap_or(self.default_job_timeout_secs),
        )
    }

    /// Poll interval as a duration.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Store backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackendConfig {
    /// In-memory store for development/testing.
    #[default]
    InMemory,
    /// JSON-lines snapshot on local disk.
    File,
}

/// Persistence collaborator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend selection.
    pub backend: StoreBackendConfig,
    /// Directory for the file backend.
    pub path: PathBuf,
    /// Snapshot file stem.
    pub stream: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackendConfig::InMemory,
            path: PathBuf::from("./data"),
            stream: "orchestrator".into(),
        }
    }
}

impl StoreConfig {
    /// Validate store configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.stream.trim().is_empty() {
            return Err("stream must not be empty".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_override_wins() {
        let cfg = WorkerPoolConfig::new()
            .with_job_timeout(JobType::CreateInstance, Duration::from_secs(42));
        assert_eq!(cfg.timeout_for(JobType::CreateInstance), Duration::from_secs(42));
        assert_eq!(cfg.timeout_for(JobType::StopInstance), Duration::from_secs(300));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        assert!(WorkerPoolConfig::new().with_max_concurrent_jobs(0).validate().is_err());
        assert!(QueueConfig { max_attempts: 0, ..QueueConfig::default() }.validate().is_err());
    }
}
