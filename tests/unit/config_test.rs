//! Tests for configuration validation

use std::time::Duration;

use instance_orchestrator::config::{
    OrchestratorConfig, QueueConfig, SchedulersConfig, StoreBackendConfig, WebhookConfig,
    WorkerPoolConfig,
};
use instance_orchestrator::core::JobType;

#[test]
fn test_defaults_are_valid() {
    let cfg = OrchestratorConfig::default();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.pool.max_concurrent_jobs, 10);
    assert_eq!(cfg.queue.max_attempts, 3);
    assert_eq!(cfg.schedulers.auto_stop.interval_secs, 300);
    assert_eq!(cfg.schedulers.migration.interval_secs, 900);
    assert_eq!(cfg.resilience.circuit_breaker.failure_threshold, 5);
    assert_eq!(cfg.resilience.rate_limiter.max_requests, 100);
}

#[test]
fn test_queue_config_invalid_attempts() {
    let invalid = QueueConfig {
        max_attempts: 0,
        ..QueueConfig::default()
    };
    assert!(invalid.validate().is_err());
}

#[test]
fn test_queue_config_ceiling_below_base() {
    let invalid = QueueConfig {
        base_delay_ms: 5_000,
        max_delay_ms: 1_000,
        ..QueueConfig::default()
    };
    assert!(invalid.validate().is_err());
}

#[test]
fn test_pool_config_zero_concurrency() {
    assert!(WorkerPoolConfig::new().with_max_concurrent_jobs(0).validate().is_err());
}

#[test]
fn test_pool_config_per_type_timeouts() {
    let cfg =
        WorkerPoolConfig::new().with_job_timeout(JobType::StopInstance, Duration::from_secs(90));
    assert_eq!(cfg.timeout_for(JobType::StopInstance), Duration::from_secs(90));
    assert_eq!(cfg.timeout_for(JobType::SendWebhook), Duration::from_secs(180));
    assert_eq!(cfg.timeout_for(JobType::DeleteInstance), Duration::from_secs(300));
}

#[test]
fn test_webhook_config_retry_ceilings() {
    let cfg = WebhookConfig::default();
    assert_eq!(cfg.max_retries(true), 5);
    assert_eq!(cfg.max_retries(false), 3);

    let inverted = WebhookConfig {
        critical_max_retries: 1,
        default_max_retries: 3,
        ..WebhookConfig::default()
    };
    assert!(inverted.validate().is_err());
}

#[test]
fn test_scheduler_config_zero_interval() {
    let mut cfg = SchedulersConfig::default();
    cfg.migration.interval_secs = 0;
    let err = cfg.validate().unwrap_err();
    assert!(err.contains("migration"));
}

#[test]
fn test_from_json_partial_document() {
    let json = r#"{
        "pool": { "max_concurrent_jobs": 4 },
        "provider": { "base_url": "http://localhost:9000" },
        "store": { "backend": "file", "path": "/tmp/orchestrator" },
        "schedulers": { "auto_stop": { "idle_threshold_minutes": 45 } }
    }"#;
    let cfg = OrchestratorConfig::from_json_str(json).unwrap();
    assert_eq!(cfg.pool.max_concurrent_jobs, 4);
    assert_eq!(cfg.pool.poll_interval_ms, 1_000);
    assert_eq!(cfg.store.backend, StoreBackendConfig::File);
    assert_eq!(cfg.schedulers.auto_stop.idle_threshold_minutes, 45);
    assert!(cfg.schedulers.auto_stop.enabled);
}

#[test]
fn test_from_json_rejects_invalid_values() {
    let json = r#"{ "provider": { "base_url": "ftp://nope" } }"#;
    let err = OrchestratorConfig::from_json_str(json).unwrap_err();
    assert!(err.contains("provider"));

    let err = OrchestratorConfig::from_json_str("{ not json").unwrap_err();
    assert!(err.starts_with("parse error"));
}
