//! Circuit breaker and rate limiter behaviour in front of a provider.

use std::sync::Arc;
use std::time::Duration;

use instance_orchestrator::builders::OrchestratorBuilder;
use instance_orchestrator::config::{
    CircuitBreakerConfig, OrchestratorConfig, RateLimiterConfig, ResilienceConfig,
};
use instance_orchestrator::core::{JobFilter, JobStatus, JobType, OrchestratorError};
use instance_orchestrator::infra::{InMemoryProvider, ProviderApi};
use instance_orchestrator::lifecycle::InstanceStatus;
use instance_orchestrator::resilience::{CircuitState, ResilienceGate};
use instance_orchestrator::runtime::api::{self, CreateInstanceBody};

fn gate(cooldown_ms: u64) -> ResilienceGate {
    ResilienceGate::new(
        "provider",
        &ResilienceConfig {
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 5,
                cooldown_ms,
                success_threshold: 1,
            },
            rate_limiter: RateLimiterConfig {
                max_requests: 100,
                window_ms: 100_000,
            },
            call_timeout_ms: None,
        },
    )
}

#[tokio::test(start_paused = true)]
async fn breaker_opens_rejects_then_probes() {
    let provider = InMemoryProvider::new();
    let gate = gate(60_000);
    provider.fail_next(503, 5);

    for _ in 0..5 {
        let err = gate.execute(|| provider.list_instances()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::TransientUpstream { .. }));
    }
    assert_eq!(gate.breaker_state().state, CircuitState::Open);
    assert_eq!(gate.breaker_state().failure_count, 5);

    // rejected without reaching the provider
    let err = gate.execute(|| provider.list_instances()).await.unwrap_err();
    match err {
        OrchestratorError::CircuitOpen { retry_in, .. } => {
            assert!(retry_in <= Duration::from_secs(60));
        }
        other => panic!("expected CircuitOpen, got {other:?}"),
    }
    assert_eq!(provider.call_count(), 5);

    tokio::time::advance(Duration::from_millis(60_001)).await;
    gate.execute(|| provider.list_instances()).await.unwrap();
    assert_eq!(gate.breaker_state().state, CircuitState::Closed);
    assert_eq!(provider.call_count(), 6);
}

#[tokio::test(start_paused = true)]
async fn failed_probe_reopens() {
    let provider = InMemoryProvider::new();
    let gate = gate(1_000);
    provider.fail_next(503, 6);
    for _ in 0..5 {
        let _ = gate.execute(|| provider.list_instances()).await;
    }
    tokio::time::advance(Duration::from_millis(1_001)).await;

    assert!(gate.execute(|| provider.list_instances()).await.is_err());
    assert_eq!(gate.breaker_state().state, CircuitState::Open);
    assert!(matches!(
        gate.execute(|| provider.list_instances()).await,
        Err(OrchestratorError::CircuitOpen { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn client_errors_do_not_trip_the_breaker() {
    let provider = InMemoryProvider::new();
    let gate = gate(60_000);
    provider.fail_next(404, 10);
    for _ in 0..10 {
        let _ = gate.execute(|| provider.list_instances()).await;
    }
    assert_eq!(gate.breaker_state().state, CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn limiter_spaces_calls_over_the_window() {
    let provider = InMemoryProvider::new();
    let gate = ResilienceGate::new(
        "provider",
        &ResilienceConfig {
            rate_limiter: RateLimiterConfig {
                max_requests: 2,
                window_ms: 1_000,
            },
            ..ResilienceConfig::default()
        },
    );
    let start = tokio::time::Instant::now();
    for _ in 0..5 {
        gate.execute(|| provider.list_instances()).await.unwrap();
    }
    // calls 3-4 wait one window, call 5 waits two
    assert!(start.elapsed() >= Duration::from_millis(2_000));
    assert_eq!(gate.limiter().available(), 1);
}

#[tokio::test]
async fn open_circuit_defers_jobs_without_consuming_attempts() {
    let mut cfg = OrchestratorConfig::default();
    cfg.pool.poll_interval_ms = 10;
    cfg.pool.shutdown_timeout_ms = 1_000;
    cfg.queue.max_attempts = 10;
    cfg.queue.base_delay_ms = 5;
    cfg.queue.max_delay_ms = 10;
    cfg.lifecycle.monitor_poll_interval_ms = 20;
    cfg.resilience.circuit_breaker.cooldown_ms = 150;

    let provider = Arc::new(InMemoryProvider::new().with_boot_polls(0));
    provider.fail_next(503, 5);
    let orch = OrchestratorBuilder::new(cfg)
        .with_provider(provider.clone())
        .without_schedulers()
        .start()
        .await
        .unwrap();

    api::create_instance(
        &orch,
        CreateInstanceBody {
            name: "gpu-1".into(),
            product_id: "p1".into(),
            image: "img".into(),
            ports: vec![],
            env: Default::default(),
            region: None,
            webhook_url: None,
        },
    )
    .await
    .unwrap();

    for _ in 0..300 {
        if orch
            .lifecycle()
            .find("gpu-1")
            .is_ok_and(|s| s.status == InstanceStatus::Running)
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(orch.lifecycle().find("gpu-1").unwrap().status, InstanceStatus::Running);

    let create = orch
        .queue()
        .list(&JobFilter {
            job_type: Some(JobType::CreateInstance),
            ..JobFilter::default()
        })
        .remove(0);
    assert_eq!(create.status, JobStatus::Completed);
    // five counted failures plus the successful probe
    assert_eq!(create.attempts, 6);
    assert_eq!(orch.gate().breaker_state().state, CircuitState::Closed);
    orch.shutdown().await;
}
