//! Tests for the API surface

use std::sync::Arc;

use instance_orchestrator::builders::{Orchestrator, OrchestratorBuilder};
use instance_orchestrator::config::OrchestratorConfig;
use instance_orchestrator::core::{JobFilter, JobType, OrchestratorError};
use instance_orchestrator::infra::InMemoryProvider;
use instance_orchestrator::lifecycle::InstanceStatus;
use instance_orchestrator::runtime::api::{self, CreateInstanceBody, StartInstanceBody};
use uuid::Uuid;

async fn orchestrator() -> Orchestrator {
    // slow boot keeps instances in Starting for the duration of a test
    OrchestratorBuilder::new(OrchestratorConfig::default())
        .with_provider(Arc::new(InMemoryProvider::new().with_boot_polls(1_000)))
        .without_schedulers()
        .start()
        .await
        .unwrap()
}

fn body(name: &str) -> CreateInstanceBody {
    CreateInstanceBody {
        name: name.into(),
        product_id: "p1".into(),
        image: "registry.example/llm:latest".into(),
        ports: vec![8000],
        env: Default::default(),
        region: None,
        webhook_url: None,
    }
}

#[tokio::test]
async fn test_create_is_accepted_without_waiting() {
    let orch = orchestrator().await;
    let accepted = api::create_instance(&orch, body("gpu-1")).await.unwrap();
    assert_eq!(accepted.status, InstanceStatus::Creating);

    let view = api::get_instance(&orch, "gpu-1").unwrap();
    assert_eq!(view.id, accepted.instance_id);
    assert_eq!(view.active_operation_id, Some(accepted.operation_id));

    let by_id = api::get_instance(&orch, &accepted.instance_id.to_string()).unwrap();
    assert_eq!(by_id.name, "gpu-1");
    orch.shutdown().await;
}

#[tokio::test]
async fn test_create_rejects_bad_body() {
    let orch = orchestrator().await;
    let mut bad = body("gpu-1");
    bad.image = String::new();
    let err = api::create_instance(&orch, bad).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(_)));
    assert!(api::list_instances(&orch, None).is_empty());
    orch.shutdown().await;
}

#[tokio::test]
async fn test_start_during_create_conflicts() {
    let orch = orchestrator().await;
    api::create_instance(&orch, body("gpu-1")).await.unwrap();
    let err = api::start_instance(&orch, "gpu-1", StartInstanceBody::default())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::OperationInProgress { .. }));
    orch.shutdown().await;
}

#[tokio::test]
async fn test_unknown_lookups_are_not_found() {
    let orch = orchestrator().await;
    assert!(matches!(
        api::get_instance(&orch, "missing"),
        Err(OrchestratorError::NotFound(_))
    ));
    assert!(matches!(
        api::get_job(&orch, Uuid::new_v4()),
        Err(OrchestratorError::NotFound(_))
    ));
    assert!(matches!(
        api::stop_instance(&orch, "missing").await,
        Err(OrchestratorError::NotFound(_))
    ));
    orch.shutdown().await;
}

#[tokio::test]
async fn test_job_listing_and_stats() {
    let orch = orchestrator().await;
    api::create_instance(&orch, body("gpu-1")).await.unwrap();
    api::create_instance(&orch, body("gpu-2")).await.unwrap();

    let creates = api::list_jobs(
        &orch,
        &JobFilter {
            job_type: Some(JobType::CreateInstance),
            ..JobFilter::default()
        },
    );
    assert_eq!(creates.len(), 2);
    let job = api::get_job(&orch, creates[0].id).unwrap();
    assert_eq!(job.job_type, JobType::CreateInstance);

    let stats = api::queue_stats(&orch);
    assert_eq!(stats.by_type.get(&JobType::CreateInstance).copied(), Some(2));
    orch.shutdown().await;
}

#[tokio::test]
async fn test_health_reports_components() {
    let orch = orchestrator().await;
    let health = api::health(&orch).await;
    assert!(health.ok);
    assert!(health.store_ok);
    assert_eq!(health.pool.max_concurrent_jobs, 10);
    orch.shutdown().await;
}
