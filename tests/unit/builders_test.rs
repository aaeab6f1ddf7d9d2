//! Tests for orchestrator assembly

use std::sync::Arc;

use async_trait::async_trait;
use instance_orchestrator::builders::OrchestratorBuilder;
use instance_orchestrator::config::OrchestratorConfig;
use instance_orchestrator::core::{OrchestratorError, OrchestratorResult};
use instance_orchestrator::infra::store::{InMemoryStore, KvStore};
use instance_orchestrator::infra::InMemoryProvider;
use std::time::Duration;

struct Unreachable;

#[async_trait]
impl KvStore for Unreachable {
    async fn get(&self, _key: &str) -> OrchestratorResult<Option<String>> {
        Err(OrchestratorError::storage("connection refused"))
    }
    async fn set(
        &self,
        _key: &str,
        _value: String,
        _ttl: Option<Duration>,
    ) -> OrchestratorResult<()> {
        Err(OrchestratorError::storage("connection refused"))
    }
    async fn delete(&self, _key: &str) -> OrchestratorResult<bool> {
        Err(OrchestratorError::storage("connection refused"))
    }
    async fn list_prefix(&self, _prefix: &str) -> OrchestratorResult<Vec<(String, String)>> {
        Err(OrchestratorError::storage("connection refused"))
    }
    async fn ping(&self) -> OrchestratorResult<()> {
        Err(OrchestratorError::storage("connection refused"))
    }
}

#[tokio::test]
async fn test_builder_starts_and_shuts_down() {
    let orch = OrchestratorBuilder::new(OrchestratorConfig::default())
        .with_store(Arc::new(InMemoryStore::new()))
        .with_provider(Arc::new(InMemoryProvider::new()))
        .start()
        .await
        .unwrap();
    assert_eq!(orch.pool().stats().max_concurrent_jobs, 10);
    assert!(orch.lifecycle().list().is_empty());

    let report = orch.shutdown().await;
    assert!(report.drained);
    assert_eq!(report.reset_jobs, 0);
}

#[tokio::test]
async fn test_builder_fails_when_store_unreachable() {
    let err = OrchestratorBuilder::new(OrchestratorConfig::default())
        .with_store(Arc::new(Unreachable))
        .with_provider(Arc::new(InMemoryProvider::new()))
        .start()
        .await
        .err()
        .unwrap();
    assert!(format!("{err:#}").contains("store unreachable"));
}

#[tokio::test]
async fn test_builder_rejects_invalid_config() {
    let mut config = OrchestratorConfig::default();
    config.pool.max_concurrent_jobs = 0;
    let result = OrchestratorBuilder::new(config)
        .with_provider(Arc::new(InMemoryProvider::new()))
        .start()
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_builder_recovers_persisted_instances() {
    let store: Arc<dyn KvStore> = Arc::new(InMemoryStore::new());
    let first = OrchestratorBuilder::new(OrchestratorConfig::default())
        .with_store(Arc::clone(&store))
        .with_provider(Arc::new(InMemoryProvider::new().with_boot_polls(100)))
        .without_schedulers()
        .start()
        .await
        .unwrap();
    first
        .lifecycle()
        .create_instance(instance_orchestrator::lifecycle::InstanceConfig::new(
            "gpu-1", "p1", "img",
        ))
        .await
        .unwrap();
    first.shutdown().await;

    let second = OrchestratorBuilder::new(OrchestratorConfig::default())
        .with_store(store)
        .with_provider(Arc::new(InMemoryProvider::new()))
        .without_schedulers()
        .start()
        .await
        .unwrap();
    assert!(second.lifecycle().find("gpu-1").is_ok());
    second.shutdown().await;
}
