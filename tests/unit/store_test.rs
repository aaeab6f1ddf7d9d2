//! Tests for persistence backends as the queue and lifecycle use them

use std::sync::Arc;
use std::time::Duration;

use instance_orchestrator::config::{LifecycleConfig, QueueConfig};
use instance_orchestrator::core::{JobPayload, JobQueue, JobStatus, Priority};
use instance_orchestrator::infra::store::{self, FileStore, InMemoryStore, KvStore, JOB_PREFIX};
use instance_orchestrator::lifecycle::{InstanceConfig, InstanceLifecycle, InstanceStatus};
use uuid::Uuid;

fn create_payload() -> JobPayload {
    JobPayload::CreateInstance {
        instance_id: Uuid::new_v4(),
        operation_id: Uuid::new_v4(),
    }
}

#[tokio::test]
async fn test_memory_store_ttl_expiry() {
    let store = InMemoryStore::new();
    store
        .set("migration:cooldown:a", "1".into(), Some(Duration::from_millis(50)))
        .await
        .unwrap();
    assert!(store.get("migration:cooldown:a").await.unwrap().is_some());
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(store.get("migration:cooldown:a").await.unwrap().is_none());
}

#[tokio::test]
async fn test_jobs_survive_file_store_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let (first, second) = {
        let store: Arc<dyn KvStore> = Arc::new(FileStore::open(dir.path(), "jobs").unwrap());
        let queue = JobQueue::new(QueueConfig::default(), store);
        let first = queue.enqueue(create_payload(), Priority::Normal).await.unwrap();
        let second = queue.enqueue(create_payload(), Priority::High).await.unwrap();
        // claimed but never finished: the process "crashes" here
        let claimed = queue.dequeue_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, second);
        (first, second)
    };

    let store: Arc<dyn KvStore> = Arc::new(FileStore::open(dir.path(), "jobs").unwrap());
    let persisted = store.list_prefix(JOB_PREFIX).await.unwrap();
    assert_eq!(persisted.len(), 2);

    let queue = JobQueue::new(QueueConfig::default(), store);
    // only the claimed job needed resetting
    assert_eq!(queue.recover().await.unwrap(), 1);
    assert_eq!(queue.get(second).unwrap().status, JobStatus::Pending);

    let replay = queue.dequeue_next().await.unwrap().unwrap();
    assert_eq!(replay.id, second);
    let next = queue.dequeue_next().await.unwrap().unwrap();
    assert_eq!(next.id, first);
}

#[tokio::test]
async fn test_instances_survive_file_store_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let store: Arc<dyn KvStore> = Arc::new(FileStore::open(dir.path(), "state").unwrap());
        let queue = Arc::new(JobQueue::new(QueueConfig::default(), Arc::clone(&store)));
        let lifecycle = InstanceLifecycle::new(LifecycleConfig::default(), store, queue);
        lifecycle
            .create_instance(InstanceConfig::new("gpu-1", "p1", "img"))
            .await
            .unwrap()
            .id
    };

    let store: Arc<dyn KvStore> = Arc::new(FileStore::open(dir.path(), "state").unwrap());
    let queue = Arc::new(JobQueue::new(QueueConfig::default(), Arc::clone(&store)));
    let lifecycle = InstanceLifecycle::new(LifecycleConfig::default(), store, queue);
    assert_eq!(lifecycle.recover().await.unwrap(), 1);
    let state = lifecycle.find("gpu-1").unwrap();
    assert_eq!(state.id, id);
    assert_eq!(state.status, InstanceStatus::Creating);
    assert!(state.active_operation_id.is_some());
}

#[tokio::test]
async fn test_corrupt_records_are_skipped() {
    let store = InMemoryStore::new();
    store.set("job:good", "42".into(), None).await.unwrap();
    store.set("job:bad", "{not json".into(), None).await.unwrap();
    let values: Vec<u32> = store::list_json(&store, JOB_PREFIX).await.unwrap();
    assert_eq!(values, vec![42]);
}

#[tokio::test]
async fn test_file_store_opens_past_corrupt_snapshot_lines() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = FileStore::open(dir.path(), "state").unwrap();
        store.set("job:a", "1".into(), None).await.unwrap();
        store.set("job:b", "2".into(), None).await.unwrap();
    }
    // a torn write leaves half a line at the end of the snapshot
    let snapshot = dir.path().join("state.jsonl");
    let mut raw = std::fs::read_to_string(&snapshot).unwrap();
    raw.push_str("{\"key\":\"job:c\",\"val\n");
    std::fs::write(&snapshot, raw).unwrap();

    let store = FileStore::open(dir.path(), "state").unwrap();
    let keys: Vec<String> = store
        .list_prefix(JOB_PREFIX)
        .await
        .unwrap()
        .into_iter()
        .map(|(key, _)| key)
        .collect();
    assert_eq!(keys, vec!["job:a".to_string(), "job:b".to_string()]);

    // the next write leaves a clean snapshot behind
    store.set("job:c", "3".into(), None).await.unwrap();
    let reopened = FileStore::open(dir.path(), "state").unwrap();
    assert_eq!(reopened.list_prefix(JOB_PREFIX).await.unwrap().len(), 3);
}
