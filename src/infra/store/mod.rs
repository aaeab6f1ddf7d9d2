//! Key-value persistence backends.
//!
//! Jobs, instance records and migration cooldowns are stored as JSON strings
//! under prefixed keys. The orchestrator treats the store as a hard
//! dependency: [`KvStore::ping`] must succeed before anything starts.

pub mod file;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::core::OrchestratorResult;

pub use file::FileStore;
pub use memory::InMemoryStore;

/// Key prefix for job records.
pub const JOB_PREFIX: &str = "job:";
/// Key prefix for instance records.
pub const INSTANCE_PREFIX: &str = "instance:";
/// Key prefix for migration cooldown timestamps.
pub const MIGRATION_COOLDOWN_PREFIX: &str = "migration:cooldown:";

/// Abstraction for the persistence collaborator.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch a value; expired entries read as absent.
    async fn get(&self, key: &str) -> OrchestratorResult<Option<String>>;
    /// Insert or replace a value, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> OrchestratorResult<()>;
    /// Remove a value, returning whether it existed.
    async fn delete(&self, key: &str) -> OrchestratorResult<bool>;
    /// All live entries whose key starts with `prefix`, sorted by key.
    async fn list_prefix(&self, prefix: &str) -> OrchestratorResult<Vec<(String, String)>>;
    /// Reachability check used at startup.
    async fn ping(&self) -> OrchestratorResult<()>;
}

/// Read and deserialize a JSON value.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> OrchestratorResult<Option<T>> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Serialize and write a JSON value.
pub async fn set_json<T: Serialize + Sync>(
    store: &dyn KvStore,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> OrchestratorResult<()> {
    let raw = serde_json::to_string(value)?;
    store.set(key, raw, ttl).await
}

/// Deserialize every value under `prefix`, skipping (and logging) corrupt entries.
pub async fn list_json<T: DeserializeOwned>(
    store: &dyn KvStore,
    prefix: &str,
) -> OrchestratorResult<Vec<T>> {
    let entries = store.list_prefix(prefix).await?;
    let mut out = Vec::with_capacity(entries.len());
    for (key, raw) in entries {
        match serde_json::from_str(&raw) {
            Ok(value) => out.push(value),
            Err(e) => tracing::warn!(key = %key, error = %e, "skipping unreadable record"),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Record {
        name: String,
    }

    #[tokio::test]
    async fn json_helpers_skip_corrupt_entries() {
        let store = InMemoryStore::new();
        set_json(&store, "rec:a", &Record { name: "a".into() }, None)
            .await
            .unwrap();
        store.set("rec:b", "{not json".into(), None).await.unwrap();

        let records: Vec<Record> = list_json(&store, "rec:").await.unwrap();
        assert_eq!(records, vec![Record { name: "a".into() }]);

        let one: Option<Record> = get_json(&store, "rec:a").await.unwrap();
        assert_eq!(one.unwrap().name, "a");
    }
}
