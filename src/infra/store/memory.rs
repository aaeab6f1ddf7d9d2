//! In-memory store for development and tests.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::KvStore;
use crate::core::OrchestratorResult;
use crate::util::clock::to_chrono;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// TTL-aware map guarded by a `parking_lot::Mutex`. Expired entries are
/// dropped lazily on access.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: Mutex<BTreeMap<String, Entry>>,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Utc::now();
        self.entries.lock().values().filter(|e| e.is_live(now)).count()
    }

    /// Whether the store holds no live entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn get(&self, key: &str) -> OrchestratorResult<Option<String>> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> OrchestratorResult<()> {
        let expires_at = ttl.map(|ttl| Utc::now() + to_chrono(ttl));
        self.entries
            .lock()
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> OrchestratorResult<bool> {
        Ok(self.entries.lock().remove(key).is_some())
    }

    async fn list_prefix(&self, prefix: &str) -> OrchestratorResult<Vec<(String, String)>> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, e| e.is_live(now));
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    async fn ping(&self) -> OrchestratorResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prefix_listing_is_scoped() {
        let store = InMemoryStore::new();
        store.set("job:1", "a".into(), None).await.unwrap();
        store.set("job:2", "b".into(), None).await.unwrap();
        store.set("instance:1", "c".into(), None).await.unwrap();

        let jobs = store.list_prefix("job:").await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0], ("job:1".to_string(), "a".to_string()));
        assert!(store.delete("job:1").await.unwrap());
        assert!(!store.delete("job:1").await.unwrap());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent() {
        let store = InMemoryStore::new();
        store
            .set("k", "v".into(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        std::thread::sleep(Duration::from_millis(40));
        assert!(store.get("k").await.unwrap().is_none());
        assert!(store.is_empty());
    }
}
