//! File-backed store using a JSON-lines snapshot for durability.
//!
//! Every mutation rewrites the snapshot (write to a temp file, then rename)
//! before returning, so a restart recovers exactly what callers saw acknowledged.

use std::collections::BTreeMap;
use std::fs::{create_dir_all, rename, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::KvStore;
use crate::core::{OrchestratorError, OrchestratorResult};
use crate::util::clock::to_chrono;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Line {
    key: String,
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

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

/// File-backed key-value store.
pub struct FileStore {
    path: PathBuf,
    stream: String,
    entries: Mutex<BTreeMap<String, Entry>>,
}

impl FileStore {
    /// Open (or create) the store `stream` under directory `path`.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Storage`] if the directory or an existing
    /// snapshot cannot be read. Snapshot lines that do not parse are skipped.
    pub fn open(path: impl AsRef<Path>, stream: impl Into<String>) -> OrchestratorResult<Self> {
        let path = path.as_ref().to_path_buf();
        create_dir_all(&path).map_err(OrchestratorError::storage)?;
        let store = Self {
            path,
            stream: stream.into(),
            entries: Mutex::new(BTreeMap::new()),
        };
        store.load_from_disk()?;
        Ok(store)
    }

    fn file_path(&self) -> PathBuf {
        self.path.join(format!("{}.jsonl", self.stream))
    }

    fn load_from_disk(&self) -> OrchestratorResult<()> {
        let file_path = self.file_path();
        if !file_path.exists() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .read(true)
            .open(&file_path)
            .map_err(OrchestratorError::storage)?;
        let now = Utc::now();
        let mut entries = self.entries.lock();
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(OrchestratorError::storage)?;
            if line.trim().is_empty() {
                continue;
            }
            let parsed: Line = match serde_json::from_str(&line) {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::warn!(
                        path = %file_path.display(),
                        line = number + 1,
                        error = %e,
                        "skipping corrupt snapshot line"
                    );
                    continue;
                }
            };
            let entry = Entry {
                value: parsed.value,
                expires_at: parsed.expires_at,
            };
            if entry.is_live(now) {
                entries.insert(parsed.key, entry);
            }
        }
        tracing::debug!(
            path = %file_path.display(),
            entries = entries.len(),
            "loaded store snapshot"
        );
        Ok(())
    }

    fn rewrite_disk(&self, entries: &BTreeMap<String, Entry>) -> OrchestratorResult<()> {
        let file_path = self.file_path();
        let tmp_path = self.path.join(format!("{}.jsonl.tmp", self.stream));
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(OrchestratorError::storage)?;
        for (key, entry) in entries {
            let line = serde_json::to_string(&Line {
                key: key.clone(),
                value: entry.value.clone(),
                expires_at: entry.expires_at,
            })?;
            writeln!(file, "{line}").map_err(OrchestratorError::storage)?;
        }
        file.sync_all().map_err(OrchestratorError::storage)?;
        rename(&tmp_path, &file_path).map_err(OrchestratorError::storage)
    }
}

#[async_trait]
impl KvStore for FileStore {
    async fn get(&self, key: &str) -> OrchestratorResult<Option<String>> {
        let now = Utc::now();
        Ok(self
            .entries
            .lock()
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> OrchestratorResult<()> {
        let expires_at = ttl.map(|ttl| Utc::now() + to_chrono(ttl));
        let mut entries = self.entries.lock();
        entries.insert(key.to_string(), Entry { value, expires_at });
        self.rewrite_disk(&entries)
    }

    async fn delete(&self, key: &str) -> OrchestratorResult<bool> {
        let mut entries = self.entries.lock();
        let existed = entries.remove(key).is_some();
        if existed {
            self.rewrite_disk(&entries)?;
        }
        Ok(existed)
    }

    async fn list_prefix(&self, prefix: &str) -> OrchestratorResult<Vec<(String, String)>> {
        let now = Utc::now();
        Ok(self
            .entries
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, e)| e.is_live(now))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect())
    }

    async fn ping(&self) -> OrchestratorResult<()> {
        if self.path.is_dir() {
            Ok(())
        } else {
            Err(OrchestratorError::Storage(format!(
                "store directory {} is missing",
                self.path.display()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path(), "state").unwrap();
            store.set("job:1", "one".into(), None).await.unwrap();
            store.set("job:2", "two".into(), None).await.unwrap();
            assert!(store.delete("job:2").await.unwrap());
        }
        let reopened = FileStore::open(dir.path(), "state").unwrap();
        assert_eq!(reopened.get("job:1").await.unwrap().as_deref(), Some("one"));
        assert!(reopened.get("job:2").await.unwrap().is_none());
        reopened.ping().await.unwrap();
    }

    #[tokio::test]
    async fn expired_entries_are_not_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path(), "state").unwrap();
            store
                .set("short", "x".into(), Some(Duration::from_millis(10)))
                .await
                .unwrap();
            store.set("long", "y".into(), None).await.unwrap();
        }
        std::thread::sleep(Duration::from_millis(30));
        let reopened = FileStore::open(dir.path(), "state").unwrap();
        let all = reopened.list_prefix("").await.unwrap();
        assert_eq!(all, vec![("long".to_string(), "y".to_string())]);
    }
}
