//! Durable instance registry.
//!
//! Every mutation is applied to a copy of the table, flushed through the
//! backing [`RegistryStore`], and only then made visible. A failed flush
//! leaves the in-memory table untouched and surfaces as `Persistence`.

use crate::persist;
use anyhow::Context;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use vps_common::{InstanceRecord, Result, VpsError};

pub type RecordTable = HashMap<String, InstanceRecord>;

pub trait RegistryStore: Send + Sync {
    /// `Ok(None)` when nothing has been persisted yet.
    fn load(&self) -> anyhow::Result<Option<RecordTable>>;
    fn save(&self, records: &RecordTable) -> anyhow::Result<()>;
}

/// Checksummed JSON file, replaced atomically on every save.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RegistryStore for JsonFileStore {
    fn load(&self) -> anyhow::Result<Option<RecordTable>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.path.display()))
            }
        };

        match persist::decode_checked::<RecordTable>(&bytes) {
            Ok(table) => Ok(Some(table)),
            Err(decode_err) => {
                let moved = persist::quarantine(&self.path)
                    .with_context(|| format!("moving aside {}", self.path.display()))?;
                Err(anyhow::Error::new(decode_err)).with_context(|| {
                    format!("registry file corrupt, preserved as {}", moved.display())
                })
            }
        }
    }

    fn save(&self, records: &RecordTable) -> anyhow::Result<()> {
        let bytes = persist::encode_checked(records)?;
        persist::write_atomic(&self.path, &bytes)
            .with_context(|| format!("writing {}", self.path.display()))
    }
}

/// Volatile store with switchable save failures, used in tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    saved: Mutex<Option<RecordTable>>,
    failing_saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: RecordTable) -> Self {
        Self {
            saved: Mutex::new(Some(records)),
            failing_saves: AtomicUsize::new(0),
        }
    }

    /// Make the next `n` saves fail.
    pub fn fail_next_saves(&self, n: usize) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> Option<RecordTable> {
        self.saved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl RegistryStore for MemoryStore {
    fn load(&self) -> anyhow::Result<Option<RecordTable>> {
        Ok(self.snapshot())
    }

    fn save(&self, records: &RecordTable) -> anyhow::Result<()> {
        let failing = self
            .failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            anyhow::bail!("injected save failure");
        }
        *self
            .saved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(records.clone());
        Ok(())
    }
}

pub struct Registry {
    records: RwLock<RecordTable>,
    store: Arc<dyn RegistryStore>,
}

impl Registry {
    /// Load persisted records. Out-of-bounds records are skipped and a
    /// corrupt file yields an empty registry; both are logged.
    pub fn open(store: Arc<dyn RegistryStore>) -> Self {
        let loaded = match store.load() {
            Ok(Some(table)) => table,
            Ok(None) => {
                info!("No persisted registry found, starting empty");
                RecordTable::new()
            }
            Err(e) => {
                error!(error = ?e, "Failed to load registry, starting empty");
                RecordTable::new()
            }
        };

        let mut records = RecordTable::with_capacity(loaded.len());
        for (key, record) in loaded {
            if key != record.id {
                error!(%key, id = %record.id, "Registry key does not match record id, skipping");
                continue;
            }
            if let Err(e) = record.config.validate() {
                error!(id = %record.id, error = %e, "Persisted record out of bounds, skipping");
                continue;
            }
            records.insert(key, record);
        }
        info!(count = records.len(), "Registry loaded");

        Self {
            records: RwLock::new(records),
            store,
        }
    }

    pub async fn get(&self, id: &str) -> Result<InstanceRecord> {
        self.records
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| VpsError::NotFound(id.to_string()))
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.records.read().await.contains_key(id)
    }

    pub async fn list(&self) -> Vec<InstanceRecord> {
        let mut records: Vec<_> = self.records.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        records
    }

    pub async fn list_for_owner(&self, owner: &str) -> Vec<InstanceRecord> {
        let mut records = self.list().await;
        records.retain(|r| r.owner == owner);
        records
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Insert or replace a record.
    pub async fn put(&self, record: InstanceRecord) -> Result<()> {
        let mut current = self.records.write().await;
        let mut next = current.clone();
        let id = record.id.clone();
        next.insert(id.clone(), record);
        self.commit(&mut current, next).await?;
        debug!(%id, "Registry record stored");
        Ok(())
    }

    /// Apply `f` to an existing record and persist the result.
    pub async fn update<F>(&self, id: &str, f: F) -> Result<InstanceRecord>
    where
        F: FnOnce(&mut InstanceRecord),
    {
        let mut current = self.records.write().await;
        let mut next = current.clone();
        let record = next
            .get_mut(id)
            .ok_or_else(|| VpsError::NotFound(id.to_string()))?;
        f(record);
        let updated = record.clone();
        self.commit(&mut current, next).await?;
        Ok(updated)
    }

    pub async fn remove(&self, id: &str) -> Result<InstanceRecord> {
        let mut current = self.records.write().await;
        let mut next = current.clone();
        let removed = next
            .remove(id)
            .ok_or_else(|| VpsError::NotFound(id.to_string()))?;
        self.commit(&mut current, next).await?;
        debug!(%id, "Registry record removed");
        Ok(removed)
    }

    async fn commit(&self, current: &mut RecordTable, next: RecordTable) -> Result<()> {
        let store = self.store.clone();
        let (next, saved) = tokio::task::spawn_blocking(move || {
            let saved = store.save(&next);
            (next, saved)
        })
        .await
        .map_err(|e| VpsError::Persistence(format!("registry flush task failed: {e}")))?;

        if let Err(e) = saved {
            warn!(error = ?e, "Registry flush failed, change discarded");
            return Err(VpsError::Persistence(format!("{e:#}")));
        }
        *current = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vps_common::InstanceConfig;

    fn record(id: &str, owner: &str) -> InstanceRecord {
        InstanceRecord::new(
            id.into(),
            format!("{id}-container"),
            owner.into(),
            InstanceConfig::new(1.0, 1024, 20, "ubuntu:latest"),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let registry = Registry::open(Arc::new(MemoryStore::new()));
        registry.put(record("vps-a", "alice")).await.unwrap();
        registry.put(record("vps-b", "bob")).await.unwrap();

        assert_eq!(registry.get("vps-a").await.unwrap().owner, "alice");
        assert_eq!(registry.list_for_owner("bob").await.len(), 1);

        registry.remove("vps-a").await.unwrap();
        assert!(matches!(
            registry.get("vps-a").await,
            Err(VpsError::NotFound(_))
        ));
        assert!(matches!(
            registry.remove("vps-a").await,
            Err(VpsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_flush_leaves_memory_unchanged() {
        let store = Arc::new(MemoryStore::new());
        let registry = Registry::open(store.clone());
        registry.put(record("vps-a", "alice")).await.unwrap();

        store.fail_next_saves(1);
        let err = registry
            .update("vps-a", |r| r.payment_overdue = true)
            .await
            .unwrap_err();
        assert!(matches!(err, VpsError::Persistence(_)));
        assert!(!registry.get("vps-a").await.unwrap().payment_overdue);

        store.fail_next_saves(1);
        assert!(registry.put(record("vps-b", "bob")).await.is_err());
        assert!(!registry.contains("vps-b").await);
        assert_eq!(store.snapshot().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reload_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");

        {
            let registry = Registry::open(Arc::new(JsonFileStore::new(&path)));
            registry.put(record("vps-a", "alice")).await.unwrap();
            registry
                .update("vps-a", |r| r.payment_overdue = true)
                .await
                .unwrap();
        }

        let reopened = Registry::open(Arc::new(JsonFileStore::new(&path)));
        let loaded = reopened.get("vps-a").await.unwrap();
        assert!(loaded.payment_overdue);
        assert_eq!(loaded.container_id, "vps-a-container");
    }

    #[tokio::test]
    async fn test_corrupt_file_is_preserved_and_registry_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let registry = Registry::open(Arc::new(JsonFileStore::new(&path)));
        assert!(registry.is_empty().await);
        assert!(!path.exists());

        let preserved: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".corrupt-"))
            .collect();
        assert_eq!(preserved.len(), 1);
    }

    #[tokio::test]
    async fn test_out_of_bounds_records_skipped_on_load() {
        let mut table = RecordTable::new();
        let good = record("vps-good", "alice");
        let mut bad = record("vps-bad", "alice");
        bad.config.cpu_cores = 16.0;
        table.insert(good.id.clone(), good);
        table.insert(bad.id.clone(), bad);

        let registry = Registry::open(Arc::new(MemoryStore::with_records(table)));
        assert!(registry.contains("vps-good").await);
        assert!(!registry.contains("vps-bad").await);
    }
}
