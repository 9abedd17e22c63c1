// ============================================================================
// RedbCache - Embedded persistent cache (redb)
// ============================================================================
// One table of bincode-encoded records, each carrying its own absolute expiry.
// Expired records read as absent and are removed by `prune_expired`.
// Default path: ~/.zeteo/cache.redb (override via ZETEO_CACHE_PATH)
// ============================================================================

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use redb::{Database, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::{CacheError, CacheStore};
use crate::clock::{Clock, SystemClock};

const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");

/// Stored value plus bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CacheRecord {
    value: Vec<u8>,
    stored_at: u64,
    expires_at: u64,
}

/// A raw cache entry, as listed by maintenance tooling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub stored_at: u64,
    pub expires_at: u64,
}

impl StoredEntry {
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at <= now
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub live_entries: usize,
    pub expired_entries: usize,
    pub total_bytes: usize,
}

fn backend<E: std::fmt::Display>(context: &'static str) -> impl FnOnce(E) -> CacheError {
    move |e| CacheError::Backend(format!("{}: {}", context, e))
}

struct Inner {
    db: Database,
    path: PathBuf,
    clock: Arc<dyn Clock>,
}

/// Persistent cache store backed by redb
#[derive(Clone)]
pub struct RedbCache {
    inner: Arc<Inner>,
}

impl RedbCache {
    /// Default location: ~/.zeteo/cache.redb
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or_else(|| anyhow!("Cannot determine home directory"))?;
        let zeteo_dir = home.join(".zeteo");
        std::fs::create_dir_all(&zeteo_dir)
            .map_err(|e| anyhow!("Failed to create .zeteo directory: {}", e))?;
        Ok(zeteo_dir.join("cache.redb"))
    }

    /// Open (or create) the cache at the given path
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_clock(path, Arc::new(SystemClock))
    }

    pub fn open_with_clock(path: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        info!("Opening cache database at: {}", path.display());

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| anyhow!("Failed to create cache directory: {}", e))?;
        }

        let db = Database::create(path).map_err(|e| anyhow!("Failed to open cache database: {}", e))?;

        let write_txn = db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))?;
        {
            let _ = write_txn
                .open_table(ENTRIES)
                .map_err(|e| anyhow!("Failed to create entries table: {}", e))?;
        }
        write_txn.commit().map_err(|e| anyhow!("Failed to commit init: {}", e))?;

        Ok(Self {
            inner: Arc::new(Inner {
                db,
                path: path.to_path_buf(),
                clock,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    fn now(&self) -> u64 {
        self.inner.clock.now()
    }

    // ========================================================================
    // Blocking Operations
    // ========================================================================

    /// Live value for `key`, if any
    pub fn get_blocking(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let now = self.now();
        Ok(self
            .read_record(key)?
            .filter(|record| record.expires_at > now)
            .map(|record| record.value))
    }

    pub fn set_blocking(&self, key: &str, value: Vec<u8>, ttl_secs: u64) -> Result<(), CacheError> {
        let now = self.now();
        let record = CacheRecord {
            value,
            stored_at: now,
            expires_at: now.saturating_add(ttl_secs),
        };
        let bytes = bincode::serialize(&record).map_err(|e| CacheError::Encoding(e.to_string()))?;

        let write_txn = self.inner.db.begin_write().map_err(backend("Failed to begin write"))?;
        {
            let mut table = write_txn
                .open_table(ENTRIES)
                .map_err(backend("Failed to open entries table"))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(backend("Failed to insert entry"))?;
        }
        write_txn.commit().map_err(backend("Failed to commit"))?;

        debug!("Stored cache entry: {}", key);
        Ok(())
    }

    pub fn delete_blocking(&self, key: &str) -> Result<bool, CacheError> {
        let write_txn = self.inner.db.begin_write().map_err(backend("Failed to begin write"))?;
        let removed;
        {
            let mut table = write_txn
                .open_table(ENTRIES)
                .map_err(backend("Failed to open entries table"))?;
            removed = table
                .remove(key)
                .map_err(backend("Failed to remove entry"))?
                .is_some();
        }
        write_txn.commit().map_err(backend("Failed to commit delete"))?;

        if removed {
            debug!("Deleted cache entry: {}", key);
        }
        Ok(removed)
    }

    fn read_record(&self, key: &str) -> Result<Option<CacheRecord>, CacheError> {
        let read_txn = self.inner.db.begin_read().map_err(backend("Failed to begin read"))?;
        let table = read_txn
            .open_table(ENTRIES)
            .map_err(backend("Failed to open entries table"))?;

        match table.get(key).map_err(backend("Failed to get entry"))? {
            Some(value) => {
                let record: CacheRecord = bincode::deserialize(value.value())
                    .map_err(|e| CacheError::Encoding(e.to_string()))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Every stored entry, expired ones included, in key order
    pub fn entries(&self) -> Result<Vec<StoredEntry>, CacheError> {
        let read_txn = self.inner.db.begin_read().map_err(backend("Failed to begin read"))?;
        let table = read_txn
            .open_table(ENTRIES)
            .map_err(backend("Failed to open entries table"))?;

        let mut results = Vec::new();
        let iter = table
            .range::<&str>(..)
            .map_err(backend("Failed to iterate entries"))?;
        for entry in iter {
            let (key, value) = entry.map_err(backend("Failed to read entry"))?;
            let record: CacheRecord = bincode::deserialize(value.value())
                .map_err(|e| CacheError::Encoding(e.to_string()))?;
            results.push(StoredEntry {
                key: key.value().to_string(),
                value: record.value,
                stored_at: record.stored_at,
                expires_at: record.expires_at,
            });
        }
        Ok(results)
    }

    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        let now = self.now();
        let entries = self.entries()?;
        let expired = entries.iter().filter(|e| e.is_expired(now)).count();

        Ok(CacheStats {
            total_entries: entries.len(),
            live_entries: entries.len() - expired,
            expired_entries: expired,
            total_bytes: entries.iter().map(|e| e.value.len()).sum(),
        })
    }

    /// Delete every expired entry. Returns the number removed.
    pub fn prune_expired(&self) -> Result<usize, CacheError> {
        let now = self.now();
        let expired: Vec<String> = self
            .entries()?
            .into_iter()
            .filter(|e| e.is_expired(now))
            .map(|e| e.key)
            .collect();

        let mut deleted = 0;
        for key in &expired {
            if self.delete_blocking(key)? {
                deleted += 1;
            }
        }

        if deleted > 0 {
            info!("Pruned {} expired cache entries", deleted);
        }
        Ok(deleted)
    }
}

async fn off_thread<T, F>(cache: &RedbCache, op: F) -> Result<T, CacheError>
where
    T: Send + 'static,
    F: FnOnce(RedbCache) -> Result<T, CacheError> + Send + 'static,
{
    let cache = cache.clone();
    tokio::task::spawn_blocking(move || op(cache))
        .await
        .map_err(backend("Cache task failed"))?
}

#[async_trait]
impl CacheStore for RedbCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let key = key.to_string();
        off_thread(self, move |cache| cache.get_blocking(&key)).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_secs: u64) -> Result<(), CacheError> {
        let key = key.to_string();
        off_thread(self, move |cache| cache.set_blocking(&key, value, ttl_secs)).await
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let key = key.to_string();
        off_thread(self, move |cache| cache.delete_blocking(&key)).await
    }

    fn backend_name(&self) -> &'static str {
        "redb"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ManualClock;

    fn open_temp(clock: Arc<ManualClock>) -> (tempfile::TempDir, RedbCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = RedbCache::open_with_clock(&dir.path().join("cache.redb"), clock).unwrap();
        (dir, cache)
    }

    #[test]
    fn test_set_get_delete() {
        let (_dir, cache) = open_temp(Arc::new(ManualClock::new(1_000)));

        cache.set_blocking("user:a:data", b"payload".to_vec(), 60).unwrap();
        assert_eq!(cache.get_blocking("user:a:data").unwrap(), Some(b"payload".to_vec()));
        assert_eq!(cache.get_blocking("user:b:data").unwrap(), None);

        assert!(cache.delete_blocking("user:a:data").unwrap());
        assert!(!cache.delete_blocking("user:a:data").unwrap());
        assert_eq!(cache.get_blocking("user:a:data").unwrap(), None);
    }

    #[test]
    fn test_expiry_stats_and_prune() {
        let clock = Arc::new(ManualClock::new(1_000));
        let (_dir, cache) = open_temp(clock.clone());

        cache.set_blocking("short", vec![1, 2], 10).unwrap();
        cache.set_blocking("long", vec![3], 100).unwrap();

        clock.set(1_010);
        assert_eq!(cache.get_blocking("short").unwrap(), None);
        assert_eq!(cache.get_blocking("long").unwrap(), Some(vec![3]));

        let stats = cache.stats().unwrap();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.live_entries, 1);
        assert_eq!(stats.expired_entries, 1);
        assert_eq!(stats.total_bytes, 3);

        assert_eq!(cache.prune_expired().unwrap(), 1);
        let keys: Vec<String> = cache.entries().unwrap().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["long".to_string()]);
    }

    #[test]
    fn test_reopen_keeps_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.redb");
        let clock = Arc::new(ManualClock::new(5));

        {
            let cache = RedbCache::open_with_clock(&path, clock.clone()).unwrap();
            cache.set_blocking("k", vec![9], 60).unwrap();
        }

        let cache = RedbCache::open_with_clock(&path, clock).unwrap();
        assert_eq!(cache.path(), path.as_path());
        assert_eq!(cache.get_blocking("k").unwrap(), Some(vec![9]));
    }

    #[tokio::test]
    async fn test_async_store_interface() {
        let (_dir, cache) = open_temp(Arc::new(ManualClock::new(1)));
        let store: Arc<dyn CacheStore> = Arc::new(cache);

        store.set("k", vec![7], 60).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(vec![7]));
        assert!(store.delete("k").await.unwrap());
        assert_eq!(store.backend_name(), "redb");
    }
}
