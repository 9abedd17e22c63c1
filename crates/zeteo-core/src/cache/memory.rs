//! ============================================================================
//! Memory Cache - In-process TTL cache
//! ============================================================================
//! Keeps entries in a `RwLock<HashMap>` with an absolute expiry per entry and a
//! capacity bound; when full, the oldest entry is evicted first.
//! ============================================================================

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use super::{CacheError, CacheStore};

/// Maximum number of entries kept before evicting
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Horizon used when `now + ttl` is not representable
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone)]
struct CachedEntry {
    value: Vec<u8>,
    stored_at: Instant,
    expires_at: Instant,
}

/// In-process cache store
#[derive(Clone)]
pub struct MemoryCache {
    entries: Arc<RwLock<HashMap<String, CachedEntry>>>,
    max_entries: usize,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            max_entries: max_entries.max(1),
        }
    }

    /// Get cache statistics as (total, live)
    pub async fn stats(&self) -> (usize, usize) {
        let entries = self.entries.read().await;
        let now = Instant::now();
        let live = entries.values().filter(|e| e.expires_at > now).count();
        (entries.len(), live)
    }

    /// Drop every expired entry, returning how many were removed
    pub async fn prune_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }
}

fn expiry_after(now: Instant, ttl_secs: u64) -> Instant {
    now.checked_add(Duration::from_secs(ttl_secs))
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_secs: u64) -> Result<(), CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        if entries.len() >= self.max_entries && !entries.contains_key(key) {
            if let Some(oldest_key) = entries
                .iter()
                .min_by_key(|(_, e)| e.stored_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest_key);
                debug!("Evicted oldest cache entry {}", oldest_key);
            }
        }

        entries.insert(
            key.to_string(),
            CachedEntry {
                value,
                stored_at: now,
                expires_at: expiry_after(now, ttl_secs),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.entries.write().await.remove(key).is_some())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = MemoryCache::new();
        cache.set("k", b"v".to_vec(), 60).await.unwrap();

        assert_eq!(cache.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(cache.get("missing").await.unwrap(), None);
        assert!(cache.delete("k").await.unwrap());
        assert!(!cache.delete("k").await.unwrap());
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let cache = MemoryCache::new();
        cache.set("k", b"v".to_vec(), 10).await.unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(cache.get("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("k").await.unwrap().is_none());
        assert_eq!(cache.stats().await, (1, 0));
        assert_eq!(cache.prune_expired().await, 1);
        assert_eq!(cache.stats().await, (0, 0));
    }

    #[tokio::test]
    async fn test_huge_ttl_does_not_overflow() {
        let cache = MemoryCache::new();
        cache.set("k", b"v".to_vec(), u64::MAX).await.unwrap();

        assert_eq!(cache.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(cache.stats().await, (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_oldest() {
        let cache = MemoryCache::with_capacity(2);
        cache.set("a", vec![1], 60).await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.set("b", vec![2], 60).await.unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.set("c", vec![3], 60).await.unwrap();

        assert!(cache.get("a").await.unwrap().is_none());
        assert!(cache.get("b").await.unwrap().is_some());
        assert!(cache.get("c").await.unwrap().is_some());

        // Overwriting an existing key never evicts
        cache.set("c", vec![4], 60).await.unwrap();
        assert!(cache.get("b").await.unwrap().is_some());
        assert_eq!(cache.get("c").await.unwrap(), Some(vec![4]));
    }
}
