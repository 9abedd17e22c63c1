//! ============================================================================
//! Cache Module - Best-effort entitlement payload cache
//! ============================================================================
//! `CacheStore` is the raw key-value capability (`get` / `set` with TTL /
//! `delete`). `EntitlementCache` layers payload encoding and account keys on
//! top of an optional store: a missing store, a failing store and an empty
//! store all read as "nothing cached".
//!
//! ## Backends
//! - **RedbCache**: persistent embedded database (default for the service)
//! - **MemoryCache**: in-process map with TTL and a capacity bound
//! ============================================================================

mod memory;
mod redb_store;

pub use memory::{MemoryCache, DEFAULT_MAX_ENTRIES};
pub use redb_store::{CacheStats, RedbCache, StoredEntry};

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::types::{Address, EntitlementPayload};

/// Default payload time-to-live (24 hours)
pub const DEFAULT_TTL_SECS: u64 = 24 * 60 * 60;

/// Cache failures. Never fatal to a read.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("No cache store configured")]
    Disabled,

    #[error("Cache backend error: {0}")]
    Backend(String),

    #[error("Cache encoding error: {0}")]
    Encoding(String),
}

/// Raw key-value store with per-entry TTL
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl_secs: u64) -> Result<(), CacheError>;

    /// Returns whether an entry was removed
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    fn backend_name(&self) -> &'static str;
}

/// Account-keyed payload cache over an optional store
#[derive(Clone)]
pub struct EntitlementCache {
    store: Option<Arc<dyn CacheStore>>,
    ttl_secs: u64,
}

impl EntitlementCache {
    pub fn new(store: Arc<dyn CacheStore>, ttl_secs: u64) -> Self {
        Self::from_option(Some(store), ttl_secs)
    }

    /// Ledger-only mode
    pub fn disabled() -> Self {
        Self::from_option(None, DEFAULT_TTL_SECS)
    }

    pub fn from_option(store: Option<Arc<dyn CacheStore>>, ttl_secs: u64) -> Self {
        Self { store, ttl_secs }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs
    }

    pub fn backend_name(&self) -> &'static str {
        self.store.as_ref().map(|s| s.backend_name()).unwrap_or("none")
    }

    /// Cache key for an account. `Address` is already canonical, so writers
    /// and readers always agree.
    pub fn key_for(account: &Address) -> String {
        format!("user:{}:data", account)
    }

    /// Best-effort read. Absent store, backend failure and undecodable bytes
    /// are all a miss.
    pub async fn load(&self, account: &Address) -> Option<EntitlementPayload> {
        let bytes = match self.load_raw(account).await {
            Ok(bytes) => bytes?,
            Err(CacheError::Disabled) => return None,
            Err(e) => {
                warn!("Cache read failed for {}: {} - treating as miss", account.short(), e);
                return None;
            }
        };

        match serde_json::from_slice::<EntitlementPayload>(&bytes) {
            Ok(payload) if payload.account == *account => Some(payload),
            Ok(payload) => {
                warn!(
                    "Cache entry for {} holds payload for {} - ignoring",
                    account.short(),
                    payload.account.short()
                );
                None
            }
            Err(e) => {
                warn!("Undecodable cache entry for {}: {}", account.short(), e);
                None
            }
        }
    }

    /// Raw stored bytes for an account
    pub async fn load_raw(&self, account: &Address) -> Result<Option<Vec<u8>>, CacheError> {
        let store = self.store.as_ref().ok_or(CacheError::Disabled)?;
        store.get(&Self::key_for(account)).await
    }

    /// Best-effort write; returns whether the payload was stored
    pub async fn store(&self, payload: &EntitlementPayload) -> bool {
        match self.put(payload).await {
            Ok(()) => true,
            Err(CacheError::Disabled) => false,
            Err(e) => {
                warn!("Cache write failed for {}: {}", payload.account.short(), e);
                false
            }
        }
    }

    /// Strict write, for callers that retry on failure
    pub async fn put(&self, payload: &EntitlementPayload) -> Result<(), CacheError> {
        let store = self.store.as_ref().ok_or(CacheError::Disabled)?;
        let bytes =
            serde_json::to_vec(payload).map_err(|e| CacheError::Encoding(e.to_string()))?;

        store
            .set(&Self::key_for(&payload.account), bytes, self.ttl_secs)
            .await?;

        debug!(
            "Cached payload for {} (tier {}, {} offerings)",
            payload.account.short(),
            payload.tier.rank(),
            payload.offerings.len()
        );
        Ok(())
    }

    /// Remove an account's entry
    pub async fn evict(&self, account: &Address) -> Result<bool, CacheError> {
        let store = self.store.as_ref().ok_or(CacheError::Disabled)?;
        store.delete(&Self::key_for(account)).await
    }
}
