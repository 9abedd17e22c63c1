//! ============================================================================
//! Reconciliation Engine - Read path
//! ============================================================================
//! Resolves an account's entitlement payload:
//!
//! 1. Read the subscription from the ledger (always, before any cache lookup)
//! 2. No active entitlement -> `NoSubscription`, whatever the cache holds
//! 3. Cached payload with the same (tier, expiry) whose links all pass the
//!    current allowlist -> serve it untouched
//! 4. Otherwise rebuild, write back best-effort, serve the fresh payload
//!
//! The cache can only ever save a rebuild; it never decides what a caller is
//! entitled to.
//! ============================================================================

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::EntitlementCache;
use crate::clock::Clock;
use crate::curator::PayloadBuilder;
use crate::oracle::SubscriptionOracle;
use crate::types::{Address, EntitlementError, EntitlementPayload};

/// How a payload was produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Served from cache after ledger verification
    Cached(EntitlementPayload),
    /// Rebuilt from ledger truth; `stored` reports the write-back
    Rebuilt {
        payload: EntitlementPayload,
        stored: bool,
    },
}

impl Resolution {
    pub fn payload(&self) -> &EntitlementPayload {
        match self {
            Resolution::Cached(payload) | Resolution::Rebuilt { payload, .. } => payload,
        }
    }

    pub fn into_payload(self) -> EntitlementPayload {
        match self {
            Resolution::Cached(payload) | Resolution::Rebuilt { payload, .. } => payload,
        }
    }

    pub fn is_cache_hit(&self) -> bool {
        matches!(self, Resolution::Cached(_))
    }
}

/// Cache-aside read path with ledger-verified hits
pub struct ReconciliationEngine {
    oracle: Arc<SubscriptionOracle>,
    builder: Arc<dyn PayloadBuilder>,
    cache: EntitlementCache,
    clock: Arc<dyn Clock>,
}

impl ReconciliationEngine {
    pub fn new(
        oracle: Arc<SubscriptionOracle>,
        builder: Arc<dyn PayloadBuilder>,
        cache: EntitlementCache,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            oracle,
            builder,
            cache,
            clock,
        }
    }

    pub fn cache(&self) -> &EntitlementCache {
        &self.cache
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache.is_enabled()
    }

    pub async fn resolve(&self, account: &Address) -> Result<EntitlementPayload, EntitlementError> {
        self.resolve_detailed(account).await.map(Resolution::into_payload)
    }

    pub async fn resolve_detailed(&self, account: &Address) -> Result<Resolution, EntitlementError> {
        let record = self.oracle.get_subscription(account).await.map_err(|e| {
            warn!("Oracle unavailable for {}: {}", account.short(), e);
            EntitlementError::OracleUnavailable(e.to_string())
        })?;

        let now = self.clock.now();
        if !record.is_active(now) {
            debug!(
                "No active entitlement for {} (tier {}, expiry {})",
                account.short(),
                record.tier.rank(),
                record.expiry
            );
            return Err(EntitlementError::NoSubscription);
        }

        if let Some(cached) = self.cache.load(account).await {
            if !cached.matches(&record) {
                info!(
                    "Cached entitlement for {} is stale (tier {} -> {}, expiry {} -> {}), rebuilding",
                    account.short(),
                    cached.tier.rank(),
                    record.tier.rank(),
                    cached.expiry,
                    record.expiry
                );
            } else if !self.builder.admits(&cached) {
                warn!(
                    "Cached entitlement for {} links outside the allowlist, rebuilding",
                    account.short()
                );
            } else {
                debug!("Cache hit for {}", account.short());
                return Ok(Resolution::Cached(cached));
            }
        }

        let payload = self.builder.build(account, record.tier, record.expiry).await;
        let stored = self.cache.store(&payload).await;

        debug!(
            "Rebuilt entitlement for {} ({} offerings, cached: {})",
            account.short(),
            payload.offerings.len(),
            stored
        );
        Ok(Resolution::Rebuilt { payload, stored })
    }
}
