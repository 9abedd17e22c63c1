//! ============================================================================
//! ZETEO-CORE: Entitlement Sync & Cache Reconciliation
//! ============================================================================
//! This crate handles all backend logic for the Zeteo entitlement service:
//! - Resilient ledger RPC access with rate-limit backoff
//! - Subscription reads from the on-chain contract (multi-encoding decode)
//! - Tier-gated airdrop offering curation behind a domain allowlist
//! - Cache-aside read path verified against ledger truth on every request
//! - Background event indexer that pre-warms the entitlement cache
//! ============================================================================

pub mod cache;
pub mod chain;
pub mod clock;
pub mod config;
pub mod curator;
pub mod indexer;
pub mod oracle;
pub mod reconcile;
pub mod types;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// Re-export main types for convenience
pub use cache::{CacheError, CacheStore, EntitlementCache, MemoryCache, RedbCache};
pub use chain::{ChainClient, LedgerEvent, LedgerRpc, RetryConfig, RpcError, StarknetRpc};
pub use clock::{Clock, SystemClock};
pub use config::ServiceConfig;
pub use curator::{DomainAllowlist, HttpOfferingFeed, OfferingCurator, OfferingFeed, PayloadBuilder, StaticCatalog};
pub use indexer::{EventIndexer, IndexerConfig, IndexerError, PollResult};
pub use oracle::{OracleError, SubscriptionOracle};
pub use reconcile::{ReconciliationEngine, Resolution};
pub use types::*;
