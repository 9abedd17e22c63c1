//! ============================================================================
//! Service Configuration
//! ============================================================================
//! All settings come from environment variables (after `.env` is loaded by the
//! binary). Parsing goes through a lookup function so tests never touch the
//! process environment.
//!
//! In production the cache is only opened when `ZETEO_CACHE_PATH` is set
//! explicitly (or `ZETEO_CACHE_BACKEND=memory` is chosen); otherwise the
//! service runs ledger-only.
//! ============================================================================

use anyhow::{anyhow, bail, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::cache::{EntitlementCache, MemoryCache, RedbCache, DEFAULT_TTL_SECS};
use crate::chain::{ChainClient, RetryConfig, StarknetRpc};
use crate::clock::Clock;
use crate::curator::{
    DomainAllowlist, HttpOfferingFeed, OfferingCurator, OfferingFeed, StaticCatalog, DEFAULT_FEED_URL,
};
use crate::indexer::{IndexerConfig, DEFAULT_CHUNK_SIZE, DEFAULT_EVENT_NAME};
use crate::oracle::{SubscriptionOracle, DEFAULT_ENTRY_POINT};
use crate::types::Address;

pub const DEFAULT_RPC_URL: &str = "https://starknet-sepolia.g.alchemy.com/v2/demo";
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3000";

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "dev" | "development" | "local" | "test" => Ok(Environment::Development),
            "prod" | "production" => Ok(Environment::Production),
            other => bail!("Unknown environment: {}", other),
        }
    }
}

/// Cache store implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheBackend {
    /// Persistent embedded database
    #[default]
    Redb,
    /// In-process map, lost on restart
    Memory,
}

impl FromStr for CacheBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redb" | "disk" => Ok(CacheBackend::Redb),
            "memory" | "mem" => Ok(CacheBackend::Memory),
            other => bail!("Unknown cache backend: {}", other),
        }
    }
}

/// Where the cache lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLocation {
    /// Explicitly configured file
    Path(PathBuf),
    /// ~/.zeteo/cache.redb
    Default,
    /// Ledger-only mode
    Disabled,
}

/// Full service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub rpc_url: String,
    pub contract_address: Option<Address>,
    pub entry_point: String,
    pub event_name: String,
    pub environment: Environment,
    pub cache_backend: CacheBackend,
    pub cache_location: CacheLocation,
    pub cache_ttl_secs: u64,
    pub listen_addr: SocketAddr,
    pub poll_interval: Duration,
    pub event_chunk_size: u32,
    pub retry: RetryConfig,
    pub rpc_timeout: Duration,
    /// Live offerings feed; `None` serves the curated catalog
    pub feed_url: Option<String>,
    pub feed_timeout: Duration,
    pub allowlist: DomainAllowlist,
    pub indexer_enabled: bool,
}

fn non_empty<F>(lookup: &F, name: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match non_empty(lookup, name) {
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow!("Invalid value for {}: {:?} ({})", name, raw, e)),
        None => Ok(default),
    }
}

fn parse_flag<F>(lookup: &F, name: &str, default: bool) -> Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    match non_empty(lookup, name).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => bail!("Invalid value for {}: {:?} (expected true/false)", name, v),
        },
    }
}

impl ServiceConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from any variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let environment: Environment = parse_or(&lookup, "ZETEO_ENV", Environment::Development)?;

        let contract_address = non_empty(&lookup, "CONTRACT_ADDRESS")
            .map(|raw| {
                Address::parse(&raw).map_err(|e| anyhow!("Invalid value for CONTRACT_ADDRESS: {}", e))
            })
            .transpose()?;

        let cache_backend: CacheBackend = parse_or(&lookup, "ZETEO_CACHE_BACKEND", CacheBackend::Redb)?;

        let cache_location = match non_empty(&lookup, "ZETEO_CACHE_PATH") {
            Some(path) => CacheLocation::Path(PathBuf::from(path)),
            None if environment == Environment::Production && cache_backend == CacheBackend::Redb => {
                CacheLocation::Disabled
            }
            None => CacheLocation::Default,
        };

        let defaults = RetryConfig::default();
        let retry = RetryConfig {
            max_attempts: parse_or(&lookup, "RPC_MAX_ATTEMPTS", defaults.max_attempts)?,
            base_delay_ms: parse_or(&lookup, "RPC_BASE_DELAY_MS", defaults.base_delay_ms)?,
            max_delay_ms: parse_or(&lookup, "RPC_MAX_DELAY_MS", defaults.max_delay_ms)?,
            jitter: parse_flag(&lookup, "RPC_JITTER", defaults.jitter)?,
        };
        if retry.max_attempts == 0 {
            bail!("Invalid value for RPC_MAX_ATTEMPTS: must be at least 1");
        }

        // Explicitly empty disables the live feed
        let feed_url = match lookup("OFFERINGS_FEED_URL") {
            Some(raw) if raw.trim().is_empty() => None,
            Some(raw) => Some(raw.trim().to_string()),
            None => Some(DEFAULT_FEED_URL.to_string()),
        };

        let allowlist = match non_empty(&lookup, "ALLOWED_DOMAINS") {
            Some(csv) => DomainAllowlist::from_csv(&csv),
            None => DomainAllowlist::default(),
        };

        let event_chunk_size: u32 = parse_or(&lookup, "EVENT_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?;
        if event_chunk_size == 0 {
            bail!("Invalid value for EVENT_CHUNK_SIZE: must be at least 1");
        }

        Ok(Self {
            rpc_url: non_empty(&lookup, "RPC_URL").unwrap_or_else(|| DEFAULT_RPC_URL.to_string()),
            contract_address,
            entry_point: non_empty(&lookup, "SUBSCRIPTION_ENTRY_POINT")
                .unwrap_or_else(|| DEFAULT_ENTRY_POINT.to_string()),
            event_name: non_empty(&lookup, "SUBSCRIPTION_EVENT")
                .unwrap_or_else(|| DEFAULT_EVENT_NAME.to_string()),
            environment,
            cache_backend,
            cache_location,
            cache_ttl_secs: parse_or(&lookup, "CACHE_TTL_SECS", DEFAULT_TTL_SECS)?,
            listen_addr: parse_or(&lookup, "LISTEN_ADDR", SocketAddr::from(([0, 0, 0, 0], 3000)))?,
            poll_interval: Duration::from_secs(parse_or(&lookup, "POLL_INTERVAL_SECS", 10u64)?.max(1)),
            event_chunk_size,
            retry,
            rpc_timeout: Duration::from_millis(parse_or(&lookup, "RPC_TIMEOUT_MS", 10_000u64)?),
            feed_url,
            feed_timeout: Duration::from_millis(parse_or(&lookup, "FEED_TIMEOUT_MS", 5_000u64)?),
            allowlist,
            indexer_enabled: parse_flag(&lookup, "INDEXER_ENABLED", true)?,
        })
    }

    /// Subscription contract, required by anything that reads the ledger
    pub fn require_contract(&self) -> Result<&Address> {
        self.contract_address
            .as_ref()
            .ok_or_else(|| anyhow!("CONTRACT_ADDRESS is not set"))
    }

    // ========================================================================
    // Component Construction
    // ========================================================================

    pub fn chain_client(&self) -> Result<ChainClient> {
        let rpc = StarknetRpc::new(&self.rpc_url, self.rpc_timeout)?;
        Ok(ChainClient::with_config(Arc::new(rpc), self.retry.clone()))
    }

    pub fn oracle(&self, chain: ChainClient) -> Result<SubscriptionOracle> {
        let contract = self.require_contract()?.clone();
        Ok(SubscriptionOracle::with_entry_point(chain, contract, &self.entry_point))
    }

    pub fn offering_feed(&self) -> Result<Arc<dyn OfferingFeed>> {
        Ok(match &self.feed_url {
            Some(url) => Arc::new(HttpOfferingFeed::new(url, self.feed_timeout)?),
            None => Arc::new(StaticCatalog::curated()),
        })
    }

    pub fn curator(&self, clock: Arc<dyn Clock>) -> Result<OfferingCurator> {
        Ok(
            OfferingCurator::new(self.offering_feed()?, self.allowlist.clone(), clock)
                .with_feed_timeout(self.feed_timeout),
        )
    }

    pub fn indexer_config(&self) -> Result<IndexerConfig> {
        let mut config = IndexerConfig::new(self.require_contract()?.clone()).with_event_name(&self.event_name);
        config.poll_interval = self.poll_interval;
        config.chunk_size = self.event_chunk_size;
        Ok(config)
    }

    /// Open the configured cache. Failure to open falls back to ledger-only
    /// mode rather than refusing to serve.
    pub fn open_cache(&self) -> EntitlementCache {
        if self.cache_location == CacheLocation::Disabled {
            info!("No cache configured for {:?} - running ledger-only", self.environment);
            return EntitlementCache::disabled();
        }
        if self.cache_backend == CacheBackend::Memory {
            info!("Using in-process entitlement cache");
            return EntitlementCache::new(Arc::new(MemoryCache::new()), self.cache_ttl_secs);
        }

        let path = match &self.cache_location {
            CacheLocation::Disabled => return EntitlementCache::disabled(),
            CacheLocation::Path(path) => path.clone(),
            CacheLocation::Default => match RedbCache::default_path() {
                Ok(path) => path,
                Err(e) => {
                    warn!("Cannot resolve default cache path: {} - running ledger-only", e);
                    return EntitlementCache::disabled();
                }
            },
        };

        match RedbCache::open(&path) {
            Ok(cache) => EntitlementCache::new(Arc::new(cache), self.cache_ttl_secs),
            Err(e) => {
                warn!("Failed to open cache at {}: {} - running ledger-only", path.display(), e);
                EntitlementCache::disabled()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<ServiceConfig> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServiceConfig::from_lookup(move |name| map.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();

        assert_eq!(config.rpc_url, DEFAULT_RPC_URL);
        assert_eq!(config.contract_address, None);
        assert_eq!(config.entry_point, "get_subscription");
        assert_eq!(config.event_name, "NewSubscription");
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.cache_backend, CacheBackend::Redb);
        assert_eq!(config.cache_location, CacheLocation::Default);
        assert_eq!(config.cache_ttl_secs, 86_400);
        assert_eq!(config.listen_addr, DEFAULT_LISTEN_ADDR.parse().unwrap());
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.event_chunk_size, 100);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, 500);
        assert_eq!(config.feed_url.as_deref(), Some(DEFAULT_FEED_URL));
        assert_eq!(config.feed_timeout, Duration::from_secs(5));
        assert_eq!(config.allowlist, DomainAllowlist::default());
        assert!(config.indexer_enabled);
        assert!(config.require_contract().is_err());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("RPC_URL", "http://localhost:5050"),
            ("CONTRACT_ADDRESS", "0xABC"),
            ("ZETEO_CACHE_PATH", "/tmp/zeteo.redb"),
            ("CACHE_TTL_SECS", "60"),
            ("LISTEN_ADDR", "127.0.0.1:8080"),
            ("RPC_MAX_ATTEMPTS", "5"),
            ("OFFERINGS_FEED_URL", ""),
            ("ALLOWED_DOMAINS", "example.org"),
            ("INDEXER_ENABLED", "false"),
        ])
        .unwrap();

        assert_eq!(config.rpc_url, "http://localhost:5050");
        assert_eq!(config.require_contract().unwrap(), &Address::parse("0xabc").unwrap());
        assert_eq!(config.cache_location, CacheLocation::Path(PathBuf::from("/tmp/zeteo.redb")));
        assert_eq!(config.cache_ttl_secs, 60);
        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.feed_url, None);
        assert!(config.allowlist.permits("https://a.example.org"));
        assert!(!config.indexer_enabled);
    }

    #[test]
    fn test_production_without_cache_path_is_ledger_only() {
        let config = load(&[("ZETEO_ENV", "production")]).unwrap();
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.cache_location, CacheLocation::Disabled);
        assert!(!config.open_cache().is_enabled());

        let explicit = load(&[("ZETEO_ENV", "production"), ("ZETEO_CACHE_PATH", "/data/cache.redb")]).unwrap();
        assert_eq!(explicit.cache_location, CacheLocation::Path(PathBuf::from("/data/cache.redb")));
    }

    #[test]
    fn test_invalid_values_name_the_variable() {
        let err = load(&[("CACHE_TTL_SECS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("CACHE_TTL_SECS"));

        let err = load(&[("CONTRACT_ADDRESS", "0xnothex")]).unwrap_err();
        assert!(err.to_string().contains("CONTRACT_ADDRESS"));

        let err = load(&[("INDEXER_ENABLED", "maybe")]).unwrap_err();
        assert!(err.to_string().contains("INDEXER_ENABLED"));

        assert!(load(&[("RPC_MAX_ATTEMPTS", "0")]).is_err());
        assert!(load(&[("EVENT_CHUNK_SIZE", "0")]).is_err());
        assert!(load(&[("ZETEO_ENV", "staging")]).is_err());
        assert!(load(&[("ZETEO_CACHE_BACKEND", "redis")]).is_err());
    }

    #[test]
    fn test_explicit_cache_path_opens_redb() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.redb");
        let config = load(&[("ZETEO_CACHE_PATH", path.to_str().unwrap())]).unwrap();

        let cache = config.open_cache();
        assert!(cache.is_enabled());
        assert_eq!(cache.backend_name(), "redb");
        assert_eq!(cache.ttl_secs(), 86_400);
    }

    #[test]
    fn test_memory_backend_selection() {
        let config = load(&[("ZETEO_CACHE_BACKEND", "memory"), ("CACHE_TTL_SECS", "60")]).unwrap();
        assert_eq!(config.cache_backend, CacheBackend::Memory);

        let cache = config.open_cache();
        assert!(cache.is_enabled());
        assert_eq!(cache.backend_name(), "memory");
        assert_eq!(cache.ttl_secs(), 60);

        // Explicit memory backend is honored in production
        let prod = load(&[("ZETEO_ENV", "production"), ("ZETEO_CACHE_BACKEND", "memory")]).unwrap();
        assert_eq!(prod.open_cache().backend_name(), "memory");
    }

    #[test]
    fn test_indexer_config_follows_settings() {
        let config = load(&[
            ("CONTRACT_ADDRESS", "0x5ec"),
            ("POLL_INTERVAL_SECS", "3"),
            ("EVENT_CHUNK_SIZE", "25"),
            ("SUBSCRIPTION_EVENT", "SubscriptionChanged"),
        ])
        .unwrap();

        let indexer = config.indexer_config().unwrap();
        assert_eq!(indexer.poll_interval, Duration::from_secs(3));
        assert_eq!(indexer.chunk_size, 25);
        assert_eq!(
            indexer.event_selector,
            crate::chain::selector_from_name("SubscriptionChanged")
        );
    }
}
