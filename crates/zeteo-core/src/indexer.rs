//! ============================================================================
//! Event Indexer - Background cache pre-warming
//! ============================================================================
//! Polls the ledger for subscription events and rewrites the affected
//! accounts' cache entries, so the first read after a purchase is a cache hit.
//!
//! State is a single in-memory `last_seen_block`, seeded from the chain head
//! at start (no historical backfill). A tick advances it only after every
//! event in `(last_seen_block, head]` has been applied; a failed tick retries
//! the same range on the next interval.
//! ============================================================================

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheError, EntitlementCache};
use crate::chain::{selector_from_name, ChainClient, EventFilter, LedgerEvent, RpcError};
use crate::clock::Clock;
use crate::curator::PayloadBuilder;
use crate::oracle::parse_uint;
use crate::types::{Address, SubscriptionRecord, TierLevel};

pub const DEFAULT_EVENT_NAME: &str = "NewSubscription";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_CHUNK_SIZE: u32 = 100;

/// Indexer settings
#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub contract: Address,
    /// Selector of the subscription event (first event key)
    pub event_selector: String,
    pub poll_interval: Duration,
    pub chunk_size: u32,
}

impl IndexerConfig {
    pub fn new(contract: Address) -> Self {
        Self {
            contract,
            event_selector: selector_from_name(DEFAULT_EVENT_NAME),
            poll_interval: DEFAULT_POLL_INTERVAL,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_event_name(mut self, name: &str) -> Self {
        self.event_selector = selector_from_name(name);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IndexerError {
    #[error("Ledger query failed: {0}")]
    Rpc(#[from] RpcError),

    #[error("Cache update failed for {account}: {source}")]
    Cache { account: Address, source: CacheError },
}

/// Summary of one tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollResult {
    /// Inclusive block range scanned, if any
    pub range: Option<(u64, u64)>,
    pub events: usize,
    pub written: usize,
    pub evicted: usize,
    pub skipped: usize,
}

/// Decoded subscription event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionEvent {
    pub record: SubscriptionRecord,
    pub timestamp: Option<u64>,
}

fn felt(raw: &str) -> Option<u64> {
    parse_uint(&Value::String(raw.to_string()))
}

/// Decode `keys = [selector, account]`, `data = [tier, expiry, timestamp?]`
pub fn decode_event(event: &LedgerEvent) -> Option<SubscriptionEvent> {
    let account = Address::parse(event.keys.get(1)?).ok()?;
    let tier = TierLevel::from_raw(felt(event.data.first()?)?)?;
    let expiry = felt(event.data.get(1)?)?;
    let timestamp = event.data.get(2).and_then(|raw| felt(raw));

    Some(SubscriptionEvent {
        record: SubscriptionRecord {
            account,
            tier,
            expiry,
        },
        timestamp,
    })
}

/// Background subscription event poller
pub struct EventIndexer {
    chain: ChainClient,
    builder: Arc<dyn PayloadBuilder>,
    cache: EntitlementCache,
    clock: Arc<dyn Clock>,
    config: IndexerConfig,
    last_seen_block: Option<u64>,
}

impl EventIndexer {
    pub fn new(
        chain: ChainClient,
        builder: Arc<dyn PayloadBuilder>,
        cache: EntitlementCache,
        clock: Arc<dyn Clock>,
        config: IndexerConfig,
    ) -> Self {
        Self {
            chain,
            builder,
            cache,
            clock,
            config,
            last_seen_block: None,
        }
    }

    /// Start from a known block instead of the current head
    pub fn starting_at(mut self, block: u64) -> Self {
        self.last_seen_block = Some(block);
        self
    }

    pub fn last_seen_block(&self) -> Option<u64> {
        self.last_seen_block
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    /// Seed `last_seen_block` from the chain head
    pub async fn initialize(&mut self) -> Result<u64, IndexerError> {
        let head = self.chain.block_number().await?;
        self.last_seen_block = Some(head);
        info!("Event indexer starting from block {}", head);
        Ok(head)
    }

    /// Run a single tick
    pub async fn poll_once(&mut self) -> Result<PollResult, IndexerError> {
        let Some(last) = self.last_seen_block else {
            self.initialize().await?;
            return Ok(PollResult::default());
        };

        let head = self.chain.block_number().await?;
        if head <= last {
            return Ok(PollResult::default());
        }

        let filter = EventFilter {
            address: self.config.contract.clone(),
            keys: vec![self.config.event_selector.clone()],
            from_block: last + 1,
            to_block: head,
            chunk_size: self.config.chunk_size,
        };
        debug!("Checking blocks {} to {}", filter.from_block, filter.to_block);

        let events = self.chain.get_events(&filter).await?;
        let mut result = PollResult {
            range: Some((filter.from_block, filter.to_block)),
            events: events.len(),
            ..Default::default()
        };

        for event in &events {
            match decode_event(event) {
                Some(decoded) => self.apply(&decoded, &mut result).await?,
                None => {
                    warn!(
                        "Skipping malformed subscription event at block {:?}: keys={:?} data={:?}",
                        event.block_number, event.keys, event.data
                    );
                    result.skipped += 1;
                }
            }
        }

        self.last_seen_block = Some(head);
        Ok(result)
    }

    async fn apply(&self, event: &SubscriptionEvent, result: &mut PollResult) -> Result<(), IndexerError> {
        let record = &event.record;
        let now = self.clock.now();

        if record.is_active(now) {
            let payload = self.builder.build(&record.account, record.tier, record.expiry).await;
            match self.cache.put(&payload).await {
                Ok(()) | Err(CacheError::Disabled) => {}
                Err(source) => {
                    return Err(IndexerError::Cache {
                        account: record.account.clone(),
                        source,
                    })
                }
            }
            info!(
                "Processed subscription for {} (tier {}, {} offerings)",
                record.account.short(),
                record.tier.display_name(),
                payload.offerings.len()
            );
            result.written += 1;
        } else {
            match self.cache.evict(&record.account).await {
                Ok(_) | Err(CacheError::Disabled) => {}
                Err(source) => {
                    return Err(IndexerError::Cache {
                        account: record.account.clone(),
                        source,
                    })
                }
            }
            debug!("Event for {} grants no entitlement, evicted", record.account.short());
            result.evicted += 1;
        }
        Ok(())
    }

    /// Poll on a fixed interval until `shutdown` is cancelled
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Event indexer watching {} every {:?}",
            self.config.contract.short(),
            self.config.poll_interval
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Event indexer stopping at block {:?}", self.last_seen_block);
                    break;
                }
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(result) if result.events > 0 => info!(
                            "Indexed blocks {:?}: {} events, {} written, {} evicted, {} skipped",
                            result.range, result.events, result.written, result.evicted, result.skipped
                        ),
                        Ok(_) => {}
                        Err(e) => warn!("Error polling events (range will be retried): {}", e),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{MemoryCache, DEFAULT_TTL_SECS};
    use crate::chain::RetryConfig;
    use crate::curator::{DomainAllowlist, OfferingCurator, StaticCatalog};
    use crate::testing::{sample_payload, subscription_event, FailingCache, FakeLedger, ManualClock};
    use crate::types::SECONDS_PER_DAY;

    const NOW: u64 = 1_700_000_000;

    fn contract() -> Address {
        Address::parse("0x5ec").unwrap()
    }

    fn alice() -> Address {
        Address::parse("0xa11ce").unwrap()
    }

    fn selector() -> String {
        selector_from_name(DEFAULT_EVENT_NAME)
    }

    struct Fixture {
        ledger: Arc<FakeLedger>,
        clock: Arc<ManualClock>,
        cache: EntitlementCache,
    }

    impl Fixture {
        fn new(head: u64) -> Self {
            Self::with_cache(head, EntitlementCache::new(Arc::new(MemoryCache::new()), DEFAULT_TTL_SECS))
        }

        fn with_cache(head: u64, cache: EntitlementCache) -> Self {
            Self {
                ledger: Arc::new(FakeLedger::new(head)),
                clock: Arc::new(ManualClock::new(NOW)),
                cache,
            }
        }

        fn indexer(&self) -> EventIndexer {
            let curator = OfferingCurator::new(
                Arc::new(StaticCatalog::curated()),
                DomainAllowlist::default(),
                self.clock.clone(),
            );
            let chain = ChainClient::with_config(
                self.ledger.clone(),
                RetryConfig {
                    base_delay_ms: 10,
                    ..Default::default()
                },
            );
            EventIndexer::new(
                chain,
                Arc::new(curator),
                self.cache.clone(),
                self.clock.clone(),
                IndexerConfig::new(contract()),
            )
        }
    }

    #[test]
    fn test_decode_event() {
        let event = subscription_event(&selector(), &alice(), 2, NOW + 5, 7);
        let decoded = decode_event(&event).unwrap();
        assert_eq!(decoded.record.account, alice());
        assert_eq!(decoded.record.tier, TierLevel::Standard);
        assert_eq!(decoded.record.expiry, NOW + 5);
        assert_eq!(decoded.timestamp, Some(7));
    }

    #[test]
    fn test_decode_event_rejects_malformed() {
        let mut missing_account = subscription_event(&selector(), &alice(), 2, 5, 7);
        missing_account.keys.truncate(1);
        assert!(decode_event(&missing_account).is_none());

        let mut bad_tier = subscription_event(&selector(), &alice(), 2, 5, 7);
        bad_tier.data[0] = "0x9".into();
        assert!(decode_event(&bad_tier).is_none());

        let mut short_data = subscription_event(&selector(), &alice(), 2, 5, 7);
        short_data.data.truncate(1);
        assert!(decode_event(&short_data).is_none());

        let mut no_timestamp = subscription_event(&selector(), &alice(), 2, 5, 7);
        no_timestamp.data.truncate(2);
        assert_eq!(decode_event(&no_timestamp).unwrap().timestamp, None);
    }

    #[tokio::test]
    async fn test_first_poll_seeds_from_head() {
        let fx = Fixture::new(50);
        fx.ledger.push_event(subscription_event(&selector(), &alice(), 2, NOW + 1, 40));
        let mut indexer = fx.indexer();

        let result = indexer.poll_once().await.unwrap();
        assert_eq!(result, PollResult::default());
        assert_eq!(indexer.last_seen_block(), Some(50));
        // History before the head is never backfilled
        assert!(fx.ledger.event_queries().is_empty());
        assert!(fx.cache.load(&alice()).await.is_none());
    }

    #[tokio::test]
    async fn test_new_event_warms_cache() {
        let fx = Fixture::new(10);
        let mut indexer = fx.indexer();
        indexer.initialize().await.unwrap();

        fx.ledger.push_event(subscription_event(&selector(), &alice(), 2, NOW + SECONDS_PER_DAY, 12));
        fx.ledger.set_head(15);

        let result = indexer.poll_once().await.unwrap();
        assert_eq!(result.range, Some((11, 15)));
        assert_eq!((result.events, result.written), (1, 1));
        assert_eq!(indexer.last_seen_block(), Some(15));
        assert_eq!(fx.ledger.event_queries(), vec![(11, 15)]);

        let payload = fx.cache.load(&alice()).await.unwrap();
        assert_eq!(payload.tier, TierLevel::Standard);
        assert_eq!(payload.expiry, NOW + SECONDS_PER_DAY);

        // Nothing new: no query, no movement
        let idle = indexer.poll_once().await.unwrap();
        assert_eq!(idle, PollResult::default());
        assert_eq!(fx.ledger.event_queries().len(), 1);
    }

    #[tokio::test]
    async fn test_reprocessing_is_byte_identical() {
        let fx = Fixture::new(10);
        fx.ledger.push_event(subscription_event(&selector(), &alice(), 3, NOW + SECONDS_PER_DAY, 11));
        fx.ledger.set_head(11);

        let mut first = fx.indexer().starting_at(10);
        first.poll_once().await.unwrap();
        let once = fx.cache.load_raw(&alice()).await.unwrap().unwrap();

        let mut replay = fx.indexer().starting_at(10);
        replay.poll_once().await.unwrap();
        let twice = fx.cache.load_raw(&alice()).await.unwrap().unwrap();

        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn test_rpc_failure_keeps_range() {
        let fx = Fixture::new(20);
        fx.ledger.push_event(subscription_event(&selector(), &alice(), 1, NOW + SECONDS_PER_DAY, 21));
        fx.ledger.set_head(22);
        let mut indexer = fx.indexer().starting_at(20);

        // Next ledger call fails with a non rate-limit error
        fx.ledger.fail_next(RpcError::Rpc {
            code: 42,
            message: "unused".into(),
        });
        assert!(indexer.poll_once().await.is_err());
        assert_eq!(indexer.last_seen_block(), Some(20));

        let result = indexer.poll_once().await.unwrap();
        assert_eq!(result.range, Some((21, 22)));
        assert_eq!(result.written, 1);
        assert_eq!(indexer.last_seen_block(), Some(22));
    }

    #[tokio::test]
    async fn test_cache_failure_keeps_range() {
        let fx = Fixture::with_cache(30, EntitlementCache::new(Arc::new(FailingCache), DEFAULT_TTL_SECS));
        fx.ledger.push_event(subscription_event(&selector(), &alice(), 2, NOW + SECONDS_PER_DAY, 31));
        fx.ledger.set_head(31);
        let mut indexer = fx.indexer().starting_at(30);

        let err = indexer.poll_once().await.unwrap_err();
        assert!(matches!(err, IndexerError::Cache { .. }));
        assert_eq!(indexer.last_seen_block(), Some(30));
    }

    #[tokio::test]
    async fn test_malformed_event_is_skipped() {
        let fx = Fixture::new(0);
        let mut broken = subscription_event(&selector(), &alice(), 2, NOW + 1, 1);
        broken.keys.truncate(1);
        fx.ledger.push_event(broken);
        let bob = Address::parse("0xb0b").unwrap();
        fx.ledger.push_event(subscription_event(&selector(), &bob, 1, NOW + SECONDS_PER_DAY, 2));
        fx.ledger.set_head(2);
        let mut indexer = fx.indexer().starting_at(0);

        let result = indexer.poll_once().await.unwrap();
        assert_eq!((result.events, result.written, result.skipped), (2, 1, 1));
        assert_eq!(indexer.last_seen_block(), Some(2));
        assert!(fx.cache.load(&bob).await.is_some());
    }

    #[tokio::test]
    async fn test_lapsed_event_evicts() {
        let fx = Fixture::new(5);
        fx.cache
            .store(&sample_payload(&alice(), TierLevel::Premium, NOW + SECONDS_PER_DAY))
            .await;
        fx.ledger.push_event(subscription_event(&selector(), &alice(), 0, 0, 6));
        fx.ledger.set_head(6);
        let mut indexer = fx.indexer().starting_at(5);

        let result = indexer.poll_once().await.unwrap();
        assert_eq!((result.written, result.evicted), (0, 1));
        assert!(fx.cache.load(&alice()).await.is_none());
    }

    #[tokio::test]
    async fn test_other_events_are_ignored() {
        let fx = Fixture::new(0);
        fx.ledger.push_event(subscription_event(&selector_from_name("Transfer"), &alice(), 2, NOW + 1, 1));
        fx.ledger.set_head(1);
        let mut indexer = fx.indexer().starting_at(0);

        let result = indexer.poll_once().await.unwrap();
        assert_eq!(result.events, 0);
        assert!(fx.cache.load(&alice()).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let fx = Fixture::new(3);
        let indexer = fx.indexer();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(indexer.run(shutdown.clone()));

        tokio::time::sleep(DEFAULT_POLL_INTERVAL * 2).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert!(fx.ledger.block_number_calls() >= 2);
    }
}
