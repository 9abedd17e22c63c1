//! In-memory fakes for the ledger, cache store, payload builder and clock.
//! Compiled for unit tests and for downstream crates enabling `test-util`.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::cache::{CacheError, CacheStore};
use crate::chain::{EventFilter, LedgerEvent, LedgerRpc, RpcError};
use crate::clock::Clock;
use crate::curator::PayloadBuilder;
use crate::types::{
    Address, AirdropOffering, EntitlementPayload, OfferingKind, OfferingStatus, TierLevel,
};

// ============================================================================
// Ledger
// ============================================================================

#[derive(Default)]
struct LedgerState {
    head: u64,
    subscriptions: HashMap<Address, Value>,
    events: Vec<LedgerEvent>,
    failures: VecDeque<RpcError>,
    block_number_calls: usize,
    call_view_calls: usize,
    event_queries: Vec<(u64, u64)>,
}

/// Scriptable ledger. Queued failures are consumed by the next call of any
/// method.
#[derive(Default)]
pub struct FakeLedger {
    state: Mutex<LedgerState>,
}

impl FakeLedger {
    pub fn new(head: u64) -> Self {
        let ledger = Self::default();
        ledger.lock().head = head;
        ledger
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_head(&self, head: u64) {
        self.lock().head = head;
    }

    /// Raw contract response for `get_subscription(account)`
    pub fn set_subscription(&self, account: &Address, raw: Value) {
        self.lock().subscriptions.insert(account.clone(), raw);
    }

    pub fn push_event(&self, event: LedgerEvent) {
        self.lock().events.push(event);
    }

    pub fn fail_next(&self, error: RpcError) {
        self.lock().failures.push_back(error);
    }

    pub fn block_number_calls(&self) -> usize {
        self.lock().block_number_calls
    }

    pub fn call_view_calls(&self) -> usize {
        self.lock().call_view_calls
    }

    /// Inclusive block ranges passed to `get_events`, in call order
    pub fn event_queries(&self) -> Vec<(u64, u64)> {
        self.lock().event_queries.clone()
    }
}

#[async_trait]
impl LedgerRpc for FakeLedger {
    async fn block_number(&self) -> Result<u64, RpcError> {
        let mut state = self.lock();
        state.block_number_calls += 1;
        match state.failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(state.head),
        }
    }

    async fn call_view(
        &self,
        _contract: &Address,
        _entry_point: &str,
        calldata: &[String],
    ) -> Result<Value, RpcError> {
        let mut state = self.lock();
        state.call_view_calls += 1;
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }

        let account = calldata
            .first()
            .and_then(|raw| Address::parse(raw).ok())
            .ok_or_else(|| RpcError::Rpc {
                code: 40,
                message: "missing account calldata".into(),
            })?;

        Ok(state
            .subscriptions
            .get(&account)
            .cloned()
            .unwrap_or_else(|| json!(["0x0", "0x0"])))
    }

    async fn get_events(&self, filter: &EventFilter) -> Result<Vec<LedgerEvent>, RpcError> {
        let mut state = self.lock();
        state.event_queries.push((filter.from_block, filter.to_block));
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }

        Ok(state
            .events
            .iter()
            .filter(|event| {
                let block = event.block_number.unwrap_or(0);
                block >= filter.from_block && block <= filter.to_block
            })
            .filter(|event| {
                filter.keys.is_empty()
                    || event.keys.first().map_or(false, |k| filter.keys.contains(k))
            })
            .cloned()
            .collect())
    }
}

/// A `NewSubscription`-shaped event: keys `[selector, account]`,
/// data `[tier, expiry, timestamp]`
pub fn subscription_event(
    selector: &str,
    account: &Address,
    tier: u64,
    expiry: u64,
    block: u64,
) -> LedgerEvent {
    LedgerEvent {
        from_address: None,
        keys: vec![selector.to_string(), account.to_string()],
        data: vec![
            format!("{:#x}", tier),
            format!("{:#x}", expiry),
            format!("{:#x}", block),
        ],
        block_number: Some(block),
        transaction_hash: Some(format!("{:#x}", block * 1_000)),
    }
}

// ============================================================================
// Cache
// ============================================================================

/// Cache store whose every operation fails
pub struct FailingCache;

#[async_trait]
impl CacheStore for FailingCache {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Err(CacheError::Backend("connection refused".into()))
    }

    async fn set(&self, _key: &str, _value: Vec<u8>, _ttl_secs: u64) -> Result<(), CacheError> {
        Err(CacheError::Backend("connection refused".into()))
    }

    async fn delete(&self, _key: &str) -> Result<bool, CacheError> {
        Err(CacheError::Backend("connection refused".into()))
    }

    fn backend_name(&self) -> &'static str {
        "failing"
    }
}

// ============================================================================
// Builders
// ============================================================================

/// Builder that must never run
pub struct PoisonBuilder;

#[async_trait]
impl PayloadBuilder for PoisonBuilder {
    async fn build(&self, account: &Address, tier: TierLevel, _expiry: u64) -> EntitlementPayload {
        panic!(
            "payload builder invoked for {} at tier {}",
            account,
            tier.rank()
        );
    }
}

/// Delegating builder that counts invocations
pub struct CountingBuilder {
    inner: Arc<dyn PayloadBuilder>,
    calls: AtomicUsize,
}

impl CountingBuilder {
    pub fn new(inner: Arc<dyn PayloadBuilder>) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PayloadBuilder for CountingBuilder {
    async fn build(&self, account: &Address, tier: TierLevel, expiry: u64) -> EntitlementPayload {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.build(account, tier, expiry).await
    }

    fn admits(&self, payload: &EntitlementPayload) -> bool {
        self.inner.admits(payload)
    }
}

/// Payload with a single eligible offering
pub fn sample_payload(account: &Address, tier: TierLevel, expiry: u64) -> EntitlementPayload {
    EntitlementPayload {
        account: account.clone(),
        tier,
        expiry,
        offerings: vec![AirdropOffering {
            name: "Cached Drop".into(),
            claim_url: "https://starknet.io/claim".into(),
            amount: "1 ZET".into(),
            status: OfferingStatus::Claimable,
            expiry: expiry + 1,
            kind: OfferingKind::Eligible,
        }],
        last_updated: 1,
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Settable clock
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now: u64) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
