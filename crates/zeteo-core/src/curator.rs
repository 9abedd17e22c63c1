//! ============================================================================
//! Offering Curator - Tier-gated airdrop lists
//! ============================================================================
//! Builds the offering list served with an entitlement:
//! - one platform reward ("eligible") for any paid tier
//! - a tier-sized slice of suggested offerings from an `OfferingFeed`
//!
//! Every offering passes through the `DomainAllowlist` before it can reach a
//! payload. Feed failures and timeouts only empty the suggested slice.
//!
//! | Tier     | Suggested offerings |
//! |----------|---------------------|
//! | Basic    | 0 (feed not queried)|
//! | Standard | first 5 allowed     |
//! | Premium  | all allowed         |
//! ============================================================================

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::clock::Clock;
use crate::types::{
    Address, AirdropOffering, EntitlementPayload, OfferingKind, OfferingStatus, TierLevel,
    SECONDS_PER_DAY,
};

/// Lifetime of the platform reward offering
pub const ELIGIBLE_LIFETIME_SECS: u64 = 30 * SECONDS_PER_DAY;

/// Lifetime stamped onto offerings from the live feed
pub const FEED_LIFETIME_SECS: u64 = 90 * SECONDS_PER_DAY;

/// Records kept from the live feed
pub const FEED_RECORD_LIMIT: usize = 10;

pub const DEFAULT_FEED_URL: &str = "https://api.llama.fi/airdrops";

pub const DEFAULT_FEED_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_ALLOWED_DOMAINS: [&str; 9] = [
    "starknet.io",
    "optimism.io",
    "polygon.io",
    "base.org",
    "eigenlayer.xyz",
    "ether.fi",
    "zksync.io",
    "arbitrum.io",
    "scroll.io",
];

const FALLBACK_PROJECT_NAME: &str = "Unknown Project";
const FALLBACK_CLAIM_URL: &str = "https://defillama.com/airdrops";

// ============================================================================
// Domain Allowlist
// ============================================================================

/// Trusted claim hosts. A host matches an entry exactly or as a subdomain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainAllowlist {
    domains: Vec<String>,
}

impl Default for DomainAllowlist {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_DOMAINS)
    }
}

impl DomainAllowlist {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized: Vec<String> = domains
            .into_iter()
            .map(|d| d.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|d| !d.is_empty())
            .collect();
        normalized.dedup();
        Self { domains: normalized }
    }

    /// Parse a comma-separated list
    pub fn from_csv(csv: &str) -> Self {
        Self::new(csv.split(','))
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    pub fn is_allowed_host(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.domains.iter().any(|allowed| {
            host == *allowed
                || host
                    .strip_suffix(allowed.as_str())
                    .map_or(false, |prefix| prefix.ends_with('.'))
        })
    }

    /// Whether a claim URL may be shown. Unparseable URLs, non-web schemes and
    /// hostless URLs are rejected.
    pub fn permits(&self, claim_url: &str) -> bool {
        let Ok(url) = Url::parse(claim_url) else {
            return false;
        };
        if !matches!(url.scheme(), "http" | "https") {
            return false;
        }
        url.host_str().map_or(false, |host| self.is_allowed_host(host))
    }
}

// ============================================================================
// Offering Feeds
// ============================================================================

/// Source of suggested offerings
#[async_trait]
pub trait OfferingFeed: Send + Sync {
    /// Offerings available at `now`, in source order
    async fn fetch(&self, now: u64) -> Result<Vec<AirdropOffering>>;

    fn source_name(&self) -> &str;
}

/// One curated catalog entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: String,
    pub claim_url: String,
    pub amount: String,
    pub status: OfferingStatus,
    pub lifetime_secs: u64,
}

impl CatalogEntry {
    pub fn new(name: &str, claim_url: &str, amount: &str, status: OfferingStatus) -> Self {
        Self {
            name: name.to_string(),
            claim_url: claim_url.to_string(),
            amount: amount.to_string(),
            status,
            lifetime_secs: ELIGIBLE_LIFETIME_SECS,
        }
    }

    fn materialize(&self, now: u64) -> AirdropOffering {
        AirdropOffering {
            name: self.name.clone(),
            claim_url: self.claim_url.clone(),
            amount: self.amount.clone(),
            status: self.status,
            expiry: now.saturating_add(self.lifetime_secs),
            kind: OfferingKind::Suggested,
        }
    }
}

/// Fixed curated catalog
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    entries: Vec<CatalogEntry>,
}

impl StaticCatalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    /// Built-in curated list used when no live feed is configured
    pub fn curated() -> Self {
        use OfferingStatus::*;
        Self::new(vec![
            CatalogEntry::new("Early Supporter Drop", "https://starknet.io/claim", "500 ZET", Pending),
            CatalogEntry::new("Starknet Provisions", "https://provisions.starknet.io", "Check eligibility", Claimable),
            CatalogEntry::new("Scroll Sessions", "https://scroll.io/sessions", "Check eligibility", Potential),
            CatalogEntry::new("zkSync Ignite", "https://zksync.io/ignite", "Check eligibility", Potential),
            CatalogEntry::new("EigenLayer Season 2", "https://claims.eigenlayer.xyz", "Check eligibility", Pending),
            CatalogEntry::new("ether.fi Loyalty", "https://app.ether.fi/loyalty", "Check eligibility", Potential),
            CatalogEntry::new("Arbitrum Odyssey", "https://arbitrum.io/odyssey", "Check eligibility", Potential),
            CatalogEntry::new("Optimism Drop 6", "https://app.optimism.io/airdrops", "Check eligibility", Pending),
            CatalogEntry::new("Base Onchain Summer", "https://base.org/onchainsummer", "Check eligibility", Potential),
        ])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl OfferingFeed for StaticCatalog {
    async fn fetch(&self, now: u64) -> Result<Vec<AirdropOffering>> {
        Ok(self.entries.iter().map(|e| e.materialize(now)).collect())
    }

    fn source_name(&self) -> &str {
        "static"
    }
}

/// One record of the live airdrop feed
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedRecord {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Map raw feed records to offerings, keeping at most `FEED_RECORD_LIMIT`
pub fn map_feed_records(records: Vec<FeedRecord>, now: u64) -> Vec<AirdropOffering> {
    records
        .into_iter()
        .take(FEED_RECORD_LIMIT)
        .map(|record| AirdropOffering {
            name: record
                .project
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| FALLBACK_PROJECT_NAME.to_string()),
            claim_url: record
                .link
                .filter(|l| !l.is_empty())
                .unwrap_or_else(|| FALLBACK_CLAIM_URL.to_string()),
            amount: "Check eligibility".to_string(),
            status: if record.status.as_deref() == Some("active") {
                OfferingStatus::Claimable
            } else {
                OfferingStatus::Potential
            },
            expiry: now.saturating_add(FEED_LIFETIME_SECS),
            kind: OfferingKind::Suggested,
        })
        .collect()
}

/// Live airdrop feed over HTTP
pub struct HttpOfferingFeed {
    client: Client,
    url: String,
}

impl HttpOfferingFeed {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("Failed to build feed HTTP client: {}", e))?;

        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl OfferingFeed for HttpOfferingFeed {
    async fn fetch(&self, now: u64) -> Result<Vec<AirdropOffering>> {
        debug!("Fetching live offerings from {}", self.url);

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| anyhow!("Feed request failed: {}", e))?;

        if !response.status().is_success() {
            bail!("Feed returned HTTP {}", response.status());
        }

        let records: Vec<FeedRecord> = response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse feed response: {}", e))?;

        Ok(map_feed_records(records, now))
    }

    fn source_name(&self) -> &str {
        &self.url
    }
}

// ============================================================================
// Payload Builder
// ============================================================================

/// Derives an entitlement payload from ledger truth. Infallible: every
/// degraded source shrinks the offering list instead of failing.
#[async_trait]
pub trait PayloadBuilder: Send + Sync {
    async fn build(&self, account: &Address, tier: TierLevel, expiry: u64) -> EntitlementPayload;

    /// Whether a previously built payload may still be served as-is
    fn admits(&self, _payload: &EntitlementPayload) -> bool {
        true
    }
}

/// Platform reward shown to every paid tier
pub fn platform_reward(now: u64) -> AirdropOffering {
    AirdropOffering {
        name: "Zeteo Milestone #1".to_string(),
        claim_url: "https://starknet.io/claim".to_string(),
        amount: "1000 ZET".to_string(),
        status: OfferingStatus::Claimable,
        expiry: now.saturating_add(ELIGIBLE_LIFETIME_SECS),
        kind: OfferingKind::Eligible,
    }
}

/// Default `PayloadBuilder`
pub struct OfferingCurator {
    feed: Arc<dyn OfferingFeed>,
    allowlist: DomainAllowlist,
    clock: Arc<dyn Clock>,
    feed_timeout: Duration,
}

impl OfferingCurator {
    pub fn new(feed: Arc<dyn OfferingFeed>, allowlist: DomainAllowlist, clock: Arc<dyn Clock>) -> Self {
        Self {
            feed,
            allowlist,
            clock,
            feed_timeout: DEFAULT_FEED_TIMEOUT,
        }
    }

    pub fn with_feed_timeout(mut self, timeout: Duration) -> Self {
        self.feed_timeout = timeout;
        self
    }

    pub fn allowlist(&self) -> &DomainAllowlist {
        &self.allowlist
    }

    fn allowed(&self, offering: &AirdropOffering) -> bool {
        let ok = self.allowlist.permits(&offering.claim_url);
        if !ok {
            debug!("Dropping offering {} ({}): domain not allowed", offering.name, offering.claim_url);
        }
        ok
    }

    async fn suggested(&self, tier: TierLevel, now: u64) -> Vec<AirdropOffering> {
        let limit = tier.suggested_limit();
        if limit == Some(0) {
            return Vec::new();
        }

        let fetched = match tokio::time::timeout(self.feed_timeout, self.feed.fetch(now)).await {
            Ok(Ok(offerings)) => offerings,
            Ok(Err(e)) => {
                warn!("Offering feed {} failed: {} - no suggestions", self.feed.source_name(), e);
                return Vec::new();
            }
            Err(_) => {
                warn!(
                    "Offering feed {} timed out after {:?} - no suggestions",
                    self.feed.source_name(),
                    self.feed_timeout
                );
                return Vec::new();
            }
        };

        let allowed = fetched
            .into_iter()
            .filter(|o| self.allowed(o))
            .map(|mut o| {
                o.kind = OfferingKind::Suggested;
                o
            });

        match limit {
            Some(n) => allowed.take(n).collect(),
            None => allowed.collect(),
        }
    }
}

#[async_trait]
impl PayloadBuilder for OfferingCurator {
    async fn build(&self, account: &Address, tier: TierLevel, expiry: u64) -> EntitlementPayload {
        let now = self.clock.now();
        let mut offerings = Vec::new();

        if tier.is_paid() {
            let reward = platform_reward(now);
            if self.allowed(&reward) {
                offerings.push(reward);
            }
            offerings.extend(self.suggested(tier, now).await);
        }

        debug!(
            "Built payload for {}: tier {}, {} offerings",
            account.short(),
            tier.display_name(),
            offerings.len()
        );

        EntitlementPayload {
            account: account.clone(),
            tier,
            expiry,
            offerings,
            last_updated: now,
        }
    }

    /// Every offering must pass the current allowlist
    fn admits(&self, payload: &EntitlementPayload) -> bool {
        payload.offerings.iter().all(|o| self.allowlist.permits(&o.claim_url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const NOW: u64 = 1_700_000_000;

    fn account() -> Address {
        Address::parse("0x123").unwrap()
    }

    fn catalog(urls: &[&str]) -> StaticCatalog {
        StaticCatalog::new(
            urls.iter()
                .enumerate()
                .map(|(i, url)| CatalogEntry::new(&format!("Drop {}", i), url, "1", OfferingStatus::Potential))
                .collect(),
        )
    }

    fn curator(feed: Arc<dyn OfferingFeed>) -> OfferingCurator {
        OfferingCurator::new(feed, DomainAllowlist::default(), Arc::new(ManualClock::new(NOW)))
    }

    struct FailingFeed;

    #[async_trait]
    impl OfferingFeed for FailingFeed {
        async fn fetch(&self, _now: u64) -> Result<Vec<AirdropOffering>> {
            bail!("HTTP 503")
        }

        fn source_name(&self) -> &str {
            "failing"
        }
    }

    struct HangingFeed;

    #[async_trait]
    impl OfferingFeed for HangingFeed {
        async fn fetch(&self, _now: u64) -> Result<Vec<AirdropOffering>> {
            std::future::pending().await
        }

        fn source_name(&self) -> &str {
            "hanging"
        }
    }

    struct CountingFeed {
        inner: StaticCatalog,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OfferingFeed for CountingFeed {
        async fn fetch(&self, now: u64) -> Result<Vec<AirdropOffering>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.fetch(now).await
        }

        fn source_name(&self) -> &str {
            "counting"
        }
    }

    #[test]
    fn test_allowlist_matching() {
        let allowlist = DomainAllowlist::default();

        assert!(allowlist.permits("https://starknet.io/claim"));
        assert!(allowlist.permits("https://sub.starknet.io/x"));
        assert!(allowlist.permits("https://A.B.Scroll.IO/"));
        assert!(allowlist.permits("http://base.org"));

        assert!(!allowlist.permits("https://evil.example.com/claim"));
        assert!(!allowlist.permits("https://evilstarknet.io/claim"));
        assert!(!allowlist.permits("https://starknet.io.evil.com/claim"));
        assert!(!allowlist.permits("javascript:alert(1)"));
        assert!(!allowlist.permits("not a url"));
        assert!(!allowlist.permits(""));
    }

    #[test]
    fn test_allowlist_from_csv() {
        let allowlist = DomainAllowlist::from_csv(" Example.org, .foo.dev ,,");
        assert_eq!(allowlist.domains(), ["example.org".to_string(), "foo.dev".to_string()]);
        assert!(allowlist.permits("https://x.foo.dev"));
        assert!(!allowlist.permits("https://starknet.io"));
    }

    #[test]
    fn test_feed_record_mapping() {
        let records: Vec<FeedRecord> = serde_json::from_value(serde_json::json!([
            {"project": "Scroll", "link": "https://scroll.io/drop", "status": "active", "extra": 1},
            {"project": "", "status": "ended"},
            {}
        ]))
        .unwrap();

        let offerings = map_feed_records(records, NOW);
        assert_eq!(offerings.len(), 3);
        assert_eq!(offerings[0].name, "Scroll");
        assert_eq!(offerings[0].status, OfferingStatus::Claimable);
        assert_eq!(offerings[0].expiry, NOW + FEED_LIFETIME_SECS);
        assert_eq!(offerings[1].name, FALLBACK_PROJECT_NAME);
        assert_eq!(offerings[1].claim_url, FALLBACK_CLAIM_URL);
        assert_eq!(offerings[1].status, OfferingStatus::Potential);
        assert!(offerings.iter().all(|o| o.kind == OfferingKind::Suggested));
    }

    #[test]
    fn test_feed_record_cap() {
        let records = vec![FeedRecord::default(); 25];
        assert_eq!(map_feed_records(records, NOW).len(), FEED_RECORD_LIMIT);
    }

    #[tokio::test]
    async fn test_domain_filtering() {
        let feed = catalog(&[
            "https://evil.example.com/claim",
            "https://sub.starknet.io/claim",
            "ftp://starknet.io/file",
        ]);
        let payload = curator(Arc::new(feed)).build(&account(), TierLevel::Premium, NOW + 10).await;

        let urls: Vec<&str> = payload.offerings.iter().map(|o| o.claim_url.as_str()).collect();
        assert!(!urls.iter().any(|u| u.contains("evil.example.com")));
        assert!(urls.contains(&"https://sub.starknet.io/claim"));
        assert!(!urls.contains(&"ftp://starknet.io/file"));
    }

    #[tokio::test]
    async fn test_tier_gated_quantity() {
        let urls: Vec<String> = (0..8).map(|i| format!("https://p{}.starknet.io", i)).collect();
        let refs: Vec<&str> = urls.iter().map(String::as_str).collect();
        let curator = curator(Arc::new(catalog(&refs)));

        let basic = curator.build(&account(), TierLevel::Basic, NOW + 1).await;
        let standard = curator.build(&account(), TierLevel::Standard, NOW + 1).await;
        let premium = curator.build(&account(), TierLevel::Premium, NOW + 1).await;

        for payload in [&basic, &standard, &premium] {
            assert_eq!(payload.count_kind(OfferingKind::Eligible), 1);
        }
        assert_eq!(basic.count_kind(OfferingKind::Suggested), 0);
        assert_eq!(standard.count_kind(OfferingKind::Suggested), 5);
        assert_eq!(premium.count_kind(OfferingKind::Suggested), 8);
    }

    #[tokio::test]
    async fn test_slice_taken_after_filtering() {
        let mut urls = vec!["https://evil.example.com".to_string(); 4];
        urls.extend((0..5).map(|i| format!("https://p{}.base.org", i)));
        let refs: Vec<&str> = urls.iter().map(String::as_str).collect();

        let payload = curator(Arc::new(catalog(&refs)))
            .build(&account(), TierLevel::Standard, NOW + 1)
            .await;
        assert_eq!(payload.count_kind(OfferingKind::Suggested), 5);
    }

    #[tokio::test]
    async fn test_payload_shape_and_order() {
        let payload = curator(Arc::new(catalog(&["https://a.starknet.io", "https://b.starknet.io"])))
            .build(&account(), TierLevel::Premium, NOW + 99)
            .await;

        assert_eq!(payload.account, account());
        assert_eq!(payload.tier, TierLevel::Premium);
        assert_eq!(payload.expiry, NOW + 99);
        assert_eq!(payload.last_updated, NOW);

        let eligible = &payload.offerings[0];
        assert_eq!(eligible.kind, OfferingKind::Eligible);
        assert_eq!(eligible.status, OfferingStatus::Claimable);
        assert_eq!(eligible.expiry, NOW + ELIGIBLE_LIFETIME_SECS);

        let names: Vec<&str> = payload.offerings[1..].iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, ["Drop 0", "Drop 1"]);
    }

    #[tokio::test]
    async fn test_basic_tier_skips_feed() {
        let feed = Arc::new(CountingFeed {
            inner: catalog(&["https://a.starknet.io"]),
            calls: AtomicUsize::new(0),
        });
        let curator = curator(feed.clone());

        curator.build(&account(), TierLevel::Basic, NOW + 1).await;
        assert_eq!(feed.calls.load(Ordering::SeqCst), 0);

        curator.build(&account(), TierLevel::Standard, NOW + 1).await;
        assert_eq!(feed.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_tier_yields_no_offerings() {
        let payload = curator(Arc::new(StaticCatalog::curated()))
            .build(&account(), TierLevel::None, 0)
            .await;
        assert!(payload.offerings.is_empty());
    }

    #[tokio::test]
    async fn test_feed_failure_degrades_to_eligible_only() {
        let payload = curator(Arc::new(FailingFeed))
            .build(&account(), TierLevel::Premium, NOW + 1)
            .await;
        assert_eq!(payload.offerings.len(), 1);
        assert_eq!(payload.offerings[0].kind, OfferingKind::Eligible);
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_timeout_degrades_to_eligible_only() {
        let curator = curator(Arc::new(HangingFeed)).with_feed_timeout(Duration::from_millis(250));

        let start = tokio::time::Instant::now();
        let payload = curator.build(&account(), TierLevel::Standard, NOW + 1).await;

        assert_eq!(start.elapsed(), Duration::from_millis(250));
        assert_eq!(payload.count_kind(OfferingKind::Suggested), 0);
        assert_eq!(payload.count_kind(OfferingKind::Eligible), 1);
    }

    #[tokio::test]
    async fn test_curated_catalog_is_fully_allowed() {
        let catalog = StaticCatalog::curated();
        let total = catalog.len();
        let payload = curator(Arc::new(catalog))
            .build(&account(), TierLevel::Premium, NOW + 1)
            .await;
        assert_eq!(payload.count_kind(OfferingKind::Suggested), total);
    }

    #[tokio::test]
    async fn test_admits_rechecks_current_allowlist() {
        let built = curator(Arc::new(catalog(&["https://a.starknet.io"])))
            .build(&account(), TierLevel::Premium, NOW + 1)
            .await;
        assert!(curator(Arc::new(StaticCatalog::default())).admits(&built));

        // Same payload after the operator drops starknet.io
        let narrowed = OfferingCurator::new(
            Arc::new(StaticCatalog::default()),
            DomainAllowlist::new(["base.org"]),
            Arc::new(ManualClock::new(NOW)),
        );
        assert!(!narrowed.admits(&built));

        let mut tampered = built.clone();
        tampered.offerings[1].claim_url = "https://evil.example.com/claim".to_string();
        assert!(!curator(Arc::new(StaticCatalog::default())).admits(&tampered));
    }
}
