//! ============================================================================
//! Core Types for Zeteo Entitlements
//! ============================================================================
//! Defines subscription tiers, ledger records, airdrop offerings and the
//! cached/served entitlement payload. Payloads are serialized to JSON both for
//! the cache and for the read-path API.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Seconds in one day
pub const SECONDS_PER_DAY: u64 = 86_400;

/// Number of suggested offerings unlocked by the Standard tier
pub const STANDARD_SUGGESTED_LIMIT: usize = 5;

/// Maximum hex digits in a ledger address (one field element)
const ADDRESS_HEX_DIGITS: usize = 64;

// ============================================================================
// Address
// ============================================================================

/// Errors raised while parsing an account or contract address
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("Address is empty")]
    Empty,

    #[error("Address has {0} hex digits, maximum is 64")]
    TooLong(usize),

    #[error("Address contains non-hex characters: {0}")]
    InvalidHex(String),
}

/// Ledger address in canonical form: `0x` + 64 lower-case hex digits.
///
/// Every cache writer and reader goes through this type, so an address typed
/// in any case, with or without leading zeros, maps to exactly one cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    /// Parse and canonicalize an address
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let trimmed = input.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);

        if digits.is_empty() {
            return Err(AddressError::Empty);
        }
        if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AddressError::InvalidHex(input.to_string()));
        }

        let significant = digits.trim_start_matches('0');
        if significant.len() > ADDRESS_HEX_DIGITS {
            return Err(AddressError::TooLong(significant.len()));
        }

        Ok(Self(format!(
            "0x{:0>width$}",
            significant.to_ascii_lowercase(),
            width = ADDRESS_HEX_DIGITS
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shortened form for log lines (`0x0000…abcd`)
    pub fn short(&self) -> String {
        format!("{}…{}", &self.0[..6], &self.0[self.0.len() - 4..])
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Subscription Tiers
// ============================================================================

/// Subscription tiers as stored by the contract (`u8` on chain)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(into = "u8", try_from = "u8")]
pub enum TierLevel {
    /// No subscription
    #[default]
    None,
    /// Basic plan - eligible offering only
    Basic,
    /// Standard plan - eligible offering plus a short curated slice
    Standard,
    /// Premium plan - every available offering
    Premium,
}

impl TierLevel {
    /// Map the raw on-chain value to a tier. Unknown values are rejected rather
    /// than rounded to a paid tier.
    pub fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            0 => Some(TierLevel::None),
            1 => Some(TierLevel::Basic),
            2 => Some(TierLevel::Standard),
            3 => Some(TierLevel::Premium),
            _ => None,
        }
    }

    /// Get the numeric rank (also the on-chain value)
    pub fn rank(&self) -> u8 {
        match self {
            TierLevel::None => 0,
            TierLevel::Basic => 1,
            TierLevel::Standard => 2,
            TierLevel::Premium => 3,
        }
    }

    /// Maximum number of suggested offerings for this tier.
    /// `None` means every available offering.
    pub fn suggested_limit(&self) -> Option<usize> {
        match self {
            TierLevel::None | TierLevel::Basic => Some(0),
            TierLevel::Standard => Some(STANDARD_SUGGESTED_LIMIT),
            TierLevel::Premium => None,
        }
    }

    /// Whether this tier is a paid plan
    pub fn is_paid(&self) -> bool {
        *self != TierLevel::None
    }

    /// Get human-readable tier name
    pub fn display_name(&self) -> &'static str {
        match self {
            TierLevel::None => "No Subscription",
            TierLevel::Basic => "Basic",
            TierLevel::Standard => "Standard",
            TierLevel::Premium => "Premium",
        }
    }
}

impl From<TierLevel> for u8 {
    fn from(tier: TierLevel) -> Self {
        tier.rank()
    }
}

impl TryFrom<u8> for TierLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        TierLevel::from_raw(value as u64).ok_or_else(|| format!("Unknown tier: {}", value))
    }
}

impl PartialOrd for TierLevel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TierLevel {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

// ============================================================================
// Ledger Record
// ============================================================================

/// Entitlement as read from the ledger. Never mutated, only re-read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub account: Address,
    pub tier: TierLevel,
    /// Unix timestamp (seconds) at which the subscription lapses
    pub expiry: u64,
}

impl SubscriptionRecord {
    /// The "no entitlement" record
    pub fn none(account: Address) -> Self {
        Self {
            account,
            tier: TierLevel::None,
            expiry: 0,
        }
    }

    /// Whether the record grants access at `now`
    pub fn is_active(&self, now: u64) -> bool {
        self.tier.is_paid() && self.expiry > now
    }
}

// ============================================================================
// Offerings & Payload
// ============================================================================

/// Claim status shown next to an offering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OfferingStatus {
    Claimable,
    Pending,
    Potential,
}

/// Where an offering comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfferingKind {
    /// Platform reward, unconditional for any active tier
    Eligible,
    /// Tier-gated slice of the curated or live catalog
    Suggested,
}

/// A single airdrop offering
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AirdropOffering {
    pub name: String,
    pub claim_url: String,
    /// Display amount, never parsed numerically
    pub amount: String,
    pub status: OfferingStatus,
    pub expiry: u64,
    pub kind: OfferingKind,
}

/// Derived artifact that is cached and served for an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementPayload {
    pub account: Address,
    pub tier: TierLevel,
    pub expiry: u64,
    pub offerings: Vec<AirdropOffering>,
    pub last_updated: u64,
}

impl EntitlementPayload {
    /// Whether this payload was derived from the same `(tier, expiry)` the
    /// ledger currently reports
    pub fn matches(&self, record: &SubscriptionRecord) -> bool {
        self.tier == record.tier && self.expiry == record.expiry
    }

    /// Count offerings of the given kind
    pub fn count_kind(&self, kind: OfferingKind) -> usize {
        self.offerings.iter().filter(|o| o.kind == kind).count()
    }
}

// ============================================================================
// Read-Path Errors
// ============================================================================

/// Non-success outcomes of resolving an account's entitlement
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntitlementError {
    #[error("No active subscription found for this address")]
    NoSubscription,

    #[error("Subscription contract unreachable: {0}")]
    OracleUnavailable(String),
}

impl EntitlementError {
    /// Stable machine-readable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            EntitlementError::NoSubscription => "NO_SUBSCRIPTION",
            EntitlementError::OracleUnavailable(_) => "CONTRACT_ERROR",
        }
    }
}
