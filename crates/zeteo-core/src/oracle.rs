//! ============================================================================
//! Subscription Oracle - On-chain entitlement reads
//! ============================================================================
//! Calls the contract's read-only `get_subscription(account)` and decodes the
//! response. The contract schema changed over time, so decoding walks a fixed
//! priority list of known encodings:
//!
//! 1. Named      `{ "tier": .., "expiry": .. }`
//! 2. Positional `[tier, expiry, ..]`
//! 3. Legacy     `expiry` alone (scalar or one-element array), tier = none
//!
//! Anything that matches none of them is treated as "no entitlement".
//! ============================================================================

use serde_json::Value;
use tracing::{debug, warn};

use crate::chain::{ChainClient, RpcError};
use crate::types::{Address, SubscriptionRecord, TierLevel};

/// Default contract view function
pub const DEFAULT_ENTRY_POINT: &str = "get_subscription";

/// Oracle failures that callers may need to tell apart from "no entitlement"
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OracleError {
    #[error("Subscription oracle unavailable: {0}")]
    Unavailable(#[from] RpcError),
}

/// Known response encodings, in decode priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEncoding {
    Named,
    Positional,
    LegacyScalar,
}

impl SubscriptionEncoding {
    pub const PRIORITY: [SubscriptionEncoding; 3] = [
        SubscriptionEncoding::Named,
        SubscriptionEncoding::Positional,
        SubscriptionEncoding::LegacyScalar,
    ];

    /// Decode `(tier, expiry)` if the raw response has this shape
    pub fn decode(&self, raw: &Value) -> Option<(TierLevel, u64)> {
        match self {
            SubscriptionEncoding::Named => {
                let fields = raw.as_object()?;
                let expiry = fields
                    .get("expiry")
                    .or_else(|| fields.get("expires_at"))
                    .and_then(parse_uint)?;
                let tier = match fields.get("tier") {
                    Some(value) => TierLevel::from_raw(parse_uint(value)?)?,
                    None => TierLevel::None,
                };
                Some((tier, expiry))
            }
            SubscriptionEncoding::Positional => {
                let items = raw.as_array()?;
                if items.len() < 2 {
                    return None;
                }
                let tier = TierLevel::from_raw(parse_uint(&items[0])?)?;
                let expiry = parse_uint(&items[1])?;
                Some((tier, expiry))
            }
            SubscriptionEncoding::LegacyScalar => {
                let value = match raw {
                    Value::Array(items) if items.len() == 1 => &items[0],
                    Value::Array(_) | Value::Object(_) => return None,
                    other => other,
                };
                Some((TierLevel::None, parse_uint(value)?))
            }
        }
    }
}

/// Parse an unsigned integer from a JSON number, decimal string, or hex felt
pub fn parse_uint(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => {
            let s = s.trim();
            if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                let hex = hex.trim_start_matches('0');
                if hex.is_empty() {
                    return Some(0);
                }
                u64::from_str_radix(hex, 16).ok()
            } else {
                s.parse::<u64>().ok()
            }
        }
        Value::Bool(_) | Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Decode a raw response using the first encoding that fits
pub fn decode_subscription(account: &Address, raw: &Value) -> Option<SubscriptionRecord> {
    SubscriptionEncoding::PRIORITY.iter().find_map(|encoding| {
        encoding.decode(raw).map(|(tier, expiry)| {
            debug!("Decoded subscription for {} as {:?}", account.short(), encoding);
            SubscriptionRecord {
                account: account.clone(),
                tier,
                expiry,
            }
        })
    })
}

/// Reads entitlement records from the subscription contract
pub struct SubscriptionOracle {
    chain: ChainClient,
    contract: Address,
    entry_point: String,
}

impl SubscriptionOracle {
    pub fn new(chain: ChainClient, contract: Address) -> Self {
        Self::with_entry_point(chain, contract, DEFAULT_ENTRY_POINT)
    }

    pub fn with_entry_point(chain: ChainClient, contract: Address, entry_point: &str) -> Self {
        Self {
            chain,
            contract,
            entry_point: entry_point.to_string(),
        }
    }

    pub fn contract(&self) -> &Address {
        &self.contract
    }

    /// Strict read: an unreachable ledger is an error, a malformed response is
    /// "no entitlement".
    pub async fn get_subscription(&self, account: &Address) -> Result<SubscriptionRecord, OracleError> {
        let calldata = [account.as_str().to_string()];
        let raw = self
            .chain
            .call_view(&self.contract, &self.entry_point, &calldata)
            .await?;

        Ok(decode_subscription(account, &raw).unwrap_or_else(|| {
            warn!(
                "Unrecognized subscription response for {}: {} - treating as no subscription",
                account.short(),
                raw
            );
            SubscriptionRecord::none(account.clone())
        }))
    }

    /// Lenient read: any failure is "no entitlement"
    pub async fn get_subscription_or_none(&self, account: &Address) -> SubscriptionRecord {
        match self.get_subscription(account).await {
            Ok(record) => record,
            Err(e) => {
                warn!("Get subscription failed for {}: {} - assuming none", account.short(), e);
                SubscriptionRecord::none(account.clone())
            }
        }
    }
}
