//! ============================================================================
//! Starknet JSON-RPC Adapter
//! ============================================================================
//! Minimal `LedgerRpc` implementation over HTTP JSON-RPC:
//! - starknet_blockNumber
//! - starknet_call (read-only, "latest" block)
//! - starknet_getEvents (follows continuation tokens)
//! ============================================================================

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use sha3::{Digest, Keccak256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use super::{EventFilter, LedgerEvent, LedgerRpc, RpcError};
use crate::types::Address;

/// Longest error body kept in an `RpcError`
const MAX_ERROR_BODY: usize = 256;

/// Compute the Starknet selector for an entry point or event name:
/// keccak256(name) truncated to 250 bits, as minimal hex.
pub fn selector_from_name(name: &str) -> String {
    let digest = Keccak256::digest(name.as_bytes());
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&digest);
    hash[0] &= 0x03;

    let encoded = hex::encode(hash);
    let trimmed = encoded.trim_start_matches('0');
    if trimmed.is_empty() {
        "0x0".to_string()
    } else {
        format!("0x{}", trimmed)
    }
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct EventsPage {
    events: Vec<LedgerEvent>,
    continuation_token: Option<String>,
}

/// Unwrap a JSON-RPC response body into its `result`
fn parse_response(status: u16, body: &str) -> Result<Value, RpcError> {
    if !(200..300).contains(&status) {
        return Err(RpcError::Http {
            status,
            message: body.chars().take(MAX_ERROR_BODY).collect(),
        });
    }

    let envelope: RpcEnvelope =
        serde_json::from_str(body).map_err(|e| RpcError::Decode(e.to_string()))?;

    if let Some(error) = envelope.error {
        return Err(RpcError::Rpc {
            code: error.code,
            message: error.message,
        });
    }

    envelope
        .result
        .ok_or_else(|| RpcError::Decode("response has neither result nor error".to_string()))
}

/// Starknet node client
pub struct StarknetRpc {
    client: Client,
    url: String,
    next_id: AtomicU64,
}

impl StarknetRpc {
    /// Create a client for the given node URL with a per-request timeout
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("Failed to build RPC HTTP client: {}", e))?;

        Ok(Self {
            client,
            url: url.to_string(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        debug!("RPC {} (id {})", method, id);

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        parse_response(status, &text)
    }
}

#[async_trait]
impl LedgerRpc for StarknetRpc {
    async fn block_number(&self) -> Result<u64, RpcError> {
        let result = self.request("starknet_blockNumber", json!([])).await?;
        result
            .as_u64()
            .ok_or_else(|| RpcError::Decode(format!("block number is not an integer: {}", result)))
    }

    async fn call_view(
        &self,
        contract: &Address,
        entry_point: &str,
        calldata: &[String],
    ) -> Result<Value, RpcError> {
        let params = json!({
            "request": {
                "contract_address": contract.as_str(),
                "entry_point_selector": selector_from_name(entry_point),
                "calldata": calldata,
            },
            "block_id": "latest",
        });

        self.request("starknet_call", params).await
    }

    async fn get_events(&self, filter: &EventFilter) -> Result<Vec<LedgerEvent>, RpcError> {
        let mut events = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut query = json!({
                "from_block": { "block_number": filter.from_block },
                "to_block": { "block_number": filter.to_block },
                "address": filter.address.as_str(),
                "keys": [filter.keys],
                "chunk_size": filter.chunk_size,
            });
            if let Some(token) = &continuation {
                query["continuation_token"] = json!(token);
            }

            let result = self
                .request("starknet_getEvents", json!({ "filter": query }))
                .await?;
            let page: EventsPage =
                serde_json::from_value(result).map_err(|e| RpcError::Decode(e.to_string()))?;

            events.extend(page.events);

            match page.continuation_token {
                Some(token) if !token.is_empty() => continuation = Some(token),
                _ => break,
            }
        }

        Ok(events)
    }
}
