//! ============================================================================
//! Chain Module - Resilient ledger access
//! ============================================================================
//! `LedgerRpc` is the black-box ledger interface (head height, read-only
//! contract calls, event queries). `ChainClient` wraps any implementation with
//! rate-limit aware retries so no other component sees transient throttling.
//!
//! ## Usage
//! ```rust,ignore
//! use zeteo_core::chain::{ChainClient, StarknetRpc};
//!
//! let rpc = StarknetRpc::new("https://starknet-sepolia.g.alchemy.com/v2/demo", timeout)?;
//! let chain = ChainClient::new(Arc::new(rpc));
//! let head = chain.block_number().await?;
//! ```
//! ============================================================================

mod retry;
mod starknet;

pub use retry::{calculate_delay, classify_error, retry_with_backoff, ErrorKind, RetryConfig};
pub use starknet::{selector_from_name, StarknetRpc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;

use crate::types::Address;

/// Errors surfaced by a ledger RPC call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Malformed RPC response: {0}")]
    Decode(String),
}

/// A raw ledger event as returned by the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEvent {
    #[serde(default)]
    pub from_address: Option<String>,
    /// Selector followed by indexed fields
    pub keys: Vec<String>,
    /// Unindexed fields
    pub data: Vec<String>,
    #[serde(default)]
    pub block_number: Option<u64>,
    #[serde(default)]
    pub transaction_hash: Option<String>,
}

/// Event query over an inclusive block range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    pub address: Address,
    /// Selector(s) the first key must match
    pub keys: Vec<String>,
    pub from_block: u64,
    pub to_block: u64,
    pub chunk_size: u32,
}

/// Black-box ledger interface
#[async_trait]
pub trait LedgerRpc: Send + Sync {
    /// Current chain head height
    async fn block_number(&self) -> Result<u64, RpcError>;

    /// Read-only contract call; returns the raw decoded JSON result
    async fn call_view(
        &self,
        contract: &Address,
        entry_point: &str,
        calldata: &[String],
    ) -> Result<serde_json::Value, RpcError>;

    /// All events matching the filter, in chain order
    async fn get_events(&self, filter: &EventFilter) -> Result<Vec<LedgerEvent>, RpcError>;
}

/// Ledger client with bounded rate-limit retries
#[derive(Clone)]
pub struct ChainClient {
    rpc: Arc<dyn LedgerRpc>,
    config: RetryConfig,
}

impl ChainClient {
    /// Create a new ChainClient with the default retry policy
    pub fn new(rpc: Arc<dyn LedgerRpc>) -> Self {
        Self {
            rpc,
            config: RetryConfig::default(),
        }
    }

    /// Create a new ChainClient with a custom retry policy
    pub fn with_config(rpc: Arc<dyn LedgerRpc>, config: RetryConfig) -> Self {
        Self { rpc, config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run any ledger operation under the retry policy
    pub async fn call<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, RpcError>
    where
        F: FnMut(Arc<dyn LedgerRpc>) -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let rpc = self.rpc.clone();
        retry_with_backoff(&self.config, label, || op(rpc.clone())).await
    }

    pub async fn block_number(&self) -> Result<u64, RpcError> {
        self.call("block_number", |rpc| async move { rpc.block_number().await })
            .await
    }

    pub async fn call_view(
        &self,
        contract: &Address,
        entry_point: &str,
        calldata: &[String],
    ) -> Result<serde_json::Value, RpcError> {
        self.call(entry_point, |rpc| async move {
            rpc.call_view(contract, entry_point, calldata).await
        })
        .await
    }

    pub async fn get_events(&self, filter: &EventFilter) -> Result<Vec<LedgerEvent>, RpcError> {
        self.call("get_events", |rpc| async move { rpc.get_events(filter).await })
            .await
    }
}
