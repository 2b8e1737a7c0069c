//! Chain access for event handlers.
//!
//! Handlers read block data and submit follow-up transactions through the
//! [`ChainClient`] trait. [`JsonRpcChainClient`] talks plain Ethereum JSON-RPC.

use async_trait::async_trait;
use serde::Deserialize;

pub mod amount;
pub mod envelope;
pub mod json_rpc;

pub use envelope::{BlockInfo, ChainEventEnvelope, EventSource, RawLog};
pub use json_rpc::JsonRpcChainClient;

/// Errors raised by chain clients.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("RPC transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Invalid RPC response: {0}")]
    InvalidResponse(String),

    #[error("Block not found: {0}")]
    BlockNotFound(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Chain client not configured: {0}")]
    NotConfigured(String),
}

/// A chain node row: how to reach a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainNode {
    pub eth_chain_id: i64,
    pub name: String,
    pub url: String,
}

/// Chain client configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Per-request HTTP timeout.
    pub request_timeout_secs: u64,
    /// Node-managed account that signs outbound transactions
    /// (`eth_sendTransaction`). Outbound transactions fail until it is set.
    pub sender_address: Option<String>,
    /// Gas limit attached to outbound transactions; the node estimates when unset.
    pub gas_limit: Option<u64>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 10,
            sender_address: None,
            gas_limit: None,
        }
    }
}

/// Reads and writes against a chain.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Unix timestamp of the block with `block_hash`.
    async fn block_timestamp(&self, node: &ChainNode, block_hash: &str) -> Result<u64, ChainError>;

    /// Submit `transferLiquidity(token, 0)` to the bonding curve at `contract`.
    ///
    /// Returns the transaction hash.
    async fn transfer_liquidity(
        &self,
        node: &ChainNode,
        contract: &str,
        token_address: &str,
    ) -> Result<String, ChainError>;
}
