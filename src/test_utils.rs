//! Test utilities and mock implementations.
//!
//! In-memory SQLite pools, a scriptable chain client, a recording message
//! handler, and chain event fixtures.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tokio::sync::RwLock;

use crate::bus::{BrokerMessage, InMemoryBroker, MessageHandler, Outcome, Topology};
use crate::chain::{ChainClient, ChainError, ChainNode};
use crate::config::StorageConfig;
use crate::storage::init_storage;

pub const TEST_CHAIN_ID: i64 = 8453;

/// Fresh in-memory database with the schema applied.
pub async fn test_pool() -> SqlitePool {
    init_storage(&StorageConfig::in_memory())
        .await
        .expect("in-memory storage")
}

pub fn test_broker() -> Arc<InMemoryBroker> {
    Arc::new(InMemoryBroker::new(Topology::default(), 3))
}

pub fn test_chain_node() -> ChainNode {
    ChainNode {
        eth_chain_id: TEST_CHAIN_ID,
        name: "base".to_string(),
        url: "http://localhost:8545".to_string(),
    }
}

/// 32-byte hash whose hex starts with `prefix` (padded with zeros).
pub fn tx_hash(prefix: &str) -> String {
    format!("0x{:0<64}", prefix)
}

/// 20-byte address whose hex starts with `prefix` (padded with zeros).
pub fn address(prefix: &str) -> String {
    format!("0x{:0<40}", prefix)
}

/// A `ChainEventCreated` payload emitted by `contract`.
pub fn chain_event(contract: &str, hash: &str, parsed_args: Value) -> Value {
    json!({
        "eventSource": { "ethChainId": TEST_CHAIN_ID, "chainNodeId": 1 },
        "rawLog": {
            "transactionHash": hash,
            "blockHash": tx_hash("b10c"),
            "blockNumber": "0x10",
            "address": contract,
            "data": "0x",
            "topics": []
        },
        "parsedArgs": parsed_args,
        "block": { "number": 16, "timestamp": 1_700_000_000u64 }
    })
}

/// Chain client that records calls and can be told to fail.
#[derive(Default)]
pub struct MockChainClient {
    transfers: RwLock<Vec<(String, String)>>,
    fail_on_transfer: RwLock<bool>,
    block_timestamp: RwLock<Option<u64>>,
}

impl MockChainClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_transfer(&self, fail: bool) {
        *self.fail_on_transfer.write().await = fail;
    }

    pub async fn set_block_timestamp(&self, timestamp: u64) {
        *self.block_timestamp.write().await = Some(timestamp);
    }

    /// `(contract, token)` for every successful `transfer_liquidity`.
    pub async fn transfers(&self) -> Vec<(String, String)> {
        self.transfers.read().await.clone()
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn block_timestamp(&self, _node: &ChainNode, block_hash: &str) -> Result<u64, ChainError> {
        self.block_timestamp
            .read()
            .await
            .ok_or_else(|| ChainError::BlockNotFound(block_hash.to_string()))
    }

    async fn transfer_liquidity(
        &self,
        _node: &ChainNode,
        contract: &str,
        token_address: &str,
    ) -> Result<String, ChainError> {
        if *self.fail_on_transfer.read().await {
            return Err(ChainError::Rpc {
                code: -32000,
                message: "nonce too low".to_string(),
            });
        }
        let mut transfers = self.transfers.write().await;
        transfers.push((contract.to_string(), token_address.to_string()));
        Ok(tx_hash(&format!("f{}", transfers.len())))
    }
}

/// Message handler that records deliveries and answers with scripted outcomes.
pub struct RecordingHandler {
    received: RwLock<Vec<BrokerMessage>>,
    script: RwLock<Vec<Outcome>>,
    delay: Option<Duration>,
}

impl RecordingHandler {
    /// Acks everything.
    pub fn acking() -> Self {
        Self::scripted(Vec::new())
    }

    /// Answers with `script` in order, then acks.
    pub fn scripted(script: Vec<Outcome>) -> Self {
        Self {
            received: RwLock::new(Vec::new()),
            script: RwLock::new(script.into_iter().rev().collect()),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn received(&self) -> Vec<BrokerMessage> {
        self.received.read().await.clone()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, message: &BrokerMessage) -> Outcome {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.received.write().await.push(message.clone());
        self.script.write().await.pop().unwrap_or(Outcome::Ack)
    }
}
