//! Chain event envelope produced by the log indexer.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::amount::{deserialize_opt_u64, deserialize_u64};

/// Where a log came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_node_id: Option<i64>,
    pub eth_chain_id: i64,
    /// topic0 of the log, when the indexer supplies it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_signature: Option<String>,
}

/// The log as returned by the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub transaction_hash: String,
    pub block_hash: String,
    #[serde(
        default,
        deserialize_with = "deserialize_opt_u64",
        skip_serializing_if = "Option::is_none"
    )]
    pub block_number: Option<u64>,
    pub address: String,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub topics: Vec<String>,
}

/// Block header fields the indexer attaches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    #[serde(deserialize_with = "deserialize_u64")]
    pub number: u64,
    #[serde(deserialize_with = "deserialize_u64")]
    pub timestamp: u64,
}

/// Payload of a `ChainEventCreated` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainEventEnvelope {
    pub event_source: EventSource,
    pub raw_log: RawLog,
    /// ABI-decoded log arguments, by parameter name.
    #[serde(default)]
    pub parsed_args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block: Option<BlockInfo>,
}

impl ChainEventEnvelope {
    pub fn eth_chain_id(&self) -> i64 {
        self.event_source.eth_chain_id
    }

    /// Lower-cased transaction hash.
    pub fn transaction_hash(&self) -> String {
        self.raw_log.transaction_hash.to_lowercase()
    }

    /// Lower-cased address of the emitting contract. This is the routing key.
    pub fn contract_address(&self) -> String {
        self.raw_log.address.to_lowercase()
    }

    /// `(eth_chain_id, lower(transaction_hash))`.
    pub fn natural_key(&self) -> (i64, String) {
        (self.eth_chain_id(), self.transaction_hash())
    }

    /// Natural key as one string, for logs and outbox deduplication.
    pub fn natural_key_string(&self) -> String {
        format!("{}:{}", self.eth_chain_id(), self.transaction_hash())
    }

    pub fn event_signature(&self) -> Option<&str> {
        self.event_source.event_signature.as_deref()
    }

    /// Block timestamp carried in the envelope, if any.
    pub fn block_timestamp(&self) -> Option<u64> {
        self.block.as_ref().map(|b| b.timestamp)
    }

    /// Decode `parsedArgs` into a handler-specific shape.
    pub fn parse_args<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.parsed_args)
    }
}
