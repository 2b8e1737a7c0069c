//! Ethereum JSON-RPC chain client over HTTP.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ethers_core::abi::{self, Token};
use ethers_core::types::{Address, U256};
use ethers_core::utils::id;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::amount::u64_from_json;
use super::{ChainClient, ChainConfig, ChainError, ChainNode};

const TRANSFER_LIQUIDITY_SIGNATURE: &str = "transferLiquidity(address,uint256)";

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// Calldata for `transferLiquidity(token, 0)`.
pub fn transfer_liquidity_calldata(token_address: &str) -> Result<Vec<u8>, ChainError> {
    let token: Address = token_address
        .parse()
        .map_err(|_| ChainError::InvalidAddress(token_address.to_string()))?;

    let mut data = id(TRANSFER_LIQUIDITY_SIGNATURE).to_vec();
    data.extend(abi::encode(&[Token::Address(token), Token::Uint(U256::zero())]));
    Ok(data)
}

/// JSON-RPC client. One HTTP connection pool shared across all chain nodes.
pub struct JsonRpcChainClient {
    http: reqwest::Client,
    config: ChainConfig,
    next_id: AtomicU64,
}

impl JsonRpcChainClient {
    pub fn new(config: ChainConfig) -> Result<Self, ChainError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            config,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call(&self, node: &ChainNode, method: &str, params: Value) -> Result<Value, ChainError> {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": request_id,
            "method": method,
            "params": params,
        });

        debug!(chain = node.eth_chain_id, method, request_id, "JSON-RPC request");

        let response: RpcResponse = self
            .http
            .post(&node.url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(error) = response.error {
            return Err(ChainError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl ChainClient for JsonRpcChainClient {
    async fn block_timestamp(&self, node: &ChainNode, block_hash: &str) -> Result<u64, ChainError> {
        let block = self
            .call(node, "eth_getBlockByHash", json!([block_hash, false]))
            .await?;

        if block.is_null() {
            return Err(ChainError::BlockNotFound(block_hash.to_string()));
        }

        let timestamp = block
            .get("timestamp")
            .ok_or_else(|| ChainError::InvalidResponse("block has no timestamp".into()))?;
        u64_from_json(timestamp).map_err(ChainError::InvalidResponse)
    }

    async fn transfer_liquidity(
        &self,
        node: &ChainNode,
        contract: &str,
        token_address: &str,
    ) -> Result<String, ChainError> {
        let from = self
            .config
            .sender_address
            .as_deref()
            .ok_or_else(|| ChainError::NotConfigured("chain.sender_address is not set".into()))?;

        let data = transfer_liquidity_calldata(token_address)?;
        let mut tx = json!({
            "from": from,
            "to": contract,
            "data": format!("0x{}", hex::encode(data)),
        });
        if let Some(gas) = self.config.gas_limit {
            tx["gas"] = json!(format!("{gas:#x}"));
        }

        let result = self.call(node, "eth_sendTransaction", json!([tx])).await?;
        let tx_hash = result
            .as_str()
            .ok_or_else(|| ChainError::InvalidResponse(format!("expected tx hash, got {result}")))?
            .to_string();

        info!(
            chain = node.eth_chain_id,
            contract,
            token = token_address,
            tx_hash = %tx_hash,
            "Submitted transferLiquidity"
        );
        Ok(tx_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_liquidity_calldata_layout() {
        let token = "0x00000000000000000000000000000000000000aa";
        let data = transfer_liquidity_calldata(token).unwrap();

        // selector + two 32-byte words
        assert_eq!(data.len(), 4 + 64);
        assert_eq!(&data[..4], &id(TRANSFER_LIQUIDITY_SIGNATURE));
        assert_eq!(data[4 + 31], 0xaa);
        assert!(data[36..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_transfer_liquidity_calldata_rejects_bad_address() {
        assert!(matches!(
            transfer_liquidity_calldata("not-an-address"),
            Err(ChainError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_client_builds_from_default_config() {
        assert!(JsonRpcChainClient::new(ChainConfig::default()).is_ok());
    }
}
