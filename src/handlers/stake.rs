//! Community stake `Trade` events.

use async_trait::async_trait;
use ethers_core::types::U256;
use serde::Deserialize;
use tracing::warn;

use super::{parse_args, signature_mismatch, ChainEventHandler, Handled, HandlerContext, HandlerError};
use crate::chain::amount::deserialize_u256;
use crate::chain::ChainEventEnvelope;
use crate::storage::{StakeDirection, StakeTransaction};

/// topic0 of `Trade(address,address,bool,uint256,uint256,uint256,uint256,uint256)`.
pub const STAKE_TRADE_SIGNATURE: &str =
    "0xfc13c9a8a9a619ac78b803aecb26abdd009182411d51a986090f82519d88a89e";

/// Every community stake contract deployed so far uses stake id 2.
pub const DEFAULT_STAKE_ID: i64 = 2;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StakeTradeArgs {
    trader: String,
    /// Namespace contract the stake belongs to.
    namespace: String,
    is_buy: bool,
    #[serde(deserialize_with = "deserialize_u256")]
    community_token_amount: U256,
    #[serde(deserialize_with = "deserialize_u256")]
    eth_amount: U256,
}

pub struct StakeTradeHandler {
    ctx: HandlerContext,
}

impl StakeTradeHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ChainEventHandler for StakeTradeHandler {
    fn name(&self) -> &'static str {
        "stake_trade"
    }

    async fn handle(&self, event: &ChainEventEnvelope) -> Result<Handled, HandlerError> {
        if let Some(skipped) = signature_mismatch(event, STAKE_TRADE_SIGNATURE) {
            return Ok(skipped);
        }
        let args: StakeTradeArgs = parse_args(event)?;
        let (eth_chain_id, transaction_hash) = event.natural_key();

        if self
            .ctx
            .store
            .stake_transaction_exists(eth_chain_id, &transaction_hash)
            .await?
        {
            return Ok(Handled::Duplicate);
        }

        let mut communities = self
            .ctx
            .store
            .communities_by_namespace_address(eth_chain_id, &args.namespace)
            .await?;
        let community = match communities.len() {
            0 => {
                warn!(
                    eth_chain_id,
                    namespace = %args.namespace,
                    "No community for namespace"
                );
                return Err(HandlerError::Unresolvable(format!(
                    "no community for namespace {}",
                    args.namespace
                )));
            }
            1 => communities.remove(0),
            n => {
                return Err(HandlerError::Ambiguous(format!(
                    "{n} communities share namespace {}",
                    args.namespace
                )));
            }
        };

        let node = self.ctx.chain_node(event).await?;
        let timestamp = self.ctx.block_timestamp(event, &node).await?;

        let stake = StakeTransaction {
            eth_chain_id,
            transaction_hash,
            community_id: community.id,
            stake_id: DEFAULT_STAKE_ID,
            address: args.trader.to_lowercase(),
            stake_amount: args.community_token_amount,
            stake_price: args.eth_amount,
            direction: if args.is_buy {
                StakeDirection::Buy
            } else {
                StakeDirection::Sell
            },
            timestamp,
        };

        Ok(if self.ctx.store.insert_stake_transaction(&stake).await? {
            Handled::Applied
        } else {
            Handled::Duplicate
        })
    }
}
