//! Bonding-curve `Trade` events from launchpad contracts.

use async_trait::async_trait;
use ethers_core::types::U256;
use serde::Deserialize;
use tracing::{error, info, warn};

use super::{parse_args, ChainEventHandler, Handled, HandlerContext, HandlerError};
use crate::chain::amount::{deserialize_u256, unit_price};
use crate::chain::{ChainEventEnvelope, ChainNode};
use crate::storage::{LaunchpadToken, LaunchpadTrade};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TradeArgs {
    trader: String,
    token_address: String,
    is_buy: bool,
    #[serde(deserialize_with = "deserialize_u256")]
    token_amount: U256,
    #[serde(deserialize_with = "deserialize_u256")]
    eth_amount: U256,
    #[serde(deserialize_with = "deserialize_u256")]
    floating_supply: U256,
}

/// Records launchpad trades and hands liquidity over once the floating
/// supply reaches the token's launchpad liquidity.
pub struct LaunchpadTradeHandler {
    ctx: HandlerContext,
}

impl LaunchpadTradeHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }

    /// Submit `transferLiquidity` at most once per token.
    ///
    /// The flag is claimed before the chain call and given back if the call
    /// fails, so a redelivery can try again.
    async fn transfer_liquidity_if_due(
        &self,
        event: &ChainEventEnvelope,
        node: &ChainNode,
        token: &LaunchpadToken,
        floating_supply: U256,
    ) -> Result<(), HandlerError> {
        if token.liquidity_transferred || floating_supply < token.launchpad_liquidity {
            return Ok(());
        }

        let eth_chain_id = event.eth_chain_id();
        let token_address = token.token_address.as_str();
        if !self
            .ctx
            .store
            .claim_liquidity_transfer(eth_chain_id, token_address)
            .await?
        {
            return Ok(());
        }

        let contract = event.contract_address();
        match self
            .ctx
            .chain
            .transfer_liquidity(node, &contract, token_address)
            .await
        {
            Ok(tx_hash) => {
                info!(
                    eth_chain_id,
                    token_address,
                    %floating_supply,
                    launchpad_liquidity = %token.launchpad_liquidity,
                    tx_hash = %tx_hash,
                    "Liquidity transfer submitted"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    eth_chain_id,
                    token_address,
                    error = %e,
                    "Liquidity transfer failed, releasing flag"
                );
                self.ctx
                    .store
                    .reset_liquidity_transfer(eth_chain_id, token_address)
                    .await?;
                Err(HandlerError::Transient(format!("transferLiquidity: {e}")))
            }
        }
    }
}

#[async_trait]
impl ChainEventHandler for LaunchpadTradeHandler {
    fn name(&self) -> &'static str {
        "launchpad_trade"
    }

    async fn handle(&self, event: &ChainEventEnvelope) -> Result<Handled, HandlerError> {
        let args: TradeArgs = parse_args(event)?;
        let (eth_chain_id, transaction_hash) = event.natural_key();

        let existing = self
            .ctx
            .store
            .launchpad_trade(eth_chain_id, &transaction_hash)
            .await?
            .is_some();

        let Some(token) = self
            .ctx
            .store
            .launchpad_token(eth_chain_id, &args.token_address)
            .await?
        else {
            warn!(
                eth_chain_id,
                token_address = %args.token_address,
                "Launchpad token not found"
            );
            return Err(HandlerError::Unresolvable(format!(
                "launchpad token {} on chain {eth_chain_id}",
                args.token_address
            )));
        };
        let node = self.ctx.chain_node(event).await?;

        let mut inserted = false;
        if !existing {
            let price = unit_price(args.eth_amount, args.token_amount)
                .map_err(|e| HandlerError::Format(e.to_string()))?;
            let timestamp = self.ctx.block_timestamp(event, &node).await?;

            let trade = LaunchpadTrade {
                eth_chain_id,
                transaction_hash: transaction_hash.clone(),
                token_address: args.token_address.to_lowercase(),
                trader_address: args.trader.to_lowercase(),
                is_buy: args.is_buy,
                community_token_amount: args.token_amount,
                price,
                floating_supply: args.floating_supply,
                timestamp,
            };
            inserted = self.ctx.store.insert_launchpad_trade(&trade).await?;
        }

        // Runs for duplicates too: a transfer that failed on an earlier
        // delivery is retried here.
        self.transfer_liquidity_if_due(event, &node, &token, args.floating_supply)
            .await?;

        Ok(if inserted {
            Handled::Applied
        } else {
            Handled::Duplicate
        })
    }
}
