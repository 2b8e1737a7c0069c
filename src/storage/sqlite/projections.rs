//! SQLite access to chain-event projections and the context rows they read.
//!
//! Every insert here is `ON CONFLICT DO NOTHING` on the record's natural key:
//! the boolean returned says whether this call created the row.

use chrono::Utc;
use ethers_core::types::U256;
use sea_query::{Expr, Func, OnConflict, Query, SqliteQueryBuilder};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::chain::ChainNode;
use crate::storage::helpers::{format_timestamp, parse_u256};
use crate::storage::schema::{
    ChainNodes, Communities, LaunchpadTokens, LaunchpadTrades, StakeTransactions,
    UnhandledChainEvents,
};
use crate::storage::Result;

/// A community row, as far as chain handlers care.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Community {
    pub id: String,
    pub name: String,
    pub namespace: Option<String>,
    pub namespace_address: Option<String>,
    pub eth_chain_id: Option<i64>,
}

/// A launchpad token and its liquidity threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchpadToken {
    pub token_address: String,
    pub eth_chain_id: i64,
    pub namespace: String,
    pub launchpad_liquidity: U256,
    pub liquidity_transferred: bool,
}

/// One bonding-curve trade, keyed by `(eth_chain_id, transaction_hash)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchpadTrade {
    pub eth_chain_id: i64,
    pub transaction_hash: String,
    pub token_address: String,
    pub trader_address: String,
    pub is_buy: bool,
    pub community_token_amount: U256,
    pub price: U256,
    pub floating_supply: U256,
    /// Block timestamp, unix seconds.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StakeDirection {
    Buy,
    Sell,
}

impl StakeDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            StakeDirection::Buy => "buy",
            StakeDirection::Sell => "sell",
        }
    }
}

/// One community stake trade, keyed by `(eth_chain_id, transaction_hash)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakeTransaction {
    pub eth_chain_id: i64,
    pub transaction_hash: String,
    pub community_id: String,
    pub stake_id: i64,
    pub address: String,
    pub stake_amount: U256,
    pub stake_price: U256,
    pub direction: StakeDirection,
    pub timestamp: i64,
}

/// A chain event with no dedicated handler.
#[derive(Debug, Clone)]
pub struct UnhandledChainEvent {
    pub eth_chain_id: i64,
    pub transaction_hash: String,
    pub contract_address: String,
    pub event_signature: Option<String>,
    pub payload: serde_json::Value,
}

fn row_to_community(row: &SqliteRow) -> Community {
    Community {
        id: row.get("id"),
        name: row.get("name"),
        namespace: row.get("namespace"),
        namespace_address: row.get("namespace_address"),
        eth_chain_id: row.get("eth_chain_id"),
    }
}

fn row_to_trade(row: &SqliteRow) -> Result<LaunchpadTrade> {
    let amount: String = row.get("community_token_amount");
    let price: String = row.get("price");
    let supply: String = row.get("floating_supply");

    Ok(LaunchpadTrade {
        eth_chain_id: row.get("eth_chain_id"),
        transaction_hash: row.get("transaction_hash"),
        token_address: row.get("token_address"),
        trader_address: row.get("trader_address"),
        is_buy: row.get("is_buy"),
        community_token_amount: parse_u256("community_token_amount", &amount)?,
        price: parse_u256("price", &price)?,
        floating_supply: parse_u256("floating_supply", &supply)?,
        timestamp: row.get("timestamp"),
    })
}

/// Read/write access for chain event handlers.
#[derive(Clone)]
pub struct ProjectionStore {
    pool: SqlitePool,
}

impl ProjectionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ------------------------------------------------------------------
    // Context rows
    // ------------------------------------------------------------------

    pub async fn chain_node(&self, eth_chain_id: i64) -> Result<Option<ChainNode>> {
        let query = Query::select()
            .columns([ChainNodes::EthChainId, ChainNodes::Name, ChainNodes::Url])
            .from(ChainNodes::Table)
            .and_where(Expr::col(ChainNodes::EthChainId).eq(eth_chain_id))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        Ok(row.map(|row| ChainNode {
            eth_chain_id: row.get("eth_chain_id"),
            name: row.get("name"),
            url: row.get("url"),
        }))
    }

    /// Register or replace a chain node.
    pub async fn upsert_chain_node(&self, node: &ChainNode) -> Result<()> {
        let query = Query::insert()
            .into_table(ChainNodes::Table)
            .columns([ChainNodes::EthChainId, ChainNodes::Name, ChainNodes::Url])
            .values_panic([
                node.eth_chain_id.into(),
                node.name.clone().into(),
                node.url.clone().into(),
            ])
            .on_conflict(
                OnConflict::column(ChainNodes::EthChainId)
                    .update_columns([ChainNodes::Name, ChainNodes::Url])
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn insert_community(&self, community: &Community) -> Result<()> {
        let query = Query::insert()
            .into_table(Communities::Table)
            .columns([
                Communities::Id,
                Communities::Name,
                Communities::Namespace,
                Communities::NamespaceAddress,
                Communities::EthChainId,
            ])
            .values_panic([
                community.id.clone().into(),
                community.name.clone().into(),
                community.namespace.clone().into(),
                community
                    .namespace_address
                    .as_ref()
                    .map(|a| a.to_lowercase())
                    .into(),
                community.eth_chain_id.into(),
            ])
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    /// Communities whose namespace contract lives at `address` on `eth_chain_id`.
    pub async fn communities_by_namespace_address(
        &self,
        eth_chain_id: i64,
        address: &str,
    ) -> Result<Vec<Community>> {
        let query = Query::select()
            .columns([
                Communities::Id,
                Communities::Name,
                Communities::Namespace,
                Communities::NamespaceAddress,
                Communities::EthChainId,
            ])
            .from(Communities::Table)
            .and_where(Expr::col(Communities::EthChainId).eq(eth_chain_id))
            .and_where(
                Expr::expr(Func::lower(Expr::col(Communities::NamespaceAddress)))
                    .eq(address.to_lowercase()),
            )
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_community).collect())
    }

    /// Communities whose namespace name is `namespace`.
    pub async fn communities_by_namespace(&self, namespace: &str) -> Result<Vec<Community>> {
        let query = Query::select()
            .columns([
                Communities::Id,
                Communities::Name,
                Communities::Namespace,
                Communities::NamespaceAddress,
                Communities::EthChainId,
            ])
            .from(Communities::Table)
            .and_where(Expr::col(Communities::Namespace).eq(namespace))
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_community).collect())
    }

    /// Set a community's namespace contract address unless one is already set.
    pub async fn link_namespace_address(&self, community_id: &str, address: &str) -> Result<bool> {
        let query = Query::update()
            .table(Communities::Table)
            .value(Communities::NamespaceAddress, address.to_lowercase())
            .and_where(Expr::col(Communities::Id).eq(community_id))
            .and_where(Expr::col(Communities::NamespaceAddress).is_null())
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn insert_launchpad_token(&self, token: &LaunchpadToken) -> Result<()> {
        let query = Query::insert()
            .into_table(LaunchpadTokens::Table)
            .columns([
                LaunchpadTokens::TokenAddress,
                LaunchpadTokens::EthChainId,
                LaunchpadTokens::Namespace,
                LaunchpadTokens::LaunchpadLiquidity,
                LaunchpadTokens::LiquidityTransferred,
            ])
            .values_panic([
                token.token_address.to_lowercase().into(),
                token.eth_chain_id.into(),
                token.namespace.clone().into(),
                token.launchpad_liquidity.to_string().into(),
                token.liquidity_transferred.into(),
            ])
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn launchpad_token(
        &self,
        eth_chain_id: i64,
        token_address: &str,
    ) -> Result<Option<LaunchpadToken>> {
        let query = Query::select()
            .columns([
                LaunchpadTokens::TokenAddress,
                LaunchpadTokens::EthChainId,
                LaunchpadTokens::Namespace,
                LaunchpadTokens::LaunchpadLiquidity,
                LaunchpadTokens::LiquidityTransferred,
            ])
            .from(LaunchpadTokens::Table)
            .and_where(Expr::col(LaunchpadTokens::EthChainId).eq(eth_chain_id))
            .and_where(Expr::col(LaunchpadTokens::TokenAddress).eq(token_address.to_lowercase()))
            .to_string(SqliteQueryBuilder);

        let Some(row) = sqlx::query(&query).fetch_optional(&self.pool).await? else {
            return Ok(None);
        };

        let liquidity: String = row.get("launchpad_liquidity");
        Ok(Some(LaunchpadToken {
            token_address: row.get("token_address"),
            eth_chain_id: row.get("eth_chain_id"),
            namespace: row.get("namespace"),
            launchpad_liquidity: parse_u256("launchpad_liquidity", &liquidity)?,
            liquidity_transferred: row.get("liquidity_transferred"),
        }))
    }

    /// Atomically flip `liquidity_transferred` from false to true.
    ///
    /// Only one caller ever gets `true` back for a given token.
    pub async fn claim_liquidity_transfer(&self, eth_chain_id: i64, token_address: &str) -> Result<bool> {
        let query = Query::update()
            .table(LaunchpadTokens::Table)
            .value(LaunchpadTokens::LiquidityTransferred, true)
            .and_where(Expr::col(LaunchpadTokens::EthChainId).eq(eth_chain_id))
            .and_where(Expr::col(LaunchpadTokens::TokenAddress).eq(token_address.to_lowercase()))
            .and_where(Expr::col(LaunchpadTokens::LiquidityTransferred).eq(false))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    /// Give a claimed transfer back after the chain submission failed.
    pub async fn reset_liquidity_transfer(&self, eth_chain_id: i64, token_address: &str) -> Result<()> {
        let query = Query::update()
            .table(LaunchpadTokens::Table)
            .value(LaunchpadTokens::LiquidityTransferred, false)
            .and_where(Expr::col(LaunchpadTokens::EthChainId).eq(eth_chain_id))
            .and_where(Expr::col(LaunchpadTokens::TokenAddress).eq(token_address.to_lowercase()))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Derived records
    // ------------------------------------------------------------------

    pub async fn launchpad_trade(
        &self,
        eth_chain_id: i64,
        transaction_hash: &str,
    ) -> Result<Option<LaunchpadTrade>> {
        let query = Query::select()
            .columns([
                LaunchpadTrades::EthChainId,
                LaunchpadTrades::TransactionHash,
                LaunchpadTrades::TokenAddress,
                LaunchpadTrades::TraderAddress,
                LaunchpadTrades::IsBuy,
                LaunchpadTrades::CommunityTokenAmount,
                LaunchpadTrades::Price,
                LaunchpadTrades::FloatingSupply,
                LaunchpadTrades::Timestamp,
            ])
            .from(LaunchpadTrades::Table)
            .and_where(Expr::col(LaunchpadTrades::EthChainId).eq(eth_chain_id))
            .and_where(Expr::col(LaunchpadTrades::TransactionHash).eq(transaction_hash))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_trade).transpose()
    }

    pub async fn insert_launchpad_trade(&self, trade: &LaunchpadTrade) -> Result<bool> {
        let query = Query::insert()
            .into_table(LaunchpadTrades::Table)
            .columns([
                LaunchpadTrades::EthChainId,
                LaunchpadTrades::TransactionHash,
                LaunchpadTrades::TokenAddress,
                LaunchpadTrades::TraderAddress,
                LaunchpadTrades::IsBuy,
                LaunchpadTrades::CommunityTokenAmount,
                LaunchpadTrades::Price,
                LaunchpadTrades::FloatingSupply,
                LaunchpadTrades::Timestamp,
            ])
            .values_panic([
                trade.eth_chain_id.into(),
                trade.transaction_hash.clone().into(),
                trade.token_address.clone().into(),
                trade.trader_address.clone().into(),
                trade.is_buy.into(),
                trade.community_token_amount.to_string().into(),
                trade.price.to_string().into(),
                trade.floating_supply.to_string().into(),
                trade.timestamp.into(),
            ])
            .on_conflict(
                OnConflict::columns([LaunchpadTrades::EthChainId, LaunchpadTrades::TransactionHash])
                    .do_nothing()
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn stake_transaction_exists(&self, eth_chain_id: i64, transaction_hash: &str) -> Result<bool> {
        let query = Query::select()
            .expr(Expr::col(StakeTransactions::TransactionHash).count())
            .from(StakeTransactions::Table)
            .and_where(Expr::col(StakeTransactions::EthChainId).eq(eth_chain_id))
            .and_where(Expr::col(StakeTransactions::TransactionHash).eq(transaction_hash))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_one(&self.pool).await?;
        let count: i64 = row.get(0);
        Ok(count > 0)
    }

    pub async fn insert_stake_transaction(&self, stake: &StakeTransaction) -> Result<bool> {
        let query = Query::insert()
            .into_table(StakeTransactions::Table)
            .columns([
                StakeTransactions::EthChainId,
                StakeTransactions::TransactionHash,
                StakeTransactions::CommunityId,
                StakeTransactions::StakeId,
                StakeTransactions::Address,
                StakeTransactions::StakeAmount,
                StakeTransactions::StakePrice,
                StakeTransactions::StakeDirection,
                StakeTransactions::Timestamp,
            ])
            .values_panic([
                stake.eth_chain_id.into(),
                stake.transaction_hash.clone().into(),
                stake.community_id.clone().into(),
                stake.stake_id.into(),
                stake.address.clone().into(),
                stake.stake_amount.to_string().into(),
                stake.stake_price.to_string().into(),
                stake.direction.as_str().into(),
                stake.timestamp.into(),
            ])
            .on_conflict(
                OnConflict::columns([
                    StakeTransactions::EthChainId,
                    StakeTransactions::TransactionHash,
                ])
                .do_nothing()
                .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn insert_unhandled_event(&self, event: &UnhandledChainEvent) -> Result<bool> {
        let payload = serde_json::to_string(&event.payload)?;
        let query = Query::insert()
            .into_table(UnhandledChainEvents::Table)
            .columns([
                UnhandledChainEvents::EthChainId,
                UnhandledChainEvents::TransactionHash,
                UnhandledChainEvents::ContractAddress,
                UnhandledChainEvents::EventSignature,
                UnhandledChainEvents::Payload,
                UnhandledChainEvents::ReceivedAt,
            ])
            .values_panic([
                event.eth_chain_id.into(),
                event.transaction_hash.clone().into(),
                event.contract_address.clone().into(),
                event.event_signature.clone().into(),
                payload.into(),
                format_timestamp(Utc::now()).into(),
            ])
            .on_conflict(
                OnConflict::columns([
                    UnhandledChainEvents::EthChainId,
                    UnhandledChainEvents::TransactionHash,
                    UnhandledChainEvents::ContractAddress,
                ])
                .do_nothing()
                .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }
}
