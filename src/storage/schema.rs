//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query building,
//! plus the DDL applied by [`crate::storage::sqlite::migrate`].

use sea_query::Iden;

/// Outbox table schema.
#[derive(Iden)]
pub enum Outbox {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "event_name"]
    EventName,
    #[iden = "event_payload"]
    EventPayload,
    #[iden = "natural_key"]
    NaturalKey,
    #[iden = "destination"]
    Destination,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "relayed"]
    Relayed,
    #[iden = "claimed_by"]
    ClaimedBy,
    #[iden = "claim_expires_at"]
    ClaimExpiresAt,
    #[iden = "relayed_at"]
    RelayedAt,
    #[iden = "parked_at"]
    ParkedAt,
    #[iden = "park_reason"]
    ParkReason,
}

/// Chain nodes known to the platform.
#[derive(Iden)]
pub enum ChainNodes {
    Table,
    #[iden = "eth_chain_id"]
    EthChainId,
    #[iden = "name"]
    Name,
    #[iden = "url"]
    Url,
}

/// Communities, owned by the platform. Only `namespace_address` is written here.
#[derive(Iden)]
pub enum Communities {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "name"]
    Name,
    #[iden = "namespace"]
    Namespace,
    #[iden = "namespace_address"]
    NamespaceAddress,
    #[iden = "eth_chain_id"]
    EthChainId,
}

/// Launchpad tokens with their liquidity threshold and transfer flag.
#[derive(Iden)]
pub enum LaunchpadTokens {
    Table,
    #[iden = "token_address"]
    TokenAddress,
    #[iden = "eth_chain_id"]
    EthChainId,
    #[iden = "namespace"]
    Namespace,
    #[iden = "launchpad_liquidity"]
    LaunchpadLiquidity,
    #[iden = "liquidity_transferred"]
    LiquidityTransferred,
}

/// Bonding-curve trade projection.
#[derive(Iden)]
pub enum LaunchpadTrades {
    Table,
    #[iden = "eth_chain_id"]
    EthChainId,
    #[iden = "transaction_hash"]
    TransactionHash,
    #[iden = "token_address"]
    TokenAddress,
    #[iden = "trader_address"]
    TraderAddress,
    #[iden = "is_buy"]
    IsBuy,
    #[iden = "community_token_amount"]
    CommunityTokenAmount,
    #[iden = "price"]
    Price,
    #[iden = "floating_supply"]
    FloatingSupply,
    #[iden = "timestamp"]
    Timestamp,
}

/// Community stake trade projection.
#[derive(Iden)]
pub enum StakeTransactions {
    Table,
    #[iden = "eth_chain_id"]
    EthChainId,
    #[iden = "transaction_hash"]
    TransactionHash,
    #[iden = "community_id"]
    CommunityId,
    #[iden = "stake_id"]
    StakeId,
    #[iden = "address"]
    Address,
    #[iden = "stake_amount"]
    StakeAmount,
    #[iden = "stake_price"]
    StakePrice,
    #[iden = "stake_direction"]
    StakeDirection,
    #[iden = "timestamp"]
    Timestamp,
}

/// Chain events nobody has a handler for.
#[derive(Iden)]
pub enum UnhandledChainEvents {
    Table,
    #[iden = "eth_chain_id"]
    EthChainId,
    #[iden = "transaction_hash"]
    TransactionHash,
    #[iden = "contract_address"]
    ContractAddress,
    #[iden = "event_signature"]
    EventSignature,
    #[iden = "payload"]
    Payload,
    #[iden = "received_at"]
    ReceivedAt,
}

/// Per-community address bans.
#[derive(Iden)]
pub enum CommunityBans {
    Table,
    #[iden = "community_id"]
    CommunityId,
    #[iden = "address"]
    Address,
}

/// SQL for creating the outbox table.
///
/// `created_at` is fixed-width RFC 3339 (microseconds, `Z`), so text order is
/// time order. The natural-key index is what makes a repeated `safe_publish`
/// a no-op; rows without a natural key or without a destination never collide
/// because SQLite treats NULLs as distinct. A row with `parked_at` set can
/// never be published and is kept out of every claim.
pub const CREATE_OUTBOX_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_name TEXT NOT NULL,
    event_payload TEXT NOT NULL,
    natural_key TEXT,
    destination TEXT,
    created_at TEXT NOT NULL,
    relayed INTEGER NOT NULL DEFAULT 0,
    claimed_by TEXT,
    claim_expires_at TEXT,
    relayed_at TEXT,
    parked_at TEXT,
    park_reason TEXT
);

CREATE INDEX IF NOT EXISTS idx_outbox_pending ON outbox(relayed, created_at, id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_outbox_natural_key ON outbox(destination, natural_key);
"#;

/// SQL for the platform-owned context tables read by handlers.
pub const CREATE_CONTEXT_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS chain_nodes (
    eth_chain_id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    url TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS communities (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    namespace TEXT,
    namespace_address TEXT,
    eth_chain_id INTEGER
);

CREATE INDEX IF NOT EXISTS idx_communities_namespace_address
    ON communities(eth_chain_id, namespace_address);

CREATE TABLE IF NOT EXISTS launchpad_tokens (
    token_address TEXT NOT NULL,
    eth_chain_id INTEGER NOT NULL,
    namespace TEXT NOT NULL,
    launchpad_liquidity TEXT NOT NULL,
    liquidity_transferred INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (eth_chain_id, token_address)
);

CREATE TABLE IF NOT EXISTS community_bans (
    community_id TEXT NOT NULL,
    address TEXT NOT NULL,
    PRIMARY KEY (community_id, address)
);
"#;

/// SQL for the derived records written by chain event handlers.
///
/// uint256 quantities are base-10 TEXT.
pub const CREATE_PROJECTION_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS launchpad_trades (
    eth_chain_id INTEGER NOT NULL,
    transaction_hash TEXT NOT NULL,
    token_address TEXT NOT NULL,
    trader_address TEXT NOT NULL,
    is_buy INTEGER NOT NULL,
    community_token_amount TEXT NOT NULL,
    price TEXT NOT NULL,
    floating_supply TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    PRIMARY KEY (eth_chain_id, transaction_hash)
);

CREATE TABLE IF NOT EXISTS stake_transactions (
    eth_chain_id INTEGER NOT NULL,
    transaction_hash TEXT NOT NULL,
    community_id TEXT NOT NULL,
    stake_id INTEGER NOT NULL,
    address TEXT NOT NULL,
    stake_amount TEXT NOT NULL,
    stake_price TEXT NOT NULL,
    stake_direction TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    PRIMARY KEY (eth_chain_id, transaction_hash)
);

CREATE TABLE IF NOT EXISTS unhandled_chain_events (
    eth_chain_id INTEGER NOT NULL,
    transaction_hash TEXT NOT NULL,
    contract_address TEXT NOT NULL,
    event_signature TEXT,
    payload TEXT NOT NULL,
    received_at TEXT NOT NULL,
    PRIMARY KEY (eth_chain_id, transaction_hash, contract_address)
);
"#;
