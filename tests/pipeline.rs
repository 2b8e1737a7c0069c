//! End-to-end pipeline tests: outbox -> relay -> in-memory broker ->
//! dispatcher -> handlers -> projections, all on an in-memory SQLite database.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use ethers_core::types::U256;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use chainrelay::bus::topology::{CHAIN_EVENTS, CHAIN_EVENTS_SUBSCRIPTION, DOMAIN_EVENTS};
use chainrelay::bus::{Broker, BrokerMessage, InMemoryBroker, Topology};
use chainrelay::cache::{CacheConfig, ChainNodeCache, SystemClock};
use chainrelay::chain::{ChainClient, ChainError, ChainNode};
use chainrelay::config::StorageConfig;
use chainrelay::consumer::{ChainEventDispatcher, DispatchConfig};
use chainrelay::dlq::DeadLetterStore;
use chainrelay::handlers::HandlerContext;
use chainrelay::outbox::{self, NewOutboxEvent, RelayConfig, RelayWorker};
use chainrelay::storage::{init_storage, LaunchpadToken, ProjectionStore, SqliteOutboxStore};

const CHAIN_ID: i64 = 8453;
const LAUNCHPAD: &str = "0x1a00000000000000000000000000000000000000";

fn tx_hash(prefix: &str) -> String {
    format!("0x{:0<64}", prefix)
}

fn address(prefix: &str) -> String {
    format!("0x{:0<40}", prefix)
}

fn ether(n: u64) -> U256 {
    U256::from(n) * U256::exp10(18)
}

fn chain_event(contract: &str, hash: &str, parsed_args: Value) -> Value {
    json!({
        "eventSource": { "ethChainId": CHAIN_ID, "chainNodeId": 1 },
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

fn token_address() -> String {
    address("70c")
}

fn trade_event(hash: &str, floating_supply: U256) -> BrokerMessage {
    BrokerMessage::new(
        "ChainEventCreated",
        chain_event(
            LAUNCHPAD,
            hash,
            json!({
                "trader": address("7ad"),
                "tokenAddress": token_address(),
                "isBuy": true,
                "tokenAmount": "4",
                "ethAmount": ether(2000).to_string(),
                "floatingSupply": floating_supply.to_string(),
            }),
        ),
    )
}

/// Chain client that only records liquidity transfers.
#[derive(Default)]
struct RecordingChain {
    transfers: Mutex<Vec<String>>,
}

#[async_trait]
impl ChainClient for RecordingChain {
    async fn block_timestamp(&self, _node: &ChainNode, block_hash: &str) -> Result<u64, ChainError> {
        Err(ChainError::BlockNotFound(block_hash.to_string()))
    }

    async fn transfer_liquidity(
        &self,
        _node: &ChainNode,
        _contract: &str,
        token_address: &str,
    ) -> Result<String, ChainError> {
        self.transfers.lock().await.push(token_address.to_string());
        Ok(tx_hash("f1"))
    }
}

struct Pipeline {
    pool: SqlitePool,
    broker: Arc<InMemoryBroker>,
    relay: RelayWorker,
    store: ProjectionStore,
    chain: Arc<RecordingChain>,
}

async fn pipeline() -> Pipeline {
    let pool = init_storage(&StorageConfig::in_memory()).await.unwrap();
    let broker = Arc::new(InMemoryBroker::new(Topology::default(), 3));
    broker.init().await.unwrap();
    let relay = RelayWorker::new(
        Arc::new(SqliteOutboxStore::new(pool.clone())),
        broker.clone(),
        RelayConfig {
            batch_size: 10,
            ..RelayConfig::default()
        },
    );
    Pipeline {
        store: ProjectionStore::new(pool.clone()),
        pool,
        broker,
        relay,
        chain: Arc::new(RecordingChain::default()),
    }
}

impl Pipeline {
    /// Wire the dispatcher with the launchpad contract routed and start it.
    async fn start_dispatcher(&self) {
        self.store
            .upsert_chain_node(&ChainNode {
                eth_chain_id: CHAIN_ID,
                name: "base".to_string(),
                url: "http://localhost:8545".to_string(),
            })
            .await
            .unwrap();
        let nodes = Arc::new(ChainNodeCache::new(
            self.store.clone(),
            &CacheConfig::default(),
            Arc::new(SystemClock),
        ));
        let ctx = HandlerContext::new(self.store.clone(), self.chain.clone(), nodes);
        let config = DispatchConfig {
            launchpad_contracts: vec![LAUNCHPAD.to_string()],
            ..DispatchConfig::default()
        };
        let dispatcher = Arc::new(ChainEventDispatcher::from_config(&config, ctx).unwrap());
        // Runs until the broker shuts down.
        let _handle = self
            .broker
            .start_subscription(dispatcher, CHAIN_EVENTS_SUBSCRIPTION)
            .await
            .unwrap();
    }

    async fn pending(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM outbox WHERE relayed_at IS NULL")
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }

    async fn count(&self, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_relay_publishes_in_created_at_order() {
    let p = pipeline().await;
    let at = |month| Utc.with_ymd_and_hms(2024, month, 1, 12, 0, 0).unwrap();

    let mut tx = p.pool.begin().await.unwrap();
    outbox::enqueue(
        &mut tx,
        &[
            NewOutboxEvent::new("Third", json!({ "n": 3 })).created_at(at(3)),
            NewOutboxEvent::new("First", json!({ "n": 1 })).created_at(at(1)),
            NewOutboxEvent::new("Second", json!({ "n": 2 })).created_at(at(2)),
        ],
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let report = p.relay.tick(1).await.unwrap();
    assert_eq!(report.relayed, 3);

    let names: Vec<String> = p
        .broker
        .published()
        .await
        .into_iter()
        .map(|(publication, message)| {
            assert_eq!(publication, DOMAIN_EVENTS);
            message.event_name
        })
        .collect();
    assert_eq!(names, vec!["First", "Second", "Third"]);
    assert_eq!(p.pending().await, 0);
}

#[tokio::test]
async fn test_broker_outage_leaves_rows_pending_until_recovery() {
    let p = pipeline().await;
    let mut tx = p.pool.begin().await.unwrap();
    outbox::enqueue(
        &mut tx,
        &[
            NewOutboxEvent::new("A", json!({})),
            NewOutboxEvent::new("B", json!({})),
        ],
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    p.broker.set_fail_on_publish(true).await;
    let report = p.relay.tick(1).await.unwrap();
    assert_eq!(report.relayed, 0);
    assert!(report.publish_failed);
    assert_eq!(p.pending().await, 2);

    p.broker.set_fail_on_publish(false).await;
    let report = p.relay.tick(2).await.unwrap();
    assert_eq!(report.relayed, 2);
    assert_eq!(p.pending().await, 0);
    assert_eq!(p.broker.published_count().await, 2);
}

#[tokio::test]
async fn test_rolled_back_transaction_publishes_nothing() {
    let p = pipeline().await;

    let mut tx = p.pool.begin().await.unwrap();
    sqlx::query("INSERT INTO chain_nodes (eth_chain_id, name, url) VALUES (1, 'main', 'http://x')")
        .execute(&mut *tx)
        .await
        .unwrap();
    p.broker
        .safe_publish(
            &mut tx,
            &BrokerMessage::new("NodeAdded", json!({ "id": 1 })),
            "node:1",
            DOMAIN_EVENTS,
        )
        .await
        .unwrap();
    tx.rollback().await.unwrap();

    assert_eq!(p.relay.tick(1).await.unwrap().claimed, 0);
    assert_eq!(p.count("chain_nodes").await, 0);
    assert_eq!(p.broker.published_count().await, 0);
}

#[tokio::test]
async fn test_trades_apply_once_and_liquidity_moves_once() {
    let p = pipeline().await;
    p.store
        .insert_launchpad_token(&LaunchpadToken {
            token_address: token_address(),
            eth_chain_id: CHAIN_ID,
            namespace: "dao".to_string(),
            launchpad_liquidity: ether(100),
            liquidity_transferred: false,
        })
        .await
        .unwrap();
    p.start_dispatcher().await;

    let mut tx = p.pool.begin().await.unwrap();
    for (hash, supply) in [("a1", ether(99)), ("a2", ether(120)), ("a3", ether(150))] {
        p.broker
            .safe_publish(&mut tx, &trade_event(&tx_hash(hash), supply), &tx_hash(hash), CHAIN_EVENTS)
            .await
            .unwrap();
    }
    tx.commit().await.unwrap();

    assert_eq!(p.relay.tick(1).await.unwrap().relayed, 3);
    assert!(p.broker.wait_until_idle(Duration::from_secs(2)).await);

    // Redelivery of an already applied trade.
    p.broker
        .publish(&trade_event(&tx_hash("a2"), ether(120)), CHAIN_EVENTS)
        .await
        .unwrap();
    assert!(p.broker.wait_until_idle(Duration::from_secs(2)).await);

    assert_eq!(p.count("launchpad_trades").await, 3);
    assert_eq!(*p.chain.transfers.lock().await, vec![token_address()]);
    let token = p
        .store
        .launchpad_token(CHAIN_ID, &token_address())
        .await
        .unwrap()
        .unwrap();
    assert!(token.liquidity_transferred);
    assert!(p.broker.dead_letters().list().await.is_empty());
}

#[tokio::test]
async fn test_poison_event_is_dead_lettered_and_the_stream_moves_on() {
    let p = pipeline().await;
    p.start_dispatcher().await;

    let mut tx = p.pool.begin().await.unwrap();
    outbox::enqueue(
        &mut tx,
        &[
            NewOutboxEvent::new("ChainEventCreated", json!({ "rawLog": "garbage" }))
                .natural_key("poison"),
            NewOutboxEvent::new(
                "ChainEventCreated",
                chain_event(&address("c0"), &tx_hash("900d"), json!({})),
            )
            .natural_key(tx_hash("900d")),
        ],
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(p.relay.tick(1).await.unwrap().relayed, 2);
    assert!(p.broker.wait_until_idle(Duration::from_secs(2)).await);

    let dead = p.broker.dead_letters().list().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].publication, CHAIN_EVENTS);
    assert_eq!(dead[0].attempts, 1);
    assert_eq!(p.count("unhandled_chain_events").await, 1);
}
