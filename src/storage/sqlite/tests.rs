//! Tests for the SQLite projection store and ban lookup.

use ethers_core::types::U256;
use serde_json::json;

use super::*;
use crate::cache::BanLookup;
use crate::test_utils::{address, test_chain_node, test_pool, tx_hash, TEST_CHAIN_ID};

fn community(id: &str, namespace: &str, namespace_address: Option<&str>) -> Community {
    Community {
        id: id.to_string(),
        name: id.to_uppercase(),
        namespace: Some(namespace.to_string()),
        namespace_address: namespace_address.map(str::to_string),
        eth_chain_id: Some(TEST_CHAIN_ID),
    }
}

fn token(addr: &str) -> LaunchpadToken {
    LaunchpadToken {
        token_address: addr.to_string(),
        eth_chain_id: TEST_CHAIN_ID,
        namespace: "dao".to_string(),
        launchpad_liquidity: U256::from(10u64).pow(U256::from(21u64)),
        liquidity_transferred: false,
    }
}

#[tokio::test]
async fn test_migrate_is_idempotent() {
    let pool = test_pool().await;
    migrate(&pool).await.unwrap();
    migrate(&pool).await.unwrap();
}

#[tokio::test]
async fn test_chain_node_upsert_replaces() {
    let store = ProjectionStore::new(test_pool().await);
    assert!(store.chain_node(TEST_CHAIN_ID).await.unwrap().is_none());

    let mut node = test_chain_node();
    store.upsert_chain_node(&node).await.unwrap();
    node.url = "http://archive:8545".to_string();
    store.upsert_chain_node(&node).await.unwrap();

    assert_eq!(store.chain_node(TEST_CHAIN_ID).await.unwrap(), Some(node));
}

#[tokio::test]
async fn test_community_lookup_is_case_insensitive() {
    let store = ProjectionStore::new(test_pool().await);
    let ns = address("AbCd");
    store
        .insert_community(&community("dao", "dao", Some(&ns)))
        .await
        .unwrap();

    let found = store
        .communities_by_namespace_address(TEST_CHAIN_ID, &ns.to_uppercase().replace("0X", "0x"))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, "dao");
    assert_eq!(found[0].namespace_address.as_deref(), Some(ns.to_lowercase().as_str()));

    assert!(store
        .communities_by_namespace_address(TEST_CHAIN_ID + 1, &ns)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_link_namespace_address_only_when_unset() {
    let store = ProjectionStore::new(test_pool().await);
    store.insert_community(&community("dao", "dao", None)).await.unwrap();

    assert!(store.link_namespace_address("dao", &address("aa")).await.unwrap());
    assert!(!store.link_namespace_address("dao", &address("bb")).await.unwrap());

    let found = store.communities_by_namespace("dao").await.unwrap();
    assert_eq!(found[0].namespace_address, Some(address("aa")));
}

#[tokio::test]
async fn test_liquidity_claim_is_exclusive_and_resettable() {
    let store = ProjectionStore::new(test_pool().await);
    let addr = address("7e");
    store.insert_launchpad_token(&token(&addr)).await.unwrap();

    assert!(store.claim_liquidity_transfer(TEST_CHAIN_ID, &addr).await.unwrap());
    assert!(!store.claim_liquidity_transfer(TEST_CHAIN_ID, &addr).await.unwrap());

    store.reset_liquidity_transfer(TEST_CHAIN_ID, &addr).await.unwrap();
    let stored = store.launchpad_token(TEST_CHAIN_ID, &addr).await.unwrap().unwrap();
    assert!(!stored.liquidity_transferred);
    assert_eq!(stored.launchpad_liquidity, token(&addr).launchpad_liquidity);
}

#[tokio::test]
async fn test_trade_insert_is_keyed_on_chain_and_hash() {
    let store = ProjectionStore::new(test_pool().await);
    let trade = LaunchpadTrade {
        eth_chain_id: TEST_CHAIN_ID,
        transaction_hash: tx_hash("abc"),
        token_address: address("7e"),
        trader_address: address("01"),
        is_buy: true,
        community_token_amount: U256::from(500u64),
        price: U256::MAX / U256::from(3u64),
        floating_supply: U256::from(9_000u64),
        timestamp: 1_700_000_000,
    };

    assert!(store.insert_launchpad_trade(&trade).await.unwrap());
    assert!(!store.insert_launchpad_trade(&trade).await.unwrap());

    let stored = store
        .launchpad_trade(TEST_CHAIN_ID, &trade.transaction_hash)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored, trade);
}

#[tokio::test]
async fn test_stake_insert_once() {
    let store = ProjectionStore::new(test_pool().await);
    let stake = StakeTransaction {
        eth_chain_id: TEST_CHAIN_ID,
        transaction_hash: tx_hash("5a"),
        community_id: "dao".to_string(),
        stake_id: 2,
        address: address("01"),
        stake_amount: U256::from(3u64),
        stake_price: U256::from(1_000u64),
        direction: StakeDirection::Sell,
        timestamp: 1_700_000_000,
    };

    assert!(!store.stake_transaction_exists(TEST_CHAIN_ID, &stake.transaction_hash).await.unwrap());
    assert!(store.insert_stake_transaction(&stake).await.unwrap());
    assert!(!store.insert_stake_transaction(&stake).await.unwrap());
    assert!(store.stake_transaction_exists(TEST_CHAIN_ID, &stake.transaction_hash).await.unwrap());
}

#[tokio::test]
async fn test_unhandled_event_recorded_once_per_contract() {
    let store = ProjectionStore::new(test_pool().await);
    let event = UnhandledChainEvent {
        eth_chain_id: TEST_CHAIN_ID,
        transaction_hash: tx_hash("dd"),
        contract_address: address("c0"),
        event_signature: None,
        payload: json!({ "anything": 1 }),
    };

    assert!(store.insert_unhandled_event(&event).await.unwrap());
    assert!(!store.insert_unhandled_event(&event).await.unwrap());

    let other_contract = UnhandledChainEvent {
        contract_address: address("c1"),
        ..event
    };
    assert!(store.insert_unhandled_event(&other_contract).await.unwrap());
}

#[tokio::test]
async fn test_ban_lookup() {
    let pool = test_pool().await;
    sqlx::query("INSERT INTO community_bans (community_id, address) VALUES ('dao', ?)")
        .bind(address("BAD"))
        .execute(&pool)
        .await
        .unwrap();

    let bans = SqliteBanLookup::new(pool);
    assert!(bans.is_banned("dao", &address("bad")).await.unwrap());
    assert!(!bans.is_banned("other", &address("bad")).await.unwrap());
    assert!(!bans.is_banned("dao", &address("900d")).await.unwrap());
}
