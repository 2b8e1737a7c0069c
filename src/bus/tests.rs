use serde_json::json;

use super::*;
use crate::config::{MessagingConfig, MessagingType};
use crate::storage::SqliteOutboxStore;
use crate::outbox::OutboxStore;
use crate::test_utils::{test_broker, test_pool};
use topology::{CHAIN_EVENTS, DOMAIN_EVENTS};

#[test]
fn test_broker_message_wire_shape_omits_delivery() {
    let message = BrokerMessage::new("ThreadCreated", json!({ "thread_id": 7 }))
        .with_delivery("DomainEvent", 2);

    let wire = serde_json::to_value(&message).unwrap();
    assert_eq!(
        wire,
        json!({ "event_name": "ThreadCreated", "event_payload": { "thread_id": 7 } })
    );

    let back: BrokerMessage = serde_json::from_value(wire).unwrap();
    assert_eq!(back.delivery, DeliveryInfo::default());
    assert_eq!(back.event_name, "ThreadCreated");
}

#[test]
fn test_outcome_is_ack() {
    assert!(Outcome::Ack.is_ack());
    assert!(!Outcome::Retry("later".into()).is_ack());
    assert!(!Outcome::DeadLetter("never".into()).is_ack());
}

#[tokio::test]
async fn test_safe_publish_stages_without_publishing() {
    let pool = test_pool().await;
    let broker = test_broker();
    let message = BrokerMessage::new("ChainEventCreated", json!({ "n": 1 }));

    let mut tx = pool.begin().await.unwrap();
    let id = broker
        .safe_publish(&mut tx, &message, "8453:0xabc", CHAIN_EVENTS)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert!(id.is_some());
    assert_eq!(broker.published_count().await, 0);

    let row = SqliteOutboxStore::new(pool)
        .fetch(id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.destination.as_deref(), Some(CHAIN_EVENTS));
    assert_eq!(row.natural_key.as_deref(), Some("8453:0xabc"));
}

#[tokio::test]
async fn test_safe_publish_dedupes_on_natural_key() {
    let pool = test_pool().await;
    let broker = test_broker();
    let message = BrokerMessage::new("ChainEventCreated", json!({}));

    let mut tx = pool.begin().await.unwrap();
    let first = broker
        .safe_publish(&mut tx, &message, "8453:0xabc", CHAIN_EVENTS)
        .await
        .unwrap();
    let second = broker
        .safe_publish(&mut tx, &message, "8453:0xabc", CHAIN_EVENTS)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert!(first.is_some());
    assert!(second.is_none());
}

#[tokio::test]
async fn test_safe_publish_rejects_unknown_publication() {
    let pool = test_pool().await;
    let broker = test_broker();
    let message = BrokerMessage::new("ThreadCreated", json!({}));

    let mut tx = pool.begin().await.unwrap();
    let result = broker.safe_publish(&mut tx, &message, "k", "nowhere").await;
    tx.rollback().await.unwrap();

    assert!(matches!(result, Err(BusError::UnknownPublication(p)) if p == "nowhere"));
}

#[tokio::test]
async fn test_init_broker_memory() {
    let config = MessagingConfig::default();
    assert_eq!(config.messaging_type, MessagingType::Memory);

    let broker = init_broker(&config, Topology::default()).await.unwrap();
    assert!(broker.topology().stream_for_publication(DOMAIN_EVENTS).is_some());
    broker.shutdown().await.unwrap();
}

#[cfg(not(feature = "amqp"))]
#[tokio::test]
async fn test_init_broker_amqp_requires_feature() {
    let config = MessagingConfig {
        messaging_type: MessagingType::Amqp,
        ..MessagingConfig::default()
    };
    assert!(init_broker(&config, Topology::default()).await.is_err());
}
