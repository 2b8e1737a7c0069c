use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use super::*;
use crate::bus::topology::{
    CHAIN_EVENTS, CHAIN_EVENTS_SUBSCRIPTION, DOMAIN_EVENTS, DOMAIN_EVENTS_SUBSCRIPTION,
};
use crate::test_utils::{test_broker, RecordingHandler};

const IDLE: Duration = Duration::from_secs(2);

fn message(n: i64) -> BrokerMessage {
    BrokerMessage::new("Numbered", json!({ "n": n }))
}

fn numbers(messages: &[BrokerMessage]) -> Vec<i64> {
    messages
        .iter()
        .map(|m| m.event_payload["n"].as_i64().unwrap())
        .collect()
}

#[tokio::test]
async fn test_delivers_in_publish_order() {
    let broker = test_broker();
    let handler = Arc::new(RecordingHandler::acking());
    let _sub = broker
        .start_subscription(handler.clone(), DOMAIN_EVENTS_SUBSCRIPTION)
        .await
        .unwrap();

    for n in 1..=5 {
        broker.publish(&message(n), DOMAIN_EVENTS).await.unwrap();
    }

    assert!(broker.wait_until_idle(IDLE).await);
    let received = handler.received().await;
    assert_eq!(numbers(&received), vec![1, 2, 3, 4, 5]);
    assert_eq!(received[0].delivery.routing_key, "DomainEvent");
    assert_eq!(received[0].delivery.redelivery_count, 0);
}

#[tokio::test]
async fn test_publications_are_isolated() {
    let broker = test_broker();
    let chain = Arc::new(RecordingHandler::acking());
    let domain = Arc::new(RecordingHandler::acking());
    let _a = broker
        .start_subscription(chain.clone(), CHAIN_EVENTS_SUBSCRIPTION)
        .await
        .unwrap();
    let _b = broker
        .start_subscription(domain.clone(), DOMAIN_EVENTS_SUBSCRIPTION)
        .await
        .unwrap();

    broker.publish(&message(1), CHAIN_EVENTS).await.unwrap();
    broker.publish(&message(2), DOMAIN_EVENTS).await.unwrap();

    assert!(broker.wait_until_idle(IDLE).await);
    assert_eq!(numbers(&chain.received().await), vec![1]);
    assert_eq!(numbers(&domain.received().await), vec![2]);
}

#[tokio::test]
async fn test_retry_then_ack() {
    let broker = test_broker();
    let handler = Arc::new(RecordingHandler::scripted(vec![Outcome::Retry(
        "db busy".into(),
    )]));
    let _sub = broker
        .start_subscription(handler.clone(), DOMAIN_EVENTS_SUBSCRIPTION)
        .await
        .unwrap();

    broker.publish(&message(1), DOMAIN_EVENTS).await.unwrap();

    assert!(broker.wait_until_idle(IDLE).await);
    let received = handler.received().await;
    assert_eq!(received.len(), 2);
    assert_eq!(received[1].delivery.redelivery_count, 1);
    assert!(broker.dead_letters().is_empty().await);
}

#[tokio::test]
async fn test_retry_budget_exhausted_dead_letters() {
    let broker = test_broker();
    let retry = || Outcome::Retry("node unreachable".into());
    let handler = Arc::new(RecordingHandler::scripted(vec![retry(), retry(), retry()]));
    let _sub = broker
        .start_subscription(handler.clone(), CHAIN_EVENTS_SUBSCRIPTION)
        .await
        .unwrap();

    broker.publish(&message(9), CHAIN_EVENTS).await.unwrap();

    assert!(broker.wait_until_idle(IDLE).await);
    assert_eq!(handler.received().await.len(), 3);

    let dead = broker.dead_letters().list().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 3);
    assert_eq!(dead[0].publication, CHAIN_EVENTS);
    assert_eq!(dead[0].subscription, CHAIN_EVENTS_SUBSCRIPTION);
    assert!(dead[0].reason.starts_with("gave up after 3 attempts"));
    assert_eq!(dead[0].message.event_payload, json!({ "n": 9 }));
}

#[tokio::test]
async fn test_dead_letter_outcome_skips_retries() {
    let broker = test_broker();
    let handler = Arc::new(RecordingHandler::scripted(vec![Outcome::DeadLetter(
        "malformed".into(),
    )]));
    let _sub = broker
        .start_subscription(handler.clone(), CHAIN_EVENTS_SUBSCRIPTION)
        .await
        .unwrap();

    broker.publish(&message(1), CHAIN_EVENTS).await.unwrap();
    broker.publish(&message(2), CHAIN_EVENTS).await.unwrap();

    assert!(broker.wait_until_idle(IDLE).await);
    assert_eq!(numbers(&handler.received().await), vec![1, 2]);

    let dead = broker.dead_letters().list().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, "malformed");
    assert_eq!(dead[0].attempts, 1);
}

#[tokio::test]
async fn test_replay_dead_letter() {
    let broker = test_broker();
    let handler = Arc::new(RecordingHandler::scripted(vec![Outcome::DeadLetter(
        "bug".into(),
    )]));
    let _sub = broker
        .start_subscription(handler.clone(), DOMAIN_EVENTS_SUBSCRIPTION)
        .await
        .unwrap();

    broker.publish(&message(4), DOMAIN_EVENTS).await.unwrap();
    assert!(broker.wait_until_idle(IDLE).await);

    let store = broker.dead_letters();
    let id = store.list().await[0].id;
    crate::dlq::replay(store.as_ref(), broker.as_ref(), id)
        .await
        .unwrap();

    assert!(broker.wait_until_idle(IDLE).await);
    assert!(store.is_empty().await);
    assert_eq!(numbers(&handler.received().await), vec![4, 4]);
}

#[tokio::test]
async fn test_messages_published_before_subscribe_are_kept() {
    let broker = test_broker();
    broker.publish(&message(1), DOMAIN_EVENTS).await.unwrap();
    assert_eq!(broker.pending(), 1);
    assert!(!broker.wait_until_idle(Duration::from_millis(20)).await);

    let handler = Arc::new(RecordingHandler::acking());
    let _sub = broker
        .start_subscription(handler.clone(), DOMAIN_EVENTS_SUBSCRIPTION)
        .await
        .unwrap();

    assert!(broker.wait_until_idle(IDLE).await);
    assert_eq!(numbers(&handler.received().await), vec![1]);
}

#[tokio::test]
async fn test_second_consumer_rejected_until_first_stops() {
    let broker = test_broker();
    let first = broker
        .start_subscription(Arc::new(RecordingHandler::acking()), DOMAIN_EVENTS_SUBSCRIPTION)
        .await
        .unwrap();

    let second = broker
        .start_subscription(Arc::new(RecordingHandler::acking()), DOMAIN_EVENTS_SUBSCRIPTION)
        .await;
    assert!(matches!(second, Err(BusError::Subscribe(_))));

    first.stop();
    first.join().await;

    let third = broker
        .start_subscription(Arc::new(RecordingHandler::acking()), DOMAIN_EVENTS_SUBSCRIPTION)
        .await;
    assert!(third.is_ok());
}

#[tokio::test]
async fn test_unknown_names_rejected() {
    let broker = test_broker();
    let publish = broker.publish(&message(1), "nowhere").await;
    assert!(matches!(publish, Err(BusError::UnknownPublication(_))));

    let subscribe = broker
        .start_subscription(Arc::new(RecordingHandler::acking()), "nowhere.consumer")
        .await;
    assert!(matches!(subscribe, Err(BusError::UnknownSubscription(_))));
}

#[tokio::test]
async fn test_simulated_outage_rejects_and_records_nothing() {
    let broker = test_broker();
    broker.set_fail_on_publish(true).await;
    assert!(matches!(
        broker.publish(&message(1), DOMAIN_EVENTS).await,
        Err(BusError::Publish(_))
    ));
    assert_eq!(broker.published_count().await, 0);
    assert_eq!(broker.pending(), 0);

    broker.set_fail_on_publish(false).await;
    broker.publish(&message(2), DOMAIN_EVENTS).await.unwrap();
    assert_eq!(numbers(&broker.take_published().await.into_iter().map(|(_, m)| m).collect::<Vec<_>>()), vec![2]);
    assert_eq!(broker.published_count().await, 0);
}

#[tokio::test]
async fn test_shutdown_drains_queue_then_rejects() {
    let broker = test_broker();
    let handler = Arc::new(RecordingHandler::acking().with_delay(Duration::from_millis(5)));
    let sub = broker
        .start_subscription(handler.clone(), DOMAIN_EVENTS_SUBSCRIPTION)
        .await
        .unwrap();

    for n in 1..=3 {
        broker.publish(&message(n), DOMAIN_EVENTS).await.unwrap();
    }
    broker.shutdown().await.unwrap();
    sub.join().await;

    assert_eq!(numbers(&handler.received().await), vec![1, 2, 3]);
    assert_eq!(broker.pending(), 0);
    assert!(matches!(
        broker.publish(&message(4), DOMAIN_EVENTS).await,
        Err(BusError::Shutdown)
    ));
    assert!(matches!(
        broker
            .start_subscription(handler.clone(), DOMAIN_EVENTS_SUBSCRIPTION)
            .await,
        Err(BusError::Shutdown)
    ));

    // init() reopens the broker.
    broker.init().await.unwrap();
    let _sub = broker
        .start_subscription(handler.clone(), DOMAIN_EVENTS_SUBSCRIPTION)
        .await
        .unwrap();
    broker.publish(&message(5), DOMAIN_EVENTS).await.unwrap();
    assert!(broker.wait_until_idle(IDLE).await);
    assert_eq!(numbers(&handler.received().await), vec![1, 2, 3, 5]);
}
