//! AMQP (RabbitMQ) broker.
//!
//! Every stream is a durable queue bound to its exchange by routing key and
//! declared with the shared dead-letter exchange as its DLX. Retries are
//! republished with an attempt header after `retry_delay_ms`; exhausted or
//! refused messages are nacked without requeue and land in the dead-letter
//! queue.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::BackoffBuilder;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, ConnectionProperties, ExchangeKind,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{
    Broker, BrokerMessage, BusError, MessageHandler, Outcome, Result, StreamTopology,
    SubscriptionHandle, Topology,
};
use crate::config::AmqpConfig;
use crate::utils::retry::{publish_backoff, reconnect_backoff};

/// Header carrying the 1-based delivery attempt of a republished retry.
const ATTEMPT_HEADER: &str = "x-chainrelay-attempt";
const CONTENT_TYPE: &str = "application/json";

/// RabbitMQ broker over a deadpool-lapin connection pool.
pub struct AmqpBroker {
    pool: Pool,
    config: AmqpConfig,
    topology: Topology,
    max_attempts: u32,
    shutdown_tx: watch::Sender<bool>,
}

impl AmqpBroker {
    /// Build the pool. No connection is made until [`Broker::init`].
    pub fn new(config: &AmqpConfig, topology: Topology, max_attempts: u32) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), ConnectionProperties::default());
        let pool = Pool::builder(manager)
            .max_size(config.pool_size)
            .build()
            .map_err(|e| BusError::Connection(format!("Failed to create pool: {}", e)))?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            pool,
            config: config.clone(),
            topology,
            max_attempts: max_attempts.max(1),
            shutdown_tx,
        })
    }

    async fn get_channel(pool: &Pool) -> Result<Channel> {
        let conn = pool.get().await.map_err(|e: PoolError| {
            BusError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        conn.create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))
    }

    /// Publish on a confirm-mode channel and wait for the broker's ack.
    ///
    /// Publishes are mandatory, so a message no queue is bound for comes back
    /// as an error instead of being dropped.
    async fn publish_once(
        pool: &Pool,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<()> {
        let channel = Self::get_channel(pool).await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        let confirmation = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
                payload,
                properties,
            )
            .await?
            .await?;

        check_confirmation(confirmation, exchange, routing_key)
    }

    /// Declare queue with DLX, bind, set prefetch and start consuming.
    async fn setup_consumer(
        pool: &Pool,
        stream: &StreamTopology,
        dead_letter_exchange: &str,
        prefetch: u16,
        consumer_tag: &str,
    ) -> Result<(Channel, lapin::Consumer)> {
        let channel = Self::get_channel(pool).await?;

        channel
            .queue_declare(
                &stream.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                queue_arguments(dead_letter_exchange),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to declare queue: {}", e)))?;

        channel
            .queue_bind(
                &stream.queue,
                &stream.exchange,
                &stream.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to bind queue: {}", e)))?;

        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to set prefetch: {}", e)))?;

        let consumer = channel
            .basic_consume(
                &stream.queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        Ok((channel, consumer))
    }
}

/// Queue arguments routing rejected messages to the dead-letter exchange.
/// Only a plain ack means the broker took responsibility for the message.
fn check_confirmation(confirmation: Confirmation, exchange: &str, routing_key: &str) -> Result<()> {
    match confirmation {
        Confirmation::Ack(None) => Ok(()),
        Confirmation::Ack(Some(_)) => Err(BusError::Publish(format!(
            "unroutable publish to {exchange}/{routing_key} was returned"
        ))),
        Confirmation::Nack(_) => Err(BusError::Publish(format!(
            "broker nacked publish to {exchange}/{routing_key}"
        ))),
        Confirmation::NotRequested => Err(BusError::Publish(format!(
            "publish to {exchange}/{routing_key} was not confirmed"
        ))),
    }
}

fn queue_arguments(dead_letter_exchange: &str) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(dead_letter_exchange.to_string().into()),
    );
    args
}

fn message_properties(attempt: u32) -> BasicProperties {
    let properties = BasicProperties::default()
        .with_content_type(CONTENT_TYPE.into())
        .with_delivery_mode(2); // persistent

    if attempt <= 1 {
        return properties;
    }
    let mut headers = FieldTable::default();
    headers.insert(ATTEMPT_HEADER.into(), AMQPValue::LongUInt(attempt));
    properties.with_headers(headers)
}

/// Delivery attempt recorded on a message; 1 when absent.
fn attempt_of(properties: &BasicProperties) -> u32 {
    let attempt = properties
        .headers()
        .as_ref()
        .and_then(|headers| headers.inner().get(ATTEMPT_HEADER))
        .and_then(|value| match value {
            AMQPValue::LongUInt(n) => Some(*n),
            AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
            AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
            AMQPValue::ShortUInt(n) => Some(u32::from(*n)),
            _ => None,
        });
    attempt.unwrap_or(1).max(1)
}

/// Resolves once the subscription is stopped or the broker shuts down.
fn stop_signal(
    mut cancel: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let mut cancel_open = true;
        loop {
            if *cancel.borrow() || *shutdown.borrow() {
                return;
            }
            tokio::select! {
                changed = cancel.changed(), if cancel_open => {
                    // Handle dropped: keep consuming until broker shutdown.
                    if changed.is_err() {
                        cancel_open = false;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    })
}

fn is_stopped(cancel: &watch::Receiver<bool>, shutdown: &watch::Receiver<bool>) -> bool {
    *cancel.borrow() || *shutdown.borrow()
}

/// Per-subscription consumer state shared by concurrent deliveries.
struct Consumer {
    pool: Pool,
    stream: StreamTopology,
    dead_letter_exchange: String,
    handler: Arc<dyn MessageHandler>,
    max_attempts: u32,
    prefetch: u16,
    retry_delay: Duration,
    consumer_tag: String,
}

impl Consumer {
    /// Consume until stopped, reconnecting with backoff.
    async fn run(self, cancel: watch::Receiver<bool>, shutdown: watch::Receiver<bool>) {
        let backoff_builder = reconnect_backoff();
        let mut backoff_iter = backoff_builder.build();

        while !is_stopped(&cancel, &shutdown) {
            match AmqpBroker::setup_consumer(
                &self.pool,
                &self.stream,
                &self.dead_letter_exchange,
                self.prefetch,
                &self.consumer_tag,
            )
            .await
            {
                // The channel must outlive the consumer stream.
                Ok((_channel, consumer)) => {
                    info!(
                        subscription = %self.stream.subscription,
                        queue = %self.stream.queue,
                        prefetch = self.prefetch,
                        "Consumer connected, processing messages"
                    );
                    backoff_iter = backoff_builder.build();

                    let this = &self;
                    consumer
                        .take_until(stop_signal(cancel.clone(), shutdown.clone()))
                        .for_each_concurrent(usize::from(self.prefetch.max(1)), |delivery| async move {
                            match delivery {
                                Ok(delivery) => this.process(delivery).await,
                                Err(e) => error!(error = %e, "Consumer delivery error"),
                            }
                        })
                        .await;

                    if is_stopped(&cancel, &shutdown) {
                        break;
                    }
                    info!(queue = %self.stream.queue, "Consumer stream ended, reconnecting...");
                }
                Err(e) => {
                    let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
                    error!(
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        queue = %self.stream.queue,
                        "Failed to set up consumer, retrying after backoff"
                    );
                    let mut stop = stop_signal(cancel.clone(), shutdown.clone());
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = &mut stop => break,
                    }
                }
            }
        }

        info!(subscription = %self.stream.subscription, "Consumer stopped");
    }

    async fn process(&self, delivery: Delivery) {
        let attempt = attempt_of(&delivery.properties);

        let message = match serde_json::from_slice::<BrokerMessage>(&delivery.data) {
            Ok(message) => message.with_delivery(delivery.routing_key.as_str(), attempt - 1),
            Err(e) => {
                error!(
                    queue = %self.stream.queue,
                    error = %e,
                    "Undecodable message, dead-lettering"
                );
                self.reject(&delivery).await;
                return;
            }
        };

        match self.handler.handle(&message).await {
            Outcome::Ack => {
                debug!(
                    subscription = %self.stream.subscription,
                    event_name = %message.event_name,
                    "Message acked"
                );
                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    error!(error = %e, "Failed to ack message");
                }
            }
            Outcome::Retry(reason) if attempt < self.max_attempts => {
                warn!(
                    subscription = %self.stream.subscription,
                    event_name = %message.event_name,
                    attempt,
                    reason = %reason,
                    "Handler asked for retry, republishing"
                );
                self.retry(&delivery, attempt + 1).await;
            }
            Outcome::Retry(reason) => {
                error!(
                    subscription = %self.stream.subscription,
                    event_name = %message.event_name,
                    attempt,
                    reason = %reason,
                    "Retry budget exhausted, dead-lettering"
                );
                self.reject(&delivery).await;
            }
            Outcome::DeadLetter(reason) => {
                error!(
                    subscription = %self.stream.subscription,
                    event_name = %message.event_name,
                    reason = %reason,
                    "Handler refused message, dead-lettering"
                );
                self.reject(&delivery).await;
            }
        }
    }

    /// Republish to the tail of the queue with the next attempt number, then
    /// ack the original once the broker confirmed the copy. Anything short of
    /// a confirm requeues the original.
    async fn retry(&self, delivery: &Delivery, next_attempt: u32) {
        tokio::time::sleep(self.retry_delay).await;

        let republished = AmqpBroker::publish_once(
            &self.pool,
            &self.stream.exchange,
            &self.stream.routing_key,
            &delivery.data,
            message_properties(next_attempt),
        )
        .await;

        let result = match republished {
            Ok(()) => delivery.ack(BasicAckOptions::default()).await,
            Err(e) => {
                error!(
                    queue = %self.stream.queue,
                    attempt = next_attempt,
                    error = %e,
                    "Retry copy not confirmed, requeueing original"
                );
                delivery
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    })
                    .await
            }
        };
        if let Err(e) = result {
            error!(error = %e, "Failed to settle retried message");
        }
    }

    /// Nack without requeue; the queue's DLX takes it.
    async fn reject(&self, delivery: &Delivery) {
        let nacked = delivery
            .nack(BasicNackOptions {
                requeue: false,
                ..Default::default()
            })
            .await;
        if let Err(e) = nacked {
            error!(error = %e, "Failed to dead-letter message");
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    fn topology(&self) -> &Topology {
        &self.topology
    }

    async fn init(&self) -> Result<()> {
        self.topology.validate()?;
        let channel = Self::get_channel(&self.pool).await?;
        let dead_letter = self.topology.dead_letter();

        let exchanges: HashSet<&str> = self
            .topology
            .streams()
            .iter()
            .map(|s| s.exchange.as_str())
            .collect();
        for exchange in exchanges {
            channel
                .exchange_declare(
                    exchange,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BusError::Connection(format!("Failed to declare exchange: {}", e)))?;
        }

        channel
            .exchange_declare(
                &dead_letter.exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Connection(format!("Failed to declare DLX: {}", e)))?;
        channel
            .queue_declare(
                &dead_letter.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Connection(format!("Failed to declare DLQ: {}", e)))?;
        channel
            .queue_bind(
                &dead_letter.queue,
                &dead_letter.exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Connection(format!("Failed to bind DLQ: {}", e)))?;

        for stream in self.topology.streams() {
            channel
                .queue_declare(
                    &stream.queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    queue_arguments(&dead_letter.exchange),
                )
                .await
                .map_err(|e| BusError::Connection(format!("Failed to declare queue: {}", e)))?;
            channel
                .queue_bind(
                    &stream.queue,
                    &stream.exchange,
                    &stream.routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BusError::Connection(format!("Failed to bind queue: {}", e)))?;
        }

        info!(
            url = %self.config.url,
            streams = self.topology.streams().len(),
            dead_letter_queue = %dead_letter.queue,
            "AMQP topology declared"
        );
        Ok(())
    }

    async fn start_subscription(
        &self,
        handler: Arc<dyn MessageHandler>,
        subscription: &str,
    ) -> Result<SubscriptionHandle> {
        if *self.shutdown_tx.borrow() {
            return Err(BusError::Shutdown);
        }
        let stream = self
            .topology
            .stream_for_subscription(subscription)
            .ok_or_else(|| BusError::UnknownSubscription(subscription.to_string()))?;

        let consumer = Consumer {
            pool: self.pool.clone(),
            stream: stream.clone(),
            dead_letter_exchange: self.topology.dead_letter().exchange.clone(),
            handler,
            max_attempts: self.max_attempts,
            prefetch: self.config.prefetch,
            retry_delay: Duration::from_millis(self.config.retry_delay_ms),
            consumer_tag: format!("{}-{}", self.config.consumer_tag, subscription),
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let task = tokio::spawn(consumer.run(cancel_rx, shutdown_rx));

        Ok(SubscriptionHandle::new(subscription, cancel_tx, task))
    }

    #[tracing::instrument(name = "bus.publish", skip(self, message), fields(event_name = %message.event_name))]
    async fn publish(&self, message: &BrokerMessage, publication: &str) -> Result<()> {
        if *self.shutdown_tx.borrow() {
            return Err(BusError::Shutdown);
        }
        let stream = self
            .topology
            .stream_for_publication(publication)
            .ok_or_else(|| BusError::UnknownPublication(publication.to_string()))?;
        let payload = serde_json::to_vec(message)?;

        let backoff = publish_backoff().build();
        let mut last_error = None;

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            match Self::publish_once(
                &self.pool,
                &stream.exchange,
                &stream.routing_key,
                &payload,
                message_properties(1),
            )
            .await
            {
                Ok(()) => {
                    debug!(
                        exchange = %stream.exchange,
                        routing_key = %stream.routing_key,
                        "Published message"
                    );
                    return Ok(());
                }
                Err(e) => {
                    error!(attempt = attempt + 1, error = %e, "Publish failed, retrying...");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| BusError::Publish("Max retries exceeded".to_string())))
    }

    async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx.send_replace(true);
        self.pool.close();
        info!("AMQP broker shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_attempt_carries_no_header() {
        let properties = message_properties(1);
        assert!(properties.headers().is_none());
        assert_eq!(attempt_of(&properties), 1);
    }

    #[test]
    fn test_retry_attempt_round_trips_through_headers() {
        assert_eq!(attempt_of(&message_properties(3)), 3);
    }

    #[test]
    fn test_foreign_attempt_header_types_are_read() {
        let mut headers = FieldTable::default();
        headers.insert(ATTEMPT_HEADER.into(), AMQPValue::LongLongInt(4));
        let properties = BasicProperties::default().with_headers(headers);
        assert_eq!(attempt_of(&properties), 4);

        let mut headers = FieldTable::default();
        headers.insert(ATTEMPT_HEADER.into(), AMQPValue::LongInt(-1));
        let properties = BasicProperties::default().with_headers(headers);
        assert_eq!(attempt_of(&properties), 1);
    }

    #[test]
    fn test_only_plain_ack_confirms_a_publish() {
        assert!(check_confirmation(Confirmation::Ack(None), "ex", "rk").is_ok());
        assert!(matches!(
            check_confirmation(Confirmation::Nack(None), "ex", "rk"),
            Err(BusError::Publish(_))
        ));
        assert!(matches!(
            check_confirmation(Confirmation::NotRequested, "ex", "rk"),
            Err(BusError::Publish(_))
        ));
    }

    #[test]
    fn test_queue_arguments_name_the_dlx() {
        let args = queue_arguments("chainrelay.dlx");
        assert!(matches!(
            args.inner().get("x-dead-letter-exchange"),
            Some(AMQPValue::LongString(_))
        ));
    }

    #[tokio::test]
    async fn test_new_does_not_connect() {
        let config = AmqpConfig {
            url: "amqp://127.0.0.1:1".to_string(),
            ..AmqpConfig::default()
        };
        let broker = AmqpBroker::new(&config, Topology::default(), 3).unwrap();
        assert_eq!(broker.topology().streams().len(), 2);
    }

    #[tokio::test]
    async fn test_publish_after_shutdown_is_rejected() {
        let broker = AmqpBroker::new(&AmqpConfig::default(), Topology::default(), 3).unwrap();
        broker.shutdown().await.unwrap();
        let result = broker
            .publish(&BrokerMessage::new("x", serde_json::json!({})), "chain-events")
            .await;
        assert!(matches!(result, Err(BusError::Shutdown)));
    }
}
