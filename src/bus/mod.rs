//! Broker abstraction.
//!
//! A broker moves [`BrokerMessage`]s from publications to subscriptions as
//! declared by a [`Topology`]. Handlers answer every delivery with an
//! [`Outcome`]; the broker turns that into ack, redelivery, or dead-lettering.
//!
//! Implementations:
//! - [`memory::InMemoryBroker`]: in-process queues, used by the standalone
//!   binary and tests
//! - `amqp::AmqpBroker`: RabbitMQ (feature `amqp`)

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{Sqlite, Transaction};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::{MessagingConfig, MessagingType};
use crate::outbox::{self, NewOutboxEvent, OutboxEvent};
use crate::storage::StorageError;

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod format;
pub mod memory;
pub mod topology;

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use format::{ChainEventCreatedFormat, DomainEventFormat, FormatError, MsgFormat};
pub use memory::InMemoryBroker;
pub use topology::{DeadLetterTopology, StreamTopology, Topology};

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during broker operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Unknown publication: {0}")]
    UnknownPublication(String),

    #[error("Unknown subscription: {0}")]
    UnknownSubscription(String),

    #[error("Invalid topology: {0}")]
    Topology(String),

    #[error("Broker is shut down")]
    Shutdown,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Outbox error: {0}")]
    Outbox(#[from] StorageError),

    #[cfg(feature = "amqp")]
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),
}

impl BusError {
    /// Retrying will not help: the message or its publication is wrong.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::UnknownPublication(_) | Self::Serialization(_))
    }
}

/// Delivery metadata assigned by the broker. Never serialized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryInfo {
    pub routing_key: String,
    /// Zero on first delivery.
    pub redelivery_count: u32,
}

/// The unit moved by a broker: `{ event_name, event_payload }` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerMessage {
    pub event_name: String,
    pub event_payload: Value,
    #[serde(skip)]
    pub delivery: DeliveryInfo,
}

impl BrokerMessage {
    pub fn new(event_name: impl Into<String>, event_payload: Value) -> Self {
        Self {
            event_name: event_name.into(),
            event_payload,
            delivery: DeliveryInfo::default(),
        }
    }

    pub fn from_outbox(event: &OutboxEvent) -> Self {
        Self::new(event.event_name.clone(), event.event_payload.clone())
    }

    /// Same message with delivery metadata attached.
    pub fn with_delivery(mut self, routing_key: impl Into<String>, redelivery_count: u32) -> Self {
        self.delivery = DeliveryInfo {
            routing_key: routing_key.into(),
            redelivery_count,
        };
        self
    }
}

/// What a handler wants done with a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Processed (or deliberately dropped); remove from the queue.
    Ack,
    /// Transient failure; redeliver until the broker's attempt budget runs out.
    Retry(String),
    /// Never retry; route to the dead-letter queue.
    DeadLetter(String),
}

impl Outcome {
    pub fn is_ack(&self) -> bool {
        matches!(self, Outcome::Ack)
    }
}

/// Consumer-side callback invoked once per delivery.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &BrokerMessage) -> Outcome;
}

/// A running subscription. Dropping the handle leaves it running.
pub struct SubscriptionHandle {
    subscription: String,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    pub fn new(subscription: impl Into<String>, cancel: watch::Sender<bool>, task: JoinHandle<()>) -> Self {
        Self {
            subscription: subscription.into(),
            cancel,
            task,
        }
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    /// Signal the consumer to stop after the delivery in hand.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    /// Wait for the consumer task to exit.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::error!(subscription = %self.subscription, error = %e, "Consumer task panicked");
        }
    }
}

/// Publish/subscribe contract shared by every broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declared streams and the shared dead-letter pair.
    fn topology(&self) -> &Topology;

    /// Connect and declare the topology. Idempotent.
    async fn init(&self) -> Result<()>;

    /// Start delivering messages from `subscription` to `handler`.
    async fn start_subscription(
        &self,
        handler: Arc<dyn MessageHandler>,
        subscription: &str,
    ) -> Result<SubscriptionHandle>;

    /// Publish directly. Callers inside a business transaction use
    /// [`Broker::safe_publish`] instead.
    async fn publish(&self, message: &BrokerMessage, publication: &str) -> Result<()>;

    /// Stage `message` in the outbox on the caller's transaction.
    ///
    /// Nothing reaches the network here: the relay publishes it once the
    /// transaction commits. Returns `None` if a message with the same natural
    /// key was already staged for this publication.
    async fn safe_publish(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        message: &BrokerMessage,
        natural_key: &str,
        publication: &str,
    ) -> Result<Option<i64>> {
        if self.topology().stream_for_publication(publication).is_none() {
            return Err(BusError::UnknownPublication(publication.to_string()));
        }

        let event = NewOutboxEvent::new(message.event_name.clone(), message.event_payload.clone())
            .natural_key(natural_key)
            .destination(publication);

        let ids = outbox::enqueue(tx, std::slice::from_ref(&event)).await?;
        Ok(ids.into_iter().next())
    }

    /// Stop consumers and release connections.
    async fn shutdown(&self) -> Result<()>;
}

/// Build the broker selected by configuration.
pub async fn init_broker(
    config: &MessagingConfig,
    topology: Topology,
) -> std::result::Result<Arc<dyn Broker>, Box<dyn std::error::Error + Send + Sync>> {
    topology.validate()?;

    let broker: Arc<dyn Broker> = match config.messaging_type {
        MessagingType::Memory => Arc::new(InMemoryBroker::new(topology, config.max_attempts)),
        MessagingType::Amqp => {
            #[cfg(feature = "amqp")]
            {
                Arc::new(AmqpBroker::new(&config.amqp, topology, config.max_attempts)?)
            }

            #[cfg(not(feature = "amqp"))]
            {
                return Err(
                    "AMQP support requires the 'amqp' feature. Rebuild with --features amqp".into(),
                );
            }
        }
    };

    broker.init().await?;
    info!(messaging_type = ?config.messaging_type, "Broker initialized");
    Ok(broker)
}

#[cfg(test)]
mod tests;
