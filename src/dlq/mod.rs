//! Dead Letter Queue (DLQ) inspection.
//!
//! Messages a consumer refused to retry land here instead of disappearing.
//! An operator lists them, fixes the root cause, then replays or discards.
//!
//! The AMQP broker dead-letters into the shared dead-letter queue declared by
//! the topology; the in-memory broker records into an [`InMemoryDeadLetterStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::{Broker, BrokerMessage, BusError};

/// Errors that can occur during DLQ operations.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("Dead letter not found: {0}")]
    NotFound(Uuid),

    #[error("Replay failed: {0}")]
    Replay(#[from] BusError),
}

/// A message that will not be retried, with why.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub id: Uuid,
    /// Publication the message was originally sent to; replay targets it.
    pub publication: String,
    pub subscription: String,
    pub message: BrokerMessage,
    pub reason: String,
    /// Deliveries made before giving up.
    pub attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        publication: impl Into<String>,
        subscription: impl Into<String>,
        message: BrokerMessage,
        reason: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            publication: publication.into(),
            subscription: subscription.into(),
            message,
            reason: reason.into(),
            attempts,
            dead_lettered_at: Utc::now(),
        }
    }
}

/// Where dead letters are kept for inspection.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn record(&self, dead_letter: DeadLetter);

    /// Oldest first.
    async fn list(&self) -> Vec<DeadLetter>;

    /// Remove and return one entry (discard, or the first half of a replay).
    async fn take(&self, id: Uuid) -> Result<DeadLetter, DlqError>;
}

/// Process-local dead-letter store.
#[derive(Default)]
pub struct InMemoryDeadLetterStore {
    entries: RwLock<Vec<DeadLetter>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn record(&self, dead_letter: DeadLetter) {
        warn!(
            id = %dead_letter.id,
            subscription = %dead_letter.subscription,
            event_name = %dead_letter.message.event_name,
            attempts = dead_letter.attempts,
            reason = %dead_letter.reason,
            "Message dead-lettered"
        );
        self.entries.write().await.push(dead_letter);
    }

    async fn list(&self) -> Vec<DeadLetter> {
        self.entries.read().await.clone()
    }

    async fn take(&self, id: Uuid) -> Result<DeadLetter, DlqError> {
        let mut entries = self.entries.write().await;
        let index = entries
            .iter()
            .position(|d| d.id == id)
            .ok_or(DlqError::NotFound(id))?;
        Ok(entries.remove(index))
    }
}

/// Publish a dead letter back to its original publication.
///
/// The entry is removed first and restored if the publish fails, so a
/// replay never duplicates an entry.
pub async fn replay(
    store: &dyn DeadLetterStore,
    broker: &dyn Broker,
    id: Uuid,
) -> Result<(), DlqError> {
    let dead_letter = store.take(id).await?;
    let message = BrokerMessage::new(
        dead_letter.message.event_name.clone(),
        dead_letter.message.event_payload.clone(),
    );

    match broker.publish(&message, &dead_letter.publication).await {
        Ok(()) => {
            info!(
                id = %id,
                publication = %dead_letter.publication,
                event_name = %message.event_name,
                "Dead letter replayed"
            );
            Ok(())
        }
        Err(e) => {
            store.record(dead_letter).await;
            Err(DlqError::Replay(e))
        }
    }
}
