//! Transactional outbox.
//!
//! Business code stages events with [`enqueue`] inside the same SQLite
//! transaction as the write they describe. The flow:
//!
//! 1. `enqueue` inserts outbox rows on the caller's open transaction
//! 2. The caller commits (or rolls back, and the rows never existed)
//! 3. The [`relay::RelayWorker`] claims pending rows oldest-first, publishes
//!    each one, and marks it relayed only after the broker accepted it
//!
//! Delivery is at-least-once: a crash between publish and mark replays the
//! row on the next tick. Consumers deduplicate by natural key. A row the
//! broker can never accept is parked so it cannot hold back the rows behind it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Sqlite, Transaction};
use tracing::debug;

use crate::bus::Topology;
use crate::storage::{Result, StorageError};

pub mod relay;

pub use relay::{spawn_relay_worker, RelayConfig, RelayError, RelayStats, RelayWorker, RelayWorkerHandle};

/// An event to be staged in the outbox.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEvent {
    pub event_name: String,
    pub event_payload: Value,
    /// Staging time. `None` means "now"; replays and tests may backdate.
    pub created_at: Option<DateTime<Utc>>,
    /// Deduplication key. A second row with the same destination and key is
    /// dropped; rows without a destination are never deduplicated.
    pub natural_key: Option<String>,
    /// Publication override; otherwise the relay routes by event name. Must
    /// name a publication of the default topology.
    pub destination: Option<String>,
}

impl NewOutboxEvent {
    pub fn new(event_name: impl Into<String>, event_payload: Value) -> Self {
        Self {
            event_name: event_name.into(),
            event_payload,
            created_at: None,
            natural_key: None,
            destination: None,
        }
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn natural_key(mut self, natural_key: impl Into<String>) -> Self {
        self.natural_key = Some(natural_key.into());
        self
    }

    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }
}

/// A persisted outbox row.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEvent {
    pub id: i64,
    pub event_name: String,
    pub event_payload: Value,
    pub natural_key: Option<String>,
    pub destination: Option<String>,
    pub created_at: DateTime<Utc>,
    pub relayed: bool,
    pub relayed_at: Option<DateTime<Utc>>,
}

/// Stage events on the caller's open transaction.
///
/// Returns the ids of the rows created. An event whose `(destination,
/// natural_key)` is already staged creates no row and contributes no id.
/// Nothing is visible to the relay until the caller commits.
///
/// A destination no stream publishes to fails the whole call before anything
/// is written.
pub async fn enqueue(
    tx: &mut Transaction<'_, Sqlite>,
    events: &[NewOutboxEvent],
) -> Result<Vec<i64>> {
    let topology = Topology::default();
    if let Some(unknown) = events
        .iter()
        .filter_map(|e| e.destination.as_deref())
        .find(|d| topology.stream_for_publication(d).is_none())
    {
        return Err(StorageError::UnknownDestination(unknown.to_string()));
    }

    let mut ids = Vec::with_capacity(events.len());
    for event in events {
        match crate::storage::sqlite::insert_event(&mut **tx, event).await? {
            Some(id) => {
                debug!(id, event_name = %event.event_name, "Event staged in outbox");
                ids.push(id);
            }
            None => {
                debug!(
                    event_name = %event.event_name,
                    natural_key = ?event.natural_key,
                    "Event already staged, skipping"
                );
            }
        }
    }
    Ok(ids)
}

/// Interface the relay uses to read and settle outbox rows.
///
/// Implementations:
/// - `SqliteOutboxStore`: SQLite storage
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Lease up to `limit` unrelayed rows to `worker_id`, oldest `created_at`
    /// first (ties broken by id).
    ///
    /// Rows leased to another worker are skipped until their lease expires.
    async fn claim_pending(
        &self,
        worker_id: &str,
        limit: u32,
        lease: Duration,
    ) -> Result<Vec<OutboxEvent>>;

    /// Flip `relayed` for a row leased to `worker_id`.
    ///
    /// Returns false if the row is already relayed or leased elsewhere.
    async fn mark_relayed(&self, id: i64, worker_id: &str) -> Result<bool>;

    /// Take a row leased to `worker_id` out of circulation for good, recording
    /// why. Parked rows are never claimed again and do not count as pending.
    async fn park(&self, id: i64, worker_id: &str, reason: &str) -> Result<bool>;

    /// Drop every unrelayed lease held by `worker_id`.
    async fn release_claims(&self, worker_id: &str) -> Result<u64>;

    /// Number of rows not yet relayed, parked rows excluded.
    async fn pending_count(&self) -> Result<u64>;

    async fn parked_count(&self) -> Result<u64>;

    /// Delete relayed rows whose `relayed_at` is before `older_than`.
    async fn prune_relayed(&self, older_than: DateTime<Utc>) -> Result<u64>;

    async fn fetch(&self, id: i64) -> Result<Option<OutboxEvent>>;
}
