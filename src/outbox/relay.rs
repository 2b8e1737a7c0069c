//! Outbox relay worker.
//!
//! Polls the outbox, publishes pending rows oldest-first, and marks each one
//! relayed after the broker accepted it. One tick = one claimed batch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{OutboxEvent, OutboxStore};
use crate::bus::format::{ChainEventCreatedFormat, MsgFormat};
use crate::bus::topology::{CHAIN_EVENTS, DOMAIN_EVENTS};
use crate::bus::{Broker, BrokerMessage, BusError};
use crate::storage::StorageError;

/// Errors that abort a relay tick.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Outbox storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Broker error: {0}")]
    Bus(#[from] BusError),
}

/// Relay worker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Rows claimed per tick.
    pub batch_size: u32,
    /// Sleep between ticks.
    pub poll_interval_ms: u64,
    /// How long a claim keeps other relay instances off a row.
    pub lease_secs: u64,
    /// Stable identity for claims. Generated per process when unset.
    pub worker_id: Option<String>,
    /// Stop after this many ticks. Unset runs until shutdown.
    pub max_iterations: Option<u64>,
    /// Publication for rows with no destination and no route.
    pub default_publication: String,
    /// Event name -> publication.
    pub routes: HashMap<String, String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval_ms: 1000,
            lease_secs: 30,
            worker_id: None,
            max_iterations: None,
            default_publication: DOMAIN_EVENTS.to_string(),
            routes: HashMap::from([(
                ChainEventCreatedFormat::MESSAGE_TYPE.to_string(),
                CHAIN_EVENTS.to_string(),
            )]),
        }
    }
}

/// What one tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub claimed: usize,
    pub relayed: usize,
    /// Rows the broker can never accept, taken out of circulation.
    pub parked: usize,
    /// A publish failed transiently and the tick stopped early.
    pub publish_failed: bool,
}

/// Totals over a [`RelayWorker::run`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub ticks: u64,
    pub relayed: u64,
    pub parked: u64,
    pub failed_ticks: u64,
}

/// Moves outbox rows to the broker.
pub struct RelayWorker {
    store: Arc<dyn OutboxStore>,
    broker: Arc<dyn Broker>,
    config: RelayConfig,
    worker_id: String,
}

impl RelayWorker {
    pub fn new(store: Arc<dyn OutboxStore>, broker: Arc<dyn Broker>, config: RelayConfig) -> Self {
        let worker_id = config
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("relay-{}", Uuid::new_v4()));
        Self {
            store,
            broker,
            config,
            worker_id,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Row destination, else the route for its event name, else the default.
    pub fn publication_for<'a>(&'a self, event: &'a OutboxEvent) -> &'a str {
        event
            .destination
            .as_deref()
            .or_else(|| self.config.routes.get(&event.event_name).map(String::as_str))
            .unwrap_or(&self.config.default_publication)
    }

    /// Claim one batch and publish it in `created_at` order.
    ///
    /// A transient publish failure ends the tick at that row: publishing
    /// later rows would let them overtake it. Unpublished rows are released
    /// for the next tick. A permanent failure parks the row and the tick
    /// moves on.
    pub async fn tick(&self, tick: u64) -> Result<TickReport, RelayError> {
        let lease = Duration::from_secs(self.config.lease_secs);
        let batch = self
            .store
            .claim_pending(&self.worker_id, self.config.batch_size, lease)
            .await?;

        let mut report = TickReport {
            claimed: batch.len(),
            ..TickReport::default()
        };
        if batch.is_empty() {
            debug!(tick, "Outbox empty");
            return Ok(report);
        }

        for event in &batch {
            let publication = self.publication_for(event);
            let message = BrokerMessage::from_outbox(event);

            if let Err(e) = self.broker.publish(&message, publication).await {
                if e.is_permanent() {
                    error!(
                        tick,
                        event_id = event.id,
                        event_name = %event.event_name,
                        natural_key = ?event.natural_key,
                        publication,
                        error = %e,
                        "Event can never be published, parking it"
                    );
                    if self.store.park(event.id, &self.worker_id, &e.to_string()).await? {
                        report.parked += 1;
                    }
                    continue;
                }
                error!(
                    tick,
                    event_id = event.id,
                    event_name = %event.event_name,
                    natural_key = ?event.natural_key,
                    publication,
                    error = %e,
                    "Publish failed, leaving remaining events for next tick"
                );
                report.publish_failed = true;
                break;
            }

            if self.store.mark_relayed(event.id, &self.worker_id).await? {
                report.relayed += 1;
                debug!(tick, event_id = event.id, event_name = %event.event_name, publication, "Event relayed");
            } else {
                warn!(
                    tick,
                    event_id = event.id,
                    event_name = %event.event_name,
                    "Published but claim was lost; another relay may publish it again"
                );
            }
        }

        if report.relayed + report.parked < report.claimed {
            self.store.release_claims(&self.worker_id).await?;
        }

        info!(
            tick,
            claimed = report.claimed,
            relayed = report.relayed,
            parked = report.parked,
            publish_failed = report.publish_failed,
            "Relay tick complete"
        );
        Ok(report)
    }

    /// Tick until `max_iterations` ticks have run or `shutdown` flips to true.
    ///
    /// An in-flight tick always completes. Tick errors are logged and the
    /// loop carries on. On exit the worker releases its claims and shuts the
    /// broker down.
    pub async fn run(&self, max_iterations: Option<u64>, mut shutdown: watch::Receiver<bool>) -> RelayStats {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut stats = RelayStats::default();
        let mut shutdown_open = true;

        info!(worker_id = %self.worker_id, ?max_iterations, "Relay worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            stats.ticks += 1;
            match self.tick(stats.ticks).await {
                Ok(report) => {
                    stats.relayed += report.relayed as u64;
                    stats.parked += report.parked as u64;
                    if report.publish_failed {
                        stats.failed_ticks += 1;
                    }
                }
                Err(e) => {
                    stats.failed_ticks += 1;
                    error!(tick = stats.ticks, error = %e, "Relay tick failed");
                }
            }

            if max_iterations.is_some_and(|max| stats.ticks >= max) {
                break;
            }

            if shutdown_open {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    changed = shutdown.changed() => match changed {
                        Ok(()) if *shutdown.borrow() => break,
                        Ok(()) => {}
                        // Sender gone: nobody can ask us to stop any more.
                        Err(_) => shutdown_open = false,
                    },
                }
            } else {
                tokio::time::sleep(poll_interval).await;
            }
        }

        if let Err(e) = self.store.release_claims(&self.worker_id).await {
            error!(error = %e, "Failed to release outbox claims");
        }
        if let Err(e) = self.broker.shutdown().await {
            error!(error = %e, "Broker shutdown failed");
        }

        info!(
            worker_id = %self.worker_id,
            ticks = stats.ticks,
            relayed = stats.relayed,
            parked = stats.parked,
            failed_ticks = stats.failed_ticks,
            "Relay worker stopped"
        );
        stats
    }
}

/// Handle to a relay worker running on its own task.
pub struct RelayWorkerHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<RelayStats>,
}

impl RelayWorkerHandle {
    /// Ask the worker to stop after its current tick.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    /// Wait for the worker to exit.
    pub async fn join(self) -> RelayStats {
        match self.task.await {
            Ok(stats) => stats,
            Err(e) => {
                error!(error = %e, "Relay worker task panicked");
                RelayStats::default()
            }
        }
    }
}

/// Spawn a relay worker on a background task.
pub fn spawn_relay_worker(worker: RelayWorker, max_iterations: Option<u64>) -> RelayWorkerHandle {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let task = tokio::spawn(async move { worker.run(max_iterations, cancel_rx).await });
    RelayWorkerHandle {
        cancel: cancel_tx,
        task,
    }
}
