//! Composition root.
//!
//! [`Runtime::build`] turns a [`Config`] into connected storage, an
//! initialized broker, the caches, the chain client and the chain event
//! dispatcher. The binaries pick which halves to run:
//!
//! - relay: [`Runtime::run_relay`]
//! - consumer: [`Runtime::run_consumer`]
//! - standalone: [`Runtime::run_standalone`] (both, one process)

use std::future::Future;
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::watch;
use tracing::{error, info};

use crate::bus::topology::{CHAIN_EVENTS_SUBSCRIPTION, DOMAIN_EVENTS_SUBSCRIPTION};
use crate::bus::{init_broker, Broker, BusError, SubscriptionHandle, Topology};
use crate::cache::{BanCache, ChainNodeCache, Clock, SystemClock};
use crate::chain::{ChainClient, ChainError, JsonRpcChainClient};
use crate::config::{Config, ConfigError, MessagingType};
use crate::consumer::{ChainEventDispatcher, DomainEventConsumer, RoutingError};
use crate::handlers::HandlerContext;
use crate::outbox::{RelayStats, RelayWorker};
use crate::storage::{init_storage, ProjectionStore, SqliteBanLookup, SqliteOutboxStore, StorageError};
use crate::utils::bootstrap::{connect_with_retry, SHUTDOWN_GRACE};

/// Errors raised while assembling or running the runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Broker error: {0}")]
    Bus(#[from] BusError),

    #[error("Broker setup failed: {0}")]
    BrokerSetup(Box<dyn std::error::Error + Send + Sync>),

    #[error("Chain client error: {0}")]
    Chain(#[from] ChainError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),
}

/// Everything a chainrelay process runs on.
pub struct Runtime {
    config: Config,
    pool: SqlitePool,
    broker: Arc<dyn Broker>,
    projections: ProjectionStore,
    chain_nodes: Arc<ChainNodeCache>,
    bans: Arc<BanCache>,
    dispatcher: Arc<ChainEventDispatcher>,
}

impl Runtime {
    /// Connect storage and the broker from `config` and wire everything else.
    pub async fn build(config: Config) -> Result<Self, RuntimeError> {
        config.validate()?;

        let storage = config.storage.clone();
        let pool = connect_with_retry("database", &storage.path, || init_storage(&storage)).await?;

        let broker = match config.messaging.messaging_type {
            MessagingType::Memory => init_broker(&config.messaging, Topology::default())
                .await
                .map_err(RuntimeError::BrokerSetup)?,
            MessagingType::Amqp => connect_with_retry("broker", &config.messaging.amqp.url, || {
                init_broker(&config.messaging, Topology::default())
            })
            .await
            .map_err(RuntimeError::BrokerSetup)?,
        };

        Self::with_parts(config, pool, broker, Arc::new(SystemClock))
    }

    /// Wire a runtime around an already connected pool and broker.
    pub fn with_parts(
        config: Config,
        pool: SqlitePool,
        broker: Arc<dyn Broker>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RuntimeError> {
        let projections = ProjectionStore::new(pool.clone());
        let chain_nodes = Arc::new(ChainNodeCache::new(
            projections.clone(),
            &config.cache,
            clock.clone(),
        ));
        let bans = Arc::new(BanCache::new(
            Arc::new(SqliteBanLookup::new(pool.clone())),
            &config.cache,
            clock,
        ));

        let chain: Arc<dyn ChainClient> = Arc::new(JsonRpcChainClient::new(config.chain.clone())?);
        let ctx = HandlerContext::new(projections.clone(), chain, chain_nodes.clone());
        let dispatcher = Arc::new(ChainEventDispatcher::from_config(&config.dispatch, ctx)?);

        Ok(Self {
            config,
            pool,
            broker,
            projections,
            chain_nodes,
            bans,
            dispatcher,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        self.broker.clone()
    }

    pub fn projections(&self) -> &ProjectionStore {
        &self.projections
    }

    pub fn ban_cache(&self) -> Arc<BanCache> {
        self.bans.clone()
    }

    pub fn dispatcher(&self) -> Arc<ChainEventDispatcher> {
        self.dispatcher.clone()
    }

    /// A relay worker over this runtime's outbox and broker.
    pub fn relay_worker(&self) -> RelayWorker {
        RelayWorker::new(
            Arc::new(SqliteOutboxStore::new(self.pool.clone())),
            self.broker.clone(),
            self.config.relay.clone(),
        )
    }

    async fn start_caches(&self) {
        self.chain_nodes.start().await;
        self.bans.start().await;
    }

    async fn stop_caches(&self) {
        self.chain_nodes.stop().await;
        self.bans.stop().await;
    }

    /// Attach the chain event dispatcher and the domain event consumer.
    pub async fn start_consumers(&self) -> Result<Vec<SubscriptionHandle>, RuntimeError> {
        let chain = self
            .broker
            .start_subscription(self.dispatcher.clone(), CHAIN_EVENTS_SUBSCRIPTION)
            .await?;
        let domain = self
            .broker
            .start_subscription(Arc::new(DomainEventConsumer), DOMAIN_EVENTS_SUBSCRIPTION)
            .await?;
        Ok(vec![chain, domain])
    }

    /// Relay until `shutdown` resolves or `relay.max_iterations` ticks ran.
    /// Shuts the broker down on exit.
    pub async fn run_relay<F>(&self, shutdown: F) -> RelayStats
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (stop_rx, watcher) = watch_shutdown(shutdown);
        let stats = self
            .relay_worker()
            .run(self.config.relay.max_iterations, stop_rx)
            .await;
        watcher.abort();
        stats
    }

    /// Consume until `shutdown` resolves, then stop consumers and the broker.
    pub async fn run_consumer<F>(&self, shutdown: F) -> Result<(), RuntimeError>
    where
        F: Future<Output = ()>,
    {
        self.start_caches().await;
        let handles = match self.start_consumers().await {
            Ok(handles) => handles,
            Err(e) => {
                self.stop_caches().await;
                return Err(e);
            }
        };
        info!(subscriptions = handles.len(), "Consumers running");

        shutdown.await;

        for handle in &handles {
            handle.stop();
        }
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        for handle in handles {
            handle.join().await;
        }
        if let Err(e) = self.broker.shutdown().await {
            error!(error = %e, "Broker shutdown failed");
        }
        self.stop_caches().await;
        info!("Consumers stopped");
        Ok(())
    }

    /// Relay and consumers in one process.
    ///
    /// The relay stops first and shuts the broker down; consumers then drain
    /// what was already delivered to them and exit.
    pub async fn run_standalone<F>(&self, shutdown: F) -> Result<RelayStats, RuntimeError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.start_caches().await;
        let handles = match self.start_consumers().await {
            Ok(handles) => handles,
            Err(e) => {
                self.stop_caches().await;
                return Err(e);
            }
        };
        info!(subscriptions = handles.len(), "Standalone runtime running");

        let stats = self.run_relay(shutdown).await;

        for handle in handles {
            handle.join().await;
        }
        self.stop_caches().await;
        info!(relayed = stats.relayed, "Standalone runtime stopped");
        Ok(stats)
    }
}

/// Forward `shutdown` into a watch channel the relay loop understands.
fn watch_shutdown<F>(shutdown: F) -> (watch::Receiver<bool>, tokio::task::JoinHandle<()>)
where
    F: Future<Output = ()> + Send + 'static,
{
    let (stop_tx, stop_rx) = watch::channel(false);
    let watcher = tokio::spawn(async move {
        shutdown.await;
        let _ = stop_tx.send(true);
        // Hold the sender so the relay never sees the channel close early.
        std::future::pending::<()>().await;
    });
    (stop_rx, watcher)
}
