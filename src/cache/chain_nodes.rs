//! Chain node resolution, cached.

use std::sync::Arc;

use tracing::debug;

use super::{CacheConfig, Clock, GuardedCache, TtlMap};
use crate::chain::ChainNode;
use crate::storage::{ProjectionStore, Result};

/// `eth_chain_id -> ChainNode`, read through to `chain_nodes`.
///
/// Unknown chains are not cached, so a node registered later is picked up
/// on the next lookup.
pub struct ChainNodeCache {
    cache: GuardedCache<TtlMap<i64, ChainNode>>,
    store: ProjectionStore,
}

impl ChainNodeCache {
    pub fn new(store: ProjectionStore, config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let cache = GuardedCache::new(TtlMap::new(config.ttl()), config.prune_interval_secs)
            .with_sweep(TtlMap::sweep)
            .with_clock(clock);
        Self { cache, store }
    }

    pub async fn resolve(&self, eth_chain_id: i64) -> Result<Option<ChainNode>> {
        let now = self.cache.now();
        if let Some(node) = self.cache.access(|m| m.get(&eth_chain_id, now).cloned()).await {
            return Ok(Some(node));
        }

        let node = self.store.chain_node(eth_chain_id).await?;
        if let Some(node) = &node {
            debug!(eth_chain_id, name = %node.name, "Chain node cached");
            let now = self.cache.now();
            let node = node.clone();
            self.cache.access(|m| m.insert(eth_chain_id, node, now)).await;
        }
        Ok(node)
    }

    pub async fn start(&self) {
        self.cache.start().await;
    }

    pub async fn stop(&self) {
        self.cache.stop().await;
    }
}
