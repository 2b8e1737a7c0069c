//! Community ban check, cached.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{CacheConfig, Clock, GuardedCache, TtlMap};
use crate::storage::Result;

/// Source of truth for bans.
#[async_trait]
pub trait BanLookup: Send + Sync {
    async fn is_banned(&self, community_id: &str, address: &str) -> Result<bool>;
}

type BanKey = (String, String);

/// Answers "is this address banned in this community" from a TTL cache,
/// falling back to a [`BanLookup`] on miss. Both answers are cached.
pub struct BanCache {
    cache: GuardedCache<TtlMap<BanKey, bool>>,
    lookup: Arc<dyn BanLookup>,
}

impl BanCache {
    pub fn new(lookup: Arc<dyn BanLookup>, config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let cache = GuardedCache::new(TtlMap::new(config.ttl()), config.prune_interval_secs)
            .with_sweep(TtlMap::sweep)
            .with_clock(clock);
        Self { cache, lookup }
    }

    fn key(community_id: &str, address: &str) -> BanKey {
        (community_id.to_string(), address.to_lowercase())
    }

    pub async fn is_banned(&self, community_id: &str, address: &str) -> Result<bool> {
        let key = Self::key(community_id, address);
        let now = self.cache.now();
        if let Some(banned) = self.cache.access(|m| m.get(&key, now).copied()).await {
            return Ok(banned);
        }

        // Lookup runs outside the lock.
        let banned = self.lookup.is_banned(community_id, address).await?;
        debug!(community_id, address, banned, "Ban cache miss");
        let now = self.cache.now();
        self.cache.access(|m| m.insert(key, banned, now)).await;
        Ok(banned)
    }

    /// Forget a cached answer, e.g. right after a ban is issued or lifted.
    pub async fn invalidate(&self, community_id: &str, address: &str) {
        let key = Self::key(community_id, address);
        self.cache.access(|m| m.remove(&key)).await;
    }

    pub async fn start(&self) {
        self.cache.start().await;
    }

    pub async fn stop(&self) {
        self.cache.stop().await;
    }

    pub async fn sweep_now(&self) {
        self.cache.sweep_now().await;
    }

    /// Entries held, expired ones included.
    pub async fn len(&self) -> usize {
        self.cache.access(|m| m.len()).await
    }
}
