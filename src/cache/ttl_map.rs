//! Map whose entries expire after a fixed time-to-live.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

/// Key/value state for a [`GuardedCache`](super::GuardedCache).
///
/// Expired entries read as absent immediately; they are physically removed
/// by [`TtlMap::prune`], normally from the cache's sweep.
#[derive(Debug, Clone)]
pub struct TtlMap<K, V> {
    entries: HashMap<K, (V, DateTime<Utc>)>,
    ttl: chrono::Duration,
}

impl<K: Eq + Hash, V> TtlMap<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
        }
    }

    fn is_live(&self, inserted_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(inserted_at) < self.ttl
    }

    pub fn get(&self, key: &K, now: DateTime<Utc>) -> Option<&V> {
        self.entries
            .get(key)
            .filter(|(_, inserted_at)| self.is_live(*inserted_at, now))
            .map(|(value, _)| value)
    }

    pub fn insert(&mut self, key: K, value: V, now: DateTime<Utc>) {
        self.entries.insert(key, (value, now));
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(value, _)| value)
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries
            .retain(|_, (_, inserted_at)| now.signed_duration_since(*inserted_at) < ttl);
        before - self.entries.len()
    }

    /// [`TtlMap::prune`] shaped as a cache sweep.
    pub fn sweep(&mut self, now: DateTime<Utc>) {
        let removed = self.prune(now);
        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "Pruned expired cache entries");
        }
    }

    /// Physical size, expired entries included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expired_entry_reads_absent_before_prune() {
        let t0 = Utc::now();
        let mut map = TtlMap::new(Duration::from_secs(60));
        map.insert("k", 1, t0);

        assert_eq!(map.get(&"k", t0 + chrono::Duration::seconds(59)), Some(&1));
        assert_eq!(map.get(&"k", t0 + chrono::Duration::seconds(60)), None);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_prune_removes_only_expired() {
        let t0 = Utc::now();
        let mut map = TtlMap::new(Duration::from_secs(60));
        map.insert("old", 1, t0);
        map.insert("new", 2, t0 + chrono::Duration::seconds(30));

        assert_eq!(map.prune(t0 + chrono::Duration::seconds(61)), 1);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&"new", t0 + chrono::Duration::seconds(61)), Some(&2));
    }

    #[test]
    fn test_reinsert_refreshes_age() {
        let t0 = Utc::now();
        let mut map = TtlMap::new(Duration::from_secs(10));
        map.insert("k", 1, t0);
        map.insert("k", 2, t0 + chrono::Duration::seconds(8));

        assert_eq!(map.get(&"k", t0 + chrono::Duration::seconds(15)), Some(&2));
        assert_eq!(map.remove(&"k"), Some(2));
        assert!(map.is_empty());
    }
}
