//! Injected TTL cache with explicit invalidation.
//!
//! Replaces process-wide lookup tables (queue by name, namespace backing
//! entities, monitor throttles). Each owner gets its own instance.

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;

#[derive(Debug)]
pub struct TtlCache<K, V>
where
    K: Eq + Hash,
{
    entries: Arc<DashMap<K, (V, Instant)>>,
    ttl: Duration,
}

impl<K: Eq + Hash, V> Clone for TtlCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            ttl: self.ttl,
        }
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let hit = self.entries.get(key).and_then(|entry| {
            let (value, stored) = entry.value();
            (stored.elapsed() < self.ttl).then(|| value.clone())
        });
        if hit.is_none() {
            self.entries.remove_if(key, |_, (_, stored)| stored.elapsed() >= self.ttl);
        }
        hit
    }

    pub fn insert(&self, key: K, value: V) {
        self.entries.insert(key, (value, Instant::now()));
    }

    /// Insert unless a live entry exists. Returns whether the insert
    /// happened. Atomic per key, which makes it usable as a throttle.
    pub fn insert_if_vacant(&self, key: K, value: V) -> bool {
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().1.elapsed() < self.ttl {
                    false
                } else {
                    occupied.insert((value, Instant::now()));
                    true
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert((value, Instant::now()));
                true
            }
        }
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.remove(key);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Drop expired entries.
    pub fn purge_expired(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, (_, stored)| stored.elapsed() < ttl);
    }

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

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = TtlCache::new(Duration::from_secs(5));
        cache.insert("q1".to_string(), 1);
        assert_eq!(cache.get(&"q1".to_string()), Some(1));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.get(&"q1".to_string()), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn insert_if_vacant_throttles() {
        let cache = TtlCache::new(Duration::from_secs(5));
        assert!(cache.insert_if_vacant("q1", ()));
        assert!(!cache.insert_if_vacant("q1", ()));
        assert!(cache.insert_if_vacant("q2", ()));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(cache.insert_if_vacant("q1", ()));
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert(1, "a");
        cache.invalidate(&1);
        assert_eq!(cache.get(&1), None);
    }
}
