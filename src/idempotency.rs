//! In-process idempotency-key cache.
//!
//! Best-effort fast path in front of the durable `external_id` unique
//! index; correctness never depends on it. Entries live for 24 hours.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub struct IdempotencyCache {
    inner: RwLock<HashMap<String, (String, Instant)>>,
    ttl: Duration,
}

impl IdempotencyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn lookup(&self, key: &str) -> Option<String> {
        {
            let cache = self.inner.read();
            match cache.get(key) {
                Some((payout_id, inserted)) if inserted.elapsed() < self.ttl => {
                    return Some(payout_id.clone());
                }
                Some(_) => {} // stale, evict below
                None => return None,
            }
        }
        self.inner.write().remove(key);
        None
    }

    pub fn remember(&self, key: &str, payout_id: &str) {
        self.inner
            .write()
            .insert(key.to_string(), (payout_id.to_string(), Instant::now()));
    }

    /// Drop expired entries; run from a slow background loop.
    pub fn prune(&self) -> usize {
        let mut cache = self.inner.write();
        let before = cache.len();
        cache.retain(|_, (_, inserted)| inserted.elapsed() < self.ttl);
        before - cache.len()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remember_and_lookup() {
        let cache = IdempotencyCache::new(Duration::from_secs(60));
        assert_eq!(cache.lookup("k1"), None);
        cache.remember("k1", "payout-1");
        assert_eq!(cache.lookup("k1").as_deref(), Some("payout-1"));
    }

    #[test]
    fn expired_entries_are_evicted_on_lookup() {
        let cache = IdempotencyCache::new(Duration::from_millis(0));
        cache.remember("k1", "payout-1");
        assert_eq!(cache.lookup("k1"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn prune_drops_only_stale_entries() {
        let cache = IdempotencyCache::new(Duration::from_secs(60));
        cache.remember("fresh", "p1");
        assert_eq!(cache.prune(), 0);
        assert_eq!(cache.len(), 1);
    }
}
