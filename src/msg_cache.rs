//! Request deduplication cache with TTL and lazy cleanup.
//!
//! Entries are keyed by keccak256 of the canonical request bytes. Expired
//! entries are treated as absent on reads; they are only physically removed
//! by the periodic sweep that runs every `threshold` inserts.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const MIN_SWEEP_THRESHOLD: u64 = 10;
const MAX_SWEEP_THRESHOLD: u64 = 1000;

pub struct MessageCache {
    inner: Mutex<CacheInner>,
    ttl: Duration,
}

struct CacheInner {
    entries: HashMap<[u8; 32], Instant>,
    ops_since_sweep: u64,
    threshold: u64,
}

impl MessageCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                ops_since_sweep: 0,
                threshold: MIN_SWEEP_THRESHOLD,
            }),
            ttl,
        }
    }

    pub fn add(&self, hash: [u8; 32]) {
        let mut inner = self.inner.lock().expect("message cache mutex poisoned");
        inner.entries.insert(hash, Instant::now());
        inner.ops_since_sweep += 1;
        if inner.ops_since_sweep >= inner.threshold {
            let ttl = self.ttl;
            inner.entries.retain(|_, t| t.elapsed() < ttl);
            inner.ops_since_sweep = 0;
            inner.threshold = (inner.entries.len() as u64 / 10)
                .clamp(MIN_SWEEP_THRESHOLD, MAX_SWEEP_THRESHOLD);
        }
    }

    pub fn exists(&self, hash: &[u8; 32]) -> bool {
        let inner = self.inner.lock().expect("message cache mutex poisoned");
        inner
            .entries
            .get(hash)
            .is_some_and(|t| t.elapsed() < self.ttl)
    }

    pub fn remove(&self, hash: &[u8; 32]) {
        let mut inner = self.inner.lock().expect("message cache mutex poisoned");
        inner.entries.remove(hash);
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("message cache mutex poisoned")
            .entries
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(b: u8) -> [u8; 32] {
        [b; 32]
    }

    #[test]
    fn test_add_exists_remove() {
        let cache = MessageCache::new(Duration::from_secs(3600));
        assert!(!cache.exists(&h(1)));
        cache.add(h(1));
        assert!(cache.exists(&h(1)));
        cache.remove(&h(1));
        assert!(!cache.exists(&h(1)));
    }

    #[test]
    fn test_expired_entries_read_as_absent() {
        let cache = MessageCache::new(Duration::from_millis(5));
        cache.add(h(2));
        assert!(cache.exists(&h(2)));
        std::thread::sleep(Duration::from_millis(10));
        assert!(!cache.exists(&h(2)));
        // Expired but not swept: still physically present.
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_sweep_evicts_expired() {
        let cache = MessageCache::new(Duration::from_millis(5));
        for i in 0..9 {
            cache.add(h(i));
        }
        std::thread::sleep(Duration::from_millis(10));
        // Tenth insert crosses the minimum threshold and sweeps.
        cache.add(h(9));
        assert_eq!(cache.len(), 1);
        assert!(cache.exists(&h(9)));
    }

    #[test]
    fn test_readd_refreshes_entry() {
        let cache = MessageCache::new(Duration::from_millis(20));
        cache.add(h(3));
        std::thread::sleep(Duration::from_millis(12));
        cache.add(h(3));
        std::thread::sleep(Duration::from_millis(12));
        assert!(cache.exists(&h(3)));
    }
}
