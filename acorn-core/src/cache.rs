use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Eviction policy for a tree's in-memory cache. The cache itself lives on
/// the tree; the strategy only tracks access metadata and nominates victims.
pub trait CacheStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn on_stash(&self, id: &str);
    fn on_crack(&self, id: &str);
    fn on_toss(&self, id: &str);
    /// Ids to evict given the cache's current size. Empty when under limit.
    fn eviction_candidates(&self, cache_len: usize) -> Vec<String>;
    fn reset(&self);
}

/// Bounded LRU. When an insertion pushes the cache past `max_size`, evicts
/// the stalest entries down to 80% of the limit so eviction cost amortizes.
pub struct LruStrategy {
    max_size: usize,
    access: Mutex<HashMap<String, u64>>,
    clock: AtomicU64,
}

impl LruStrategy {
    pub fn new(max_size: usize) -> Self {
        LruStrategy {
            max_size: max_size.max(1),
            access: Mutex::new(HashMap::new()),
            clock: AtomicU64::new(0),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    fn touch(&self, id: &str) {
        let stamp = self.clock.fetch_add(1, Ordering::Relaxed);
        self.access.lock().insert(id.to_string(), stamp);
    }
}

impl CacheStrategy for LruStrategy {
    fn name(&self) -> &'static str {
        "lru"
    }

    fn on_stash(&self, id: &str) {
        self.touch(id);
    }

    fn on_crack(&self, id: &str) {
        self.touch(id);
    }

    fn on_toss(&self, id: &str) {
        self.access.lock().remove(id);
    }

    fn eviction_candidates(&self, cache_len: usize) -> Vec<String> {
        if cache_len <= self.max_size {
            return Vec::new();
        }
        let target = (self.max_size * 4) / 5;
        let surplus = cache_len - target;
        let access = self.access.lock();
        let mut entries: Vec<(&String, &u64)> = access.iter().collect();
        entries.sort_by_key(|(_, stamp)| **stamp);
        entries.into_iter().take(surplus).map(|(id, _)| id.clone()).collect()
    }

    fn reset(&self) {
        self.access.lock().clear();
    }
}

/// Unbounded cache; nothing is ever nominated for eviction.
#[derive(Debug, Default)]
pub struct NoEvictionStrategy;

impl CacheStrategy for NoEvictionStrategy {
    fn name(&self) -> &'static str {
        "no-eviction"
    }

    fn on_stash(&self, _id: &str) {}
    fn on_crack(&self, _id: &str) {}
    fn on_toss(&self, _id: &str) {}

    fn eviction_candidates(&self, _cache_len: usize) -> Vec<String> {
        Vec::new()
    }

    fn reset(&self) {}
}
