use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;
use uuid::Uuid;

/// Bounded set of recently processed change ids. Oldest entries fall out
/// first once the cap is reached.
pub struct DedupSet {
    cap: usize,
    inner: Mutex<DedupInner>,
}

struct DedupInner {
    seen: HashSet<Uuid>,
    order: VecDeque<Uuid>,
}

impl DedupSet {
    pub const DEFAULT_CAPACITY: usize = 10_000;

    pub fn new(cap: usize) -> Self {
        DedupSet {
            cap: cap.max(1),
            inner: Mutex::new(DedupInner {
                seen: HashSet::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.inner.lock().seen.contains(id)
    }

    /// Record `id`; returns false if it was already present.
    pub fn insert(&self, id: Uuid) -> bool {
        let mut inner = self.inner.lock();
        if !inner.seen.insert(id) {
            return false;
        }
        inner.order.push_back(id);
        while inner.order.len() > self.cap {
            if let Some(old) = inner.order.pop_front() {
                inner.seen.remove(&old);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DedupSet {
    fn default() -> Self {
        DedupSet::new(Self::DEFAULT_CAPACITY)
    }
}
