use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::nut::Nut;

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Authored write on the local tree.
    Stash,
    /// Delete.
    Toss,
    /// Conflict-resolved admission of a peer's envelope.
    Squabble,
    /// Bulk admission (shake / import).
    Update,
}

/// Ephemeral record of an admitted write or delete. Not persisted.
#[derive(Debug, Clone)]
pub struct ChangeEvent<T> {
    pub kind: ChangeKind,
    pub id: String,
    pub nut: Option<Nut<T>>,
    pub timestamp: OffsetDateTime,
    pub origin_node_id: String,
}

/// A change event crossing a tree boundary, carrying anti-loop bookkeeping.
#[derive(Debug, Clone)]
pub struct Leaf<T> {
    pub leaf_id: Uuid,
    pub origin_tree_id: String,
    pub visited: HashSet<String>,
    pub hop_count: u32,
    pub kind: ChangeKind,
    pub id: String,
    pub nut: Option<Nut<T>>,
}

impl<T: Clone> Leaf<T> {
    /// Wrap a locally admitted change for fan-out. The authoring tree is the
    /// first entry in the visited set; hop count starts at zero.
    pub fn authored(kind: ChangeKind, id: impl Into<String>, nut: Option<Nut<T>>, tree_id: &str) -> Self {
        let mut visited = HashSet::new();
        visited.insert(tree_id.to_string());
        Leaf {
            leaf_id: Uuid::new_v4(),
            origin_tree_id: tree_id.to_string(),
            visited,
            hop_count: 0,
            kind,
            id: id.into(),
            nut,
        }
    }

    /// Wrap a bare envelope received outside a mesh (shake, import, HTTP).
    pub fn from_nut(kind: ChangeKind, nut: Nut<T>) -> Self {
        Leaf {
            leaf_id: Uuid::new_v4(),
            origin_tree_id: nut.origin_node_id.clone(),
            visited: HashSet::new(),
            hop_count: nut.hop_count,
            kind,
            id: nut.id.clone(),
            nut: Some(nut),
        }
    }

    /// The hand-off form of this leaf: one more hop, forwarder recorded.
    pub fn hopped(&self, via_tree_id: &str) -> Self {
        let mut next = self.clone();
        next.hop_count += 1;
        next.visited.insert(via_tree_id.to_string());
        next
    }
}

/// Handle returned by `subscribe`; pass back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle(pub(crate) u64);

type Callback<T> = Arc<dyn Fn(&ChangeEvent<T>) + Send + Sync>;

/// In-process change broadcaster. Delivery is synchronous on the admitting
/// thread; no internal lock is held across user callbacks.
pub struct Broadcaster<T> {
    subscribers: RwLock<Vec<(u64, Callback<T>)>>,
    next_id: AtomicU64,
}

impl<T> Default for Broadcaster<T> {
    fn default() -> Self {
        Broadcaster {
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<T> Broadcaster<T> {
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(&ChangeEvent<T>) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().push((id, Arc::new(callback)));
        SubscriptionHandle(id)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut subs = self.subscribers.write();
        let before = subs.len();
        subs.retain(|(id, _)| *id != handle.0);
        subs.len() != before
    }

    pub fn emit(&self, event: &ChangeEvent<T>) {
        let snapshot: Vec<Callback<T>> = self.subscribers.read().iter().map(|(_, cb)| cb.clone()).collect();
        for cb in snapshot {
            cb(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}
