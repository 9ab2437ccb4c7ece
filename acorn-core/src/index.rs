use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::event::{ChangeEvent, ChangeKind, SubscriptionHandle};
use crate::tree::Tree;

type ExtractFn<T> = Arc<dyn Fn(&T) -> Option<String> + Send + Sync>;

struct IndexState {
    buckets: HashMap<String, BTreeSet<String>>,
    /// Reverse id -> indexed value, so removal touches exactly one bucket.
    by_id: HashMap<String, String>,
}

/// Read-side scalar index over one extracted field of a tree's payloads.
/// Kept current by subscribing to the tree's change events.
pub struct ScalarIndex<T: Clone + Send + Sync + 'static> {
    extract: ExtractFn<T>,
    state: Arc<RwLock<IndexState>>,
    subscription: Option<(Tree<T>, SubscriptionHandle)>,
}

impl<T> ScalarIndex<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new<F>(extract: F) -> Self
    where
        F: Fn(&T) -> Option<String> + Send + Sync + 'static,
    {
        ScalarIndex {
            extract: Arc::new(extract),
            state: Arc::new(RwLock::new(IndexState {
                buckets: HashMap::new(),
                by_id: HashMap::new(),
            })),
            subscription: None,
        }
    }

    /// Index existing entries and follow the tree's change stream.
    pub fn attach(mut self, tree: &Tree<T>) -> crate::error::AcornResult<Self> {
        for nut in tree.crack_all()? {
            if let Some(payload) = &nut.payload {
                if let Some(value) = (self.extract)(payload) {
                    Self::apply_insert(&self.state, &nut.id, value);
                }
            }
        }
        let state = self.state.clone();
        let extract = self.extract.clone();
        let handle = tree.subscribe(move |event: &ChangeEvent<T>| match event.kind {
            ChangeKind::Toss => Self::apply_remove(&state, &event.id),
            _ => {
                let value = event
                    .nut
                    .as_ref()
                    .and_then(|nut| nut.payload.as_ref())
                    .and_then(|payload| extract(payload));
                match value {
                    Some(value) => Self::apply_insert(&state, &event.id, value),
                    // Payload present but field absent: drop any stale entry.
                    None => Self::apply_remove(&state, &event.id),
                }
            }
        });
        self.subscription = Some((tree.clone(), handle));
        Ok(self)
    }

    fn apply_insert(state: &RwLock<IndexState>, id: &str, value: String) {
        let mut state = state.write();
        if let Some(old) = state.by_id.insert(id.to_string(), value.clone()) {
            if old == value {
                return;
            }
            if let Some(bucket) = state.buckets.get_mut(&old) {
                bucket.remove(id);
                if bucket.is_empty() {
                    state.buckets.remove(&old);
                }
            }
        }
        state.buckets.entry(value).or_default().insert(id.to_string());
    }

    fn apply_remove(state: &RwLock<IndexState>, id: &str) {
        let mut state = state.write();
        if let Some(value) = state.by_id.remove(id) {
            if let Some(bucket) = state.buckets.get_mut(&value) {
                bucket.remove(id);
                if bucket.is_empty() {
                    state.buckets.remove(&value);
                }
            }
        }
    }

    /// Ids whose extracted field equals `value`, in id order.
    pub fn lookup(&self, value: &str) -> Vec<String> {
        self.state
            .read()
            .buckets
            .get(value)
            .map(|bucket| bucket.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.state.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop following the tree. Index contents are kept but go stale.
    pub fn detach(&mut self) {
        if let Some((tree, handle)) = self.subscription.take() {
            tree.unsubscribe(handle);
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Drop for ScalarIndex<T> {
    fn drop(&mut self) {
        if let Some((tree, handle)) = self.subscription.take() {
            tree.unsubscribe(handle);
        }
    }
}
