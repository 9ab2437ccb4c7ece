use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::branch::Branch;
use crate::cache::{CacheStrategy, LruStrategy};
use crate::dedup::DedupSet;
use crate::error::AcornResult;
use crate::event::{Broadcaster, ChangeEvent, ChangeKind, Leaf, SubscriptionHandle};
use crate::judge::{Judge, TimestampJudge, Winner};
use crate::metrics::{MetricsSink, NullMetrics};
use crate::nut::{IdExtractor, Keyed, Nut};
use crate::trunk::{Trunk, TrunkCapabilities};

const LOCK_STRIPES: usize = 64;
const DEFAULT_MAX_HOPS: u32 = 10;
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// How a conflict-resolving admission ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SquabbleOutcome {
    /// Incoming envelope won and the local store changed.
    Accepted,
    /// The judge kept the local envelope.
    LocalWins,
    /// Change id already processed.
    DroppedDuplicate,
    /// The envelope originated here.
    DroppedOwnOrigin,
    /// Hop bound reached.
    DroppedHopLimit,
}

impl SquabbleOutcome {
    pub fn accepted(self) -> bool {
        matches!(self, SquabbleOutcome::Accepted)
    }
}

type KeyedFn<T> = Arc<dyn Fn(&T) -> String + Send + Sync>;

/// Typed façade over a trunk: bounded cache, TTL enforcement, change events,
/// conflict-resolving write admission, and replication fan-out.
///
/// `Tree` is a cheap handle; clones share one underlying tree. Dropping the
/// last handle flushes the trunk and stops the TTL sweeper.
pub struct Tree<T> {
    inner: Arc<TreeInner<T>>,
}

impl<T> Clone for Tree<T> {
    fn clone(&self) -> Self {
        Tree { inner: self.inner.clone() }
    }
}

pub(crate) struct TreeInner<T> {
    id: String,
    trunk: Arc<dyn Trunk<T>>,
    cache: RwLock<HashMap<String, Nut<T>>>,
    strategy: Arc<dyn CacheStrategy>,
    judge: Arc<dyn Judge<T>>,
    branches: RwLock<Vec<Arc<dyn Branch<T>>>>,
    broadcaster: Broadcaster<T>,
    dedup: DedupSet,
    extractor: IdExtractor,
    keyed_fn: Option<KeyedFn<T>>,
    locks: Vec<Mutex<()>>,
    max_hops: u32,
    metrics: Arc<dyn MetricsSink>,
    sweeper_stop: Arc<AtomicBool>,
}

impl<T> Drop for TreeInner<T> {
    fn drop(&mut self) {
        self.sweeper_stop.store(true, Ordering::Relaxed);
        if let Err(err) = self.trunk.flush() {
            warn!(tree = %self.id, %err, "flush on dispose failed");
        }
    }
}

impl<T> Tree<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// A tree over `trunk` with default options. Use [`TreeBuilder`] to tune.
    pub fn new(trunk: Arc<dyn Trunk<T>>) -> Self {
        TreeBuilder::new(trunk).build()
    }

    pub fn builder(trunk: Arc<dyn Trunk<T>>) -> TreeBuilder<T> {
        TreeBuilder::new(trunk)
    }

    /// This tree's node id, used as `origin_node_id` on authored envelopes.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn capabilities(&self) -> TrunkCapabilities {
        self.inner.trunk.capabilities()
    }

    pub fn trunk(&self) -> &Arc<dyn Trunk<T>> {
        &self.inner.trunk
    }

    /// Authoring write under an explicit id.
    pub fn stash(&self, id: &str, value: T) -> AcornResult<()> {
        self.inner.author(id, value, None)
    }

    /// Authoring write that expires at `expires_at`.
    pub fn stash_with_ttl(&self, id: &str, value: T, expires_at: OffsetDateTime) -> AcornResult<()> {
        self.inner.author(id, value, Some(expires_at))
    }

    /// Authoring write with the id derived from the value: the `Keyed`
    /// capability when the tree was built with one, else the conventional id
    /// field, else `MissingId`.
    pub fn stash_auto(&self, value: T) -> AcornResult<String>
    where
        T: Serialize,
    {
        let id = match &self.inner.keyed_fn {
            Some(keyed) => keyed(&value),
            None => self.inner.extractor.extract(&value)?,
        };
        self.inner.author(&id, value, None)?;
        Ok(id)
    }

    /// Read the current payload; expired entries read as absent.
    pub fn crack(&self, id: &str) -> AcornResult<Option<T>> {
        Ok(self.crack_nut(id)?.and_then(|nut| nut.payload))
    }

    /// Read the current envelope.
    pub fn crack_nut(&self, id: &str) -> AcornResult<Option<Nut<T>>> {
        self.inner.crack_nut(id)
    }

    /// All current, unexpired envelopes.
    pub fn crack_all(&self) -> AcornResult<Vec<Nut<T>>> {
        self.inner.crack_all()
    }

    /// Prior envelopes for `id`, oldest first. `Unsupported` on trunks
    /// without history.
    pub fn history(&self, id: &str) -> AcornResult<Vec<Nut<T>>> {
        self.inner.trunk.history(id)
    }

    /// Delete via a versioned tombstone.
    pub fn toss(&self, id: &str) -> AcornResult<()> {
        self.inner.toss(id)
    }

    /// Conflict-resolving admission of a peer's envelope.
    pub fn squabble(&self, incoming: Nut<T>) -> AcornResult<SquabbleOutcome> {
        let leaf = Leaf::from_nut(ChangeKind::Squabble, incoming);
        self.inner.admit_remote(&*self.inner.judge, leaf)
    }

    /// Admission of a full propagation leaf, preserving its anti-loop state.
    pub fn squabble_leaf(&self, leaf: Leaf<T>) -> AcornResult<SquabbleOutcome> {
        self.inner.admit_remote(&*self.inner.judge, leaf)
    }

    /// Admission under an overriding judge; used by branches to apply a
    /// conflict direction without changing the tree's own policy.
    pub fn squabble_with(&self, judge: &dyn Judge<T>, leaf: Leaf<T>) -> AcornResult<SquabbleOutcome> {
        self.inner.admit_remote(judge, leaf)
    }

    /// Register an outbound replication branch.
    pub fn entangle(&self, branch: Arc<dyn Branch<T>>) {
        self.inner.branches.write().push(branch);
    }

    pub fn branches(&self) -> Vec<Arc<dyn Branch<T>>> {
        self.inner.branches.read().clone()
    }

    /// Register a change-event callback. Delivery is synchronous on the
    /// admitting thread.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(&ChangeEvent<T>) + Send + Sync + 'static,
    {
        self.inner.broadcaster.subscribe(callback)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.inner.broadcaster.unsubscribe(handle)
    }

    /// Delete every expired envelope now. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        self.inner.sweep_expired()
    }

    /// Flush any batched trunk writes.
    pub fn flush(&self) -> AcornResult<()> {
        self.inner.trunk.flush()
    }

    /// Queue several operations and commit them through normal admission.
    pub fn batch(&self) -> Batch<T> {
        Batch { tree: self.clone(), ops: Vec::new() }
    }

    pub(crate) fn downgrade(&self) -> Weak<TreeInner<T>> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn judge_ref(&self) -> &Arc<dyn Judge<T>> {
        &self.inner.judge
    }
}

impl<T> TreeInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn own_judge(&self) -> Arc<dyn Judge<T>> {
        self.judge.clone()
    }

    fn lock_for(&self, id: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        self.locks[(hasher.finish() as usize) % LOCK_STRIPES].lock()
    }

    fn author(&self, id: &str, value: T, expires_at: Option<OffsetDateTime>) -> AcornResult<()> {
        let start = std::time::Instant::now();
        // Persist under the per-id stripe lock, but release it before events
        // and fan-out: callbacks must not run under internal locks, and two
        // trees pushing to each other would otherwise deadlock.
        let nut = {
            let _guard = self.lock_for(id);
            let prior = self.trunk.crack(id)?.map(|n| n.version).unwrap_or(0);
            let mut nut = Nut::next(prior, id, value, &self.id);
            nut.expires_at = expires_at;
            self.trunk.stash(id, nut.clone())?;
            self.cache_insert(nut.clone());
            nut
        };
        self.metrics.incr("tree.stash", 1);
        self.metrics.record_latency("tree.stash", start.elapsed().as_micros() as u64);
        self.emit(ChangeKind::Stash, id, Some(nut.clone()));
        self.fan_out(&Leaf::authored(ChangeKind::Stash, id, Some(nut), &self.id));
        Ok(())
    }

    fn toss(&self, id: &str) -> AcornResult<()> {
        let tombstone = {
            let _guard = self.lock_for(id);
            let prior = self.trunk.crack(id)?.map(|n| n.version).unwrap_or(0);
            let tombstone = Nut::tombstone(id, prior + 1, &self.id);
            self.trunk.toss(id)?;
            self.cache_remove(id);
            tombstone
        };
        self.metrics.incr("tree.toss", 1);
        self.emit(ChangeKind::Toss, id, Some(tombstone.clone()));
        self.fan_out(&Leaf::authored(ChangeKind::Toss, id, Some(tombstone), &self.id));
        Ok(())
    }

    fn crack_nut(&self, id: &str) -> AcornResult<Option<Nut<T>>> {
        let now = OffsetDateTime::now_utc();
        if let Some(nut) = self.cache.read().get(id).cloned() {
            if nut.is_expired(now) {
                return Ok(None);
            }
            self.strategy.on_crack(id);
            self.metrics.incr("tree.cache.hits", 1);
            return Ok(Some(nut));
        }
        self.metrics.incr("tree.cache.misses", 1);
        match self.trunk.crack(id)? {
            Some(nut) if !nut.is_tombstone() && !nut.is_expired(now) => {
                self.cache_insert(nut.clone());
                Ok(Some(nut))
            }
            _ => Ok(None),
        }
    }

    fn crack_all(&self) -> AcornResult<Vec<Nut<T>>> {
        let now = OffsetDateTime::now_utc();
        let nuts = self.trunk.crack_all()?;
        Ok(nuts
            .into_iter()
            .filter(|nut| !nut.is_tombstone() && !nut.is_expired(now))
            .collect())
    }

    pub(crate) fn admit_remote(&self, judge: &dyn Judge<T>, leaf: Leaf<T>) -> AcornResult<SquabbleOutcome> {
        let Some(incoming) = leaf.nut.clone() else {
            debug!(tree = %self.id, id = %leaf.id, "leaf without envelope dropped");
            return Ok(SquabbleOutcome::DroppedDuplicate);
        };
        if incoming.origin_node_id == self.id {
            return Ok(SquabbleOutcome::DroppedOwnOrigin);
        }
        if self.dedup.contains(&incoming.change_id) {
            return Ok(SquabbleOutcome::DroppedDuplicate);
        }
        if leaf.hop_count >= self.max_hops {
            self.metrics.incr("tree.squabble.hop_limited", 1);
            return Ok(SquabbleOutcome::DroppedHopLimit);
        }

        let admitted_kind = {
            let _guard = self.lock_for(&incoming.id);
            let current = self.trunk.crack(&incoming.id)?;
            // Atomic check-and-record: a racing admission of the same change
            // id loses here even though both passed the early contains check.
            if !self.dedup.insert(incoming.change_id) {
                return Ok(SquabbleOutcome::DroppedDuplicate);
            }
            let incoming_wins = match &current {
                None => true,
                Some(local) => matches!(judge.resolve(local, &incoming).winner, Winner::Incoming),
            };
            if !incoming_wins {
                self.metrics.incr("tree.squabble.local_wins", 1);
                return Ok(SquabbleOutcome::LocalWins);
            }
            if incoming.is_tombstone() {
                self.trunk.toss(&incoming.id)?;
                self.cache_remove(&incoming.id);
                ChangeKind::Toss
            } else {
                self.trunk.stash(&incoming.id, incoming.clone())?;
                self.cache_insert(incoming.clone());
                ChangeKind::Squabble
            }
        };

        self.metrics.incr("tree.squabble.accepted", 1);
        self.emit(admitted_kind, &incoming.id, Some(incoming.clone()));
        // Re-propagate exactly when the local store changed.
        self.fan_out(&leaf.hopped(&self.id));
        Ok(SquabbleOutcome::Accepted)
    }

    fn fan_out(&self, leaf: &Leaf<T>) {
        if leaf.hop_count >= self.max_hops {
            return;
        }
        let branches = self.branches.read().clone();
        for branch in branches {
            if leaf.visited.contains(branch.remote_id()) {
                continue;
            }
            let delivery = match leaf.kind {
                ChangeKind::Toss => branch.try_delete(leaf),
                _ => branch.try_push(leaf),
            };
            // Per-branch failures are isolated; the author never fails here.
            if let Err(err) = delivery {
                self.metrics.incr("tree.fanout.failures", 1);
                warn!(tree = %self.id, remote = branch.remote_id(), %err, "branch delivery failed");
            }
        }
    }

    fn cache_insert(&self, nut: Nut<T>) {
        let id = nut.id.clone();
        let len = {
            let mut cache = self.cache.write();
            cache.insert(id.clone(), nut);
            cache.len()
        };
        self.strategy.on_stash(&id);
        let victims = self.strategy.eviction_candidates(len);
        if !victims.is_empty() {
            let mut cache = self.cache.write();
            for victim in &victims {
                cache.remove(victim);
                self.strategy.on_toss(victim);
            }
            self.metrics.incr("tree.cache.evictions", victims.len() as u64);
        }
    }

    fn cache_remove(&self, id: &str) {
        self.cache.write().remove(id);
        self.strategy.on_toss(id);
    }

    fn emit(&self, kind: ChangeKind, id: &str, nut: Option<Nut<T>>) {
        let event = ChangeEvent {
            kind,
            id: id.to_string(),
            timestamp: nut.as_ref().map(|n| n.timestamp).unwrap_or_else(OffsetDateTime::now_utc),
            origin_node_id: nut
                .as_ref()
                .map(|n| n.origin_node_id.clone())
                .filter(|origin| !origin.is_empty())
                .unwrap_or_else(|| self.id.clone()),
            nut,
        };
        self.broadcaster.emit(&event);
    }

    pub(crate) fn export_nuts(&self) -> AcornResult<Vec<Nut<T>>> {
        let now = OffsetDateTime::now_utc();
        Ok(self
            .trunk
            .export_changes()?
            .into_iter()
            .filter(|nut| !nut.is_tombstone() && !nut.is_expired(now))
            .collect())
    }

    fn sweep_expired(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        let mut expired: Vec<String> = self
            .cache
            .read()
            .values()
            .filter(|nut| nut.is_expired(now))
            .map(|nut| nut.id.clone())
            .collect();
        if let Ok(nuts) = self.trunk.crack_all() {
            for nut in nuts {
                if nut.is_expired(now) && !expired.contains(&nut.id) {
                    expired.push(nut.id);
                }
            }
        }
        for id in &expired {
            if let Err(err) = self.toss(id) {
                warn!(tree = %self.id, %id, %err, "ttl sweep delete failed");
            }
        }
        expired.len()
    }
}

fn spawn_sweeper<T>(inner: &Arc<TreeInner<T>>, interval: Duration)
where
    T: Clone + Send + Sync + 'static,
{
    let weak = Arc::downgrade(inner);
    let stop = inner.sweeper_stop.clone();
    let spawned = std::thread::Builder::new()
        .name("acorn-ttl-sweeper".to_string())
        .spawn(move || loop {
            std::thread::sleep(interval);
            if stop.load(Ordering::Relaxed) {
                break;
            }
            let Some(inner) = weak.upgrade() else { break };
            let removed = inner.sweep_expired();
            if removed > 0 {
                debug!(tree = %inner.id, removed, "ttl sweep removed expired envelopes");
            }
        });
    if let Err(err) = spawned {
        warn!(%err, "failed to spawn ttl sweeper");
    }
}

/// Queued operations against one tree, applied in order on commit.
pub struct Batch<T> {
    tree: Tree<T>,
    ops: Vec<BatchOp<T>>,
}

enum BatchOp<T> {
    Stash { id: String, value: T },
    Toss { id: String },
}

impl<T> Batch<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn stash(&mut self, id: impl Into<String>, value: T) -> &mut Self {
        self.ops.push(BatchOp::Stash { id: id.into(), value });
        self
    }

    pub fn toss(&mut self, id: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::Toss { id: id.into() });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Apply all queued operations through normal admission. Stops at the
    /// first failure; operations already applied stay applied.
    pub fn commit(self) -> AcornResult<usize> {
        let mut applied = 0;
        for op in self.ops {
            match op {
                BatchOp::Stash { id, value } => self.tree.stash(&id, value)?,
                BatchOp::Toss { id } => self.tree.toss(&id)?,
            }
            applied += 1;
        }
        Ok(applied)
    }

    pub fn discard(self) {}
}

/// Configures and builds a [`Tree`].
pub struct TreeBuilder<T> {
    trunk: Arc<dyn Trunk<T>>,
    id: Option<String>,
    judge: Arc<dyn Judge<T>>,
    strategy: Arc<dyn CacheStrategy>,
    extractor: IdExtractor,
    keyed_fn: Option<KeyedFn<T>>,
    max_hops: u32,
    sweep_interval: Option<Duration>,
    dedup_capacity: usize,
    metrics: Arc<dyn MetricsSink>,
}

impl<T> TreeBuilder<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(trunk: Arc<dyn Trunk<T>>) -> Self {
        TreeBuilder {
            trunk,
            id: None,
            judge: Arc::new(TimestampJudge),
            strategy: Arc::new(LruStrategy::new(10_000)),
            extractor: IdExtractor::default(),
            keyed_fn: None,
            max_hops: DEFAULT_MAX_HOPS,
            sweep_interval: Some(DEFAULT_SWEEP_INTERVAL),
            dedup_capacity: DedupSet::DEFAULT_CAPACITY,
            metrics: Arc::new(NullMetrics),
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn judge(mut self, judge: Arc<dyn Judge<T>>) -> Self {
        self.judge = judge;
        self
    }

    pub fn cache_strategy(mut self, strategy: Arc<dyn CacheStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Field name consulted by auto-id extraction. Defaults to `Id`.
    pub fn id_field(mut self, field: impl Into<String>) -> Self {
        self.extractor = IdExtractor::new(field);
        self
    }

    /// Prefer the `Keyed` capability for auto-id extraction.
    pub fn keyed(mut self) -> Self
    where
        T: Keyed,
    {
        self.keyed_fn = Some(Arc::new(|value: &T| value.acorn_id()));
        self
    }

    pub fn max_hops(mut self, max_hops: u32) -> Self {
        self.max_hops = max_hops;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    /// Turn the periodic TTL sweep off; expiry is then enforced on read only.
    pub fn disable_sweeper(mut self) -> Self {
        self.sweep_interval = None;
        self
    }

    pub fn dedup_capacity(mut self, capacity: usize) -> Self {
        self.dedup_capacity = capacity;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn build(self) -> Tree<T> {
        let inner = Arc::new(TreeInner {
            id: self.id.unwrap_or_else(|| format!("tree-{}", uuid::Uuid::new_v4())),
            trunk: self.trunk,
            cache: RwLock::new(HashMap::new()),
            strategy: self.strategy,
            judge: self.judge,
            branches: RwLock::new(Vec::new()),
            broadcaster: Broadcaster::default(),
            dedup: DedupSet::new(self.dedup_capacity),
            extractor: self.extractor,
            keyed_fn: self.keyed_fn,
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            max_hops: self.max_hops,
            metrics: self.metrics,
            sweeper_stop: Arc::new(AtomicBool::new(false)),
        });
        if let Some(interval) = self.sweep_interval {
            spawn_sweeper(&inner, interval);
        }
        Tree { inner }
    }
}
