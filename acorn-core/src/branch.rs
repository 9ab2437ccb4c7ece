use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use time::OffsetDateTime;

use crate::error::{AcornError, AcornResult};
use crate::event::Leaf;
use crate::judge::{Judge, LocalWins, RemoteWins};
use crate::tree::{SquabbleOutcome, Tree, TreeInner};

/// Gates whether a branch pushes, pulls, both, or nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Bidirectional,
    PushOnly,
    PullOnly,
    Disabled,
}

impl SyncMode {
    pub fn pushes(self) -> bool {
        matches!(self, SyncMode::Bidirectional | SyncMode::PushOnly)
    }

    pub fn pulls(self) -> bool {
        matches!(self, SyncMode::Bidirectional | SyncMode::PullOnly)
    }
}

/// How conflicts are decided on this branch. Implemented as judge
/// composition: the direction picks the judge consulted at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDirection {
    UseJudge,
    PreferLocal,
    PreferRemote,
}

impl ConflictDirection {
    pub fn judge_for<T>(self, fallback: Arc<dyn Judge<T>>) -> Arc<dyn Judge<T>>
    where
        T: 'static,
    {
        match self {
            ConflictDirection::UseJudge => fallback,
            ConflictDirection::PreferLocal => Arc::new(LocalWins),
            ConflictDirection::PreferRemote => Arc::new(RemoteWins),
        }
    }
}

/// Point-in-time view of a branch's delivery counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BranchStatsSnapshot {
    pub pushed: u64,
    pub deleted: u64,
    pub pulled: u64,
    pub conflicts: u64,
    pub last_sync: Option<OffsetDateTime>,
}

/// Shared counter block for branch implementations.
#[derive(Default)]
pub struct BranchStats {
    pushed: AtomicU64,
    deleted: AtomicU64,
    pulled: AtomicU64,
    conflicts: AtomicU64,
    last_sync: Mutex<Option<OffsetDateTime>>,
}

impl BranchStats {
    pub fn record_push(&self) {
        self.pushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pulled(&self, count: u64) {
        self.pulled.fetch_add(count, Ordering::Relaxed);
        *self.last_sync.lock() = Some(OffsetDateTime::now_utc());
    }

    pub fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BranchStatsSnapshot {
        BranchStatsSnapshot {
            pushed: self.pushed.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            pulled: self.pulled.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            last_sync: *self.last_sync.lock(),
        }
    }
}

/// Suppresses re-pushes of an envelope version already delivered to a peer.
/// Keyed by (id, author timestamp); bounded like the change-id dedup set.
pub struct PushedSet {
    cap: usize,
    inner: Mutex<PushedInner>,
}

struct PushedInner {
    seen: HashSet<(String, OffsetDateTime)>,
    order: VecDeque<(String, OffsetDateTime)>,
}

impl PushedSet {
    pub fn new(cap: usize) -> Self {
        PushedSet {
            cap: cap.max(1),
            inner: Mutex::new(PushedInner {
                seen: HashSet::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn contains(&self, id: &str, timestamp: OffsetDateTime) -> bool {
        self.inner.lock().seen.contains(&(id.to_string(), timestamp))
    }

    /// Record the delivery; returns false if this version was already pushed.
    pub fn mark(&self, id: &str, timestamp: OffsetDateTime) -> bool {
        let key = (id.to_string(), timestamp);
        let mut inner = self.inner.lock();
        if !inner.seen.insert(key.clone()) {
            return false;
        }
        inner.order.push_back(key);
        while inner.order.len() > self.cap {
            if let Some(old) = inner.order.pop_front() {
                inner.seen.remove(&old);
            }
        }
        true
    }
}

impl Default for PushedSet {
    fn default() -> Self {
        PushedSet::new(10_000)
    }
}

/// Outbound replication endpoint.
pub trait Branch<T>: Send + Sync {
    /// Id of the remote tree, used for visited-set loop prevention.
    fn remote_id(&self) -> &str;

    fn mode(&self) -> SyncMode;

    /// Deliver an authored or propagated envelope. No-op unless the mode
    /// pushes.
    fn try_push(&self, leaf: &Leaf<T>) -> AcornResult<()>;

    /// Deliver a tombstone. No-op unless the mode pushes.
    fn try_delete(&self, leaf: &Leaf<T>) -> AcornResult<()>;

    /// Pull the remote's current set and admit each envelope locally.
    /// Returns the number accepted. No-op unless the mode pulls.
    fn shake(&self, local: &Tree<T>) -> AcornResult<usize>;

    fn stats(&self) -> BranchStatsSnapshot;
}

/// Branch wrapping another in-process tree; delivery is a direct squabble
/// into the target.
pub struct InProcessBranch<T> {
    target: Weak<TreeInner<T>>,
    remote_id: String,
    mode: SyncMode,
    direction: ConflictDirection,
    pushed: PushedSet,
    stats: BranchStats,
}

impl<T> InProcessBranch<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(target: &Tree<T>) -> Self {
        InProcessBranch {
            remote_id: target.id().to_string(),
            target: target.downgrade(),
            mode: SyncMode::Bidirectional,
            direction: ConflictDirection::UseJudge,
            pushed: PushedSet::default(),
            stats: BranchStats::default(),
        }
    }

    pub fn with_mode(mut self, mode: SyncMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_direction(mut self, direction: ConflictDirection) -> Self {
        self.direction = direction;
        self
    }

    fn upgrade(&self) -> AcornResult<Arc<TreeInner<T>>> {
        self.target
            .upgrade()
            .ok_or_else(|| AcornError::PeerUnavailable(format!("tree `{}` was dropped", self.remote_id)))
    }

    fn deliver(&self, leaf: &Leaf<T>) -> AcornResult<SquabbleOutcome> {
        let target = self.upgrade()?;
        let judge = self.direction.judge_for(target.own_judge());
        let outcome = target.admit_remote(&*judge, leaf.clone())?;
        if outcome == SquabbleOutcome::LocalWins {
            self.stats.record_conflict();
        }
        Ok(outcome)
    }
}

impl<T> Branch<T> for InProcessBranch<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn remote_id(&self) -> &str {
        &self.remote_id
    }

    fn mode(&self) -> SyncMode {
        self.mode
    }

    fn try_push(&self, leaf: &Leaf<T>) -> AcornResult<()> {
        if !self.mode.pushes() {
            return Ok(());
        }
        if let Some(nut) = &leaf.nut {
            if self.pushed.contains(&nut.id, nut.timestamp) {
                return Ok(());
            }
        }
        self.deliver(leaf)?;
        // Marked only after delivery, so a failed push stays retryable.
        if let Some(nut) = &leaf.nut {
            self.pushed.mark(&nut.id, nut.timestamp);
        }
        self.stats.record_push();
        Ok(())
    }

    fn try_delete(&self, leaf: &Leaf<T>) -> AcornResult<()> {
        if !self.mode.pushes() {
            return Ok(());
        }
        self.deliver(leaf)?;
        self.stats.record_delete();
        Ok(())
    }

    fn shake(&self, local: &Tree<T>) -> AcornResult<usize> {
        if !self.mode.pulls() {
            return Ok(0);
        }
        let target = self.upgrade()?;
        let judge = self.direction.judge_for(Arc::clone(local.judge_ref()));
        let mut accepted = 0;
        for nut in target.export_nuts()? {
            let leaf = Leaf::from_nut(crate::event::ChangeKind::Update, nut);
            match local.squabble_with(&*judge, leaf)? {
                SquabbleOutcome::Accepted => accepted += 1,
                SquabbleOutcome::LocalWins => self.stats.record_conflict(),
                _ => {}
            }
        }
        self.stats.record_pulled(accepted as u64);
        Ok(accepted)
    }

    fn stats(&self) -> BranchStatsSnapshot {
        self.stats.snapshot()
    }
}
