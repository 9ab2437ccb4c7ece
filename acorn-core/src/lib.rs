//! AcornDB core: a typed document tree over pluggable trunks, with a
//! byte-level root pipeline, conflict-resolved replication, and reactive
//! change notifications.
//!
//! The vocabulary follows the acorn: a [`Tree`] stores [`Nut`] envelopes in a
//! [`Trunk`], pushes changes out along [`Branch`]es, and settles concurrent
//! writes with a [`Judge`]. `stash`/`crack`/`toss` are write/read/delete;
//! `squabble` is conflict-resolving admission of a peer's envelope.

mod branch;
mod cache;
mod cached;
mod dedup;
mod error;
mod event;
mod index;
mod judge;
mod mesh;
mod metrics;
mod nut;
mod resilient;
mod root;
mod tangle;
mod tree;
mod trunk;

pub use branch::{
    Branch, BranchStats, BranchStatsSnapshot, ConflictDirection, InProcessBranch, PushedSet, SyncMode,
};
pub use cache::{CacheStrategy, LruStrategy, NoEvictionStrategy};
pub use cached::CachedTrunk;
pub use dedup::DedupSet;
pub use error::{AcornError, AcornResult};
pub use event::{Broadcaster, ChangeEvent, ChangeKind, Leaf, SubscriptionHandle};
pub use index::ScalarIndex;
pub use judge::{CustomJudge, Judge, LocalWins, RemoteWins, TimestampJudge, Verdict, VersionJudge, Winner};
pub use mesh::Mesh;
pub use metrics::{InMemoryMetrics, LatencySummary, MetricsSink, NullMetrics};
pub use nut::{IdExtractor, JsonCodec, Keyed, Nut, NutCodec};
pub use resilient::{BreakerConfig, BreakerState, CircuitBreaker, ResilientTrunk, RetryPolicy};
pub use root::{PolicyMode, PolicyOptions, PolicyRoot, Root, RootChain, RootContext, RootInfo, RootOp};
pub use tangle::Tangle;
pub use tree::{Batch, SquabbleOutcome, Tree, TreeBuilder};
pub use trunk::{Trunk, TrunkCapabilities};
