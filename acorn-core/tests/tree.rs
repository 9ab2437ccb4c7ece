//! Tree semantics over real trunks: versioning, caching, TTL, events,
//! auto-id, batching, and the scalar index.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use acorn_core::{
    AcornError, ChangeKind, Keyed, LruStrategy, Nut, ScalarIndex, SquabbleOutcome, Tree,
};
use acorn_trunk_file::DocumentLogTrunk;
use acorn_trunk_mem::MemoryTrunk;

fn memory_tree(id: &str) -> Tree<String> {
    Tree::builder(Arc::new(MemoryTrunk::new())).id(id).disable_sweeper().build()
}

#[test]
fn versions_increment_and_history_holds_priors() {
    let dir = tempfile::tempdir().unwrap();
    let trunk = Arc::new(DocumentLogTrunk::open(dir.path(), "users").unwrap());
    let tree: Tree<String> = Tree::builder(trunk).id("node-a").disable_sweeper().build();

    tree.stash("u1", "a".to_string()).unwrap();
    assert_eq!(tree.crack_nut("u1").unwrap().unwrap().version, 1);

    tree.stash("u1", "b".to_string()).unwrap();
    let current = tree.crack_nut("u1").unwrap().unwrap();
    assert_eq!(current.version, 2);
    assert_eq!(current.payload.as_deref(), Some("b"));

    let history = tree.history("u1").unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].version, 1);
    assert_eq!(history[0].payload.as_deref(), Some("a"));
}

#[test]
fn repeated_stash_has_no_silent_dedup() {
    let tree = memory_tree("node-a");
    tree.stash("k", "same".to_string()).unwrap();
    tree.stash("k", "same".to_string()).unwrap();
    assert_eq!(tree.crack_nut("k").unwrap().unwrap().version, 2);
}

#[test]
fn squabble_is_idempotent_per_change_id() {
    let tree = memory_tree("node-b");
    let incoming = Nut::new("k", "remote".to_string(), "node-a");

    assert_eq!(tree.squabble(incoming.clone()).unwrap(), SquabbleOutcome::Accepted);
    assert_eq!(tree.squabble(incoming).unwrap(), SquabbleOutcome::DroppedDuplicate);
    assert_eq!(tree.crack_nut("k").unwrap().unwrap().version, 1);
}

#[test]
fn squabble_drops_own_origin_and_respects_judge() {
    let tree = memory_tree("node-b");
    tree.stash("k", "local".to_string()).unwrap();

    // Authored here; a reflected copy must be dropped.
    let own = tree.crack_nut("k").unwrap().unwrap();
    assert_eq!(tree.squabble(own).unwrap(), SquabbleOutcome::DroppedOwnOrigin);

    // Older incoming loses under the timestamp judge.
    let mut stale = Nut::new("k", "stale".to_string(), "node-a");
    stale.timestamp = OffsetDateTime::now_utc() - time::Duration::minutes(5);
    assert_eq!(tree.squabble(stale).unwrap(), SquabbleOutcome::LocalWins);
    assert_eq!(tree.crack("k").unwrap().as_deref(), Some("local"));
}

#[test]
fn toss_removes_and_notifies() {
    let tree = memory_tree("node-a");
    let kinds: Arc<Mutex<Vec<ChangeKind>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = kinds.clone();
    tree.subscribe(move |event| sink.lock().unwrap().push(event.kind));

    tree.stash("k", "v".to_string()).unwrap();
    tree.toss("k").unwrap();
    assert!(tree.crack("k").unwrap().is_none());

    let seen = kinds.lock().unwrap().clone();
    assert_eq!(seen, vec![ChangeKind::Stash, ChangeKind::Toss]);
}

#[test]
fn expired_envelopes_read_as_not_found() {
    let tree = memory_tree("node-a");
    tree.stash_with_ttl("tmp", "v".to_string(), OffsetDateTime::now_utc() - time::Duration::seconds(1))
        .unwrap();
    assert!(tree.crack("tmp").unwrap().is_none());
    assert!(tree.crack_all().unwrap().is_empty());
}

#[test]
fn ttl_sweep_tosses_expired_entries() {
    let tree: Tree<String> = Tree::builder(Arc::new(MemoryTrunk::new()))
        .id("node-a")
        .sweep_interval(Duration::from_millis(50))
        .build();

    let tossed = Arc::new(AtomicUsize::new(0));
    let counter = tossed.clone();
    tree.subscribe(move |event| {
        if event.kind == ChangeKind::Toss {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    tree.stash_with_ttl(
        "tmp",
        "v".to_string(),
        OffsetDateTime::now_utc() + time::Duration::milliseconds(100),
    )
    .unwrap();
    assert_eq!(tree.crack("tmp").unwrap().as_deref(), Some("v"));

    std::thread::sleep(Duration::from_millis(400));
    assert!(tree.crack("tmp").unwrap().is_none());
    assert_eq!(tossed.load(Ordering::SeqCst), 1, "sweep should delete through the toss path");
}

#[test]
fn eviction_never_loses_trunk_data() {
    let tree: Tree<String> = Tree::builder(Arc::new(MemoryTrunk::new()))
        .id("node-a")
        .cache_strategy(Arc::new(LruStrategy::new(8)))
        .disable_sweeper()
        .build();

    for i in 0..32 {
        tree.stash(&format!("k{i}"), format!("v{i}")).unwrap();
    }
    for i in 0..32 {
        assert_eq!(tree.crack(&format!("k{i}")).unwrap(), Some(format!("v{i}")));
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Acorn {
    #[serde(rename = "Id")]
    id: String,
    kind: String,
}

impl Keyed for Acorn {
    fn acorn_id(&self) -> String {
        format!("acorn/{}", self.id)
    }
}

#[test]
fn auto_id_prefers_capability_then_field() {
    let keyed: Tree<Acorn> = Tree::builder(Arc::new(MemoryTrunk::new()))
        .id("node-a")
        .keyed()
        .disable_sweeper()
        .build();
    let id = keyed.stash_auto(Acorn { id: "7".into(), kind: "oak".into() }).unwrap();
    assert_eq!(id, "acorn/7");

    let by_field: Tree<Acorn> = Tree::builder(Arc::new(MemoryTrunk::new()))
        .id("node-b")
        .disable_sweeper()
        .build();
    let id = by_field.stash_auto(Acorn { id: "9".into(), kind: "oak".into() }).unwrap();
    assert_eq!(id, "9");
}

#[test]
fn auto_id_fails_fast_without_id() {
    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Anonymous {
        kind: String,
    }

    let tree: Tree<Anonymous> = Tree::builder(Arc::new(MemoryTrunk::new()))
        .id("node-a")
        .disable_sweeper()
        .build();
    let err = tree.stash_auto(Anonymous { kind: "oak".into() }).unwrap_err();
    assert!(matches!(err, AcornError::MissingId(_)));
}

#[test]
fn batch_commits_through_normal_admission() {
    let tree = memory_tree("node-a");
    tree.stash("old", "x".to_string()).unwrap();

    let mut batch = tree.batch();
    batch.stash("a", "1".to_string()).stash("b", "2".to_string()).toss("old");
    assert_eq!(batch.len(), 3);
    assert_eq!(batch.commit().unwrap(), 3);

    assert_eq!(tree.crack("a").unwrap().as_deref(), Some("1"));
    assert_eq!(tree.crack("b").unwrap().as_deref(), Some("2"));
    assert!(tree.crack("old").unwrap().is_none());
}

#[test]
fn scalar_index_follows_changes_with_reverse_map() {
    let tree: Tree<Acorn> = Tree::builder(Arc::new(MemoryTrunk::new()))
        .id("node-a")
        .disable_sweeper()
        .build();
    tree.stash("1", Acorn { id: "1".into(), kind: "oak".into() }).unwrap();

    let index = ScalarIndex::new(|acorn: &Acorn| Some(acorn.kind.clone()))
        .attach(&tree)
        .unwrap();
    assert_eq!(index.lookup("oak"), vec!["1".to_string()]);

    tree.stash("2", Acorn { id: "2".into(), kind: "oak".into() }).unwrap();
    assert_eq!(index.lookup("oak"), vec!["1".to_string(), "2".to_string()]);

    // Updating the value moves the id across buckets via the reverse map.
    tree.stash("1", Acorn { id: "1".into(), kind: "chestnut".into() }).unwrap();
    assert_eq!(index.lookup("oak"), vec!["2".to_string()]);
    assert_eq!(index.lookup("chestnut"), vec!["1".to_string()]);

    tree.toss("2").unwrap();
    assert!(index.lookup("oak").is_empty());
    assert_eq!(index.len(), 1);
}

#[test]
fn unsubscribe_stops_delivery() {
    let tree = memory_tree("node-a");
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let handle = tree.subscribe(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    tree.stash("k", "v".to_string()).unwrap();
    assert!(tree.unsubscribe(handle));
    tree.stash("k", "v2".to_string()).unwrap();
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}
