//! Replication across trees: conflict resolution, loop prevention, hop
//! bounds, topology builders, and conflict directions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use time::OffsetDateTime;

use acorn_core::{
    Branch, ChangeKind, ConflictDirection, InProcessBranch, Mesh, Nut, SquabbleOutcome, SyncMode,
    Tangle, Tree,
};
use acorn_trunk_mem::MemoryTrunk;

fn tree(id: &str) -> Tree<String> {
    Tree::builder(Arc::new(MemoryTrunk::new())).id(id).disable_sweeper().build()
}

fn tree_with_hops(id: &str, max_hops: u32) -> Tree<String> {
    Tree::builder(Arc::new(MemoryTrunk::new()))
        .id(id)
        .max_hops(max_hops)
        .disable_sweeper()
        .build()
}

#[test]
fn later_author_wins_under_timestamp_judge() {
    let b = tree("b");
    b.stash("k", "B".to_string()).unwrap();

    let mut from_a = Nut::new("k", "A".to_string(), "a");
    from_a.timestamp = OffsetDateTime::now_utc() - time::Duration::minutes(1);

    assert_eq!(b.squabble(from_a).unwrap(), SquabbleOutcome::LocalWins);
    assert_eq!(b.crack("k").unwrap().as_deref(), Some("B"));
}

#[test]
fn triangle_mesh_converges_with_single_admission_per_tree() {
    let mut mesh = Mesh::new();
    mesh.add_node(tree("a")).add_node(tree("b")).add_node(tree("c"));
    mesh.create_full_mesh().unwrap();
    assert_eq!(mesh.edge_count(), 3);

    let b_admissions = Arc::new(AtomicUsize::new(0));
    let c_admissions = Arc::new(AtomicUsize::new(0));
    for (node, counter) in [("b", b_admissions.clone()), ("c", c_admissions.clone())] {
        let counter = counter.clone();
        mesh.node(node).unwrap().subscribe(move |event| {
            if event.kind == ChangeKind::Squabble {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
    }

    mesh.node("a").unwrap().stash("x", "v".to_string()).unwrap();

    for node in ["a", "b", "c"] {
        assert_eq!(
            mesh.node(node).unwrap().crack("x").unwrap().as_deref(),
            Some("v"),
            "node {node} should hold the value"
        );
    }
    // Change-id dedup: each peer admitted the change exactly once even
    // though it arrived over two edges.
    assert_eq!(b_admissions.load(Ordering::SeqCst), 1);
    assert_eq!(c_admissions.load(Ordering::SeqCst), 1);
}

#[test]
fn hop_limit_stops_chain_propagation() {
    let mut mesh = Mesh::new();
    for id in ["a", "b", "c", "d", "e"] {
        mesh.add_node(tree_with_hops(id, 2));
    }
    for pair in [("a", "b"), ("b", "c"), ("c", "d"), ("d", "e")] {
        mesh.connect_nodes(pair.0, pair.1).unwrap();
    }

    mesh.node("a").unwrap().stash("x", "v".to_string()).unwrap();

    for node in ["a", "b", "c"] {
        assert_eq!(
            mesh.node(node).unwrap().crack("x").unwrap().as_deref(),
            Some("v"),
            "node {node} is within the hop bound"
        );
    }
    for node in ["d", "e"] {
        assert!(
            mesh.node(node).unwrap().crack("x").unwrap().is_none(),
            "node {node} is beyond the hop bound"
        );
    }
}

#[test]
fn ring_and_star_builders_wire_expected_edges() {
    let mut ring = Mesh::new();
    for id in ["a", "b", "c", "d"] {
        ring.add_node(tree(id));
    }
    ring.create_ring().unwrap();
    assert_eq!(ring.edge_count(), 4);

    let mut star = Mesh::new();
    for id in ["hub", "l1", "l2", "l3"] {
        star.add_node(tree(id));
    }
    star.create_star("hub").unwrap();
    assert_eq!(star.edge_count(), 3);
}

#[test]
fn synchronize_all_converges_preexisting_data() {
    let mut mesh = Mesh::new();
    let hub = tree("hub");
    hub.stash("seed", "value".to_string()).unwrap();
    mesh.add_node(hub);
    mesh.add_node(tree("l1"));
    mesh.add_node(tree("l2"));
    // Data was authored before any edge existed, so only a shake moves it.
    mesh.create_star("hub").unwrap();
    assert!(mesh.node("l1").unwrap().crack("seed").unwrap().is_none());

    let accepted = mesh.synchronize_all();
    assert!(accepted >= 2);
    for node in ["l1", "l2"] {
        assert_eq!(
            mesh.node(node).unwrap().crack("seed").unwrap().as_deref(),
            Some("value")
        );
    }
}

#[test]
fn conflict_direction_overrides_the_judge() {
    // prefer-remote: an older incoming still replaces newer local data.
    let receiver = tree("receiver");
    receiver.stash("k", "newer-local".to_string()).unwrap();
    let sender = tree("sender");
    let branch = InProcessBranch::new(&receiver).with_direction(ConflictDirection::PreferRemote);
    sender.entangle(Arc::new(branch));

    let mut stale = Nut::new("k", "older-remote".to_string(), "far-away-node");
    stale.timestamp = OffsetDateTime::now_utc() - time::Duration::minutes(10);
    // Route it through the sender so the branch delivers it.
    sender.squabble(stale).unwrap();
    assert_eq!(receiver.crack("k").unwrap().as_deref(), Some("older-remote"));

    // prefer-local: even a newer incoming is refused.
    let keeper = tree("keeper");
    keeper.stash("k", "kept".to_string()).unwrap();
    let origin = tree("origin");
    origin.entangle(Arc::new(
        InProcessBranch::new(&keeper).with_direction(ConflictDirection::PreferLocal),
    ));
    let fresh = Nut::new("k", "incoming".to_string(), "origin-node");
    origin.squabble(fresh).unwrap();
    assert_eq!(keeper.crack("k").unwrap().as_deref(), Some("kept"));
}

#[test]
fn push_only_and_disabled_modes_gate_traffic() {
    let source = tree("source");
    let sink = tree("sink");
    let branch = Arc::new(InProcessBranch::new(&sink).with_mode(SyncMode::PushOnly));
    source.entangle(branch.clone());

    source.stash("k", "v".to_string()).unwrap();
    assert_eq!(sink.crack("k").unwrap().as_deref(), Some("v"));

    // Pull direction is gated off.
    sink.stash("other", "o".to_string()).unwrap();
    assert_eq!(branch.shake(&source).unwrap(), 0);
    assert!(source.crack("other").unwrap().is_none());

    let dead = tree("dead");
    let disabled = Arc::new(InProcessBranch::new(&dead).with_mode(SyncMode::Disabled));
    let author = tree("author");
    author.entangle(disabled);
    author.stash("k2", "v2".to_string()).unwrap();
    assert!(dead.crack("k2").unwrap().is_none());
}

#[test]
fn tangle_pushes_and_shakes_by_name() {
    let local = tree("local");
    let remote = tree("remote");
    let tangle = Tangle::connect("local->remote", &local, Arc::new(InProcessBranch::new(&remote)));
    assert_eq!(tangle.name(), "local->remote");
    assert_eq!(tangle.remote_id(), "remote");

    local.stash("a", "1".to_string()).unwrap();
    // Registered branch already replicated the authored write.
    assert_eq!(remote.crack("a").unwrap().as_deref(), Some("1"));

    // push_all re-offers everything; the per-peer pushed set suppresses the
    // duplicate delivery.
    assert_eq!(tangle.push_all().unwrap(), 1);

    remote.stash("b", "2".to_string()).unwrap();
    assert!(tangle.shake().unwrap() >= 1);
    assert_eq!(local.crack("b").unwrap().as_deref(), Some("2"));

    let stats = tangle.stats();
    assert!(stats.pushed >= 1);
    assert!(stats.pulled >= 1);

    tangle.push_delete("a").unwrap();
    assert!(remote.crack("a").unwrap().is_none());
}

#[test]
fn deletes_propagate_as_tombstones() {
    let a = tree("a");
    let b = tree("b");
    a.entangle(Arc::new(InProcessBranch::new(&b)));

    a.stash("k", "v".to_string()).unwrap();
    assert_eq!(b.crack("k").unwrap().as_deref(), Some("v"));

    a.toss("k").unwrap();
    assert!(b.crack("k").unwrap().is_none());
}
