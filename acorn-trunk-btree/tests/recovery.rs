//! Durability across process boundaries: batched writes flushed to the
//! mapped file must replay completely on reopen.

use std::time::Duration;

use acorn_core::{Nut, Trunk};
use acorn_trunk_btree::{BTreeTrunk, BTreeTrunkOptions};

fn batched_opts() -> BTreeTrunkOptions {
    BTreeTrunkOptions {
        initial_capacity: 64 * 1024,
        batching: true,
        batch_threshold: 32,
        flush_interval: Duration::from_millis(20),
        ..BTreeTrunkOptions::default()
    }
}

#[test]
fn one_thousand_batched_writes_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grove.acorn");

    {
        let trunk: BTreeTrunk<String> = BTreeTrunk::open_with(&path, batched_opts()).unwrap();
        for i in 0..1000u32 {
            let id = format!("nut-{i:04}");
            let mut nut = Nut::new(&id, format!("payload-{i}"), "writer");
            nut.version = u64::from(i % 7 + 1);
            trunk.stash(&id, nut).unwrap();
        }
        trunk.flush().unwrap();
    }

    let trunk: BTreeTrunk<String> = BTreeTrunk::open_with(&path, batched_opts()).unwrap();
    assert_eq!(trunk.crack_all().unwrap().len(), 1000);
    for i in (0..1000u32).step_by(97) {
        let id = format!("nut-{i:04}");
        let nut = trunk.crack(&id).unwrap().unwrap();
        assert_eq!(nut.payload.as_deref(), Some(format!("payload-{i}").as_str()));
        assert_eq!(nut.version, u64::from(i % 7 + 1));
    }
}

#[test]
fn overwrites_replay_to_the_latest_version() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grove.acorn");

    {
        let trunk: BTreeTrunk<String> = BTreeTrunk::open_with(&path, batched_opts()).unwrap();
        for round in 1..=5u64 {
            let mut nut = Nut::new("hot", format!("round-{round}"), "writer");
            nut.version = round;
            trunk.stash("hot", nut).unwrap();
        }
        trunk.flush().unwrap();
    }

    let trunk: BTreeTrunk<String> = BTreeTrunk::open_with(&path, batched_opts()).unwrap();
    assert_eq!(trunk.entry_count(), 1);
    let nut = trunk.crack("hot").unwrap().unwrap();
    assert_eq!(nut.payload.as_deref(), Some("round-5"));
    assert_eq!(nut.version, 5);
}

#[test]
fn concurrent_writers_do_not_lose_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grove.acorn");
    let trunk: std::sync::Arc<BTreeTrunk<String>> = std::sync::Arc::new(
        BTreeTrunk::open_with(
            &path,
            BTreeTrunkOptions {
                initial_capacity: 4096,
                batching: false,
                ..BTreeTrunkOptions::default()
            },
        )
        .unwrap(),
    );

    let mut handles = Vec::new();
    for worker in 0..4 {
        let trunk = trunk.clone();
        handles.push(std::thread::spawn(move || {
            for i in 0..100 {
                let id = format!("w{worker}-{i}");
                trunk.stash(&id, Nut::new(&id, format!("v{worker}-{i}"), "writer")).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(trunk.entry_count(), 400);
    for worker in 0..4 {
        for i in (0..100).step_by(33) {
            let id = format!("w{worker}-{i}");
            assert_eq!(
                trunk.crack(&id).unwrap().unwrap().payload.as_deref(),
                Some(format!("v{worker}-{i}").as_str())
            );
        }
    }
}
