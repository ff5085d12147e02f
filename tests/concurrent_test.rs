mod test_utils;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use rand::prelude::*;
use small_index::{CancelToken, TreeError};

use crate::test_utils::{entry, insert_kv, open_tree, setup};

/// A snapshot taken before an insert never sees it, even after the
/// insert (and its flush) completed.
#[test]
fn test_snapshot_isolation() {
    let id = setup();
    let dir = tempfile::tempdir().unwrap();
    let tree = open_tree(dir.path(), id, 4096);

    insert_kv(&tree, "a", "1", 1);
    tree.flush().unwrap();

    let old_snap = tree.snapshot().unwrap();

    insert_kv(&tree, "b", "2", 2);
    tree.flush().unwrap();

    assert!(matches!(old_snap.get(b"b"), Err(TreeError::KeyNotFound)));
    assert_eq!(old_snap.get(b"a").unwrap().0, b"1");

    // a fresh snapshot sees both
    let new_snap = tree.snapshot().unwrap();
    assert_eq!(new_snap.get(b"b").unwrap().0, b"2");

    drop(old_snap);
    drop(new_snap);
    tree.close().unwrap();
}

/// 8 reader threads against 1 writer. Readers must always observe a
/// complete, sorted tree and monotonically non-decreasing timestamps per
/// key.
#[test]
fn test_concurrent_reads_during_writes() {
    let id = setup();
    let dir = tempfile::tempdir().unwrap();
    let tree = Arc::new(open_tree(dir.path(), id, 512));

    const KEYS: u64 = 200;
    const WRITES: u64 = 2000;

    for i in 0..KEYS {
        insert_kv(&tree, &format!("k{:03}", i), "v0", i + 1);
    }
    tree.flush().unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let mut readers = Vec::new();

    for seed in 0..8u64 {
        let tree = tree.clone();
        let done = done.clone();
        readers.push(thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut last_ts: HashMap<u64, u64> = HashMap::new();

            while !done.load(Ordering::SeqCst) {
                let k = rng.gen_range(0, KEYS);
                let key = format!("k{:03}", k);

                let snap = tree.snapshot().unwrap();
                let (_value, ts, _h_count) = snap.get(key.as_bytes()).unwrap();
                drop(snap);

                let prev = last_ts.entry(k).or_insert(0);
                assert!(
                    ts >= *prev,
                    "timestamp of {} moved backward: {} -> {}",
                    key,
                    prev,
                    ts
                );
                *prev = ts;
            }
        }));
    }

    let mut rng = StdRng::seed_from_u64(42);
    for i in 0..WRITES {
        let k = rng.gen_range(0, KEYS);
        let ts = KEYS + i + 1;
        tree.insert(entry(&format!("k{:03}", k), &format!("v{}", ts), ts))
            .unwrap();
        if i % 100 == 99 {
            tree.flush().unwrap();
        }
    }
    tree.flush().unwrap();

    done.store(true, Ordering::SeqCst);
    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(tree.root_ts(), KEYS + WRITES);
    tree.close().unwrap();
}

/// Waiters wake up when indexing reaches their timestamp and when their
/// token cancels.
#[test]
fn test_wait_for_indexing() {
    let id = setup();
    let dir = tempfile::tempdir().unwrap();
    let tree = Arc::new(open_tree(dir.path(), id, 4096));

    // satisfied by a concurrent insert
    let waiter = {
        let tree = tree.clone();
        thread::spawn(move || {
            let token = CancelToken::new();
            tree.wait_for_indexing_up_to(&token, 5)
        })
    };
    thread::sleep(Duration::from_millis(20));
    insert_kv(&tree, "a", "1", 5);
    waiter.join().unwrap().unwrap();

    // satisfied by advance
    let waiter = {
        let tree = tree.clone();
        thread::spawn(move || {
            let token = CancelToken::new();
            tree.wait_for_indexing_up_to(&token, 9)
        })
    };
    thread::sleep(Duration::from_millis(20));
    tree.advance(9, 0).unwrap();
    waiter.join().unwrap().unwrap();

    // cancelled while the timestamp stays out of reach
    let token = CancelToken::new();
    let waiter = {
        let tree = tree.clone();
        let token = token.clone();
        thread::spawn(move || tree.wait_for_indexing_up_to(&token, 1_000_000))
    };
    thread::sleep(Duration::from_millis(20));
    token.cancel();
    assert!(matches!(
        waiter.join().unwrap(),
        Err(TreeError::Cancelled)
    ));

    tree.close().unwrap();
}

#[test]
fn test_snapshot_must_include_ts() {
    let id = setup();
    let dir = tempfile::tempdir().unwrap();
    let tree = Arc::new(open_tree(dir.path(), id, 4096));

    insert_kv(&tree, "a", "1", 3);

    // the data is indexed but not flushed yet: the snapshot only opens
    // once a flush publishes a root covering ts 3
    let waiter = {
        let tree = tree.clone();
        thread::spawn(move || {
            let token = CancelToken::new();
            let snap = tree.snapshot_must_include_ts(&token, 3)?;
            snap.get(b"a").map(|(value, _, _)| value)
        })
    };
    thread::sleep(Duration::from_millis(20));
    tree.flush().unwrap();

    assert_eq!(waiter.join().unwrap().unwrap(), b"1");
    tree.close().unwrap();
}

/// The snapshot budget is enforced and released on drop.
#[test]
fn test_snapshot_limit() {
    let id = setup();
    let dir = tempfile::tempdir().unwrap();
    let opts = crate::test_utils::test_options(id, 4096).with_max_active_snapshots(2);
    let tree = small_index::BTree::open(dir.path(), opts).unwrap();

    insert_kv(&tree, "a", "1", 1);
    tree.flush().unwrap();

    let snap_1 = tree.snapshot().unwrap();
    let snap_2 = tree.snapshot().unwrap();
    assert!(matches!(
        tree.snapshot(),
        Err(TreeError::TooManySnapshots(2))
    ));

    // close refuses while snapshots are alive
    assert!(matches!(tree.close(), Err(TreeError::ActiveSnapshots(2))));

    drop(snap_1);
    let snap_3 = tree.snapshot().unwrap();
    drop(snap_2);
    drop(snap_3);

    tree.close().unwrap();
}

/// Two writers racing for the tree: the loser gets `TreeLocked`, never a
/// block.
#[test]
fn test_insert_is_non_blocking() {
    let id = setup();
    let dir = tempfile::tempdir().unwrap();
    let tree = Arc::new(open_tree(dir.path(), id, 512));

    let locked_seen = Arc::new(AtomicBool::new(false));
    let mut writers = Vec::new();

    for w in 0..4u64 {
        let tree = tree.clone();
        let locked_seen = locked_seen.clone();
        writers.push(thread::spawn(move || {
            for i in 0..250u64 {
                // timestamps only ever move forward across all writers
                let ts = 1 + w + i * 4;
                match tree.insert(entry(&format!("w{}k{}", w, i), "v", ts)) {
                    Ok(()) => {}
                    Err(TreeError::TreeLocked) => {
                        locked_seen.store(true, Ordering::SeqCst);
                    }
                    Err(TreeError::InvalidTimestamp { .. }) => {
                        // a faster writer already advanced the root
                    }
                    Err(err) => panic!("unexpected insert error: {}", err),
                }
            }
        }));
    }

    for writer in writers {
        writer.join().unwrap();
    }

    // the tree is still consistent
    tree.flush().unwrap();
    let snap = tree.snapshot().unwrap();
    let mut iter = snap.scan(b"").unwrap();
    let mut previous: Option<Vec<u8>> = None;
    loop {
        match iter.next_entry() {
            Ok((key, _, _)) => {
                if let Some(prev) = &previous {
                    assert!(*prev < key);
                }
                previous = Some(key);
            }
            Err(TreeError::NoMoreEntries) => break,
            Err(err) => panic!("scan failed: {}", err),
        }
    }
    drop(iter);
    drop(snap);
    tree.close().unwrap();
}
