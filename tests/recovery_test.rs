mod test_utils;

use small_index::TreeError;

use crate::test_utils::{
    entry, file_len, insert_kv, open_tree, setup, truncate_file, tree_log_file,
};

/// Insert, flush, close, reopen: every key must come back with its value
/// and timestamp.
#[test]
fn test_round_trip_reopen() {
    let id = setup();
    let dir = tempfile::tempdir().unwrap();

    {
        let tree = open_tree(dir.path(), id, 512);
        for i in 0..32u64 {
            insert_kv(&tree, &format!("k{:02}", i), &format!("v{}", i), i + 1);
        }
        tree.flush().unwrap();
        tree.close().unwrap();
    }

    let tree = open_tree(dir.path(), id, 512);
    assert_eq!(tree.root_ts(), 32);
    assert_eq!(tree.indexed_entries(), 32);

    let snap = tree.snapshot().unwrap();
    for i in 0..32u64 {
        let (value, ts, _) = snap.get(format!("k{:02}", i).as_bytes()).unwrap();
        assert_eq!(value, format!("v{}", i).as_bytes());
        assert_eq!(ts, i + 1);
    }
    drop(snap);
    tree.close().unwrap();
}

/// History chains must survive a reopen.
#[test]
fn test_history_survives_reopen() {
    let id = setup();
    let dir = tempfile::tempdir().unwrap();

    {
        let tree = open_tree(dir.path(), id, 4096);
        insert_kv(&tree, "a", "1", 1);
        insert_kv(&tree, "a", "2", 2);
        tree.flush().unwrap();
        insert_kv(&tree, "a", "3", 3);
        tree.flush().unwrap();
        tree.close().unwrap();
    }

    let tree = open_tree(dir.path(), id, 4096);
    let snap = tree.snapshot().unwrap();

    let (value, ts, h_count) = snap.get(b"a").unwrap();
    assert_eq!(value, b"3");
    assert_eq!(ts, 3);
    assert_eq!(h_count, 2);
    assert_eq!(snap.get_revision(b"a", 1).unwrap(), (b"1".to_vec(), 1));
    assert_eq!(snap.get_revision(b"a", 2).unwrap(), (b"2".to_vec(), 2));

    drop(snap);
    tree.close().unwrap();
}

/// Kill the batch after the history flush but before the commit entry:
/// the reopened tree must sit at the previous commit, with none of the
/// lost batch visible.
#[test]
fn test_lost_batch_recovers_previous_commit() {
    let id = setup();
    let dir = tempfile::tempdir().unwrap();

    let size_after_first;
    {
        let tree = open_tree(dir.path(), id, 512);
        for i in 0..16u64 {
            insert_kv(&tree, &format!("k{:02}", i), "v", i + 1);
        }
        tree.flush().unwrap();
        tree.close().unwrap();
        size_after_first = file_len(&tree_log_file(dir.path()));
    }

    {
        let tree = open_tree(dir.path(), id, 512);
        for i in 16..24u64 {
            insert_kv(&tree, &format!("k{:02}", i), "v", i + 1);
        }
        tree.flush().unwrap();
        tree.close().unwrap();
    }

    // cut the second batch's commit entry (and a bit of its root page)
    truncate_file(&tree_log_file(dir.path()), size_after_first + 30);

    let tree = open_tree(dir.path(), id, 512);
    assert_eq!(tree.root_ts(), 16);

    let snap = tree.snapshot().unwrap();
    for i in 0..16u64 {
        assert!(snap.get(format!("k{:02}", i).as_bytes()).is_ok());
    }
    for i in 16..24u64 {
        assert!(matches!(
            snap.get(format!("k{:02}", i).as_bytes()),
            Err(TreeError::KeyNotFound)
        ));
    }
    drop(snap);

    // the recovered tree accepts new writes
    insert_kv(&tree, "k99", "v", 100);
    tree.flush().unwrap();
    tree.close().unwrap();
}

/// Truncate at every byte position across the last commit entry: the
/// tree must recover to either the previous or the current commit, never
/// to a mix.
#[test]
fn test_crash_idempotence_at_any_cut() {
    let id = setup();
    let dir = tempfile::tempdir().unwrap();

    {
        let tree = open_tree(dir.path(), id, 512);
        insert_kv(&tree, "a", "1", 1);
        tree.flush().unwrap();
        insert_kv(&tree, "b", "2", 2);
        tree.flush().unwrap();
        tree.close().unwrap();
    }

    let full_len = file_len(&tree_log_file(dir.path()));

    // the last commit entry occupies the final 42 bytes
    for cut in (full_len - 42)..=full_len {
        let scratch = tempfile::tempdir().unwrap();
        copy_dir(dir.path(), scratch.path());
        truncate_file(&tree_log_file(scratch.path()), cut);

        let tree = open_tree(scratch.path(), id, 512);
        let snap = tree.snapshot().unwrap();

        let (value, ts, _) = snap.get(b"a").unwrap();
        assert_eq!(value, b"1");
        assert_eq!(ts, 1);

        match tree.root_ts() {
            1 => assert!(matches!(snap.get(b"b"), Err(TreeError::KeyNotFound))),
            2 => assert_eq!(snap.get(b"b").unwrap().0, b"2"),
            ts => panic!("recovered to impossible timestamp {}", ts),
        }

        drop(snap);
        tree.close().unwrap();
    }
}

/// A log of garbage yields an empty tree, not an error.
#[test]
fn test_garbage_log_opens_empty() {
    let id = setup();
    let dir = tempfile::tempdir().unwrap();

    std::fs::create_dir_all(dir.path().join("tree")).unwrap();
    std::fs::write(tree_log_file(dir.path()), vec![0xA5u8; 700]).unwrap();

    let tree = open_tree(dir.path(), id, 512);
    assert_eq!(tree.root_ts(), 0);
    assert!(matches!(
        tree.snapshot(),
        Err(TreeError::NoSnapshotAvailable)
    ));

    // and it is usable from scratch
    insert_kv(&tree, "a", "1", 1);
    tree.flush().unwrap();
    let snap = tree.snapshot().unwrap();
    assert_eq!(snap.get(b"a").unwrap().0, b"1");
    drop(snap);
    tree.close().unwrap();
}

/// An unflushed batch disappears on reopen; flushed data stays.
#[test]
fn test_unflushed_batch_is_lost() {
    let id = setup();
    let dir = tempfile::tempdir().unwrap();

    {
        let tree = open_tree(dir.path(), id, 4096);
        insert_kv(&tree, "a", "1", 1);
        tree.flush().unwrap();
        insert_kv(&tree, "b", "2", 2);
        // dropped without close: nothing of "b" was persisted
        let _ = tree;
    }

    let tree = open_tree(dir.path(), id, 4096);
    let snap = tree.snapshot().unwrap();
    assert!(snap.get(b"a").is_ok());
    assert!(matches!(snap.get(b"b"), Err(TreeError::KeyNotFound)));
    drop(snap);
    tree.close().unwrap();
}

/// Read-only mode serves reads and rejects every mutation.
#[test]
fn test_read_only_mode() {
    let id = setup();
    let dir = tempfile::tempdir().unwrap();

    {
        let tree = open_tree(dir.path(), id, 4096);
        insert_kv(&tree, "a", "1", 1);
        tree.flush().unwrap();
        tree.close().unwrap();
    }

    let opts = crate::test_utils::test_options(id, 4096).with_read_only(true);
    let tree = small_index::BTree::open(dir.path(), opts).unwrap();

    let snap = tree.snapshot().unwrap();
    assert_eq!(snap.get(b"a").unwrap().0, b"1");
    drop(snap);

    assert!(matches!(
        tree.insert(entry("b", "2", 2)),
        Err(TreeError::ReadOnly)
    ));
    assert!(matches!(tree.advance(5, 1), Err(TreeError::ReadOnly)));
    assert!(matches!(tree.flush(), Err(TreeError::ReadOnly)));

    tree.close().unwrap();
}

fn copy_dir(from: &std::path::Path, to: &std::path::Path) {
    for entry in std::fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        let target = to.join(entry.file_name());
        if entry.file_type().unwrap().is_dir() {
            std::fs::create_dir_all(&target).unwrap();
            copy_dir(&entry.path(), &target);
        } else {
            std::fs::copy(entry.path(), &target).unwrap();
        }
    }
}
