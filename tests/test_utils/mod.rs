#![allow(dead_code)]

use std::{
    fs::OpenOptions,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Once,
    },
};

use small_index::{BTree, Entry, Options};

static INIT: Once = Once::new();
static NEXT_TREE_ID: AtomicU64 = AtomicU64::new(1);

/// # Conduct the initialization
///
/// - Setting up log configurations.
/// - Handing out a fresh tree id, so trees of different tests never
///   collide in the shared page cache.
pub fn setup() -> u64 {
    INIT.call_once(small_index::utils::init_log);
    NEXT_TREE_ID.fetch_add(1, Ordering::SeqCst)
}

pub fn test_options(id: u64, page_size: usize) -> Options {
    Options::default().with_id(id).with_page_size(page_size)
}

pub fn open_tree(dir: &Path, id: u64, page_size: usize) -> BTree {
    BTree::open(dir, test_options(id, page_size)).unwrap()
}

pub fn entry(key: &str, value: &str, ts: u64) -> Entry {
    Entry {
        key: key.as_bytes().to_vec(),
        value: value.as_bytes().to_vec(),
        ts,
    }
}

pub fn insert_kv(tree: &BTree, key: &str, value: &str, ts: u64) {
    tree.insert(entry(key, value, ts)).unwrap();
}

/// The first fragment of the tree log, where all test-sized trees live.
pub fn tree_log_file(dir: &Path) -> PathBuf {
    dir.join("tree").join("00000000.t")
}

pub fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).unwrap().len()
}

/// Cut the file to `len` bytes, simulating a crash mid-write.
pub fn truncate_file(path: &Path, len: u64) {
    let file = OpenOptions::new().write(true).open(path).unwrap();
    file.set_len(len).unwrap();
    file.sync_all().unwrap();
}
