use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, RwLock,
    },
};

use log::warn;
use once_cell::sync::OnceCell;

use crate::{
    error::{TreeError, TreeResult},
    tree::page::Page,
    types::PageID,
    utils::HandyRwLock,
};

pub const DEFAULT_CACHE_SLOTS: usize = 256;

static PAGE_CACHE: OnceCell<Arc<PageCache>> = OnceCell::new();

/// Install the process-wide cache at startup. Trees fall back to it
/// when their options carry no explicit handle; installing twice is a
/// startup bug.
pub fn init(slots: usize) {
    if PAGE_CACHE.set(Arc::new(PageCache::new(slots))).is_err() {
        panic!("page cache already initialized");
    }
}

/// The process-wide cache. When nothing installed one yet, the first
/// caller's `slots` sizes it; later arguments are ignored.
pub fn global(slots: usize) -> Arc<PageCache> {
    PAGE_CACHE
        .get_or_init(|| Arc::new(PageCache::new(slots)))
        .clone()
}

type Key = (u64, PageID);

/// Fixed-capacity cache of persisted pages, shared by every tree in the
/// process and safe for concurrent use. Eviction is CLOCK: a scan
/// advances the hand, clears reference bits, and recycles the first
/// unpinned slot whose bit is already clear.
pub struct PageCache {
    slots: Vec<Slot>,
    map: RwLock<HashMap<Key, usize>>,
    hand: Mutex<usize>,
}

struct Slot {
    inner: RwLock<SlotInner>,
    pinned: AtomicU32,
    referenced: AtomicBool,
}

#[derive(Default)]
struct SlotInner {
    key: Option<Key>,
    page: Option<Arc<Page>>,
}

impl PageCache {
    pub fn new(slots: usize) -> Self {
        assert!(slots > 0, "page cache must have at least one slot");
        Self {
            slots: (0..slots)
                .map(|_| Slot {
                    inner: RwLock::new(SlotInner::default()),
                    pinned: AtomicU32::new(0),
                    referenced: AtomicBool::new(false),
                })
                .collect(),
            map: RwLock::new(HashMap::new()),
            hand: Mutex::new(0),
        }
    }

    /// Pin and return the page, loading it on a miss. The caller owns one
    /// pin and must hand it back through [`PageCache::release`].
    pub fn get(
        &self,
        tree_id: u64,
        pid: PageID,
        loader: impl FnOnce() -> TreeResult<Page>,
    ) -> TreeResult<Arc<Page>> {
        let key = (tree_id, pid);

        if let Some(page) = self.lookup(&key) {
            return Ok(page);
        }

        // Miss: parse outside of any cache lock, then race to publish.
        let page = Arc::new(loader()?);

        let mut map = self.map.wl();
        if let Some(&idx) = map.get(&key) {
            let slot = &self.slots[idx];
            slot.pinned.fetch_add(1, Ordering::SeqCst);
            slot.referenced.store(true, Ordering::Relaxed);
            let inner = slot.inner.rl();
            if inner.key == Some(key) {
                return Ok(inner.page.clone().unwrap());
            }
            slot.pinned.fetch_sub(1, Ordering::SeqCst);
        }

        let idx = self.find_victim(&mut map)?;
        let slot = &self.slots[idx];
        let mut inner = slot.inner.wl();
        if let Some(old_key) = inner.key.take() {
            map.remove(&old_key);
        }
        inner.key = Some(key);
        inner.page = Some(page.clone());
        map.insert(key, idx);
        slot.pinned.store(1, Ordering::SeqCst);
        slot.referenced.store(true, Ordering::Relaxed);

        Ok(page)
    }

    pub fn release(&self, tree_id: u64, pid: PageID) {
        let map = self.map.rl();
        match map.get(&(tree_id, pid)) {
            Some(&idx) => {
                self.slots[idx].pinned.fetch_sub(1, Ordering::SeqCst);
            }
            None => {
                warn!("release of unpinned page {:#x}", pid);
            }
        }
    }

    /// Pin, run `f`, release; the release happens even when `f` fails.
    pub fn use_page<T>(
        &self,
        tree_id: u64,
        pid: PageID,
        loader: impl FnOnce() -> TreeResult<Page>,
        f: impl FnOnce(&Page) -> TreeResult<T>,
    ) -> TreeResult<T> {
        let page = self.get(tree_id, pid, loader)?;
        let result = f(&page);
        self.release(tree_id, pid);
        result
    }

    /// Drop every cached page of one tree. Called on close so a reopened
    /// tree cannot observe stale images under recycled offsets.
    pub fn drop_tree(&self, tree_id: u64) {
        let mut map = self.map.wl();
        let keys: Vec<Key> = map.keys().filter(|(t, _)| *t == tree_id).cloned().collect();
        for key in keys {
            if let Some(idx) = map.remove(&key) {
                let mut inner = self.slots[idx].inner.wl();
                inner.key = None;
                inner.page = None;
            }
        }
    }

    fn lookup(&self, key: &Key) -> Option<Arc<Page>> {
        let map = self.map.rl();
        let &idx = map.get(key)?;
        let slot = &self.slots[idx];

        // pin before inspecting, so the clock hand skips this slot
        slot.pinned.fetch_add(1, Ordering::SeqCst);
        slot.referenced.store(true, Ordering::Relaxed);

        let inner = slot.inner.rl();
        if inner.key.as_ref() == Some(key) {
            return inner.page.clone();
        }

        // raced with an eviction
        slot.pinned.fetch_sub(1, Ordering::SeqCst);
        None
    }

    /// Advance the clock hand until an unpinned slot with a clear
    /// reference bit turns up. Runs under the map write lock so nobody
    /// can re-map slots during the scan.
    fn find_victim(&self, _map: &mut HashMap<Key, usize>) -> TreeResult<usize> {
        let mut hand = self.hand.lock().unwrap();

        let limit = self.slots.len() * 4;
        for _ in 0..limit {
            let idx = *hand % self.slots.len();
            *hand = hand.wrapping_add(1);

            let slot = &self.slots[idx];
            if slot.pinned.load(Ordering::SeqCst) != 0 {
                continue;
            }
            if slot.referenced.swap(false, Ordering::Relaxed) {
                continue;
            }
            return Ok(idx);
        }

        Err(TreeError::CacheExhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::page::{LeafEntry, LeafNode, Node};
    use crate::types::OFFSET_NONE;

    fn page_with_key(key: &[u8]) -> Page {
        let mut leaf = LeafNode::default();
        leaf.entries.push(LeafEntry {
            key: key.to_vec(),
            value: b"v".to_vec(),
            ts: 1,
            h_off: OFFSET_NONE,
            h_count: 0,
        });
        Page {
            node: Node::Leaf(leaf),
            is_root: false,
            copied: false,
        }
    }

    #[test]
    fn test_hit_skips_loader() {
        let cache = PageCache::new(4);

        let page = cache.get(1, 100, || Ok(page_with_key(b"a"))).unwrap();
        assert_eq!(page.as_leaf().unwrap().entries[0].key, b"a");

        // second get must not invoke the loader
        let page = cache
            .get(1, 100, || panic!("loader called on a hit"))
            .unwrap();
        assert_eq!(page.as_leaf().unwrap().entries[0].key, b"a");

        cache.release(1, 100);
        cache.release(1, 100);
    }

    #[test]
    fn test_exhausted_when_all_pinned() {
        let cache = PageCache::new(1);

        let _page = cache.get(1, 100, || Ok(page_with_key(b"a"))).unwrap();

        // the only slot is pinned, a different page cannot get in
        match cache.get(1, 200, || Ok(page_with_key(b"b"))) {
            Err(TreeError::CacheExhausted) => {}
            other => panic!("expected CacheExhausted, got {:?}", other.map(|_| ())),
        }

        cache.release(1, 100);

        // released, the slot is reusable
        cache
            .use_page(1, 200, || Ok(page_with_key(b"b")), |page| {
                assert_eq!(page.as_leaf().unwrap().entries[0].key, b"b");
                Ok(())
            })
            .unwrap();
    }

    // The only test allowed to touch the process-wide instance: the
    // install order inside one process is not otherwise deterministic.
    #[test]
    fn test_global_cache_installs_once() {
        init(8);

        // every later caller gets the installed instance, whatever size
        // it asks for
        let cache = global(4);
        assert!(Arc::ptr_eq(&cache, &global(64)));

        // the strict installer refuses to run twice
        let panicked = std::panic::catch_unwind(|| init(2)).is_err();
        assert!(panicked);
    }

    #[test]
    fn test_eviction_prefers_unreferenced() {
        let cache = PageCache::new(2);

        cache.use_page(1, 100, || Ok(page_with_key(b"a")), |_| Ok(())).unwrap();
        cache.use_page(1, 200, || Ok(page_with_key(b"b")), |_| Ok(())).unwrap();

        // a full clock rotation clears both reference bits, then evicts one
        cache.use_page(1, 300, || Ok(page_with_key(b"c")), |_| Ok(())).unwrap();

        // page 300 must still be resident
        cache
            .use_page(1, 300, || panic!("evicted the newest page"), |_| Ok(()))
            .unwrap();
    }
}
