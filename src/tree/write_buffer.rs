use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, RwLock,
    },
};

use log::debug;

use crate::{
    error::{TreeError, TreeResult},
    tree::{history::HistoryPage, page::Page},
    types::{is_mem_page, mem_page_id, mem_page_slot, PageID, Pod},
    utils::HandyRwLock,
};

/// The shared arena budget. Trees reserve chunks (one chunk backs one
/// mem-page) against it; quotas keep a single hot tree from starving the
/// rest.
pub struct WriteBufferPool {
    capacity: usize,
    allocated: AtomicUsize,
}

impl WriteBufferPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            allocated: AtomicUsize::new(0),
        })
    }

    fn reserve(&self, n: usize) -> bool {
        let mut current = self.allocated.load(Ordering::SeqCst);
        loop {
            if current + n > self.capacity {
                return false;
            }
            match self.allocated.compare_exchange(
                current,
                current + n,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn release(&self, n: usize) {
        self.allocated.fetch_sub(n, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub enum MemPage {
    Tree(Pod<Page>),
    History(Pod<HistoryPage>),
}

/// Per-tree slice of the arena. The owning tree's write lock serialises
/// all mutation; snapshot readers only clone `Arc`s out of the slot table.
pub struct TreeWriteBuffer {
    pool: Arc<WriteBufferPool>,
    min_chunks: usize,
    max_chunks: usize,

    /// Chunks currently reserved against the pool, `min..=max`.
    reserved: usize,

    slots: Vec<Option<MemPage>>,
    free: Vec<usize>,

    /// Persisted page id -> mem page id for pages already duplicated in
    /// this write batch.
    dups: HashMap<PageID, PageID>,
}

impl TreeWriteBuffer {
    pub fn new(
        pool: Arc<WriteBufferPool>,
        min_chunks: usize,
        max_chunks: usize,
    ) -> TreeResult<Self> {
        if min_chunks == 0 || min_chunks > max_chunks {
            return Err(TreeError::IllegalArguments(
                "write buffer quota must satisfy 0 < min <= max",
            ));
        }
        if !pool.reserve(min_chunks) {
            return Err(TreeError::WriteBufferFull(min_chunks));
        }
        Ok(Self {
            pool,
            min_chunks,
            max_chunks,
            reserved: min_chunks,
            slots: Vec::new(),
            free: Vec::new(),
            dups: HashMap::new(),
        })
    }

    // free holds recycled slots; reserved - slots.len() is the untouched
    // tail of the quota
    fn available(&self) -> usize {
        self.free.len() + (self.reserved - self.slots.len())
    }

    /// Make sure `n` fresh pages can be vended without touching the pool
    /// again, growing the reservation when the quota and the arena allow
    /// it.
    pub fn ensure_capacity(&mut self, n: usize) -> bool {
        while self.available() < n && self.reserved < self.max_chunks {
            if !self.pool.reserve(1) {
                break;
            }
            self.reserved += 1;
        }
        self.available() >= n
    }

    /// Same check without growing.
    pub fn can_accommodate(&self, n: usize) -> bool {
        self.available() >= n
    }

    fn alloc_slot(&mut self, page: MemPage) -> TreeResult<PageID> {
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(page);
                idx
            }
            None => {
                if self.slots.len() >= self.reserved {
                    return Err(TreeError::WriteBufferFull(1));
                }
                self.slots.push(Some(page));
                self.slots.len() - 1
            }
        };
        Ok(mem_page_id(idx))
    }

    pub fn new_leaf(&mut self) -> TreeResult<(PageID, Pod<Page>)> {
        let page = Arc::new(RwLock::new(Page::new_leaf()));
        let pid = self.alloc_slot(MemPage::Tree(page.clone()))?;
        Ok((pid, page))
    }

    pub fn new_inner(&mut self, left_child: PageID) -> TreeResult<(PageID, Pod<Page>)> {
        let page = Arc::new(RwLock::new(Page::new_inner(left_child)));
        let pid = self.alloc_slot(MemPage::Tree(page.clone()))?;
        Ok((pid, page))
    }

    pub fn new_history(
        &mut self,
        capacity: usize,
    ) -> TreeResult<(PageID, Pod<HistoryPage>)> {
        let page = Arc::new(RwLock::new(HistoryPage::new(capacity)));
        let pid = self.alloc_slot(MemPage::History(page.clone()))?;
        Ok((pid, page))
    }

    /// Return the writable mem-page behind `pid`, duplicating a persisted
    /// page into the arena on first touch. The duplicate carries the
    /// `copied` mark so the flush can account its predecessor as stale.
    pub fn get_or_dup(
        &mut self,
        pid: PageID,
        loader: impl FnOnce() -> TreeResult<Page>,
    ) -> TreeResult<(PageID, Pod<Page>)> {
        if is_mem_page(pid) {
            let page = self.tree_page(pid)?;
            return Ok((pid, page));
        }
        if let Some(&mem_pid) = self.dups.get(&pid) {
            let page = self.tree_page(mem_pid)?;
            return Ok((mem_pid, page));
        }

        let mut copy = loader()?;
        copy.copied = true;
        let page = Arc::new(RwLock::new(copy));
        let mem_pid = self.alloc_slot(MemPage::Tree(page.clone()))?;
        self.dups.insert(pid, mem_pid);

        debug!("dup page {:#x} -> mem {:#x}", pid, mem_pid);
        Ok((mem_pid, page))
    }

    pub fn tree_page(&self, pid: PageID) -> TreeResult<Pod<Page>> {
        match self.mem_page(pid)? {
            MemPage::Tree(page) => Ok(page),
            MemPage::History(_) => Err(TreeError::InvalidPageID(pid)),
        }
    }

    pub fn history_page(&self, pid: PageID) -> TreeResult<Pod<HistoryPage>> {
        match self.mem_page(pid)? {
            MemPage::History(page) => Ok(page),
            MemPage::Tree(_) => Err(TreeError::InvalidPageID(pid)),
        }
    }

    fn mem_page(&self, pid: PageID) -> TreeResult<MemPage> {
        if !is_mem_page(pid) {
            return Err(TreeError::InvalidPageID(pid));
        }
        let slot = mem_page_slot(pid);
        self.slots
            .get(slot)
            .and_then(|s| s.clone())
            .ok_or(TreeError::InvalidPageID(pid))
    }

    /// Snapshot of the slot table; write snapshots hold this so a flush
    /// reset cannot pull their pages out from under them.
    pub fn capture(&self) -> Vec<Option<MemPage>> {
        self.slots.clone()
    }

    /// Free every mem-page after a successful flush and shrink the
    /// reservation back to the minimum quota.
    pub fn reset(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.dups.clear();
        if self.reserved > self.min_chunks {
            self.pool.release(self.reserved - self.min_chunks);
            self.reserved = self.min_chunks;
        }
    }

    pub fn page_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

impl Drop for TreeWriteBuffer {
    fn drop(&mut self) {
        self.pool.release(self.reserved);
    }
}
