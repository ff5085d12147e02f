use std::sync::{atomic::Ordering, Arc};

use bytes::Buf;

use crate::{
    error::{TreeError, TreeResult},
    tree::{
        history::{HistoryEntry, HistoryPage},
        page::{Node, Page},
        tree::{BTree, TreeInner},
        write_buffer::MemPage,
    },
    types::{is_mem_page, mem_page_slot, PageID, Pod, OFFSET_NONE, PAGE_NONE},
    utils::{CancelToken, HandyRwLock},
};

#[derive(Clone, Copy, PartialEq)]
pub enum SnapshotMode {
    Read,
    Write,
}

/// A fixed view of the tree. Read snapshots anchor at the last persisted
/// root and are fully isolated from the writer; write snapshots anchor at
/// the current in-memory root and observe the writer's batch as it runs.
pub struct Snapshot {
    inner: Arc<TreeInner>,
    pub root_id: PageID,
    pub ts: u64,
    pub mode: SnapshotMode,

    /// Write snapshots pin the slot table and the buffered history chain
    /// so a concurrent flush reset cannot invalidate them.
    mem: Option<Vec<Option<MemPage>>>,
    mem_history: Option<MemHistory>,
}

struct MemHistory {
    base: u64,
    pages: Vec<Pod<HistoryPage>>,
}

enum PageRef {
    Mem(Pod<Page>),
    Disk(Arc<Page>),
}

impl PageRef {
    fn with<T>(&self, f: impl FnOnce(&Page) -> TreeResult<T>) -> TreeResult<T> {
        match self {
            PageRef::Mem(page) => f(&page.rl()),
            PageRef::Disk(page) => f(page),
        }
    }
}

impl BTree {
    /// Open a read snapshot at the last persisted root.
    pub fn snapshot(&self) -> TreeResult<Snapshot> {
        self.inner.check_open()?;

        let root_id = self.inner.last_snapshot_id.load(Ordering::SeqCst);
        if root_id == PAGE_NONE {
            return Err(TreeError::NoSnapshotAvailable);
        }
        let ts = self.inner.last_snapshot_ts.load(Ordering::SeqCst);

        self.inner.register_snapshot()?;
        Ok(Snapshot {
            inner: self.inner.clone(),
            root_id,
            ts,
            mode: SnapshotMode::Read,
            mem: None,
            mem_history: None,
        })
    }

    /// Open a write snapshot at the current in-memory root. Briefly takes
    /// the write lock to capture the root and the mem-page table.
    pub fn write_snapshot(&self) -> TreeResult<Snapshot> {
        self.inner.check_open()?;

        let writer = self.inner.writer.lock().unwrap();
        let root_id = self.inner.root_id.load(Ordering::SeqCst);
        let ts = self.inner.root_ts.load(Ordering::SeqCst);

        let mem = writer.wb.capture();
        let mut pages = Vec::new();
        let mut pid = writer.history_head;
        while pid != PAGE_NONE {
            let page = writer.wb.history_page(pid)?;
            let next = page.rl().next;
            pages.push(page);
            pid = next;
        }
        let mem_history = MemHistory {
            base: writer.h_base_off,
            pages,
        };
        drop(writer);

        self.inner.register_snapshot()?;
        Ok(Snapshot {
            inner: self.inner.clone(),
            root_id,
            ts,
            mode: SnapshotMode::Write,
            mem: Some(mem),
            mem_history: Some(mem_history),
        })
    }

    /// Wait until a *flushed* root covers `ts`, then open a read
    /// snapshot there.
    pub fn snapshot_must_include_ts(&self, token: &CancelToken, ts: u64) -> TreeResult<Snapshot> {
        if self.inner.read_only
            && self.inner.last_snapshot_ts.load(Ordering::SeqCst) < ts
        {
            return Err(TreeError::StaleRootTimestamp);
        }

        self.inner.wait_until(token, || {
            self.inner.last_snapshot_ts.load(Ordering::SeqCst) >= ts
        })?;
        self.snapshot()
    }

    /// Wait until indexing reaches `ts`, then open a write snapshot.
    pub fn snapshot_at_ts(&self, token: &CancelToken, ts: u64) -> TreeResult<Snapshot> {
        if self.inner.read_only && self.inner.root_ts.load(Ordering::SeqCst) < ts {
            return Err(TreeError::StaleRootTimestamp);
        }

        self.inner
            .wait_until(token, || self.inner.root_ts.load(Ordering::SeqCst) >= ts)?;
        self.write_snapshot()
    }
}

impl TreeInner {
    fn register_snapshot(&self) -> TreeResult<()> {
        let active = self.active_snapshots.fetch_add(1, Ordering::SeqCst) + 1;
        if active > self.max_active_snapshots {
            self.active_snapshots.fetch_sub(1, Ordering::SeqCst);
            return Err(TreeError::TooManySnapshots(self.max_active_snapshots));
        }
        Ok(())
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.inner.active_snapshots.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Snapshot {
    /// Point lookup: `(value, ts, history count)`.
    pub fn get(&self, key: &[u8]) -> TreeResult<(Vec<u8>, u64, u64)> {
        let entry = self.leaf_entry(key)?;
        Ok((entry.value, entry.ts, entry.h_count))
    }

    /// The smallest key starting with `prefix` whose bytes differ from
    /// `neq`; used for "next after" scans.
    pub fn get_with_prefix(
        &self,
        prefix: &[u8],
        neq: &[u8],
    ) -> TreeResult<(Vec<u8>, Vec<u8>, u64, u64)> {
        let mut iter = self.scan(prefix)?;
        loop {
            let (key, value, ts) = match iter.next_entry() {
                Ok(found) => found,
                Err(TreeError::NoMoreEntries) => return Err(TreeError::KeyNotFound),
                Err(err) => return Err(err),
            };
            if !key.starts_with(prefix) {
                return Err(TreeError::KeyNotFound);
            }
            if key == neq {
                continue;
            }
            let h_count = self.leaf_entry(&key)?.h_count;
            return Ok((key, value, ts, h_count));
        }
    }

    /// Newest revision of `key` whose timestamp falls in `[t_lo, t_hi]`.
    pub fn get_between(
        &self,
        key: &[u8],
        t_lo: u64,
        t_hi: u64,
    ) -> TreeResult<(Vec<u8>, u64, u64)> {
        let entry = self.leaf_entry(key)?;

        if entry.ts < t_lo {
            return Err(TreeError::KeyNotFound);
        }
        if entry.ts <= t_hi {
            return Ok((entry.value, entry.ts, entry.h_count));
        }

        // newest revision is too new, walk back through the chain
        let mut off = entry.h_off;
        while off != OFFSET_NONE {
            let rec = self.history_entry_at(off)?;
            if rec.ts < t_lo {
                break;
            }
            if rec.ts <= t_hi {
                return Ok((rec.value, rec.ts, entry.h_count));
            }
            off = rec.prev_off;
        }
        Err(TreeError::KeyNotFound)
    }

    /// Revision `rev` of `key`, 1-based and oldest first; the current
    /// value is revision `h_count + 1`.
    pub fn get_revision(&self, key: &[u8], rev: u64) -> TreeResult<(Vec<u8>, u64)> {
        if rev == 0 {
            return Err(TreeError::IllegalArguments("revisions are 1-based"));
        }

        let entry = self.leaf_entry(key)?;
        let newest = entry.h_count + 1;
        if rev > newest {
            return Err(TreeError::KeyRevisionNotFound);
        }
        if rev == newest {
            return Ok((entry.value, entry.ts));
        }

        let mut steps_back = newest - rev;
        let mut off = entry.h_off;
        loop {
            if off == OFFSET_NONE {
                return Err(TreeError::KeyRevisionNotFound);
            }
            let rec = self.history_entry_at(off)?;
            steps_back -= 1;
            if steps_back == 0 {
                return Ok((rec.value, rec.ts));
            }
            off = rec.prev_off;
        }
    }

    /// Ordered scan starting at the first key `>= seek`.
    pub fn scan(&self, seek: &[u8]) -> TreeResult<TreeIterator<'_>> {
        enum SeekStep {
            Descend(usize, PageID),
            Leaf(usize),
        }

        let mut stack = Vec::new();

        if self.root_id != PAGE_NONE {
            let mut pid = self.root_id;
            loop {
                let page = self.resolve(pid)?;
                let step = page.with(|p| match &p.node {
                    Node::Inner(node) => {
                        let idx = node.child_index(seek);
                        Ok(SeekStep::Descend(idx, node.children[idx]))
                    }
                    Node::Leaf(leaf) => {
                        Ok(SeekStep::Leaf(leaf.find(seek).unwrap_or_else(|slot| slot)))
                    }
                })?;

                match step {
                    SeekStep::Descend(idx, child) => {
                        // idx + 1 is the next child the iterator visits
                        // after the subtree below is exhausted
                        stack.push((page, idx + 1));
                        pid = child;
                    }
                    SeekStep::Leaf(idx) => {
                        stack.push((page, idx));
                        break;
                    }
                }
            }
        }

        Ok(TreeIterator {
            snap: self,
            stack,
        })
    }

    fn leaf_entry(&self, key: &[u8]) -> TreeResult<crate::tree::page::LeafEntry> {
        if key.is_empty() {
            return Err(TreeError::IllegalArguments("empty key"));
        }
        if self.root_id == PAGE_NONE {
            return Err(TreeError::KeyNotFound);
        }

        let mut pid = self.root_id;
        loop {
            let page = self.resolve(pid)?;
            let outcome = page.with(|p| match &p.node {
                Node::Inner(node) => Ok(Err(node.children[node.child_index(key)])),
                Node::Leaf(leaf) => match leaf.find(key) {
                    Ok(slot) => Ok(Ok(leaf.entries[slot].clone())),
                    Err(_) => Err(TreeError::KeyNotFound),
                },
            })?;

            match outcome {
                Ok(entry) => return Ok(entry),
                Err(child) => pid = child,
            }
        }
    }

    fn resolve(&self, pid: PageID) -> TreeResult<PageRef> {
        if is_mem_page(pid) {
            let mem = self.mem.as_ref().ok_or(TreeError::InvalidPageID(pid))?;
            match mem.get(mem_page_slot(pid)).and_then(|s| s.as_ref()) {
                Some(MemPage::Tree(page)) => Ok(PageRef::Mem(page.clone())),
                _ => Err(TreeError::InvalidPageID(pid)),
            }
        } else {
            Ok(PageRef::Disk(self.inner.disk_page(pid)?))
        }
    }

    /// Read one history record, from the buffered chain when the offset
    /// has not been flushed yet, from the history log otherwise.
    fn history_entry_at(&self, off: u64) -> TreeResult<HistoryEntry> {
        if let Some(hist) = &self.mem_history {
            if off >= hist.base {
                let mut rel = (off - hist.base) as usize;
                for page in &hist.pages {
                    let guard = page.rl();
                    if rel < guard.payload.len() {
                        return parse_history_record(&guard.payload[rel..]);
                    }
                    rel -= guard.payload.len();
                }
                return Err(TreeError::CorruptedEntry);
            }
        }

        HistoryEntry::read_from(self.inner.history_log.as_ref(), off).map(|(rec, _)| rec)
    }
}

fn parse_history_record(buf: &[u8]) -> TreeResult<HistoryEntry> {
    if buf.len() < crate::tree::consts::HISTORY_ENTRY_HEADER_SIZE {
        return Err(TreeError::CorruptedEntry);
    }
    let mut r = buf;
    let prev_off = r.get_u64();
    let ts = r.get_u64();
    let value_len = r.get_u16() as usize;
    if r.remaining() < value_len {
        return Err(TreeError::CorruptedEntry);
    }
    Ok(HistoryEntry {
        prev_off,
        ts,
        value: r.copy_to_bytes(value_len).to_vec(),
    })
}

/// Stack-based in-order traversal over a frozen snapshot. Stable under
/// concurrent writers: the pages it visits are immutable once persisted.
pub struct TreeIterator<'a> {
    snap: &'a Snapshot,
    stack: Vec<(PageRef, usize)>,
}

impl<'a> TreeIterator<'a> {
    /// The next `(key, value, ts)` in key order, or `NoMoreEntries`.
    pub fn next_entry(&mut self) -> TreeResult<(Vec<u8>, Vec<u8>, u64)> {
        loop {
            let (page, idx) = match self.stack.last_mut() {
                Some(top) => top,
                None => return Err(TreeError::NoMoreEntries),
            };
            let cursor = *idx;

            enum Step {
                Yield(Vec<u8>, Vec<u8>, u64),
                Descend(PageID),
                Pop,
            }

            let step = page.with(|p| match &p.node {
                Node::Leaf(leaf) => {
                    if cursor < leaf.entries.len() {
                        let e = &leaf.entries[cursor];
                        Ok(Step::Yield(e.key.clone(), e.value.clone(), e.ts))
                    } else {
                        Ok(Step::Pop)
                    }
                }
                Node::Inner(node) => {
                    if cursor < node.children.len() {
                        Ok(Step::Descend(node.children[cursor]))
                    } else {
                        Ok(Step::Pop)
                    }
                }
            })?;

            match step {
                Step::Yield(key, value, ts) => {
                    *idx += 1;
                    return Ok((key, value, ts));
                }
                Step::Descend(child) => {
                    *idx += 1;
                    let child_page = self.snap.resolve(child)?;
                    self.stack.push((child_page, 0));
                }
                Step::Pop => {
                    self.stack.pop();
                }
            }
        }
    }
}
