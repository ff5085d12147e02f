use std::sync::atomic::Ordering;

use log::debug;

use crate::{
    error::{TreeError, TreeResult},
    tree::{
        consts::{MAX_ENTRY_SIZE, MAX_KEY_SIZE, PAGE_HEADER_SIZE},
        history::HistoryEntry,
        page::{LeafEntry, Node, Page},
        tree::{BTree, Entry, TreeInner, WriterState},
    },
    types::{PageID, Pod, OFFSET_NONE, PAGE_NONE},
    utils::HandyRwLock,
};

struct Split {
    sep: Vec<u8>,
    right: PageID,
}

impl BTree {
    /// Index one entry. Non-blocking: fails with `TreeLocked` when
    /// another writer holds the tree.
    pub fn insert(&self, entry: Entry) -> TreeResult<()> {
        self.inner.check_writable()?;

        let mut writer = self
            .inner
            .writer
            .try_lock()
            .map_err(|_| TreeError::TreeLocked)?;

        insert_locked(&self.inner, &mut writer, entry)?;
        self.inner.notify_waiters();
        Ok(())
    }

    /// Index a batch under one lock acquisition. Entries are applied in
    /// order; the first failure stops the batch, leaving the entries
    /// before it indexed.
    pub fn insert_batch(&self, entries: Vec<Entry>) -> TreeResult<()> {
        self.inner.check_writable()?;

        let mut writer = self
            .inner
            .writer
            .try_lock()
            .map_err(|_| TreeError::TreeLocked)?;

        for entry in entries {
            insert_locked(&self.inner, &mut writer, entry)?;
        }
        self.inner.notify_waiters();
        Ok(())
    }
}

fn insert_locked(inner: &TreeInner, st: &mut WriterState, entry: Entry) -> TreeResult<()> {
    if entry.key.is_empty() || entry.key.len() > MAX_KEY_SIZE {
        return Err(TreeError::IllegalArguments("key empty or too long"));
    }
    if entry.ts == 0 {
        return Err(TreeError::IllegalArguments("timestamp must be positive"));
    }
    if entry.value.len() > MAX_ENTRY_SIZE {
        return Err(TreeError::MaxEntrySizeExceeded(entry.value.len()));
    }

    let probe = LeafEntry {
        key: entry.key.clone(),
        value: entry.value.clone(),
        ts: entry.ts,
        h_off: OFFSET_NONE,
        h_count: 0,
    };
    if PAGE_HEADER_SIZE + probe.disk_size() > inner.page_size {
        return Err(TreeError::MaxEntrySizeExceeded(probe.disk_size()));
    }

    let root_ts = inner.root_ts.load(Ordering::SeqCst);
    if entry.ts < root_ts {
        return Err(TreeError::InvalidTimestamp {
            ts: entry.ts,
            root_ts,
        });
    }

    // worst case the whole path splits: fail before any page is touched
    let depth = inner.depth.load(Ordering::SeqCst) as usize;
    if !st.wb.ensure_capacity(depth + 2) {
        return Err(TreeError::WriteBufferFull(depth + 2));
    }

    // first insert of a batch anchors the buffered history offsets
    if !inner.mutated.load(Ordering::SeqCst) {
        st.h_base_off = inner.history_log.size()?;
        st.history_buffered = 0;
    }

    let root = inner.root_id.load(Ordering::SeqCst);
    let (sub_root, split) = if root == PAGE_NONE {
        let (pid, page) = st.wb.new_leaf()?;
        let mut guard = page.wl();
        guard.is_root = true;
        if let Node::Leaf(leaf) = &mut guard.node {
            leaf.entries.push(probe);
        }
        drop(guard);
        (pid, None)
    } else {
        insert_rec(inner, st, root, &entry, probe)?
    };

    let new_root = match split {
        Some(split) => {
            // the old root moves down one level
            st.wb.tree_page(sub_root)?.wl().is_root = false;

            let (pid, page) = st.wb.new_inner(sub_root)?;
            let mut guard = page.wl();
            guard.is_root = true;
            if let Node::Inner(node) = &mut guard.node {
                node.insert_sep(0, split.sep, split.right);
            }
            drop(guard);

            inner.depth.fetch_add(1, Ordering::SeqCst);
            debug!(
                "root split, depth now {}",
                inner.depth.load(Ordering::SeqCst)
            );
            pid
        }
        None => {
            // the descent always dup'd the root, mark the copy
            st.wb.tree_page(sub_root)?.wl().is_root = true;
            sub_root
        }
    };

    inner.root_id.store(new_root, Ordering::SeqCst);
    inner.root_ts.store(entry.ts, Ordering::SeqCst);
    inner.indexed_entries.fetch_add(1, Ordering::SeqCst);
    inner.mutated.store(true, Ordering::SeqCst);
    Ok(())
}

/// Copy-on-write descent. Returns the mem-page id now standing in for
/// `pid`, plus the split to propagate when the page overflowed.
fn insert_rec(
    inner: &TreeInner,
    st: &mut WriterState,
    pid: PageID,
    entry: &Entry,
    probe: LeafEntry,
) -> TreeResult<(PageID, Option<Split>)> {
    let (mem_pid, page) = st.wb.get_or_dup(pid, || {
        let disk = inner.disk_page(pid)?;
        Ok((*disk).clone())
    })?;

    let child = {
        let guard = page.rl();
        match &guard.node {
            Node::Leaf(_) => None,
            Node::Inner(node) => {
                let idx = node.child_index(&entry.key);
                Some((idx, node.children[idx]))
            }
        }
    };

    match child {
        None => insert_into_leaf(inner, st, &page, mem_pid, entry, probe),
        Some((idx, child_pid)) => {
            let (new_child, split) = insert_rec(inner, st, child_pid, entry, probe)?;

            let mut guard = page.wl();
            let node = match &mut guard.node {
                Node::Inner(node) => node,
                Node::Leaf(_) => return Err(TreeError::CorruptedIndex),
            };
            node.children[idx] = new_child;

            let split = match split {
                None => None,
                Some(split) => {
                    node.insert_sep(idx, split.sep, split.right);
                    if guard.used() <= inner.page_size {
                        None
                    } else {
                        Some(split_inner(st, &mut guard)?)
                    }
                }
            };
            drop(guard);

            Ok((mem_pid, split))
        }
    }
}

fn insert_into_leaf(
    inner: &TreeInner,
    st: &mut WriterState,
    page: &Pod<Page>,
    mem_pid: PageID,
    entry: &Entry,
    probe: LeafEntry,
) -> TreeResult<(PageID, Option<Split>)> {
    let mut guard = page.wl();

    {
        let leaf = match &mut guard.node {
            Node::Leaf(leaf) => leaf,
            Node::Inner(_) => return Err(TreeError::CorruptedIndex),
        };

        match leaf.find(&entry.key) {
            Ok(slot) => {
                // the displaced revision goes to the history chain before
                // anything else moves
                let h_off = archive(inner, st, &leaf.entries[slot])?;
                let h_count = leaf.entries[slot].h_count + 1;
                leaf.entries[slot] = LeafEntry {
                    h_off,
                    h_count,
                    ..probe
                };
            }
            Err(slot) => {
                leaf.entries.insert(slot, probe);
            }
        }
    }

    if guard.used() <= inner.page_size {
        return Ok((mem_pid, None));
    }

    // overflow: move the upper half to a fresh sibling
    let leaf = match &mut guard.node {
        Node::Leaf(leaf) => leaf,
        Node::Inner(_) => return Err(TreeError::CorruptedIndex),
    };
    let mid = leaf.entries.len() / 2;
    let right_entries = leaf.entries.split_off(mid);
    let sep = right_entries[0].key.clone();
    drop(guard);

    if !st.wb.ensure_capacity(1) {
        return Err(TreeError::WriteBufferFull(1));
    }
    let (right_pid, right_page) = st.wb.new_leaf()?;
    if let Node::Leaf(right) = &mut right_page.wl().node {
        right.entries = right_entries;
    }

    debug!(
        "leaf {:#x} split, sep {}",
        mem_pid,
        hex::encode(&sep)
    );
    Ok((
        mem_pid,
        Some(Split {
            sep,
            right: right_pid,
        }),
    ))
}

/// Lift the middle separator out of an overflowing inner page and move
/// the right half to a fresh sibling.
fn split_inner(
    st: &mut WriterState,
    guard: &mut std::sync::RwLockWriteGuard<'_, Page>,
) -> TreeResult<Split> {
    let node = match &mut guard.node {
        Node::Inner(node) => node,
        Node::Leaf(_) => return Err(TreeError::CorruptedIndex),
    };

    let mid = node.seps.len() / 2;
    let right_seps = node.seps.split_off(mid + 1);
    let sep_up = node.seps.pop().unwrap();
    let right_children = node.children.split_off(mid + 1);

    if !st.wb.ensure_capacity(1) {
        return Err(TreeError::WriteBufferFull(1));
    }
    let (right_pid, right_page) = st.wb.new_inner(right_children[0])?;
    if let Node::Inner(right) = &mut right_page.wl().node {
        right.seps = right_seps;
        right.children = right_children;
    }

    Ok(Split {
        sep: sep_up,
        right: right_pid,
    })
}

/// Push the displaced revision of a key onto the in-memory history
/// chain. The returned offset is where the record will land in the
/// history log once the batch flushes.
fn archive(inner: &TreeInner, st: &mut WriterState, old: &LeafEntry) -> TreeResult<u64> {
    let rec = HistoryEntry {
        prev_off: old.h_off,
        ts: old.ts,
        value: old.value.clone(),
    };
    let size = rec.encoded_size();

    let need_new_page = match st.history_tail {
        PAGE_NONE => true,
        tail => !st.wb.history_page(tail)?.rl().fits(size),
    };
    if need_new_page {
        if !st.wb.ensure_capacity(1) {
            return Err(TreeError::WriteBufferFull(1));
        }
        let (pid, _) = st.wb.new_history(inner.page_size)?;
        if st.history_tail == PAGE_NONE {
            st.history_head = pid;
        } else {
            st.wb.history_page(st.history_tail)?.wl().next = pid;
        }
        st.history_tail = pid;
    }

    let off = st.h_base_off + st.history_buffered;

    let page = st.wb.history_page(st.history_tail)?;
    let mut guard = page.wl();
    let start = guard.payload.len();
    guard.append(&rec);
    let checksum = crc32c::crc32c(&guard.payload[start..]);
    drop(guard);

    st.history_buffered += size as u64;
    st.last_history = Some((off, checksum));
    Ok(off)
}
