use std::sync::atomic::Ordering;

use log::debug;

use crate::{
    error::TreeResult,
    tree::{
        commit::CommitEntry,
        page::Node,
        tree::{BTree, TreeInner, WriterState},
    },
    types::{is_mem_page, PageID, PAGE_NONE},
    utils::HandyRwLock,
};

struct FlushCounters {
    pages: u64,
    stale: u32,
}

impl BTree {
    /// Persist all in-memory mutations: history pages first, then the
    /// tree in post-order, then the commit entry. Recovery lands either
    /// before or after the whole batch, never in between.
    pub fn flush(&self) -> TreeResult<()> {
        self.inner.check_writable()?;
        let mut writer = self.inner.writer.lock().unwrap();
        flush_locked(&self.inner, &mut writer)?;
        self.inner.notify_waiters();
        Ok(())
    }
}

pub(crate) fn flush_locked(inner: &TreeInner, st: &mut WriterState) -> TreeResult<()> {
    if !inner.mutated.load(Ordering::SeqCst) {
        return Ok(());
    }

    let mut appended = 0u64;

    // history first: its offsets were promised to leaf entries at insert
    // time, so the records must be durable before any page referring to
    // them
    let mut pid = st.history_head;
    while pid != PAGE_NONE {
        let page = st.wb.history_page(pid)?;
        let guard = page.rl();
        let (_, n) = inner.history_log.append(&guard.payload)?;
        appended += n as u64;
        pid = guard.next;
    }
    if let Some((off, checksum)) = st.last_history {
        inner.h_log_last_off.store(off, Ordering::SeqCst);
        inner.h_log_last_checksum.store(checksum, Ordering::SeqCst);
    }
    inner.history_log.flush()?;

    // tree pages in post-order, children before parents so every child
    // slot can be rewritten with the final persistent id
    let root = inner.root_id.load(Ordering::SeqCst);
    let mut counters = FlushCounters { pages: 0, stale: 0 };
    let new_root = flush_page(inner, st, root, &mut counters)?;
    appended += counters.pages * inner.page_size as u64;

    let total_pages = inner.total_pages.load(Ordering::SeqCst) + counters.pages;
    let stale_pages = inner.stale_pages.load(Ordering::SeqCst) + counters.stale;

    let commit = CommitEntry {
        ts: inner.root_ts.load(Ordering::SeqCst),
        h_log_off: inner.h_log_last_off.load(Ordering::SeqCst),
        h_log_checksum: inner.h_log_last_checksum.load(Ordering::SeqCst),
        total_pages,
        stale_pages,
        indexed_entries: inner.indexed_entries.load(Ordering::SeqCst) as u32,
    };
    let mut buf = Vec::new();
    commit.put(&mut buf);
    let (commit_off, n) = inner.tree_log.append(&buf)?;
    appended += n as u64;

    // the root is the page right before the commit entry
    debug_assert_eq!(commit_off, new_root);

    inner.tree_log.flush()?;

    inner.root_id.store(new_root, Ordering::SeqCst);
    inner.last_snapshot_id.store(new_root, Ordering::SeqCst);
    inner
        .last_snapshot_ts
        .store(commit.ts, Ordering::SeqCst);
    inner.total_pages.store(total_pages, Ordering::SeqCst);
    inner.stale_pages.store(stale_pages, Ordering::SeqCst);
    inner.mutated.store(false, Ordering::SeqCst);

    st.wb.reset();
    st.history_head = PAGE_NONE;
    st.history_tail = PAGE_NONE;
    st.history_buffered = 0;
    st.last_history = None;

    debug!(
        "flushed batch: root {:#x}, ts {}, {} pages ({} stale)",
        new_root, commit.ts, counters.pages, counters.stale
    );

    inner.maybe_schedule_sync(appended);
    Ok(())
}

/// Append the subtree under `pid` and return the persistent id standing
/// in for it. Pages already on disk pass through untouched.
fn flush_page(
    inner: &TreeInner,
    st: &mut WriterState,
    pid: PageID,
    counters: &mut FlushCounters,
) -> TreeResult<PageID> {
    if !is_mem_page(pid) {
        return Ok(pid);
    }

    let page = st.wb.tree_page(pid)?;
    let mut guard = page.wl();

    if let Node::Inner(node) = &mut guard.node {
        for i in 0..node.children.len() {
            let child = node.children[i];
            if is_mem_page(child) {
                node.children[i] = flush_page(inner, st, child, counters)?;
            }
        }
    }

    let mut buf = vec![0u8; inner.page_size];
    guard.put(&mut buf)?;
    let was_copy = guard.copied;
    drop(guard);

    let (off, n) = inner.tree_log.append(&buf)?;
    counters.pages += 1;
    if was_copy {
        // the on-disk predecessor is no longer reachable from the new
        // root
        counters.stale += 1;
    }

    Ok(off + n as u64)
}
