use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc, Condvar, Mutex,
    },
    thread::JoinHandle,
    time::Duration,
};

use crossbeam::channel::{unbounded, Sender};
use log::{debug, info, warn};

use crate::{
    applog::{app_remove, default_app_factory, AppOptions, AppendLog},
    error::{TreeError, TreeResult},
    tree::{
        commit::find_last_valid_commit,
        consts::COMMIT_ENTRY_SIZE,
        history::HistoryEntry,
        options::Options,
        page::{Node, Page},
        page_cache::{self, PageCache},
        write_buffer::{TreeWriteBuffer, WriteBufferPool},
    },
    types::{is_mem_page, PageID, OFFSET_NONE, PAGE_NONE},
    utils::CancelToken,
};

/// One entry submitted for indexing. The timestamp comes from the
/// external sequencer and must never move backward.
#[derive(Clone)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub ts: u64,
}

/// Append-only, copy-on-write B+tree over two logs: fixed-size tree pages
/// in one, variable-length value history in the other. A single writer
/// mutates mem-pages in the write buffer; readers anchor at a root id and
/// never block the writer.
pub struct BTree {
    pub(crate) inner: Arc<TreeInner>,
}

pub(crate) struct TreeInner {
    pub id: u64,
    pub path: PathBuf,
    pub page_size: usize,
    pub read_only: bool,
    pub sync_thld: u64,
    pub compaction_thld: f64,
    pub max_active_snapshots: usize,

    pub tree_log: Arc<dyn AppendLog>,
    pub history_log: Arc<dyn AppendLog>,
    pub page_cache: Arc<PageCache>,

    /// Exclusive writer state; `Insert` try-locks it, the other writers
    /// block.
    pub writer: Mutex<WriterState>,

    pub root_id: AtomicU64,
    pub root_ts: AtomicU64,
    pub last_snapshot_id: AtomicU64,
    pub last_snapshot_ts: AtomicU64,
    pub depth: AtomicU32,
    pub indexed_entries: AtomicU64,
    pub total_pages: AtomicU64,
    pub stale_pages: AtomicU32,
    pub h_log_last_off: AtomicU64,
    pub h_log_last_checksum: AtomicU32,
    pub mutated: AtomicBool,
    pub closed: AtomicBool,

    pub active_snapshots: AtomicUsize,
    pub ongoing_syncs: Arc<AtomicUsize>,
    pub unsynced_bytes: AtomicU64,

    /// Parked `wait_for_indexing_up_to` callers; notified whenever
    /// `root_ts` or `last_snapshot_ts` advances.
    pub wait_mutex: Mutex<()>,
    pub wait_cond: Condvar,

    sync_tx: Mutex<Option<Sender<SyncMsg>>>,
    sync_handle: Mutex<Option<JoinHandle<()>>>,
}

pub(crate) struct WriterState {
    pub wb: TreeWriteBuffer,

    /// In-memory history chain of the current write batch.
    pub history_head: PageID,
    pub history_tail: PageID,
    pub history_buffered: u64,

    /// History-log size at batch start; buffered offsets are relative to
    /// it.
    pub h_base_off: u64,

    /// Offset and checksum of the newest record archived in this batch.
    pub last_history: Option<(u64, u32)>,
}

enum SyncMsg {
    Sync,
    Shutdown,
}

struct Recovered {
    root_id: PageID,
    root_ts: u64,
    depth: u32,
    total_pages: u64,
    stale_pages: u32,
    indexed_entries: u64,
    h_log_last_off: u64,
    h_log_last_checksum: u32,
}

impl Recovered {
    fn empty() -> Self {
        Self {
            root_id: PAGE_NONE,
            root_ts: 0,
            depth: 0,
            total_pages: 0,
            stale_pages: 0,
            indexed_entries: 0,
            h_log_last_off: OFFSET_NONE,
            h_log_last_checksum: 0,
        }
    }
}

impl BTree {
    pub fn open<P: AsRef<Path>>(path: P, opts: Options) -> TreeResult<Self> {
        opts.validate()?;
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let factory = opts
            .app_factory
            .clone()
            .unwrap_or_else(default_app_factory);
        let cache = opts
            .page_buffer
            .clone()
            .unwrap_or_else(|| page_cache::global(opts.cache_size));
        let pool = opts
            .write_buffer
            .clone()
            .unwrap_or_else(|| WriteBufferPool::new(opts.write_buffer_max_chunks));

        let tree_app_opts = AppOptions {
            ext: "t".to_string(),
            file_size: opts.file_size,
            file_mode: opts.file_mode,
            write_buffer_size: opts.app_write_buffer_size,
        };
        let history_app_opts = AppOptions {
            ext: "hx".to_string(),
            ..tree_app_opts.clone()
        };

        let history_log = factory(&path, "history", &history_app_opts)?;

        // Snapshot directories first, newest timestamp first, then the
        // base log. The first candidate with a valid last commit wins.
        let mut candidates = snapshot_candidates(&path)?;
        candidates.push("tree".to_string());

        let mut attempts = 0;
        let mut opened: Option<(Arc<dyn AppendLog>, Recovered)> = None;

        for sub in &candidates {
            let log = match factory(&path, sub, &tree_app_opts) {
                Ok(log) => log,
                Err(err) => {
                    warn!("cannot open tree log {:?}/{}: {}", path, sub, err);
                    attempts += 1;
                    continue;
                }
            };

            // an empty snapshot directory carries nothing to recover;
            // only the base log may legitimately start empty
            if sub.as_str() != "tree" && log.size().unwrap_or(0) == 0 {
                attempts += 1;
                let _ = log.close();
                let _ = app_remove(&path, sub);
                continue;
            }

            match recover(log.as_ref(), history_log.as_ref(), &opts) {
                Ok(state) => {
                    opened = Some((log, state));
                    break;
                }
                Err(err) if err.rejects_candidate() => {
                    warn!(
                        "recovery of {:?}/{} failed: {}, trying next candidate",
                        path, sub, err
                    );
                    attempts += 1;
                    let _ = log.close();
                    if sub.as_str() != "tree" {
                        let _ = app_remove(&path, sub);
                    }
                }
                Err(err) => return Err(err),
            }
        }

        let (tree_log, recovered) = match opened {
            Some(opened) => opened,
            None => {
                warn!(
                    "no valid commit entry after {} recovery attempts, {:?} starts empty",
                    attempts, path
                );
                let log = factory(&path, "tree", &tree_app_opts)?;
                if !opts.read_only {
                    log.set_offset(0)?;
                    history_log.set_offset(0)?;
                }
                (log, Recovered::empty())
            }
        };

        let wb = TreeWriteBuffer::new(
            pool,
            opts.write_buffer_min_chunks,
            opts.write_buffer_max_chunks,
        )?;

        let ongoing_syncs = Arc::new(AtomicUsize::new(0));
        let inner = Arc::new(TreeInner {
            id: opts.id,
            path,
            page_size: opts.page_size,
            read_only: opts.read_only,
            sync_thld: opts.sync_thld,
            compaction_thld: opts.compaction_thld,
            max_active_snapshots: opts.max_active_snapshots,
            tree_log,
            history_log,
            page_cache: cache,
            writer: Mutex::new(WriterState {
                wb,
                history_head: PAGE_NONE,
                history_tail: PAGE_NONE,
                history_buffered: 0,
                h_base_off: 0,
                last_history: None,
            }),
            root_id: AtomicU64::new(recovered.root_id),
            root_ts: AtomicU64::new(recovered.root_ts),
            last_snapshot_id: AtomicU64::new(recovered.root_id),
            last_snapshot_ts: AtomicU64::new(recovered.root_ts),
            depth: AtomicU32::new(recovered.depth),
            indexed_entries: AtomicU64::new(recovered.indexed_entries),
            total_pages: AtomicU64::new(recovered.total_pages),
            stale_pages: AtomicU32::new(recovered.stale_pages),
            h_log_last_off: AtomicU64::new(recovered.h_log_last_off),
            h_log_last_checksum: AtomicU32::new(recovered.h_log_last_checksum),
            mutated: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            active_snapshots: AtomicUsize::new(0),
            ongoing_syncs,
            unsynced_bytes: AtomicU64::new(0),
            wait_mutex: Mutex::new(()),
            wait_cond: Condvar::new(),
            sync_tx: Mutex::new(None),
            sync_handle: Mutex::new(None),
        });

        if !inner.read_only {
            inner.start_sync_worker();
        }

        info!(
            "opened tree {} at {:?}: root {:#x}, ts {}, {} entries",
            inner.id,
            inner.path,
            inner.root_id.load(Ordering::SeqCst),
            inner.root_ts.load(Ordering::SeqCst),
            inner.indexed_entries.load(Ordering::SeqCst),
        );

        Ok(Self { inner })
    }

    /// Bump the root timestamp without indexing anything; used when the
    /// upstream ledger committed transactions that produced no entries
    /// for this tree. Touches atomics only, never pages.
    pub fn advance(&self, ts: u64, entry_count: u64) -> TreeResult<()> {
        self.inner.check_writable()?;

        let _writer = self.inner.writer.lock().unwrap();
        let root_ts = self.inner.root_ts.load(Ordering::SeqCst);
        if ts < root_ts {
            return Err(TreeError::InvalidTimestamp { ts, root_ts });
        }
        if ts == root_ts {
            return Ok(());
        }

        self.inner.root_ts.store(ts, Ordering::SeqCst);
        self.inner
            .indexed_entries
            .fetch_add(entry_count, Ordering::SeqCst);
        self.inner.notify_waiters();
        Ok(())
    }

    /// Block until entries up to `ts` are visible in the in-memory tree.
    pub fn wait_for_indexing_up_to(&self, token: &CancelToken, ts: u64) -> TreeResult<()> {
        self.inner
            .wait_until(token, || self.inner.root_ts.load(Ordering::SeqCst) >= ts)
    }

    pub fn root_ts(&self) -> u64 {
        self.inner.root_ts.load(Ordering::SeqCst)
    }

    pub fn indexed_entries(&self) -> u64 {
        self.inner.indexed_entries.load(Ordering::SeqCst)
    }

    pub fn depth(&self) -> u32 {
        self.inner.depth.load(Ordering::SeqCst)
    }

    /// Fraction of persisted pages no longer reachable from the latest
    /// committed root. Drives the compaction trigger.
    pub fn stale_ratio(&self) -> f64 {
        let total = self.inner.total_pages.load(Ordering::SeqCst);
        if total == 0 {
            return 0.0;
        }
        self.inner.stale_pages.load(Ordering::SeqCst) as f64 / total as f64
    }

    pub fn should_compact(&self) -> bool {
        self.stale_ratio() >= self.inner.compaction_thld
            && self.inner.ongoing_syncs.load(Ordering::SeqCst) == 0
            && self.inner.active_snapshots.load(Ordering::SeqCst) == 0
    }

    /// Force both logs to storage on the calling thread.
    pub fn sync(&self) -> TreeResult<()> {
        self.inner.check_open()?;
        self.inner.tree_log.sync()?;
        self.inner.history_log.sync()?;
        self.inner.unsynced_bytes.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Flush pending mutations, stop the sync worker and close both logs.
    /// Every step is attempted; the first error is reported after the
    /// remaining steps ran.
    pub fn close(&self) -> TreeResult<()> {
        self.inner.check_open()?;

        let active = self.inner.active_snapshots.load(Ordering::SeqCst);
        if active > 0 {
            return Err(TreeError::ActiveSnapshots(active));
        }

        let mut first_err: Option<TreeError> = None;
        let mut keep = |res: TreeResult<()>| {
            if let Err(err) = res {
                warn!("close step failed: {}", err);
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        };

        if !self.inner.read_only {
            keep(self.flush());
        }

        self.inner.stop_sync_worker();
        self.inner.closed.store(true, Ordering::SeqCst);

        if !self.inner.read_only {
            keep(self.inner.tree_log.sync());
            keep(self.inner.history_log.sync());
        }
        keep(self.inner.tree_log.close());
        keep(self.inner.history_log.close());

        self.inner.page_cache.drop_tree(self.inner.id);
        self.inner.notify_waiters();

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl TreeInner {
    pub fn check_open(&self) -> TreeResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TreeError::AlreadyClosed);
        }
        Ok(())
    }

    pub fn check_writable(&self) -> TreeResult<()> {
        self.check_open()?;
        if self.read_only {
            return Err(TreeError::ReadOnly);
        }
        Ok(())
    }

    /// Load a persisted page through the shared cache. The pin is given
    /// back right away; the returned `Arc` keeps the parsed page alive
    /// regardless of eviction.
    pub fn disk_page(&self, pid: PageID) -> TreeResult<Arc<Page>> {
        if is_mem_page(pid) || pid == PAGE_NONE || pid < self.page_size as u64 {
            return Err(TreeError::InvalidPageID(pid));
        }

        let page_size = self.page_size;
        let log = self.tree_log.clone();
        let page = self.page_cache.get(self.id, pid, || {
            let mut buf = vec![0u8; page_size];
            log.read_at(&mut buf, pid - page_size as u64)?;
            Page::from_bytes(&buf)
        })?;
        self.page_cache.release(self.id, pid);
        Ok(page)
    }

    pub fn notify_waiters(&self) {
        let _guard = self.wait_mutex.lock().unwrap();
        self.wait_cond.notify_all();
    }

    /// Park until `done()` holds, the token cancels, or the tree closes.
    pub fn wait_until(&self, token: &CancelToken, done: impl Fn() -> bool) -> TreeResult<()> {
        let mut guard = self.wait_mutex.lock().unwrap();
        loop {
            if done() {
                return Ok(());
            }
            if token.is_cancelled() {
                return Err(TreeError::Cancelled);
            }
            if self.closed.load(Ordering::SeqCst) {
                return Err(TreeError::AlreadyClosed);
            }
            let (g, _timeout) = self
                .wait_cond
                .wait_timeout(guard, Duration::from_millis(10))
                .unwrap();
            guard = g;
        }
    }

    fn start_sync_worker(self: &Arc<Self>) {
        let (tx, rx) = unbounded();
        let tree_log = self.tree_log.clone();
        let history_log = self.history_log.clone();
        let ongoing = self.ongoing_syncs.clone();
        let id = self.id;

        let handle = std::thread::spawn(move || {
            for msg in rx.iter() {
                match msg {
                    SyncMsg::Sync => {
                        if let Err(err) =
                            tree_log.sync().and_then(|_| history_log.sync())
                        {
                            // in-memory state is still correct; the next
                            // flush retries
                            warn!("background sync of tree {} failed: {}", id, err);
                        }
                        ongoing.fetch_sub(1, Ordering::SeqCst);
                    }
                    SyncMsg::Shutdown => break,
                }
            }
        });

        *self.sync_tx.lock().unwrap() = Some(tx);
        *self.sync_handle.lock().unwrap() = Some(handle);
    }

    /// Hand both logs to the worker once the unsynced volume crosses the
    /// threshold.
    pub fn maybe_schedule_sync(&self, appended: u64) {
        let unsynced = self
            .unsynced_bytes
            .fetch_add(appended, Ordering::SeqCst)
            + appended;
        if unsynced < self.sync_thld {
            return;
        }

        let tx = self.sync_tx.lock().unwrap();
        if let Some(tx) = tx.as_ref() {
            self.unsynced_bytes.store(0, Ordering::SeqCst);
            self.ongoing_syncs.fetch_add(1, Ordering::SeqCst);
            if tx.send(SyncMsg::Sync).is_err() {
                self.ongoing_syncs.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    fn stop_sync_worker(&self) {
        if let Some(tx) = self.sync_tx.lock().unwrap().take() {
            let _ = tx.send(SyncMsg::Shutdown);
        }
        if let Some(handle) = self.sync_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TreeInner {
    fn drop(&mut self) {
        self.stop_sync_worker();
    }
}

/// `tree_<ts>` directories, newest first.
fn snapshot_candidates(path: &Path) -> TreeResult<Vec<String>> {
    let mut found: Vec<(u64, String)> = Vec::new();

    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy().to_string();
        if let Some(ts) = name.strip_prefix("tree_") {
            if let Ok(ts) = ts.parse::<u64>() {
                found.push((ts, name));
            }
        }
    }

    found.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(found.into_iter().map(|(_, name)| name).collect())
}

fn recover(
    log: &dyn AppendLog,
    history_log: &dyn AppendLog,
    opts: &Options,
) -> TreeResult<Recovered> {
    let size = log.size()?;
    if size == 0 {
        // a brand new tree, nothing to scan
        return Ok(Recovered::empty());
    }

    let (commit_off, ce) = find_last_valid_commit(log)?;
    if commit_off < opts.page_size as u64 {
        return Err(TreeError::CorruptedTreeLog);
    }

    // the root is always the page right before the commit entry
    let root_id = commit_off;
    let mut buf = vec![0u8; opts.page_size];
    log.read_at(&mut buf, root_id - opts.page_size as u64)?;
    let root = Page::from_bytes(&buf)?;
    if !root.is_root {
        return Err(TreeError::CorruptedTreeLog);
    }

    if !opts.read_only {
        log.set_offset(commit_off + COMMIT_ENTRY_SIZE as u64)?;
    }

    if ce.h_log_off == OFFSET_NONE {
        if !opts.read_only {
            history_log.set_offset(0)?;
        }
    } else {
        let (entry, len) = HistoryEntry::read_from(history_log, ce.h_log_off)?;
        let mut encoded = Vec::with_capacity(len);
        entry.put(&mut encoded);
        if crc32c::crc32c(&encoded) != ce.h_log_checksum {
            return Err(TreeError::CorruptedTreeLog);
        }
        if !opts.read_only {
            history_log.set_offset(ce.h_log_off + len as u64)?;
        }
    }

    let depth = compute_depth(log, &root, opts.page_size)?;

    debug!(
        "recovered commit at {}: ts {}, {} pages ({} stale), depth {}",
        commit_off, ce.ts, ce.total_pages, ce.stale_pages, depth
    );

    Ok(Recovered {
        root_id,
        root_ts: ce.ts,
        depth,
        total_pages: ce.total_pages,
        stale_pages: ce.stale_pages,
        indexed_entries: ce.indexed_entries as u64,
        h_log_last_off: ce.h_log_off,
        h_log_last_checksum: ce.h_log_checksum,
    })
}

/// Number of inner levels above the leaves, following the left-most path.
fn compute_depth(log: &dyn AppendLog, root: &Page, page_size: usize) -> TreeResult<u32> {
    let mut depth = 0u32;
    let mut page = match &root.node {
        Node::Leaf(_) => return Ok(0),
        Node::Inner(inner) => {
            depth += 1;
            load_at(log, inner.children[0], page_size)?
        }
    };

    loop {
        match &page.node {
            Node::Leaf(_) => return Ok(depth),
            Node::Inner(inner) => {
                depth += 1;
                if depth > 64 {
                    return Err(TreeError::CorruptedTreeLog);
                }
                page = load_at(log, inner.children[0], page_size)?;
            }
        }
    }
}

fn load_at(log: &dyn AppendLog, pid: PageID, page_size: usize) -> TreeResult<Page> {
    if is_mem_page(pid) || pid == PAGE_NONE || pid < page_size as u64 {
        return Err(TreeError::CorruptedTreeLog);
    }
    let mut buf = vec![0u8; page_size];
    log.read_at(&mut buf, pid - page_size as u64)?;
    Page::from_bytes(&buf)
}
