use thiserror::Error;

pub type TreeResult<T> = Result<T, TreeError>;

/// All failures surfaced by the index. Validation and lookup errors are
/// returned to the caller as-is; integrity errors abort the operation that
/// hit them, except during recovery where they reject the current snapshot
/// candidate and let the next older one be tried.
#[derive(Debug, Error)]
pub enum TreeError {
    // validation
    #[error("illegal arguments: {0}")]
    IllegalArguments(&'static str),

    #[error("timestamp {ts} is older than the root timestamp {root_ts}")]
    InvalidTimestamp { ts: u64, root_ts: u64 },

    #[error("requested timestamp can no longer be satisfied by this tree")]
    StaleRootTimestamp,

    #[error("entry of {0} bytes exceeds the maximum entry size")]
    MaxEntrySizeExceeded(usize),

    // state
    #[error("tree is locked by another writer")]
    TreeLocked,

    #[error("already closed")]
    AlreadyClosed,

    #[error("tree still has {0} active snapshots")]
    ActiveSnapshots(usize),

    #[error("write buffer cannot hold {0} more pages")]
    WriteBufferFull(usize),

    #[error("no persisted snapshot available")]
    NoSnapshotAvailable,

    #[error("tree was opened read-only")]
    ReadOnly,

    // lookup
    #[error("key not found")]
    KeyNotFound,

    #[error("key revision not found")]
    KeyRevisionNotFound,

    #[error("no more entries")]
    NoMoreEntries,

    // integrity
    #[error("corrupted tree log")]
    CorruptedTreeLog,

    #[error("corrupted page")]
    CorruptedPage,

    #[error("corrupted entry")]
    CorruptedEntry,

    #[error("corrupted index")]
    CorruptedIndex,

    #[error("invalid page id {0:#x}")]
    InvalidPageID(u64),

    #[error("no valid page found")]
    NoValidPageFound,

    // resource
    #[error("all page cache slots are pinned")]
    CacheExhausted,

    #[error("too many active snapshots (limit {0})")]
    TooManySnapshots(usize),

    #[error("read of {requested} bytes at offset {offset} past the logical end")]
    ShortRead { offset: u64, requested: usize },

    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TreeError {
    /// Whether recovery should drop the current snapshot candidate and keep
    /// scanning older ones when it hits this error.
    pub fn rejects_candidate(&self) -> bool {
        matches!(
            self,
            TreeError::CorruptedTreeLog
                | TreeError::CorruptedPage
                | TreeError::CorruptedEntry
                | TreeError::NoValidPageFound
                | TreeError::ShortRead { .. }
                | TreeError::Io(_)
        )
    }
}
