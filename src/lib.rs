pub mod applog;
pub mod error;
pub mod tree;
pub mod types;
pub mod utils;

pub use crate::{
    applog::{AppFactory, AppOptions, AppendLog, FileLog},
    error::{TreeError, TreeResult},
    tree::{
        options::Options,
        page_cache::PageCache,
        snapshot::{Snapshot, SnapshotMode, TreeIterator},
        tree::{BTree, Entry},
        write_buffer::WriteBufferPool,
    },
    utils::CancelToken,
};
