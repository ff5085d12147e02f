use std::sync::Arc;

use crate::{
    applog::AppFactory,
    error::{TreeError, TreeResult},
    tree::{
        consts::DEFAULT_PAGE_SIZE,
        page_cache::{PageCache, DEFAULT_CACHE_SLOTS},
        write_buffer::WriteBufferPool,
    },
};

/// Tunables of one tree. Shared resources (the page cache and the write
/// buffer arena) may be handed in; a tree opened without them builds
/// private ones.
#[derive(Clone)]
pub struct Options {
    /// Tree id, part of every page-cache key.
    pub id: u64,

    pub page_size: usize,

    /// Fragment rollover threshold for both logs.
    pub file_size: u64,

    pub file_mode: u32,

    pub app_write_buffer_size: usize,

    /// Unsynced bytes that trigger a background sync of both logs.
    pub sync_thld: u64,

    /// Stale-page ratio above which a compaction is worthwhile.
    pub compaction_thld: f64,

    pub read_only: bool,

    pub max_active_snapshots: usize,

    /// Page-cache slots backing this tree when no explicit `page_buffer`
    /// handle is given: the first opener sizes the shared instance.
    pub cache_size: usize,

    pub write_buffer_min_chunks: usize,
    pub write_buffer_max_chunks: usize,

    pub write_buffer: Option<Arc<WriteBufferPool>>,
    pub page_buffer: Option<Arc<PageCache>>,
    pub app_factory: Option<AppFactory>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            id: 0,
            page_size: DEFAULT_PAGE_SIZE,
            file_size: 2 << 30,
            file_mode: 0o644,
            app_write_buffer_size: 4096,
            sync_thld: 64 << 20,
            compaction_thld: 0.5,
            read_only: false,
            max_active_snapshots: 100,
            cache_size: DEFAULT_CACHE_SLOTS,
            write_buffer_min_chunks: 32,
            write_buffer_max_chunks: 256,
            write_buffer: None,
            page_buffer: None,
            app_factory: None,
        }
    }
}

impl Options {
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_file_size(mut self, file_size: u64) -> Self {
        self.file_size = file_size;
        self
    }

    pub fn with_sync_thld(mut self, sync_thld: u64) -> Self {
        self.sync_thld = sync_thld;
        self
    }

    pub fn with_compaction_thld(mut self, compaction_thld: f64) -> Self {
        self.compaction_thld = compaction_thld;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_max_active_snapshots(mut self, max: usize) -> Self {
        self.max_active_snapshots = max;
        self
    }

    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    pub fn with_write_buffer_quota(mut self, min: usize, max: usize) -> Self {
        self.write_buffer_min_chunks = min;
        self.write_buffer_max_chunks = max;
        self
    }

    pub fn with_write_buffer(mut self, pool: Arc<WriteBufferPool>) -> Self {
        self.write_buffer = Some(pool);
        self
    }

    pub fn with_page_buffer(mut self, cache: Arc<PageCache>) -> Self {
        self.page_buffer = Some(cache);
        self
    }

    pub fn with_app_factory(mut self, factory: AppFactory) -> Self {
        self.app_factory = Some(factory);
        self
    }

    pub fn validate(&self) -> TreeResult<()> {
        if self.page_size < 128 {
            return Err(TreeError::IllegalArguments("page size below 128 bytes"));
        }
        if self.page_size > u16::MAX as usize {
            return Err(TreeError::IllegalArguments(
                "page size does not fit the slot directory",
            ));
        }
        if self.file_size < self.page_size as u64 {
            return Err(TreeError::IllegalArguments(
                "file size below a single page",
            ));
        }
        if self.write_buffer_min_chunks == 0
            || self.write_buffer_min_chunks > self.write_buffer_max_chunks
        {
            return Err(TreeError::IllegalArguments(
                "write buffer quota must satisfy 0 < min <= max",
            ));
        }
        if self.max_active_snapshots == 0 {
            return Err(TreeError::IllegalArguments(
                "max active snapshots must be positive",
            ));
        }
        if self.cache_size == 0 {
            return Err(TreeError::IllegalArguments(
                "page cache needs at least one slot",
            ));
        }
        if !(0.0..=1.0).contains(&self.compaction_thld) {
            return Err(TreeError::IllegalArguments(
                "compaction threshold must lie in [0, 1]",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(Options::default().validate().is_ok());
    }

    #[test]
    fn test_reject_bad_quota() {
        let opts = Options::default().with_write_buffer_quota(8, 4);
        assert!(matches!(
            opts.validate(),
            Err(TreeError::IllegalArguments(_))
        ));
    }

    #[test]
    fn test_reject_tiny_pages() {
        let opts = Options::default().with_page_size(64);
        assert!(matches!(
            opts.validate(),
            Err(TreeError::IllegalArguments(_))
        ));
    }

    #[test]
    fn test_reject_zero_cache_slots() {
        assert_eq!(Options::default().cache_size, DEFAULT_CACHE_SLOTS);

        let opts = Options::default().with_cache_size(0);
        assert!(matches!(
            opts.validate(),
            Err(TreeError::IllegalArguments(_))
        ));
    }
}
