mod file_log;

pub use file_log::FileLog;

use std::{fs, path::Path, sync::Arc};

use crate::error::TreeResult;

/// A sequential log with atomic append and explicit durability control.
///
/// Offsets are logical and absolute: they keep growing across fragment
/// files, so the id of a byte never changes once it is appended. Reads see
/// every flushed byte plus whatever still sits in the write buffer.
pub trait AppendLog: Send + Sync {
    /// Append `buf` and return the offset it was written at together with
    /// the number of bytes written.
    fn append(&self, buf: &[u8]) -> TreeResult<(u64, usize)>;

    /// Harden buffered writes to the OS.
    fn flush(&self) -> TreeResult<()>;

    /// Harden flushed writes to storage.
    fn sync(&self) -> TreeResult<()>;

    /// Fill `buf` from logical offset `off`. Fails with `ShortRead` when
    /// the requested range extends past the logical end.
    fn read_at(&self, buf: &mut [u8], off: u64) -> TreeResult<()>;

    /// Current logical size in bytes.
    fn size(&self) -> TreeResult<u64>;

    /// Truncate the logical size down to `off`. Used by recovery to cut a
    /// torn tail; `off` must not exceed the current size.
    fn set_offset(&self, off: u64) -> TreeResult<()>;

    fn close(&self) -> TreeResult<()>;
}

/// Options applied to a single log (one subdirectory of the tree path).
#[derive(Clone)]
pub struct AppOptions {
    /// Fragment file extension, e.g. "t" or "hx".
    pub ext: String,

    /// Fragment rollover threshold in bytes.
    pub file_size: u64,

    /// Permission bits for newly created fragment files.
    pub file_mode: u32,

    /// Private write buffer capacity in bytes.
    pub write_buffer_size: usize,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            ext: "t".to_string(),
            file_size: 2 << 30,
            file_mode: 0o644,
            write_buffer_size: 4096,
        }
    }
}

/// Injected constructor for append logs, so tests and future backends can
/// swap the file implementation out.
pub type AppFactory =
    Arc<dyn Fn(&Path, &str, &AppOptions) -> TreeResult<Arc<dyn AppendLog>> + Send + Sync>;

pub fn default_app_factory() -> AppFactory {
    Arc::new(|root, sub, opts| {
        let log = FileLog::open(&root.join(sub), opts)?;
        Ok(Arc::new(log) as Arc<dyn AppendLog>)
    })
}

/// Remove the directory of a log that failed recovery.
pub fn app_remove(root: &Path, sub: &str) -> TreeResult<()> {
    let path = root.join(sub);
    if path.exists() {
        fs::remove_dir_all(&path)?;
    }
    Ok(())
}
