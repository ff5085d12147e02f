use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use log::debug;

use super::AppOptions;
use crate::{
    applog::AppendLog,
    error::{TreeError, TreeResult},
};

/// File-backed append log. The log is a directory of fragment files named
/// `NNNNNNNN.<ext>`; every fragment except the last is exactly
/// `file_size` bytes long, so the fragment holding a logical offset is a
/// plain division.
pub struct FileLog {
    dir: PathBuf,
    opts: AppOptions,
    inner: Mutex<Inner>,
}

struct Inner {
    fragments: Vec<Fragment>,

    /// Bytes appended but not yet written to a fragment file.
    buffer: Vec<u8>,

    /// Logical size of everything already written to fragment files. The
    /// write buffer starts here.
    flushed_size: u64,

    closed: bool,
}

struct Fragment {
    file: File,
    len: u64,
    dirty: bool,
}

impl FileLog {
    pub fn open(dir: &Path, opts: &AppOptions) -> TreeResult<Self> {
        fs::create_dir_all(dir)?;

        let mut indexes: Vec<u64> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(&format!(".{}", opts.ext)) {
                if let Ok(index) = stem.parse::<u64>() {
                    indexes.push(index);
                }
            }
        }
        indexes.sort_unstable();

        let mut fragments = Vec::new();
        let mut flushed_size = 0;
        for index in &indexes {
            let file = open_fragment(&fragment_path(dir, *index, &opts.ext), opts.file_mode)?;
            let len = file.metadata()?.len();
            flushed_size += len;
            fragments.push(Fragment {
                file,
                len,
                dirty: false,
            });
        }

        debug!(
            "opened log at {:?}: {} fragments, {} bytes",
            dir,
            fragments.len(),
            flushed_size
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            opts: opts.clone(),
            inner: Mutex::new(Inner {
                fragments,
                buffer: Vec::new(),
                flushed_size,
                closed: false,
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }
}

fn fragment_path(dir: &Path, index: u64, ext: &str) -> PathBuf {
    dir.join(format!("{:08}.{}", index, ext))
}

#[cfg(unix)]
fn open_fragment(path: &Path, mode: u32) -> TreeResult<File> {
    use std::os::unix::fs::OpenOptionsExt;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(mode)
        .open(path)?;
    Ok(file)
}

#[cfg(not(unix))]
fn open_fragment(path: &Path, _mode: u32) -> TreeResult<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;
    Ok(file)
}

impl Inner {
    fn check_open(&self) -> TreeResult<()> {
        if self.closed {
            return Err(TreeError::AlreadyClosed);
        }
        Ok(())
    }

    fn logical_size(&self) -> u64 {
        self.flushed_size + self.buffer.len() as u64
    }

    /// Move the write buffer into fragment files, rolling over when the
    /// current fragment reaches the configured size.
    fn write_out(&mut self, dir: &Path, opts: &AppOptions) -> TreeResult<()> {
        let mut pending = std::mem::take(&mut self.buffer);
        let mut data = pending.as_slice();

        while !data.is_empty() {
            let need_new = match self.fragments.last() {
                Some(frag) => frag.len >= opts.file_size,
                None => true,
            };
            if need_new {
                let index = self.fragments.len() as u64;
                let file = open_fragment(&fragment_path(dir, index, &opts.ext), opts.file_mode)?;
                self.fragments.push(Fragment {
                    file,
                    len: 0,
                    dirty: false,
                });
            }

            let frag = self.fragments.last_mut().unwrap();
            let room = (opts.file_size - frag.len) as usize;
            let take = room.min(data.len());

            frag.file.seek(SeekFrom::Start(frag.len))?;
            frag.file.write_all(&data[..take])?;
            frag.len += take as u64;
            frag.dirty = true;
            self.flushed_size += take as u64;

            data = &data[take..];
        }

        pending.clear();
        self.buffer = pending;
        Ok(())
    }
}

impl AppendLog for FileLog {
    fn append(&self, buf: &[u8]) -> TreeResult<(u64, usize)> {
        let mut inner = self.lock();
        inner.check_open()?;

        let off = inner.logical_size();
        inner.buffer.extend_from_slice(buf);

        if inner.buffer.len() >= self.opts.write_buffer_size {
            inner.write_out(&self.dir, &self.opts)?;
        }

        Ok((off, buf.len()))
    }

    fn flush(&self) -> TreeResult<()> {
        let mut inner = self.lock();
        inner.check_open()?;
        inner.write_out(&self.dir, &self.opts)
    }

    fn sync(&self) -> TreeResult<()> {
        let mut inner = self.lock();
        inner.check_open()?;
        inner.write_out(&self.dir, &self.opts)?;

        for frag in inner.fragments.iter_mut().filter(|f| f.dirty) {
            frag.file.sync_data()?;
            frag.dirty = false;
        }
        Ok(())
    }

    fn read_at(&self, buf: &mut [u8], off: u64) -> TreeResult<()> {
        let mut inner = self.lock();
        inner.check_open()?;

        if off + buf.len() as u64 > inner.logical_size() {
            return Err(TreeError::ShortRead {
                offset: off,
                requested: buf.len(),
            });
        }

        let mut pos = off;
        let mut filled = 0;
        let file_size = self.opts.file_size;

        // flushed portion, possibly spanning fragments
        while filled < buf.len() && pos < inner.flushed_size {
            let index = (pos / file_size) as usize;
            let in_frag = pos % file_size;
            let frag = &mut inner.fragments[index];
            let take = ((frag.len - in_frag) as usize).min(buf.len() - filled);

            frag.file.seek(SeekFrom::Start(in_frag))?;
            frag.file.read_exact(&mut buf[filled..filled + take])?;
            filled += take;
            pos += take as u64;
        }

        // remainder comes from the write buffer
        if filled < buf.len() {
            let start = (pos - inner.flushed_size) as usize;
            let take = buf.len() - filled;
            buf[filled..].copy_from_slice(&inner.buffer[start..start + take]);
        }

        Ok(())
    }

    fn size(&self) -> TreeResult<u64> {
        let inner = self.lock();
        inner.check_open()?;
        Ok(inner.logical_size())
    }

    fn set_offset(&self, off: u64) -> TreeResult<()> {
        let mut inner = self.lock();
        inner.check_open()?;

        if off > inner.logical_size() {
            return Err(TreeError::IllegalArguments(
                "set_offset past the logical end",
            ));
        }

        // drop buffered bytes beyond the cut first
        if off >= inner.flushed_size {
            let keep = (off - inner.flushed_size) as usize;
            inner.buffer.truncate(keep);
            return Ok(());
        }
        inner.buffer.clear();

        let file_size = self.opts.file_size;
        let keep_fragments = if off == 0 {
            0
        } else {
            ((off - 1) / file_size) as usize + 1
        };

        for frag in inner.fragments.drain(keep_fragments..) {
            drop(frag.file);
        }
        // remove the orphaned fragment files so a later reopen does not
        // resurrect them
        let mut index = keep_fragments as u64;
        loop {
            let path = fragment_path(&self.dir, index, &self.opts.ext);
            if !path.exists() {
                break;
            }
            fs::remove_file(&path)?;
            index += 1;
        }

        if let Some(frag) = inner.fragments.last_mut() {
            let new_len = off - (keep_fragments as u64 - 1) * file_size;
            frag.file.set_len(new_len)?;
            frag.len = new_len;
            frag.dirty = true;
        }
        inner.flushed_size = off;

        debug!("log {:?} truncated to {}", self.dir, off);
        Ok(())
    }

    fn close(&self) -> TreeResult<()> {
        let mut inner = self.lock();
        inner.check_open()?;
        inner.write_out(&self.dir, &self.opts)?;
        for frag in inner.fragments.iter_mut().filter(|f| f.dirty) {
            frag.file.sync_data()?;
            frag.dirty = false;
        }
        inner.closed = true;
        Ok(())
    }
}
