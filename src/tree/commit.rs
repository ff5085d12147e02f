use std::convert::TryInto;

use bytes::{Buf, BufMut};

use crate::{
    applog::AppendLog,
    error::{TreeError, TreeResult},
    tree::consts::{COMMIT_ENTRY_SIZE, COMMIT_MAGIC},
};

/// Fixed-size trailer appended after each flush batch. The root page is
/// always the page appended immediately before it, so the entry start
/// offset doubles as the persisted root id.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitEntry {
    pub ts: u64,

    /// Offset of the last history record appended by this batch, and the
    /// CRC32-C of its bytes. Recovery truncates the history log right
    /// after it.
    pub h_log_off: u64,
    pub h_log_checksum: u32,

    pub total_pages: u64,
    pub stale_pages: u32,
    pub indexed_entries: u32,
}

impl CommitEntry {
    /// Serialize, checksum first: CRC32-C over the 38 bytes that follow
    /// it, magic last.
    pub fn put(&self, buf: &mut Vec<u8>) {
        let mut body = Vec::with_capacity(COMMIT_ENTRY_SIZE - 4);
        body.put_u64(self.ts);
        body.put_u64(self.h_log_off);
        body.put_u32(self.h_log_checksum);
        body.put_u64(self.total_pages);
        body.put_u32(self.stale_pages);
        body.put_u32(self.indexed_entries);
        body.put_u16(COMMIT_MAGIC);

        buf.put_u32(crc32c::crc32c(&body));
        buf.extend_from_slice(&body);
    }

    pub fn from_bytes(buf: &[u8; COMMIT_ENTRY_SIZE]) -> TreeResult<Self> {
        let magic = u16::from_be_bytes(buf[COMMIT_ENTRY_SIZE - 2..].try_into().unwrap());
        if magic != COMMIT_MAGIC {
            return Err(TreeError::CorruptedEntry);
        }

        let mut r = &buf[..];
        let checksum = r.get_u32();
        if crc32c::crc32c(&buf[4..]) != checksum {
            return Err(TreeError::CorruptedEntry);
        }

        let entry = Self {
            ts: r.get_u64(),
            h_log_off: r.get_u64(),
            h_log_checksum: r.get_u32(),
            total_pages: r.get_u64(),
            stale_pages: r.get_u32(),
            indexed_entries: r.get_u32(),
        };
        Ok(entry)
    }
}

/// Scan the tree log backward for the newest commit entry that carries
/// the magic and passes its checksum. Returns the entry together with
/// the offset it starts at.
pub fn find_last_valid_commit(log: &dyn AppendLog) -> TreeResult<(u64, CommitEntry)> {
    let size = log.size()?;
    let mut end = size;

    while end >= COMMIT_ENTRY_SIZE as u64 {
        let mut rec = [0u8; COMMIT_ENTRY_SIZE];
        log.read_at(&mut rec, end - COMMIT_ENTRY_SIZE as u64)?;

        if let Ok(entry) = CommitEntry::from_bytes(&rec) {
            return Ok((end - COMMIT_ENTRY_SIZE as u64, entry));
        }
        end -= 1;
    }

    Err(TreeError::NoValidPageFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applog::{AppOptions, FileLog};

    fn sample() -> CommitEntry {
        CommitEntry {
            ts: 42,
            h_log_off: 1000,
            h_log_checksum: 0xdead_beef,
            total_pages: 7,
            stale_pages: 2,
            indexed_entries: 35,
        }
    }

    #[test]
    fn test_round_trip() {
        let mut buf = Vec::new();
        sample().put(&mut buf);
        assert_eq!(buf.len(), COMMIT_ENTRY_SIZE);

        let parsed = CommitEntry::from_bytes(buf.as_slice().try_into().unwrap()).unwrap();
        assert_eq!(parsed, sample());
    }

    #[test]
    fn test_reject_flipped_bit() {
        let mut buf = Vec::new();
        sample().put(&mut buf);
        buf[10] ^= 0x01;

        let buf: &[u8; COMMIT_ENTRY_SIZE] = buf.as_slice().try_into().unwrap();
        assert!(matches!(
            CommitEntry::from_bytes(buf),
            Err(TreeError::CorruptedEntry)
        ));
    }

    #[test]
    fn test_backward_scan_finds_last_entry() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::open(dir.path(), &AppOptions::default()).unwrap();

        // page-sized filler, then a commit, then a torn tail
        log.append(&[0u8; 128]).unwrap();
        let mut buf = Vec::new();
        sample().put(&mut buf);
        let (commit_off, _) = log.append(&buf).unwrap();
        log.append(b"torn garbage").unwrap();

        let (off, entry) = find_last_valid_commit(&log).unwrap();
        assert_eq!(off, commit_off);
        assert_eq!(entry.ts, 42);
    }

    #[test]
    fn test_scan_of_garbage_fails() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::open(dir.path(), &AppOptions::default()).unwrap();
        log.append(&[7u8; 256]).unwrap();

        assert!(matches!(
            find_last_valid_commit(&log),
            Err(TreeError::NoValidPageFound)
        ));
    }
}
