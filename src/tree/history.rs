use bytes::{Buf, BufMut};

use crate::{
    applog::AppendLog,
    error::{TreeError, TreeResult},
    tree::consts::HISTORY_ENTRY_HEADER_SIZE,
    types::{PageID, OFFSET_NONE, PAGE_NONE},
};

/// One archived version of a key. Records are threaded backward through
/// the history log: `prev_off` names the next older version, or
/// `OFFSET_NONE` at the chain end.
pub struct HistoryEntry {
    pub prev_off: u64,
    pub ts: u64,
    pub value: Vec<u8>,
}

impl HistoryEntry {
    pub fn encoded_size(&self) -> usize {
        HISTORY_ENTRY_HEADER_SIZE + self.value.len()
    }

    pub fn put(&self, buf: &mut Vec<u8>) {
        buf.put_u64(self.prev_off);
        buf.put_u64(self.ts);
        buf.put_u16(self.value.len() as u16);
        buf.put_slice(&self.value);
    }

    /// Read one record at logical offset `off` of the history log.
    /// Returns the record and its encoded length.
    pub fn read_from(log: &dyn AppendLog, off: u64) -> TreeResult<(Self, usize)> {
        let mut header = [0u8; HISTORY_ENTRY_HEADER_SIZE];
        log.read_at(&mut header, off)
            .map_err(|_| TreeError::CorruptedEntry)?;

        let mut r = &header[..];
        let prev_off = r.get_u64();
        let ts = r.get_u64();
        let value_len = r.get_u16() as usize;

        let mut value = vec![0u8; value_len];
        log.read_at(&mut value, off + HISTORY_ENTRY_HEADER_SIZE as u64)
            .map_err(|_| TreeError::CorruptedEntry)?;

        let entry = Self {
            prev_off,
            ts,
            value,
        };
        let size = entry.encoded_size();
        Ok((entry, size))
    }
}

/// In-memory page of history records waiting for the next flush. Pages
/// form a singly-linked chain through `next` for the duration of one
/// write batch; only their raw payload reaches the history log.
pub struct HistoryPage {
    pub payload: Vec<u8>,
    pub next: PageID,
    capacity: usize,
}

impl HistoryPage {
    pub fn new(capacity: usize) -> Self {
        Self {
            payload: Vec::with_capacity(capacity),
            next: PAGE_NONE,
            capacity,
        }
    }

    pub fn fits(&self, bytes: usize) -> bool {
        self.payload.len() + bytes <= self.capacity
    }

    pub fn append(&mut self, entry: &HistoryEntry) {
        entry.put(&mut self.payload);
    }
}

/// Walk the history chain of one key backward, newest first. `h_off` is
/// the head taken from a leaf entry; the walk ends at `OFFSET_NONE`.
pub struct HistoryWalk<'a> {
    log: &'a dyn AppendLog,
    next_off: u64,
}

impl<'a> HistoryWalk<'a> {
    pub fn new(log: &'a dyn AppendLog, h_off: u64) -> Self {
        Self {
            log,
            next_off: h_off,
        }
    }

    pub fn next_entry(&mut self) -> TreeResult<Option<HistoryEntry>> {
        if self.next_off == OFFSET_NONE {
            return Ok(None);
        }
        let (entry, _) = HistoryEntry::read_from(self.log, self.next_off)?;
        self.next_off = entry.prev_off;
        Ok(Some(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applog::{AppOptions, FileLog};

    #[test]
    fn test_entry_round_trip_through_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileLog::open(dir.path(), &AppOptions::default()).unwrap();

        let first = HistoryEntry {
            prev_off: OFFSET_NONE,
            ts: 1,
            value: b"one".to_vec(),
        };
        let mut buf = Vec::new();
        first.put(&mut buf);
        let (off_1, _) = log.append(&buf).unwrap();

        let second = HistoryEntry {
            prev_off: off_1,
            ts: 2,
            value: b"two".to_vec(),
        };
        buf.clear();
        second.put(&mut buf);
        let (off_2, _) = log.append(&buf).unwrap();

        let mut walk = HistoryWalk::new(&log, off_2);
        let entry = walk.next_entry().unwrap().unwrap();
        assert_eq!(entry.ts, 2);
        assert_eq!(entry.value, b"two");

        let entry = walk.next_entry().unwrap().unwrap();
        assert_eq!(entry.ts, 1);
        assert_eq!(entry.value, b"one");

        assert!(walk.next_entry().unwrap().is_none());
    }

    #[test]
    fn test_page_chains_when_full() {
        let mut page = HistoryPage::new(64);
        let entry = HistoryEntry {
            prev_off: OFFSET_NONE,
            ts: 1,
            value: vec![0u8; 30],
        };
        assert!(page.fits(entry.encoded_size()));
        page.append(&entry);
        // 48 bytes used, another 48 no longer fit
        assert!(!page.fits(entry.encoded_size()));
        assert_eq!(page.next, PAGE_NONE);
    }
}
