/// Fixed on-disk image size of a tree page. Tests shrink this through the
/// tree options to force splits early.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Inline values above this size are rejected.
pub const MAX_ENTRY_SIZE: usize = 2048;

pub const MAX_KEY_SIZE: usize = 1024;

/// tag(1) + flags(1) + num_entries(2) + reserved(4)
pub const PAGE_HEADER_SIZE: usize = 8;

/// One slot-directory entry: the u16 offset of an entry's payload.
pub const SLOT_SIZE: usize = 2;

pub const TAG_LEAF: u8 = 1;
pub const TAG_INNER: u8 = 2;

pub const FLAG_ROOT: u8 = 0x01;
pub const FLAG_COPIED: u8 = 0x02;

/// checksum(4) + ts(8) + h_log_off(8) + h_log_checksum(4) + total_pages(8)
/// + stale_pages(4) + indexed_entries(4) + magic(2)
pub const COMMIT_ENTRY_SIZE: usize = 42;

pub const COMMIT_MAGIC: u16 = 0xB1EE;

/// prev_off(8) + ts(8) + value_len(2)
pub const HISTORY_ENTRY_HEADER_SIZE: usize = 18;

/// Fixed per-entry cost of a leaf entry beyond key and value bytes:
/// slot(2) + key_len(2) + value_len(2) + ts(8) + h_off(8) + h_count(8)
pub const LEAF_ENTRY_OVERHEAD: usize = 30;

/// Fixed per-entry cost of an inner entry beyond the separator bytes:
/// slot(2) + sep_len(2) + child(8)
pub const INNER_ENTRY_OVERHEAD: usize = 12;

/// The left-most child id stored after the inner-page header.
pub const INNER_LEFT_CHILD_SIZE: usize = 8;
