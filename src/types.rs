use std::sync::{Arc, RwLock};

// Type alias, not a new type, cannot define methods on it
pub type Pod<T> = Arc<RwLock<T>>;

/// Page identifier. Persistent ids equal the tree-log offset of the page's
/// end-of-write; in-memory ids carry [`MEM_PAGE_BIT`] and index the owning
/// tree's write buffer.
pub type PageID = u64;

/// "absent" page.
pub const PAGE_NONE: PageID = u64::MAX;

/// "no prior version" sentinel in a history chain.
pub const OFFSET_NONE: u64 = u64::MAX;

/// High bit marks a write-buffer page. File offsets can never reach it.
pub const MEM_PAGE_BIT: PageID = 1 << 63;

pub fn is_mem_page(pid: PageID) -> bool {
    pid != PAGE_NONE && pid & MEM_PAGE_BIT != 0
}

pub fn mem_page_slot(pid: PageID) -> usize {
    (pid & !MEM_PAGE_BIT) as usize
}

pub fn mem_page_id(slot: usize) -> PageID {
    slot as PageID | MEM_PAGE_BIT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_page_ids() {
        let pid = mem_page_id(7);
        assert!(is_mem_page(pid));
        assert_eq!(mem_page_slot(pid), 7);

        assert!(!is_mem_page(4096));
        assert!(!is_mem_page(PAGE_NONE));
    }
}
