use std::{convert::TryInto, fmt};

use bytes::{Buf, BufMut};

use crate::{
    error::{TreeError, TreeResult},
    tree::consts::*,
    types::PageID,
};

/// One tree page: a leaf or an inner node plus its header flags. The same
/// struct backs both write-buffer pages (mutable) and cached disk pages
/// (read-only once parsed).
#[derive(Clone)]
pub struct Page {
    pub node: Node,
    pub is_root: bool,
    pub copied: bool,
}

#[derive(Clone)]
pub enum Node {
    Leaf(LeafNode),
    Inner(InnerNode),
}

#[derive(Clone)]
pub struct LeafEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub ts: u64,
    pub h_off: u64,
    pub h_count: u64,
}

#[derive(Clone, Default)]
pub struct LeafNode {
    pub entries: Vec<LeafEntry>,
}

#[derive(Clone)]
pub struct InnerNode {
    pub seps: Vec<Vec<u8>>,

    /// Always `seps.len() + 1` children; `children[0]` is the left-most.
    pub children: Vec<PageID>,
}

impl LeafEntry {
    pub fn disk_size(&self) -> usize {
        LEAF_ENTRY_OVERHEAD + self.key.len() + self.value.len()
    }
}

impl LeafNode {
    /// Binary search for `key`: Ok(slot) when present, Err(insertion slot)
    /// otherwise.
    pub fn find(&self, key: &[u8]) -> Result<usize, usize> {
        self.entries.binary_search_by(|e| e.key.as_slice().cmp(key))
    }

    pub fn used(&self) -> usize {
        PAGE_HEADER_SIZE + self.entries.iter().map(LeafEntry::disk_size).sum::<usize>()
    }
}

impl InnerNode {
    pub fn new(left_child: PageID) -> Self {
        Self {
            seps: Vec::new(),
            children: vec![left_child],
        }
    }

    /// Index of the child whose subtree covers `key`: the number of
    /// separators less than or equal to `key`.
    pub fn child_index(&self, key: &[u8]) -> usize {
        match self.seps.binary_search_by(|s| s.as_slice().cmp(key)) {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }

    /// Insert `sep` with its right child after the child at `idx`.
    pub fn insert_sep(&mut self, idx: usize, sep: Vec<u8>, right: PageID) {
        self.seps.insert(idx, sep);
        self.children.insert(idx + 1, right);
    }

    pub fn used(&self) -> usize {
        PAGE_HEADER_SIZE
            + INNER_LEFT_CHILD_SIZE
            + self
                .seps
                .iter()
                .map(|s| INNER_ENTRY_OVERHEAD + s.len())
                .sum::<usize>()
    }
}

impl Page {
    pub fn new_leaf() -> Self {
        Self {
            node: Node::Leaf(LeafNode::default()),
            is_root: false,
            copied: false,
        }
    }

    pub fn new_inner(left_child: PageID) -> Self {
        Self {
            node: Node::Inner(InnerNode::new(left_child)),
            is_root: false,
            copied: false,
        }
    }

    pub fn as_leaf(&self) -> TreeResult<&LeafNode> {
        match &self.node {
            Node::Leaf(leaf) => Ok(leaf),
            Node::Inner(_) => Err(TreeError::CorruptedIndex),
        }
    }

    pub fn as_inner(&self) -> TreeResult<&InnerNode> {
        match &self.node {
            Node::Inner(inner) => Ok(inner),
            Node::Leaf(_) => Err(TreeError::CorruptedIndex),
        }
    }

    pub fn num_entries(&self) -> usize {
        match &self.node {
            Node::Leaf(leaf) => leaf.entries.len(),
            Node::Inner(inner) => inner.seps.len(),
        }
    }

    /// Serialized footprint, header included.
    pub fn used(&self) -> usize {
        match &self.node {
            Node::Leaf(leaf) => leaf.used(),
            Node::Inner(inner) => inner.used(),
        }
    }

    /// Serialize into `buf`, whose length is the page size. The image fills
    /// the buffer exactly; unused space between the slot directory and the
    /// payload is zeroed. Returns the written length.
    pub fn put(&self, buf: &mut [u8]) -> TreeResult<usize> {
        let page_size = buf.len();
        if self.used() > page_size {
            return Err(TreeError::CorruptedPage);
        }
        for b in buf.iter_mut() {
            *b = 0;
        }

        let mut flags = 0u8;
        if self.is_root {
            flags |= FLAG_ROOT;
        }
        if self.copied {
            flags |= FLAG_COPIED;
        }

        let (tag, num_entries) = match &self.node {
            Node::Leaf(leaf) => (TAG_LEAF, leaf.entries.len()),
            Node::Inner(inner) => (TAG_INNER, inner.seps.len()),
        };

        buf[0] = tag;
        buf[1] = flags;
        buf[2..4].copy_from_slice(&(num_entries as u16).to_be_bytes());

        match &self.node {
            Node::Leaf(leaf) => {
                let mut tail = page_size;
                for (i, entry) in leaf.entries.iter().enumerate().rev() {
                    let len = entry.disk_size() - SLOT_SIZE;
                    tail -= len;

                    let slot_pos = PAGE_HEADER_SIZE + i * SLOT_SIZE;
                    buf[slot_pos..slot_pos + 2].copy_from_slice(&(tail as u16).to_be_bytes());

                    let mut w = &mut buf[tail..tail + len];
                    w.put_u16(entry.key.len() as u16);
                    w.put_slice(&entry.key);
                    w.put_u16(entry.value.len() as u16);
                    w.put_slice(&entry.value);
                    w.put_u64(entry.ts);
                    w.put_u64(entry.h_off);
                    w.put_u64(entry.h_count);
                }
            }
            Node::Inner(inner) => {
                buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + 8]
                    .copy_from_slice(&inner.children[0].to_be_bytes());

                let slots_base = PAGE_HEADER_SIZE + INNER_LEFT_CHILD_SIZE;
                let mut tail = page_size;
                for (i, sep) in inner.seps.iter().enumerate().rev() {
                    let len = INNER_ENTRY_OVERHEAD - SLOT_SIZE + sep.len();
                    tail -= len;

                    let slot_pos = slots_base + i * SLOT_SIZE;
                    buf[slot_pos..slot_pos + 2].copy_from_slice(&(tail as u16).to_be_bytes());

                    let mut w = &mut buf[tail..tail + len];
                    w.put_u16(sep.len() as u16);
                    w.put_slice(sep);
                    w.put_u64(inner.children[i + 1]);
                }
            }
        }

        Ok(page_size)
    }

    /// Reparse a page image, rejecting malformed headers and any slot
    /// directory that overlaps the payload.
    pub fn from_bytes(buf: &[u8]) -> TreeResult<Self> {
        let page_size = buf.len();
        if page_size < PAGE_HEADER_SIZE {
            return Err(TreeError::CorruptedPage);
        }

        let tag = buf[0];
        let flags = buf[1];
        let num_entries = u16::from_be_bytes([buf[2], buf[3]]) as usize;

        let node = match tag {
            TAG_LEAF => {
                let slots_end = PAGE_HEADER_SIZE + num_entries * SLOT_SIZE;
                if slots_end > page_size {
                    return Err(TreeError::CorruptedPage);
                }

                let mut entries = Vec::with_capacity(num_entries);
                for i in 0..num_entries {
                    let slot_pos = PAGE_HEADER_SIZE + i * SLOT_SIZE;
                    let off =
                        u16::from_be_bytes([buf[slot_pos], buf[slot_pos + 1]]) as usize;
                    if off < slots_end || off + 6 > page_size {
                        return Err(TreeError::CorruptedPage);
                    }

                    let mut r = &buf[off..];
                    let key_len = r.get_u16() as usize;
                    if r.remaining() < key_len + 2 {
                        return Err(TreeError::CorruptedPage);
                    }
                    let key = r.copy_to_bytes(key_len).to_vec();
                    let value_len = r.get_u16() as usize;
                    if r.remaining() < value_len + 24 {
                        return Err(TreeError::CorruptedPage);
                    }
                    let value = r.copy_to_bytes(value_len).to_vec();
                    let ts = r.get_u64();
                    let h_off = r.get_u64();
                    let h_count = r.get_u64();

                    entries.push(LeafEntry {
                        key,
                        value,
                        ts,
                        h_off,
                        h_count,
                    });
                }

                // keys must be strictly ascending
                for pair in entries.windows(2) {
                    if pair[0].key >= pair[1].key {
                        return Err(TreeError::CorruptedPage);
                    }
                }

                Node::Leaf(LeafNode { entries })
            }
            TAG_INNER => {
                let slots_base = PAGE_HEADER_SIZE + INNER_LEFT_CHILD_SIZE;
                let slots_end = slots_base + num_entries * SLOT_SIZE;
                if slots_end > page_size {
                    return Err(TreeError::CorruptedPage);
                }

                let left = u64::from_be_bytes(
                    buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + 8]
                        .try_into()
                        .unwrap(),
                );

                let mut seps = Vec::with_capacity(num_entries);
                let mut children = Vec::with_capacity(num_entries + 1);
                children.push(left);

                for i in 0..num_entries {
                    let slot_pos = slots_base + i * SLOT_SIZE;
                    let off =
                        u16::from_be_bytes([buf[slot_pos], buf[slot_pos + 1]]) as usize;
                    if off < slots_end || off + 2 > page_size {
                        return Err(TreeError::CorruptedPage);
                    }

                    let mut r = &buf[off..];
                    let sep_len = r.get_u16() as usize;
                    if r.remaining() < sep_len + 8 {
                        return Err(TreeError::CorruptedPage);
                    }
                    let sep = r.copy_to_bytes(sep_len).to_vec();
                    let child = r.get_u64();

                    seps.push(sep);
                    children.push(child);
                }

                for pair in seps.windows(2) {
                    if pair[0] >= pair[1] {
                        return Err(TreeError::CorruptedPage);
                    }
                }

                Node::Inner(InnerNode { seps, children })
            }
            _ => return Err(TreeError::CorruptedPage),
        };

        Ok(Self {
            node,
            is_root: flags & FLAG_ROOT != 0,
            copied: flags & FLAG_COPIED != 0,
        })
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.node {
            Node::Leaf(leaf) => {
                write!(f, "<leaf, root: {}, keys:", self.is_root)?;
                for e in &leaf.entries {
                    write!(f, " {}", hex::encode(&e.key))?;
                }
                write!(f, ">")
            }
            Node::Inner(inner) => {
                write!(
                    f,
                    "<inner, root: {}, seps: {}, children: {:?}>",
                    self.is_root,
                    inner
                        .seps
                        .iter()
                        .map(hex::encode)
                        .collect::<Vec<_>>()
                        .join(" "),
                    inner.children,
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OFFSET_NONE;

    fn leaf_entry(key: &str, value: &str, ts: u64) -> LeafEntry {
        LeafEntry {
            key: key.as_bytes().to_vec(),
            value: value.as_bytes().to_vec(),
            ts,
            h_off: OFFSET_NONE,
            h_count: 0,
        }
    }

    #[test]
    fn test_leaf_round_trip() {
        let mut leaf = LeafNode::default();
        for (i, key) in ["apple", "banana", "cherry"].iter().enumerate() {
            leaf.entries.push(leaf_entry(key, "v", i as u64 + 1));
        }
        let page = Page {
            node: Node::Leaf(leaf),
            is_root: true,
            copied: false,
        };

        let mut buf = vec![0u8; 256];
        let n = page.put(&mut buf).unwrap();
        assert_eq!(n, 256);

        let parsed = Page::from_bytes(&buf).unwrap();
        assert!(parsed.is_root);
        let leaf = parsed.as_leaf().unwrap();
        assert_eq!(leaf.entries.len(), 3);
        assert_eq!(leaf.entries[1].key, b"banana");
        assert_eq!(leaf.entries[1].ts, 2);
        assert_eq!(leaf.entries[2].h_off, OFFSET_NONE);
    }

    #[test]
    fn test_inner_round_trip() {
        let mut inner = InnerNode::new(100);
        inner.insert_sep(0, b"m".to_vec(), 200);
        let page = Page {
            node: Node::Inner(inner),
            is_root: false,
            copied: true,
        };

        let mut buf = vec![0u8; 256];
        page.put(&mut buf).unwrap();

        let parsed = Page::from_bytes(&buf).unwrap();
        assert!(parsed.copied);
        let inner = parsed.as_inner().unwrap();
        assert_eq!(inner.seps, vec![b"m".to_vec()]);
        assert_eq!(inner.children, vec![100, 200]);
    }

    #[test]
    fn test_child_index() {
        let mut inner = InnerNode::new(1);
        inner.insert_sep(0, b"f".to_vec(), 2);
        inner.insert_sep(1, b"p".to_vec(), 3);

        // keys below "f" go left of the first separator
        assert_eq!(inner.child_index(b"a"), 0);
        // a key equal to a separator belongs to the right subtree
        assert_eq!(inner.child_index(b"f"), 1);
        assert_eq!(inner.child_index(b"g"), 1);
        assert_eq!(inner.child_index(b"z"), 2);
    }

    #[test]
    fn test_reject_bad_tag() {
        let mut buf = vec![0u8; 64];
        buf[0] = 9;
        assert!(matches!(
            Page::from_bytes(&buf),
            Err(TreeError::CorruptedPage)
        ));
    }

    #[test]
    fn test_reject_slot_into_directory() {
        let mut leaf = LeafNode::default();
        leaf.entries.push(leaf_entry("k", "v", 1));
        let page = Page {
            node: Node::Leaf(leaf),
            is_root: false,
            copied: false,
        };

        let mut buf = vec![0u8; 128];
        page.put(&mut buf).unwrap();

        // point the slot inside the slot directory itself
        buf[8..10].copy_from_slice(&4u16.to_be_bytes());
        assert!(matches!(
            Page::from_bytes(&buf),
            Err(TreeError::CorruptedPage)
        ));
    }

    #[test]
    fn test_reject_unsorted_keys() {
        let mut leaf = LeafNode::default();
        leaf.entries.push(leaf_entry("b", "v", 1));
        leaf.entries.push(leaf_entry("a", "v", 2));
        let page = Page {
            node: Node::Leaf(leaf),
            is_root: false,
            copied: false,
        };

        let mut buf = vec![0u8; 128];
        page.put(&mut buf).unwrap();
        assert!(matches!(
            Page::from_bytes(&buf),
            Err(TreeError::CorruptedPage)
        ));
    }
}
