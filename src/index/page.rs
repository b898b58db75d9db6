//! Serialization and deserialization for index pages and the index file descriptor
//!
//! Index file layout (all integers little-endian):
//!
//! ```text
//! page 0        descriptor: root u16, free u16, next_new u16, source_field i16,
//!               key_length i16, key_transform u8, reserved u8, capacity u16
//! page n (n>0)  left_sibling u16, right_sibling u16, less_all u16, entry_count i16,
//!               slots[capacity] = { next_page u16, file_pos_low u16, file_pos_high u8,
//!                                   key u8[key_length] }
//! ```
//!
//! A page whose `less_all` is [`NONE`] is a leaf.

use std::cmp::Ordering;

use crate::error::{DbfError, DbfResult};
use crate::table::RecPos;

use super::key::KeyTransform;

/// Page number within an index file
pub type PageNo = u16;

/// Sentinel page number: no page / leaf marker
pub const NONE: PageNo = 0xFFFF;

/// Bytes before the first slot of a page
pub const PAGE_HEADER_SIZE: usize = 8;

/// Bytes of a slot besides its key
pub const SLOT_OVERHEAD: usize = 5;

/// Bytes of the descriptor stored at the start of page 0
pub const DESCRIPTOR_SIZE: usize = 14;

/// Largest record number a slot can reference (24-bit file position)
pub const MAX_FILE_POS: RecPos = 0x00FF_FFFF;

/// Compare two `(key, record)` pairs: key bytes first, record number second
pub fn compare_entries(a_key: &[u8], a_record: RecPos, b_key: &[u8], b_record: RecPos) -> Ordering {
    a_key.cmp(b_key).then(a_record.cmp(&b_record))
}

/// One slot of an index page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexNode {
    /// Child page (internal pages) or [`NONE`] (leaf pages)
    pub next_page: PageNo,
    /// Record number referenced by this entry
    pub file_pos: RecPos,
    pub key: Vec<u8>,
}

impl IndexNode {
    pub fn leaf(key: Vec<u8>, record: RecPos) -> Self {
        Self {
            next_page: NONE,
            file_pos: record,
            key,
        }
    }

    fn cmp_target(&self, key: &[u8], record: RecPos) -> Ordering {
        compare_entries(&self.key, self.file_pos, key, record)
    }
}

/// A decoded index page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPage {
    pub left_sibling: PageNo,
    pub right_sibling: PageNo,
    /// Child holding every key below the first slot; [`NONE`] on leaves
    pub less_all: PageNo,
    pub slots: Vec<IndexNode>,
}

impl IndexPage {
    pub fn new_leaf() -> Self {
        Self {
            left_sibling: NONE,
            right_sibling: NONE,
            less_all: NONE,
            slots: Vec::new(),
        }
    }

    pub fn new_internal(less_all: PageNo) -> Self {
        Self {
            less_all,
            ..Self::new_leaf()
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.less_all == NONE
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Index of the first slot ordered at or after `(key, record)`
    pub fn lower_bound(&self, key: &[u8], record: RecPos) -> usize {
        self.slots
            .partition_point(|node| node.cmp_target(key, record) == Ordering::Less)
    }

    /// Number of slots ordered at or before `(key, record)`
    pub fn upper_bound(&self, key: &[u8], record: RecPos) -> usize {
        self.slots
            .partition_point(|node| node.cmp_target(key, record) != Ordering::Greater)
    }

    /// Child page to follow for `(key, record)` and the slot it hangs off
    /// (`-1` for the less-than-all child)
    pub fn child_for(&self, key: &[u8], record: RecPos) -> (isize, PageNo) {
        match self.upper_bound(key, record) {
            0 => (-1, self.less_all),
            n => (n as isize - 1, self.slots[n - 1].next_page),
        }
    }
}

/// Page geometry of one index file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLayout {
    pub page_size: usize,
    pub key_length: usize,
    pub capacity: usize,
}

impl PageLayout {
    fn slot_size(&self) -> usize {
        SLOT_OVERHEAD + self.key_length
    }

    /// Byte offset of a page within the index file
    pub fn page_offset(&self, page_no: PageNo) -> u64 {
        u64::from(page_no) * self.page_size as u64
    }

    /// Serialize a page into exactly `page_size` bytes
    pub fn encode(&self, page: &IndexPage) -> DbfResult<Vec<u8>> {
        if page.slots.len() > self.capacity {
            return Err(DbfError::CapacityExceeded(format!(
                "page holds {} entries, capacity is {}",
                page.slots.len(),
                self.capacity
            )));
        }

        let mut buf = vec![0u8; self.page_size];
        buf[0..2].copy_from_slice(&page.left_sibling.to_le_bytes());
        buf[2..4].copy_from_slice(&page.right_sibling.to_le_bytes());
        buf[4..6].copy_from_slice(&page.less_all.to_le_bytes());
        buf[6..8].copy_from_slice(&(page.slots.len() as i16).to_le_bytes());

        let mut offset = PAGE_HEADER_SIZE;
        for node in &page.slots {
            if node.file_pos > MAX_FILE_POS {
                return Err(DbfError::CapacityExceeded(format!(
                    "record {} does not fit a 24-bit file position",
                    node.file_pos
                )));
            }
            buf[offset..offset + 2].copy_from_slice(&node.next_page.to_le_bytes());
            buf[offset + 2..offset + 4].copy_from_slice(&(node.file_pos as u16).to_le_bytes());
            buf[offset + 4] = (node.file_pos >> 16) as u8;

            // Keys are stored at exactly key_length bytes
            let key_len = node.key.len().min(self.key_length);
            buf[offset + SLOT_OVERHEAD..offset + SLOT_OVERHEAD + key_len]
                .copy_from_slice(&node.key[..key_len]);
            offset += self.slot_size();
        }

        Ok(buf)
    }

    /// Deserialize a page read from `page_no`
    pub fn decode(&self, page_no: PageNo, buf: &[u8]) -> DbfResult<IndexPage> {
        if buf.len() != self.page_size {
            return Err(DbfError::corrupt(
                page_no,
                format!("expected {} bytes, got {}", self.page_size, buf.len()),
            ));
        }

        let left_sibling = u16::from_le_bytes([buf[0], buf[1]]);
        let right_sibling = u16::from_le_bytes([buf[2], buf[3]]);
        let less_all = u16::from_le_bytes([buf[4], buf[5]]);
        let entry_count = i16::from_le_bytes([buf[6], buf[7]]);

        if entry_count < 0 || entry_count as usize > self.capacity {
            return Err(DbfError::corrupt(
                page_no,
                format!(
                    "entry count {} outside capacity {}",
                    entry_count, self.capacity
                ),
            ));
        }

        let mut slots = Vec::with_capacity(entry_count as usize);
        let mut offset = PAGE_HEADER_SIZE;
        for _ in 0..entry_count {
            let next_page = u16::from_le_bytes([buf[offset], buf[offset + 1]]);
            let low = u16::from_le_bytes([buf[offset + 2], buf[offset + 3]]);
            let high = buf[offset + 4];
            let key = buf[offset + SLOT_OVERHEAD..offset + self.slot_size()].to_vec();

            slots.push(IndexNode {
                next_page,
                file_pos: (u32::from(high) << 16) | u32::from(low),
                key,
            });
            offset += self.slot_size();
        }

        Ok(IndexPage {
            left_sibling,
            right_sibling,
            less_all,
            slots,
        })
    }
}

/// Index file descriptor stored at the start of page 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexFileDescriptor {
    pub root: PageNo,
    /// Head of the free-page chain (linked through `right_sibling`)
    pub free: PageNo,
    /// Next never-used page number
    pub next_new: PageNo,
    /// Table field the index is built over
    pub source_field: i16,
    pub key_length: i16,
    pub transform: KeyTransform,
    /// Slots per page the file was built with
    pub capacity: u16,
}

impl IndexFileDescriptor {
    pub fn encode(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mut buf = [0u8; DESCRIPTOR_SIZE];
        buf[0..2].copy_from_slice(&self.root.to_le_bytes());
        buf[2..4].copy_from_slice(&self.free.to_le_bytes());
        buf[4..6].copy_from_slice(&self.next_new.to_le_bytes());
        buf[6..8].copy_from_slice(&self.source_field.to_le_bytes());
        buf[8..10].copy_from_slice(&self.key_length.to_le_bytes());
        buf[10] = self.transform.tag();
        // buf[11] reserved
        buf[12..14].copy_from_slice(&self.capacity.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> DbfResult<Self> {
        if buf.len() < DESCRIPTOR_SIZE {
            return Err(DbfError::corrupt(0, "descriptor truncated"));
        }

        let descriptor = Self {
            root: u16::from_le_bytes([buf[0], buf[1]]),
            free: u16::from_le_bytes([buf[2], buf[3]]),
            next_new: u16::from_le_bytes([buf[4], buf[5]]),
            source_field: i16::from_le_bytes([buf[6], buf[7]]),
            key_length: i16::from_le_bytes([buf[8], buf[9]]),
            transform: KeyTransform::from_tag(buf[10])
                .ok_or_else(|| DbfError::corrupt(0, format!("unknown key transform {}", buf[10])))?,
            capacity: u16::from_le_bytes([buf[12], buf[13]]),
        };

        if descriptor.root == 0 || descriptor.root == NONE || descriptor.root >= descriptor.next_new {
            return Err(DbfError::corrupt(
                0,
                format!("root page {} is not allocated", descriptor.root),
            ));
        }
        if descriptor.key_length <= 0 || descriptor.source_field < 0 {
            return Err(DbfError::corrupt(0, "invalid key length or source field"));
        }

        Ok(descriptor)
    }
}
