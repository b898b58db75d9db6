//! B-tree index files
//!
//! An index maps fixed-length keys derived from one table field to record
//! numbers. Entries are ordered by key bytes and then record number, so
//! duplicate keys are allowed and traversal order is total.

mod cache;
mod cursor;
mod index_file;
mod key;
mod page;

pub use cache::{PageBox, PageCache};
pub use cursor::IndexScan;
pub use index_file::{IndexEntry, IndexPack};
pub use key::{KeyTransform, NUMERIC_KEY_LENGTH};
pub use page::{
    DESCRIPTOR_SIZE, IndexFileDescriptor, IndexNode, IndexPage, MAX_FILE_POS, NONE,
    PAGE_HEADER_SIZE, PageLayout, PageNo, SLOT_OVERHEAD, compare_entries,
};
