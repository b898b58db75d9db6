//! In-order traversal and key lookup over an [`IndexPack`]

use tracing::debug;

use crate::error::{DbfError, DbfResult};
use crate::table::RecPos;

use super::index_file::{IndexEntry, IndexPack};
use super::page::PageNo;

/// Where the next call to [`IndexPack::next`] continues from
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CursorState {
    /// Start from the smallest entry
    Unpositioned,
    /// Page boxes hold the path to the last entry returned
    Positioned,
    /// Descend afresh to the first entry at or after this pair
    Resume { key: Vec<u8>, record: RecPos },
    Exhausted,
    /// A read failed; further calls yield nothing until a reset
    Failed,
}

impl IndexPack {
    /// Rewind the cursor to before the first entry
    pub fn reset(&mut self) {
        self.cursor = CursorState::Unpositioned;
        self.last = None;
    }

    /// Re-anchor a positioned cursor by value, so it survives changes to
    /// the cached path
    pub(super) fn suspend_cursor(&mut self) {
        if self.cursor != CursorState::Positioned {
            return;
        }
        self.cursor = match &self.last {
            Some(last) => match last.record.checked_add(1) {
                Some(record) => CursorState::Resume {
                    key: last.key.clone(),
                    record,
                },
                None => CursorState::Exhausted,
            },
            None => CursorState::Unpositioned,
        };
    }

    /// The next entry in `(key, record)` order, or `None` when the index
    /// is exhausted. After an error the cursor stays failed and returns
    /// `None` until [`IndexPack::reset`] or a seek.
    pub fn next(&mut self) -> DbfResult<Option<IndexEntry>> {
        match self.step() {
            Ok(Some(entry)) => {
                self.last = Some(entry.clone());
                Ok(Some(entry))
            }
            Ok(None) => {
                if self.cursor != CursorState::Failed {
                    self.cursor = CursorState::Exhausted;
                }
                Ok(None)
            }
            Err(err) => {
                debug!(path = %self.path.display(), error = %err, "index cursor failed");
                self.cursor = CursorState::Failed;
                Err(err)
            }
        }
    }

    fn step(&mut self) -> DbfResult<Option<IndexEntry>> {
        match std::mem::replace(&mut self.cursor, CursorState::Positioned) {
            CursorState::Exhausted => {
                self.cursor = CursorState::Exhausted;
                return Ok(None);
            }
            CursorState::Failed => {
                self.cursor = CursorState::Failed;
                return Ok(None);
            }
            CursorState::Unpositioned => {
                let root = self.descriptor.root;
                self.descend_leftmost(0, root)?;
            }
            CursorState::Resume { key, record } => self.position_before(&key, record)?,
            CursorState::Positioned => {}
        }

        loop {
            let leaf = self.cache.level_mut(self.leaf_level);
            if let Some(slot) = leaf.advance() {
                let node = &leaf.page.slots[slot];
                return Ok(Some(IndexEntry::new(node.key.clone(), node.file_pos)));
            }

            // Leaf used up: climb to the nearest level with another child
            let mut level = self.leaf_level;
            let child = loop {
                if level == 0 {
                    return Ok(None);
                }
                level -= 1;
                let parent = self.cache.level_mut(level);
                if let Some(slot) = parent.advance() {
                    break parent.page.slots[slot].next_page;
                }
            };
            self.descend_leftmost(level + 1, child)?;
        }
    }

    /// Load the leftmost path below `page_no`, which sits at `level`
    fn descend_leftmost(&mut self, mut level: usize, mut page_no: PageNo) -> DbfResult<()> {
        loop {
            let slot = self.cache.get_page(self.file.as_mut(), level, page_no)?;
            slot.offset = -1;
            if slot.page.is_leaf() {
                self.leaf_level = level;
                return Ok(());
            }
            page_no = slot.page.less_all;
            level += 1;
        }
    }

    /// Position so the next step returns the first entry at or after
    /// `(key, record)`
    fn position_before(&mut self, key: &[u8], record: RecPos) -> DbfResult<()> {
        let mut level = 0;
        let mut page_no = self.descriptor.root;
        loop {
            let slot = self.cache.get_page(self.file.as_mut(), level, page_no)?;
            if slot.page.is_leaf() {
                slot.offset = slot.page.lower_bound(key, record) as isize - 1;
                self.leaf_level = level;
                return Ok(());
            }
            let (offset, child) = slot.page.child_for(key, record);
            slot.offset = offset;
            page_no = child;
            level += 1;
        }
    }

    /// Find the first entry whose key starts with `search` and return its
    /// record. A search longer than the key is cut to the key length.
    ///
    /// On a miss the cursor is left before the first entry greater than
    /// `search`, so [`IndexPack::next`] continues from there.
    pub fn seek(&mut self, search: &[u8]) -> DbfResult<RecPos> {
        let prefix = &search[..search.len().min(self.key_length())];
        let mut target = prefix.to_vec();
        target.resize(self.key_length(), 0);

        self.cursor = CursorState::Resume {
            key: target,
            record: 0,
        };
        self.last = None;

        match self.next()? {
            Some(entry) if entry.key.starts_with(prefix) => Ok(entry.record),
            Some(entry) => {
                self.cursor = CursorState::Resume {
                    key: entry.key,
                    record: entry.record,
                };
                self.last = None;
                Err(DbfError::KeyNotFound(
                    String::from_utf8_lossy(search).into_owned(),
                ))
            }
            None => Err(DbfError::KeyNotFound(
                String::from_utf8_lossy(search).into_owned(),
            )),
        }
    }

    /// Iterate every entry from the start
    pub fn scan(&mut self) -> IndexScan<'_> {
        self.reset();
        IndexScan {
            pack: self,
            done: false,
        }
    }
}

/// Iterator over an index in order, ending after the first error
pub struct IndexScan<'a> {
    pack: &'a mut IndexPack,
    done: bool,
}

impl Iterator for IndexScan<'_> {
    type Item = DbfResult<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.pack.next() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
