use tracing::debug;

use crate::error::{DbfError, DbfResult};
use crate::file::BlockFile;

use super::page::{IndexPage, NONE, PageLayout, PageNo};

/// Read and decode one page straight from the file
pub(crate) fn read_page(
    file: &mut dyn BlockFile,
    layout: &PageLayout,
    page_no: PageNo,
) -> DbfResult<IndexPage> {
    if page_no == 0 || page_no == NONE {
        return Err(DbfError::corrupt(page_no, "reference to a reserved page number"));
    }

    let mut buf = vec![0u8; layout.page_size];
    file.read_at(layout.page_offset(page_no), &mut buf)?;
    layout.decode(page_no, &buf)
}

/// Encode and write one page straight to the file
pub(crate) fn write_page(
    file: &mut dyn BlockFile,
    layout: &PageLayout,
    page_no: PageNo,
    page: &IndexPage,
) -> DbfResult<()> {
    let bytes = layout.encode(page)?;
    file.write_at(layout.page_offset(page_no), &bytes)?;
    Ok(())
}

/// The cached page of one tree level
#[derive(Debug, Clone)]
pub struct PageBox {
    /// Resident page, or [`NONE`] when the box is empty
    pub page_no: PageNo,
    pub dirty: bool,
    /// Cursor slot within the page; `-1` is "before the first slot"
    pub offset: isize,
    pub page: IndexPage,
}

impl PageBox {
    fn empty() -> Self {
        Self {
            page_no: NONE,
            dirty: false,
            offset: -1,
            page: IndexPage::new_leaf(),
        }
    }

    /// Step the cursor forward; returns the new slot if it is inside the page
    pub fn advance(&mut self) -> Option<usize> {
        self.offset += 1;
        let slot = self.offset as usize;
        (slot < self.page.slots.len()).then_some(slot)
    }
}

/// One page buffer per tree level
///
/// Traversal depth is bounded, so a single slot per level replaces a
/// general pool: descending to a level either hits the resident page or
/// swaps it out, writing it back first when dirty.
#[derive(Debug)]
pub struct PageCache {
    layout: PageLayout,
    boxes: Vec<PageBox>,
}

impl PageCache {
    pub fn new(layout: PageLayout, max_levels: usize) -> Self {
        Self {
            layout,
            boxes: vec![PageBox::empty(); max_levels],
        }
    }

    pub fn layout(&self) -> &PageLayout {
        &self.layout
    }

    pub fn levels(&self) -> usize {
        self.boxes.len()
    }

    /// Get the page at `level`, loading it if the box holds a different page
    pub fn get_page(
        &mut self,
        file: &mut dyn BlockFile,
        level: usize,
        page_no: PageNo,
    ) -> DbfResult<&mut PageBox> {
        if level >= self.boxes.len() {
            return Err(DbfError::corrupt(
                page_no,
                format!("tree deeper than {} levels", self.boxes.len()),
            ));
        }

        if self.boxes[level].page_no != page_no {
            // The old page must reach disk before its buffer is reused
            self.flush_level(file, level)?;

            let page = read_page(file, &self.layout, page_no)?;
            debug!(level, page_no, "loaded index page");

            let slot = &mut self.boxes[level];
            slot.page_no = page_no;
            slot.dirty = false;
            slot.offset = -1;
            slot.page = page;
        }

        Ok(&mut self.boxes[level])
    }

    /// Borrow the box at `level` without loading anything
    pub fn level(&self, level: usize) -> &PageBox {
        &self.boxes[level]
    }

    pub fn level_mut(&mut self, level: usize) -> &mut PageBox {
        &mut self.boxes[level]
    }

    /// Mark the page at `level` as needing write-back
    pub fn mark_dirty(&mut self, level: usize) {
        if let Some(slot) = self.boxes.get_mut(level) {
            slot.dirty = true;
        }
    }

    /// Write back the page at `level` if it is dirty
    pub fn flush_level(&mut self, file: &mut dyn BlockFile, level: usize) -> DbfResult<()> {
        let slot = &mut self.boxes[level];
        if slot.dirty && slot.page_no != NONE {
            write_page(file, &self.layout, slot.page_no, &slot.page)?;
            slot.dirty = false;
            debug!(level, page_no = slot.page_no, "flushed index page");
        }
        Ok(())
    }

    /// Write back every dirty level. Keeps going past failures and
    /// reports the first one.
    pub fn flush_all(&mut self, file: &mut dyn BlockFile) -> DbfResult<()> {
        let mut result = Ok(());
        for level in 0..self.boxes.len() {
            if let Err(err) = self.flush_level(file, level)
                && result.is_ok()
            {
                result = Err(err);
            }
        }
        result
    }

    /// Number of levels holding unwritten changes
    pub fn dirty_count(&self) -> usize {
        self.boxes.iter().filter(|slot| slot.dirty).count()
    }

    /// Check whether `page_no` is resident at `level`
    pub fn is_cached(&self, level: usize, page_no: PageNo) -> bool {
        self.boxes.get(level).is_some_and(|slot| slot.page_no == page_no)
    }

    /// Forget every resident page. Dirty pages are dropped, so callers
    /// flush first unless they mean to discard.
    pub fn invalidate(&mut self) {
        for slot in &mut self.boxes {
            *slot = PageBox::empty();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{MemoryStorage, Storage};
    use crate::index::page::IndexNode;
    use std::path::Path;

    fn layout() -> PageLayout {
        PageLayout {
            page_size: 64,
            key_length: 2,
            capacity: 4,
        }
    }

    fn setup() -> (MemoryStorage, Box<dyn BlockFile>, PageCache) {
        let storage = MemoryStorage::new();
        let mut file = storage.create(Path::new("test.ndx")).unwrap();
        let layout = layout();

        // pages 1..=3, each holding one key naming the page
        for page_no in 1..=3u16 {
            let mut page = IndexPage::new_leaf();
            page.slots
                .push(IndexNode::leaf(vec![b'P', b'0' + page_no as u8], u32::from(page_no)));
            write_page(file.as_mut(), &layout, page_no, &page).unwrap();
        }

        (storage, file, PageCache::new(layout, 2))
    }

    #[test]
    fn test_get_page_loads_and_hits() {
        let (storage, mut file, mut cache) = setup();
        let path = Path::new("test.ndx");

        let slot = cache.get_page(file.as_mut(), 0, 2).unwrap();
        assert_eq!(slot.page.slots[0].key, b"P2".to_vec());
        assert!(cache.is_cached(0, 2));

        // A hit returns the same box without touching the file
        storage.set_fail_reads(path, true);
        let slot = cache.get_page(file.as_mut(), 0, 2).unwrap();
        assert_eq!(slot.page.slots[0].file_pos, 2);
    }

    #[test]
    fn test_swap_flushes_dirty_page() {
        let (storage, mut file, mut cache) = setup();
        let path = Path::new("test.ndx");
        let writes_before = storage.write_count(path);

        let slot = cache.get_page(file.as_mut(), 1, 1).unwrap();
        slot.page.slots[0].file_pos = 99;
        cache.mark_dirty(1);

        cache.get_page(file.as_mut(), 1, 3).unwrap();
        assert_eq!(storage.write_count(path), writes_before + 1);

        let reread = read_page(file.as_mut(), &layout(), 1).unwrap();
        assert_eq!(reread.slots[0].file_pos, 99);
    }

    #[test]
    fn test_swap_aborts_when_flush_fails() {
        let (storage, mut file, mut cache) = setup();
        let path = Path::new("test.ndx");

        cache.get_page(file.as_mut(), 0, 1).unwrap();
        cache.mark_dirty(0);

        storage.set_fail_writes(path, true);
        let result = cache.get_page(file.as_mut(), 0, 2);
        assert!(matches!(result, Err(DbfError::Io(_))));
        // The old page stays resident and dirty
        assert!(cache.is_cached(0, 1));
        assert_eq!(cache.dirty_count(), 1);
    }

    #[test]
    fn test_flush_all_is_idempotent() {
        let (storage, mut file, mut cache) = setup();
        let path = Path::new("test.ndx");

        cache.get_page(file.as_mut(), 0, 1).unwrap();
        cache.get_page(file.as_mut(), 1, 2).unwrap();
        cache.mark_dirty(0);
        cache.mark_dirty(1);

        let before = storage.write_count(path);
        cache.flush_all(file.as_mut()).unwrap();
        assert_eq!(storage.write_count(path), before + 2);

        cache.flush_all(file.as_mut()).unwrap();
        assert_eq!(storage.write_count(path), before + 2);
    }

    #[test]
    fn test_flush_all_continues_after_failure() {
        let (storage, mut file, mut cache) = setup();
        let path = Path::new("test.ndx");

        cache.get_page(file.as_mut(), 0, 1).unwrap();
        cache.get_page(file.as_mut(), 1, 2).unwrap();
        cache.mark_dirty(0);
        cache.mark_dirty(1);

        storage.set_fail_writes(path, true);
        assert!(cache.flush_all(file.as_mut()).is_err());
        assert_eq!(cache.dirty_count(), 2);

        storage.set_fail_writes(path, false);
        cache.flush_all(file.as_mut()).unwrap();
        assert_eq!(cache.dirty_count(), 0);
    }

    #[test]
    fn test_level_out_of_range() {
        let (_storage, mut file, mut cache) = setup();
        let result = cache.get_page(file.as_mut(), 2, 1);
        assert!(matches!(result, Err(DbfError::CorruptPage { .. })));
    }

    #[test]
    fn test_read_failure_surfaces() {
        let (storage, mut file, mut cache) = setup();
        storage.set_fail_reads(Path::new("test.ndx"), true);
        assert!(matches!(
            cache.get_page(file.as_mut(), 0, 1),
            Err(DbfError::Io(_))
        ));
        assert!(!cache.is_cached(0, 1));
    }
}
