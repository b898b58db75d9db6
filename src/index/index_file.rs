//! Index file management: creation, bulk build and incremental insert

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::{DbfConfig, MIN_ENTRIES_PER_PAGE};
use crate::error::{DbfError, DbfResult};
use crate::file::BlockFile;
use crate::table::RecPos;

use super::cache::{PageCache, read_page, write_page};
use super::cursor::CursorState;
use super::key::KeyTransform;
use super::page::{
    DESCRIPTOR_SIZE, IndexFileDescriptor, IndexNode, IndexPage, MAX_FILE_POS, NONE, PageLayout,
    PageNo, compare_entries,
};

/// One `(key, record)` pair of an index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: Vec<u8>,
    pub record: RecPos,
}

impl IndexEntry {
    pub fn new(key: Vec<u8>, record: RecPos) -> Self {
        Self { key, record }
    }
}

/// An open B-tree index file
///
/// Owns the file handle, the descriptor and one cached page per tree
/// level. The same per-level boxes carry the cursor used by
/// [`IndexPack::next`], so an insert re-positions any cursor in flight.
pub struct IndexPack {
    pub(super) path: PathBuf,
    pub(super) file: Box<dyn BlockFile>,
    pub(super) share_count: usize,
    /// Descriptor differs from disk
    pub(super) dirty: bool,
    pub(super) descriptor: IndexFileDescriptor,
    pub(super) cache: PageCache,
    pub(super) max_levels: usize,
    pub(super) cursor: CursorState,
    pub(super) leaf_level: usize,
    pub(super) last: Option<IndexEntry>,
}

/// Page geometry for keys of `key_length` bytes under `config`
fn layout_for(config: &DbfConfig, key_length: usize) -> DbfResult<PageLayout> {
    if key_length == 0 || key_length > config.max_key_length {
        return Err(DbfError::CapacityExceeded(format!(
            "key length {} outside 1..={}",
            key_length, config.max_key_length
        )));
    }

    let capacity = config.page_capacity(key_length);
    if capacity < MIN_ENTRIES_PER_PAGE {
        return Err(DbfError::CapacityExceeded(format!(
            "a {}-byte page holds only {} keys of {} bytes",
            config.page_size, capacity, key_length
        )));
    }

    Ok(PageLayout {
        page_size: config.page_size,
        key_length,
        capacity,
    })
}

impl IndexPack {
    fn assemble(
        path: &Path,
        file: Box<dyn BlockFile>,
        descriptor: IndexFileDescriptor,
        layout: PageLayout,
        config: &DbfConfig,
    ) -> Self {
        Self {
            path: path.to_path_buf(),
            file,
            share_count: 1,
            dirty: false,
            descriptor,
            cache: PageCache::new(layout, config.max_levels),
            max_levels: config.max_levels,
            cursor: CursorState::Unpositioned,
            leaf_level: 0,
            last: None,
        }
    }

    /// Initialise an empty index in a freshly created file
    pub fn create(
        mut file: Box<dyn BlockFile>,
        path: &Path,
        config: &DbfConfig,
        source_field: usize,
        key_length: usize,
        transform: KeyTransform,
    ) -> DbfResult<Self> {
        let layout = layout_for(config, key_length)?;
        let descriptor = IndexFileDescriptor {
            root: 1,
            free: NONE,
            next_new: 2,
            source_field: source_field as i16,
            key_length: key_length as i16,
            transform,
            capacity: layout.capacity as u16,
        };

        write_page(file.as_mut(), &layout, 1, &IndexPage::new_leaf())?;
        file.write_at(0, &descriptor.encode())?;

        debug!(path = %path.display(), key_length, capacity = layout.capacity, "created index");
        Ok(Self::assemble(path, file, descriptor, layout, config))
    }

    /// Create an index and fill it from unsorted entries in one pass
    pub fn build(
        file: Box<dyn BlockFile>,
        path: &Path,
        config: &DbfConfig,
        source_field: usize,
        key_length: usize,
        transform: KeyTransform,
        entries: Vec<IndexEntry>,
    ) -> DbfResult<Self> {
        let mut pack = Self::create(file, path, config, source_field, key_length, transform)?;
        pack.bulk_load(entries)?;
        Ok(pack)
    }

    /// Open an existing index file
    pub fn open(mut file: Box<dyn BlockFile>, path: &Path, config: &DbfConfig) -> DbfResult<Self> {
        let mut buf = [0u8; DESCRIPTOR_SIZE];
        file.read_at(0, &mut buf)?;
        let descriptor = IndexFileDescriptor::decode(&buf)?;

        let layout = layout_for(config, descriptor.key_length as usize)?;
        if layout.capacity != usize::from(descriptor.capacity) {
            return Err(DbfError::corrupt(
                0,
                format!(
                    "index built with {} slots per page, configuration gives {}",
                    descriptor.capacity, layout.capacity
                ),
            ));
        }

        debug!(path = %path.display(), root = descriptor.root, "opened index");
        Ok(Self::assemble(path, file, descriptor, layout, config))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn descriptor(&self) -> &IndexFileDescriptor {
        &self.descriptor
    }

    /// Table field this index is built over
    pub fn source_field(&self) -> usize {
        self.descriptor.source_field as usize
    }

    pub fn key_length(&self) -> usize {
        self.cache.layout().key_length
    }

    pub fn capacity(&self) -> usize {
        self.cache.layout().capacity
    }

    pub fn transform(&self) -> KeyTransform {
        self.descriptor.transform
    }

    pub fn share_count(&self) -> usize {
        self.share_count
    }

    pub(crate) fn acquire_share(&mut self) {
        self.share_count += 1;
    }

    /// Drop one share; returns the shares left
    pub(crate) fn release_share(&mut self) -> usize {
        self.share_count = self.share_count.saturating_sub(1);
        self.share_count
    }

    /// Whether pages or the descriptor hold unwritten changes
    pub fn is_dirty(&self) -> bool {
        self.dirty || self.cache.dirty_count() > 0
    }

    fn check_entry(&self, key: &[u8], record: RecPos) -> DbfResult<()> {
        if key.len() != self.key_length() {
            return Err(DbfError::InvalidValue {
                field: "index key".to_string(),
                reason: format!("expected {} bytes, got {}", self.key_length(), key.len()),
            });
        }
        if record > MAX_FILE_POS {
            return Err(DbfError::CapacityExceeded(format!(
                "record {} does not fit a 24-bit file position",
                record
            )));
        }
        Ok(())
    }

    /// Take a page from the free chain, or extend the file
    fn allocate_page(&mut self) -> DbfResult<PageNo> {
        if self.descriptor.free != NONE {
            let page_no = self.descriptor.free;
            let page = read_page(self.file.as_mut(), self.cache.layout(), page_no)?;
            self.descriptor.free = page.right_sibling;
            self.dirty = true;
            return Ok(page_no);
        }

        let page_no = self.descriptor.next_new;
        if page_no >= NONE {
            return Err(DbfError::CapacityExceeded(
                "index file has no page numbers left".to_string(),
            ));
        }
        self.descriptor.next_new += 1;
        self.dirty = true;
        Ok(page_no)
    }

    /// Replace the whole tree with `entries`, packing leaves full and
    /// building internal levels bottom-up
    pub fn bulk_load(&mut self, mut entries: Vec<IndexEntry>) -> DbfResult<()> {
        for entry in &entries {
            self.check_entry(&entry.key, entry.record)?;
        }
        entries.sort_by(|a, b| compare_entries(&a.key, a.record, &b.key, b.record));
        entries.dedup();

        let layout = *self.cache.layout();
        let capacity = layout.capacity;

        // Plan every level first so nothing is written for a tree that cannot fit
        let mut level_sizes = vec![entries.len().div_ceil(capacity).max(1)];
        loop {
            let count = level_sizes[level_sizes.len() - 1];
            if count <= 1 {
                break;
            }
            level_sizes.push(count.div_ceil(capacity + 1));
        }
        if level_sizes.len() > self.max_levels {
            return Err(DbfError::CapacityExceeded(format!(
                "{} entries need {} levels, limit is {}",
                entries.len(),
                level_sizes.len(),
                self.max_levels
            )));
        }
        let total_pages: usize = level_sizes.iter().sum();
        if total_pages >= usize::from(NONE) {
            return Err(DbfError::CapacityExceeded(format!(
                "{} entries need {} pages",
                entries.len(),
                total_pages
            )));
        }

        self.cache.invalidate();
        self.reset();

        let mut pages: Vec<IndexPage> = if entries.is_empty() {
            vec![IndexPage::new_leaf()]
        } else {
            entries
                .chunks(capacity)
                .map(|chunk| IndexPage {
                    slots: chunk
                        .iter()
                        .map(|entry| IndexNode::leaf(entry.key.clone(), entry.record))
                        .collect(),
                    ..IndexPage::new_leaf()
                })
                .collect()
        };
        // First (key, record) of each page's subtree
        let mut heads: Vec<(Vec<u8>, RecPos)> = pages
            .iter()
            .filter_map(|page| page.slots.first())
            .map(|node| (node.key.clone(), node.file_pos))
            .collect();

        let mut next_page: PageNo = 1;
        let root = loop {
            let first = next_page;
            let count = pages.len();
            for (i, page) in pages.iter_mut().enumerate() {
                let page_no = first + i as PageNo;
                page.left_sibling = if i == 0 { NONE } else { page_no - 1 };
                page.right_sibling = if i + 1 == count { NONE } else { page_no + 1 };
                write_page(self.file.as_mut(), &layout, page_no, page)?;
            }
            next_page = first + count as PageNo;

            if count == 1 {
                break first;
            }

            let mut parents = Vec::new();
            let mut parent_heads = Vec::new();
            let mut start = 0;
            while start < count {
                let end = (start + capacity + 1).min(count);
                let mut parent = IndexPage::new_internal(first + start as PageNo);
                for child in start + 1..end {
                    let (key, record) = &heads[child];
                    parent.slots.push(IndexNode {
                        next_page: first + child as PageNo,
                        file_pos: *record,
                        key: key.clone(),
                    });
                }
                parent_heads.push(heads[start].clone());
                parents.push(parent);
                start = end;
            }
            pages = parents;
            heads = parent_heads;
        };

        self.descriptor.root = root;
        self.descriptor.free = NONE;
        self.descriptor.next_new = next_page;
        self.write_descriptor()?;
        self.file.set_len(layout.page_offset(next_page))?;

        info!(
            path = %self.path.display(),
            entries = entries.len(),
            levels = level_sizes.len(),
            pages = total_pages,
            "built index"
        );
        Ok(())
    }

    /// Insert one entry, splitting full pages on the way back up
    pub fn insert(&mut self, key: &[u8], record: RecPos) -> DbfResult<()> {
        self.check_entry(key, record)?;
        self.suspend_cursor();
        let layout = *self.cache.layout();

        // Descend to the target leaf; each level's offset records the child taken
        let mut level = 0;
        let mut page_no = self.descriptor.root;
        loop {
            let slot = self.cache.get_page(self.file.as_mut(), level, page_no)?;
            if slot.page.is_leaf() {
                break;
            }
            let (offset, child) = slot.page.child_for(key, record);
            slot.offset = offset;
            page_no = child;
            level += 1;
        }
        let leaf_level = level;

        let leaf = &self.cache.level(leaf_level).page;
        let pos = leaf.lower_bound(key, record);
        if leaf
            .slots
            .get(pos)
            .is_some_and(|node| node.key == key && node.file_pos == record)
        {
            return Ok(());
        }

        // Refuse before mutating anything if the split chain would outgrow the tree
        let splits = (0..=leaf_level)
            .rev()
            .take_while(|&l| self.cache.level(l).page.len() >= layout.capacity)
            .count();
        let root_splits = splits > leaf_level;
        if root_splits && leaf_level + 2 > self.max_levels {
            return Err(DbfError::CapacityExceeded(format!(
                "insert would grow the tree past {} levels",
                self.max_levels
            )));
        }
        let new_pages = splits + usize::from(root_splits);
        if self.descriptor.free == NONE
            && usize::from(self.descriptor.next_new) + new_pages > usize::from(NONE)
        {
            return Err(DbfError::CapacityExceeded(
                "index file has no page numbers left".to_string(),
            ));
        }

        let mut node = IndexNode::leaf(key.to_vec(), record);
        let mut level = leaf_level;
        loop {
            {
                let slot = self.cache.level_mut(level);
                let pos = slot.page.lower_bound(&node.key, node.file_pos);
                slot.page.slots.insert(pos, node);
                slot.dirty = true;
                if slot.page.len() <= layout.capacity {
                    return Ok(());
                }
            }

            let right_no = self.allocate_page()?;
            let (left_no, separator, right, old_right) = {
                let slot = self.cache.level_mut(level);
                let mid = slot.page.len() / 2;
                let mut moved = slot.page.slots.split_off(mid);

                let (separator, mut right) = if slot.page.is_leaf() {
                    let separator = IndexNode {
                        next_page: right_no,
                        file_pos: moved[0].file_pos,
                        key: moved[0].key.clone(),
                    };
                    let right = IndexPage {
                        slots: moved,
                        ..IndexPage::new_leaf()
                    };
                    (separator, right)
                } else {
                    // Internal split: the middle entry moves up, its child
                    // becomes the right page's less-than-all child
                    let promoted = moved.remove(0);
                    let right = IndexPage {
                        slots: moved,
                        ..IndexPage::new_internal(promoted.next_page)
                    };
                    let separator = IndexNode {
                        next_page: right_no,
                        ..promoted
                    };
                    (separator, right)
                };

                let old_right = slot.page.right_sibling;
                right.left_sibling = slot.page_no;
                right.right_sibling = old_right;
                slot.page.right_sibling = right_no;
                (slot.page_no, separator, right, old_right)
            };

            write_page(self.file.as_mut(), &layout, right_no, &right)?;
            if old_right != NONE {
                let mut neighbour = read_page(self.file.as_mut(), &layout, old_right)?;
                neighbour.left_sibling = right_no;
                write_page(self.file.as_mut(), &layout, old_right, &neighbour)?;
            }
            debug!(level, left = left_no, right = right_no, "split index page");

            if level == 0 {
                let root_no = self.allocate_page()?;
                let mut root = IndexPage::new_internal(left_no);
                root.slots.push(separator);
                write_page(self.file.as_mut(), &layout, root_no, &root)?;
                self.descriptor.root = root_no;
                self.dirty = true;

                // Every page moves down one level under the new root
                self.cache.flush_all(self.file.as_mut())?;
                self.cache.invalidate();
                debug!(root = root_no, "index root split");
                return Ok(());
            }

            node = separator;
            level -= 1;
        }
    }

    fn write_descriptor(&mut self) -> DbfResult<()> {
        self.file.write_at(0, &self.descriptor.encode())?;
        self.dirty = false;
        Ok(())
    }

    /// Write back every dirty page and the descriptor. Attempts all of
    /// them and reports the first failure.
    pub fn flush(&mut self) -> DbfResult<()> {
        let mut result = self.cache.flush_all(self.file.as_mut());
        if self.dirty
            && let Err(err) = self.write_descriptor()
            && result.is_ok()
        {
            result = Err(err);
        }
        result
    }

    /// Re-read the descriptor and drop every cached page after another
    /// session may have changed the file. Pending changes are flushed
    /// first; a clean pack writes nothing, so this is safe on read-only files.
    pub fn refresh(&mut self) -> DbfResult<()> {
        self.flush()?;

        let mut buf = [0u8; DESCRIPTOR_SIZE];
        self.file.read_at(0, &mut buf)?;
        self.descriptor = IndexFileDescriptor::decode(&buf)?;
        self.cache.invalidate();
        self.suspend_cursor();
        Ok(())
    }

    /// Number of levels from root to leaf
    pub fn depth(&mut self) -> DbfResult<usize> {
        self.flush()?;

        let layout = *self.cache.layout();
        let mut depth = 1;
        let mut page = read_page(self.file.as_mut(), &layout, self.descriptor.root)?;
        while !page.is_leaf() {
            depth += 1;
            if depth > self.max_levels {
                return Err(DbfError::corrupt(page.less_all, "tree deeper than configured"));
            }
            page = read_page(self.file.as_mut(), &layout, page.less_all)?;
        }
        Ok(depth)
    }

    /// Read a page as it is on disk, after flushing pending changes
    pub fn load_page(&mut self, page_no: PageNo) -> DbfResult<IndexPage> {
        self.flush()?;
        let layout = *self.cache.layout();
        read_page(self.file.as_mut(), &layout, page_no)
    }

    /// Flush and sync, consuming the pack
    pub fn close(mut self) -> DbfResult<()> {
        self.flush()?;
        self.file.sync()?;
        debug!(path = %self.path.display(), "closed index");
        Ok(())
    }
}

impl Drop for IndexPack {
    fn drop(&mut self) {
        if self.is_dirty()
            && let Err(err) = self.flush()
        {
            warn!(path = %self.path.display(), error = %err, "failed to flush index on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{MemoryStorage, Storage};

    fn small_config() -> DbfConfig {
        DbfConfig {
            page_size: 128,
            max_entries_per_page: Some(4),
            max_levels: 8,
            ..DbfConfig::default()
        }
    }

    fn key(n: u32) -> Vec<u8> {
        format!("{:04}", n).into_bytes()
    }

    fn create_pack(storage: &MemoryStorage, config: &DbfConfig) -> IndexPack {
        let path = Path::new("test.ndx");
        let file = storage.create(path).unwrap();
        IndexPack::create(file, path, config, 0, 4, KeyTransform::Verbatim).unwrap()
    }

    /// Walk every page reachable from the root, checking ordering and fill
    fn check_tree(pack: &mut IndexPack) -> Vec<IndexEntry> {
        fn walk(pack: &mut IndexPack, page_no: PageNo, out: &mut Vec<IndexEntry>) {
            let page = pack.load_page(page_no).unwrap();
            assert!(page.len() <= pack.capacity());
            for pair in page.slots.windows(2) {
                assert_eq!(
                    compare_entries(&pair[0].key, pair[0].file_pos, &pair[1].key, pair[1].file_pos),
                    std::cmp::Ordering::Less
                );
            }
            if page.is_leaf() {
                out.extend(
                    page.slots
                        .iter()
                        .map(|node| IndexEntry::new(node.key.clone(), node.file_pos)),
                );
            } else {
                walk(pack, page.less_all, out);
                for node in &page.slots {
                    let before = out.len();
                    walk(pack, node.next_page, out);
                    // The separator is the first entry of its subtree
                    assert_eq!(out[before].key, node.key);
                    assert_eq!(out[before].record, node.file_pos);
                }
            }
        }

        let mut out = Vec::new();
        let root = pack.descriptor.root;
        walk(pack, root, &mut out);
        out
    }

    #[test]
    fn test_create_empty() {
        let storage = MemoryStorage::new();
        let mut pack = create_pack(&storage, &small_config());
        assert_eq!(pack.depth().unwrap(), 1);
        assert!(check_tree(&mut pack).is_empty());
    }

    #[test]
    fn test_insert_without_split() {
        let storage = MemoryStorage::new();
        let mut pack = create_pack(&storage, &small_config());

        for n in [3, 1, 2] {
            pack.insert(&key(n), n).unwrap();
        }

        let entries = check_tree(&mut pack);
        let records: Vec<RecPos> = entries.iter().map(|e| e.record).collect();
        assert_eq!(records, vec![1, 2, 3]);
        assert_eq!(pack.depth().unwrap(), 1);
    }

    #[test]
    fn test_leaf_split_grows_root() {
        let storage = MemoryStorage::new();
        let mut pack = create_pack(&storage, &small_config());

        for n in 0..5 {
            pack.insert(&key(n), n).unwrap();
        }

        assert_eq!(pack.depth().unwrap(), 2);
        let root = pack.load_page(pack.descriptor.root).unwrap();
        assert_eq!(root.len(), 1);

        let left = pack.load_page(root.less_all).unwrap();
        let right = pack.load_page(root.slots[0].next_page).unwrap();
        assert!(left.is_leaf() && right.is_leaf());
        assert_eq!(left.len() + right.len(), 5);
        assert!(left.len() >= 2 && right.len() >= 2);
        assert_eq!(left.right_sibling, root.slots[0].next_page);
        assert_eq!(right.left_sibling, root.less_all);
        assert_eq!(root.slots[0].key, right.slots[0].key);
    }

    #[test]
    fn test_leaf_split_below_root_keeps_depth() {
        let storage = MemoryStorage::new();
        let mut pack = create_pack(&storage, &small_config());

        for n in 0..5 {
            pack.insert(&key(n * 10), n * 10).unwrap();
        }
        assert_eq!(pack.depth().unwrap(), 2);
        let root_before = pack.load_page(pack.descriptor.root).unwrap();

        // Fill the right leaf to capacity, then overflow it
        pack.insert(&key(25), 25).unwrap();
        let right = pack.load_page(root_before.slots[0].next_page).unwrap();
        assert_eq!(right.len(), pack.capacity());

        pack.insert(&key(35), 35).unwrap();
        assert_eq!(pack.depth().unwrap(), 2);
        let root_after = pack.load_page(pack.descriptor.root).unwrap();
        assert_eq!(root_after.len(), root_before.len() + 1);

        let entries = check_tree(&mut pack);
        assert_eq!(entries.len(), 7);
    }

    #[test]
    fn test_many_inserts_keep_invariants() {
        let storage = MemoryStorage::new();
        let mut pack = create_pack(&storage, &small_config());

        // Interleaved order exercises splits on both sides
        let mut inserted: Vec<u32> = (0..120).map(|n| (n * 37) % 120).collect();
        for &n in &inserted {
            pack.insert(&key(n), n).unwrap();
        }

        let entries = check_tree(&mut pack);
        inserted.sort_unstable();
        let records: Vec<RecPos> = entries.iter().map(|e| e.record).collect();
        assert_eq!(records, inserted);
        assert!(pack.depth().unwrap() <= 8);
    }

    #[test]
    fn test_duplicate_keys_ordered_by_record() {
        let storage = MemoryStorage::new();
        let mut pack = create_pack(&storage, &small_config());

        for record in [9, 2, 7, 4, 1, 8] {
            pack.insert(b"SAME", record).unwrap();
        }
        // Re-inserting an existing pair is a no-op
        pack.insert(b"SAME", 7).unwrap();

        let records: Vec<RecPos> = check_tree(&mut pack).iter().map(|e| e.record).collect();
        assert_eq!(records, vec![1, 2, 4, 7, 8, 9]);
    }

    #[test]
    fn test_depth_limit_is_capacity_error() {
        let storage = MemoryStorage::new();
        let config = DbfConfig {
            max_levels: 2,
            ..small_config()
        };
        let mut pack = create_pack(&storage, &config);

        // Two levels of fan-out 4 hold at most 5 full leaves
        let mut result = Ok(());
        let mut count = 0;
        for n in 0..100 {
            result = pack.insert(&key(n), n);
            if result.is_err() {
                break;
            }
            count += 1;
        }
        assert!(matches!(result, Err(DbfError::CapacityExceeded(_))));
        // The failed insert left the tree intact
        assert_eq!(check_tree(&mut pack).len(), count);
        assert_eq!(pack.depth().unwrap(), 2);
    }

    #[test]
    fn test_bulk_load_builds_levels() {
        let storage = MemoryStorage::new();
        let mut pack = create_pack(&storage, &small_config());

        let entries: Vec<IndexEntry> = (0..50).rev().map(|n| IndexEntry::new(key(n), n)).collect();
        pack.bulk_load(entries).unwrap();

        // 13 leaves -> 3 internal -> 1 root
        assert_eq!(pack.depth().unwrap(), 3);
        let records: Vec<RecPos> = check_tree(&mut pack).iter().map(|e| e.record).collect();
        assert_eq!(records, (0..50).collect::<Vec<_>>());

        // Leaves are packed full and linked left to right
        let mut page_no = 1;
        let mut leaves = 0;
        while page_no != NONE {
            let page = pack.load_page(page_no).unwrap();
            assert!(page.is_leaf());
            leaves += 1;
            page_no = page.right_sibling;
        }
        assert_eq!(leaves, 13);
    }

    #[test]
    fn test_bulk_load_then_insert() {
        let storage = MemoryStorage::new();
        let mut pack = create_pack(&storage, &small_config());

        let entries: Vec<IndexEntry> = (0..20).map(|n| IndexEntry::new(key(n * 2), n * 2)).collect();
        pack.bulk_load(entries).unwrap();
        for n in 0..20 {
            pack.insert(&key(n * 2 + 1), n * 2 + 1).unwrap();
        }

        let records: Vec<RecPos> = check_tree(&mut pack).iter().map(|e| e.record).collect();
        assert_eq!(records, (0..40).collect::<Vec<_>>());
    }

    #[test]
    fn test_bulk_load_too_deep() {
        let storage = MemoryStorage::new();
        let config = DbfConfig {
            max_levels: 2,
            ..small_config()
        };
        let mut pack = create_pack(&storage, &config);

        // Two levels of fan-out 4 index at most 20 entries
        let entries: Vec<IndexEntry> = (0..100).map(|n| IndexEntry::new(key(n), n)).collect();
        assert!(matches!(
            pack.bulk_load(entries),
            Err(DbfError::CapacityExceeded(_))
        ));
    }

    #[test]
    fn test_reopen_after_close() {
        let storage = MemoryStorage::new();
        let config = small_config();
        let path = Path::new("test.ndx");
        {
            let mut pack = create_pack(&storage, &config);
            for n in 0..30 {
                pack.insert(&key(n), n).unwrap();
            }
            pack.close().unwrap();
        }

        let file = storage.open(path, crate::file::AccessMode::ReadOnly).unwrap();
        let mut pack = IndexPack::open(file, path, &config).unwrap();
        assert_eq!(check_tree(&mut pack).len(), 30);
    }

    #[test]
    fn test_open_with_other_geometry_fails() {
        let storage = MemoryStorage::new();
        let path = Path::new("test.ndx");
        create_pack(&storage, &small_config()).close().unwrap();

        let file = storage
            .open(path, crate::file::AccessMode::ReadOnly)
            .unwrap();
        let other = DbfConfig {
            max_entries_per_page: Some(6),
            ..small_config()
        };
        assert!(matches!(
            IndexPack::open(file, path, &other),
            Err(DbfError::CorruptPage { page: 0, .. })
        ));
    }

    #[test]
    fn test_rejects_wrong_key_length_and_large_record() {
        let storage = MemoryStorage::new();
        let mut pack = create_pack(&storage, &small_config());
        assert!(matches!(
            pack.insert(b"TOO LONG", 1),
            Err(DbfError::InvalidValue { .. })
        ));
        assert!(matches!(
            pack.insert(b"ABCD", MAX_FILE_POS + 1),
            Err(DbfError::CapacityExceeded(_))
        ));
    }

    #[test]
    fn test_flush_is_idempotent() {
        let storage = MemoryStorage::new();
        let path = Path::new("test.ndx");
        let mut pack = create_pack(&storage, &small_config());
        for n in 0..10 {
            pack.insert(&key(n), n).unwrap();
        }

        pack.flush().unwrap();
        let writes = storage.write_count(path);
        pack.flush().unwrap();
        assert_eq!(storage.write_count(path), writes);
        assert!(!pack.is_dirty());
    }
}
