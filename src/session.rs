//! Session layer: a registry of open tables
//!
//! Callers address tables through [`TableHandle`]s handed out by a
//! [`Workspace`]. The first handle opened on a path is exclusive, later
//! ones on the same path are shared. Every handle owns its own file, so
//! on [`MemoryStorage`](crate::file::MemoryStorage) and on Linux disks
//! handles on one table contend for the table lock like separate
//! processes do. Other unixes fall back to per-process POSIX locks, which
//! never conflict within one process.

use std::path::{Path, PathBuf};

use ahash::AHashMap;
use tracing::{debug, warn};

use crate::config::DbfConfig;
use crate::error::{DbfError, DbfResult};
use crate::file::{AccessMode, DiskStorage, Storage};
use crate::index::KeyTransform;
use crate::table::{FieldDescriptor, RecPos, ShareMode, Value, WorkArea};

/// Handle to an open table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableHandle(usize);

impl TableHandle {
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

/// Open tables and the storage they live on
pub struct Workspace {
    storage: Box<dyn Storage>,
    config: DbfConfig,
    tables: AHashMap<TableHandle, WorkArea>,
    /// Open handles per table path
    shares: AHashMap<PathBuf, usize>,
    next_handle: usize,
}

impl Workspace {
    pub fn new(storage: Box<dyn Storage>, config: DbfConfig) -> DbfResult<Self> {
        config.validate()?;
        Ok(Self {
            storage,
            config,
            tables: AHashMap::new(),
            shares: AHashMap::new(),
            next_handle: 0,
        })
    }

    /// Workspace over the local filesystem
    pub fn on_disk(config: DbfConfig) -> DbfResult<Self> {
        Self::new(Box::new(DiskStorage::new()), config)
    }

    pub fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    pub fn config(&self) -> &DbfConfig {
        &self.config
    }

    /// Number of handles currently open on `path`
    pub fn share_count(&self, path: &Path) -> usize {
        self.shares.get(path).copied().unwrap_or(0)
    }

    pub fn handles(&self) -> impl Iterator<Item = TableHandle> + '_ {
        self.tables.keys().copied()
    }

    fn register(&mut self, path: &Path, table: WorkArea) -> TableHandle {
        let handle = TableHandle(self.next_handle);
        self.next_handle += 1;
        *self.shares.entry(path.to_path_buf()).or_insert(0) += 1;
        self.tables.insert(handle, table);
        debug!(handle = handle.0, path = %path.display(), "registered table");
        handle
    }

    /// Create a table and open it exclusively
    pub fn create_table(
        &mut self,
        path: &Path,
        fields: Vec<FieldDescriptor>,
    ) -> DbfResult<TableHandle> {
        let table = WorkArea::create(self.storage.as_ref(), path, fields, &self.config)?;
        Ok(self.register(path, table))
    }

    /// Open a table. Exclusive when no other handle has it open, shared otherwise.
    pub fn open_table(&mut self, path: &Path, mode: AccessMode) -> DbfResult<TableHandle> {
        let share_mode = if self.share_count(path) == 0 {
            ShareMode::Exclusive
        } else {
            ShareMode::Shared
        };
        let table = WorkArea::open(self.storage.as_ref(), path, mode, share_mode, &self.config)?;
        Ok(self.register(path, table))
    }

    /// Close a table and forget its handle
    pub fn close_table(&mut self, handle: TableHandle) -> DbfResult<()> {
        let mut table = self.tables.remove(&handle).ok_or(DbfError::NotOpen)?;

        let path = table.path().to_path_buf();
        if let Some(count) = self.shares.get_mut(&path) {
            *count -= 1;
            if *count == 0 {
                self.shares.remove(&path);
            }
        }
        table.close()
    }

    /// Close every open table, reporting the first failure
    pub fn close_all(&mut self) -> DbfResult<()> {
        let mut handles: Vec<TableHandle> = self.handles().collect();
        handles.sort();

        let mut result = Ok(());
        for handle in handles {
            if let Err(err) = self.close_table(handle) {
                warn!(handle = handle.0, error = %err, "failed to close table");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    pub fn table(&self, handle: TableHandle) -> DbfResult<&WorkArea> {
        self.tables.get(&handle).ok_or(DbfError::NotOpen)
    }

    pub fn table_mut(&mut self, handle: TableHandle) -> DbfResult<&mut WorkArea> {
        self.tables.get_mut(&handle).ok_or(DbfError::NotOpen)
    }

    pub fn read_record(&mut self, handle: TableHandle, record: RecPos) -> DbfResult<Vec<u8>> {
        self.table_mut(handle)?.read_record(record)
    }

    pub fn write_record(&mut self, handle: TableHandle, record: RecPos, data: &[u8]) -> DbfResult<()> {
        self.table_mut(handle)?.write_record(record, data)
    }

    pub fn append_record(&mut self, handle: TableHandle, data: &[u8]) -> DbfResult<RecPos> {
        self.table_mut(handle)?.append_record(data)
    }

    pub fn append_values(&mut self, handle: TableHandle, values: &[Value]) -> DbfResult<RecPos> {
        self.table_mut(handle)?.append_values(values)
    }

    pub fn lock(&mut self, handle: TableHandle) -> DbfResult<()> {
        self.table_mut(handle)?.lock()
    }

    pub fn unlock(&mut self, handle: TableHandle) -> DbfResult<()> {
        self.table_mut(handle)?.unlock()
    }

    /// Build an index over `field` into `index_path`; returns its slot
    pub fn build_index(
        &mut self,
        handle: TableHandle,
        index_path: &Path,
        field: &str,
        transform: KeyTransform,
    ) -> DbfResult<usize> {
        let table = self.tables.get_mut(&handle).ok_or(DbfError::NotOpen)?;
        table.build_index(self.storage.as_ref(), index_path, field, transform)
    }

    pub fn open_index(&mut self, handle: TableHandle, index_path: &Path) -> DbfResult<usize> {
        let table = self.tables.get_mut(&handle).ok_or(DbfError::NotOpen)?;
        table.open_index(self.storage.as_ref(), index_path)
    }

    pub fn close_index(&mut self, handle: TableHandle, slot: usize) -> DbfResult<()> {
        self.table_mut(handle)?.close_index(slot)
    }

    pub fn seek(&mut self, handle: TableHandle, key: &str) -> DbfResult<RecPos> {
        self.table_mut(handle)?.seek(key)
    }

    pub fn next(&mut self, handle: TableHandle) -> DbfResult<Option<RecPos>> {
        self.table_mut(handle)?.next()
    }

    pub fn reset(&mut self, handle: TableHandle) -> DbfResult<()> {
        self.table_mut(handle)?.reset()
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(err) = self.close_all() {
            warn!(error = %err, "failed to close workspace");
        }
    }
}
