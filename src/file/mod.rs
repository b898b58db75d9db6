//! File collaborator boundary
//!
//! The table and index layers only ever talk to a [`BlockFile`]: a
//! byte-addressable random-access handle that can also grant advisory
//! range locks. [`Storage`] is the factory that opens those handles by
//! path. [`DiskStorage`] is the real implementation; [`MemoryStorage`]
//! keeps everything in memory and lets tests inject faults.

mod disk;
mod error;
mod memory;

pub use disk::{DiskFile, DiskStorage};
pub use error::{FileError, FileResult};
pub use memory::{MemoryFile, MemoryStorage};

use std::path::Path;

/// How a file is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// Random-access file handle consumed by the table and index layers
pub trait BlockFile {
    /// Read exactly `buf.len()` bytes at `offset`.
    /// Fails with [`FileError::ShortRead`] if the range runs past the end of the file.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> FileResult<()>;

    /// Write `data` at `offset`, extending the file if necessary
    fn write_at(&mut self, offset: u64, data: &[u8]) -> FileResult<()>;

    /// Current file size in bytes
    fn size(&mut self) -> FileResult<u64>;

    /// Truncate or extend the file to `len` bytes
    fn set_len(&mut self, len: u64) -> FileResult<()>;

    /// Flush OS buffers to stable storage
    fn sync(&mut self) -> FileResult<()>;

    /// Request an exclusive advisory lock on a byte range without blocking.
    /// Returns `Ok(false)` when another holder owns an overlapping range.
    fn try_lock_range(&mut self, offset: u64, len: u64) -> FileResult<bool>;

    /// Release a range previously granted by [`BlockFile::try_lock_range`]
    fn unlock_range(&mut self, offset: u64, len: u64) -> FileResult<()>;
}

/// Opens, creates and removes [`BlockFile`]s by path
pub trait Storage {
    /// Create a new empty file. Fails if the file already exists.
    fn create(&self, path: &Path) -> FileResult<Box<dyn BlockFile>>;

    /// Open an existing file
    fn open(&self, path: &Path, mode: AccessMode) -> FileResult<Box<dyn BlockFile>>;

    /// Check whether a file exists
    fn exists(&self, path: &Path) -> bool;

    /// Remove (delete) a file
    fn remove(&self, path: &Path) -> FileResult<()>;
}
