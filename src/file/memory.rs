use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::error::{FileError, FileResult};
use super::{AccessMode, BlockFile, Storage};

/// A granted advisory range lock
#[derive(Debug, Clone, Copy)]
struct RangeLock {
    owner: u64,
    offset: u64,
    len: u64,
}

impl RangeLock {
    fn overlaps(&self, offset: u64, len: u64) -> bool {
        self.offset < offset.saturating_add(len) && offset < self.offset.saturating_add(self.len)
    }
}

/// File contents shared by every handle opened on the same path
#[derive(Debug, Default)]
struct SharedFile {
    data: Vec<u8>,
    locks: Vec<RangeLock>,
    fail_reads: bool,
    fail_writes: bool,
    write_count: u64,
}

type SharedHandle = Arc<Mutex<SharedFile>>;

fn lock_shared(shared: &SharedHandle) -> MutexGuard<'_, SharedFile> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory [`Storage`]
///
/// Every `open` hands out a handle with its own lock owner id, so two
/// handles on one path behave like two processes sharing a file. Reads
/// and writes can be made to fail per path, and writes are counted.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    files: Arc<Mutex<HashMap<PathBuf, SharedHandle>>>,
    next_owner: Arc<AtomicU64>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn shared(&self, path: &Path) -> Option<SharedHandle> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .cloned()
    }

    fn handle(&self, shared: SharedHandle, path: &Path, read_only: bool) -> Box<dyn BlockFile> {
        let owner = self.next_owner.fetch_add(1, Ordering::Relaxed);
        Box::new(MemoryFile {
            shared,
            path: path.to_path_buf(),
            owner,
            read_only,
        })
    }

    /// Make every read of `path` fail (or succeed again)
    pub fn set_fail_reads(&self, path: &Path, fail: bool) {
        if let Some(shared) = self.shared(path) {
            lock_shared(&shared).fail_reads = fail;
        }
    }

    /// Make every write of `path` fail (or succeed again)
    pub fn set_fail_writes(&self, path: &Path, fail: bool) {
        if let Some(shared) = self.shared(path) {
            lock_shared(&shared).fail_writes = fail;
        }
    }

    /// Number of successful writes performed on `path`
    pub fn write_count(&self, path: &Path) -> u64 {
        self.shared(path)
            .map(|shared| lock_shared(&shared).write_count)
            .unwrap_or(0)
    }

    /// Raw copy of the current contents of `path`
    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        self.shared(path).map(|shared| lock_shared(&shared).data.clone())
    }
}

impl Storage for MemoryStorage {
    fn create(&self, path: &Path) -> FileResult<Box<dyn BlockFile>> {
        let shared = {
            let mut files = self.files.lock().unwrap_or_else(PoisonError::into_inner);
            if files.contains_key(path) {
                return Err(FileError::FileAlreadyExists(path.display().to_string()));
            }
            let shared = SharedHandle::default();
            files.insert(path.to_path_buf(), Arc::clone(&shared));
            shared
        };
        Ok(self.handle(shared, path, false))
    }

    fn open(&self, path: &Path, mode: AccessMode) -> FileResult<Box<dyn BlockFile>> {
        let shared = self
            .shared(path)
            .ok_or_else(|| FileError::FileNotFound(path.display().to_string()))?;
        Ok(self.handle(shared, path, mode == AccessMode::ReadOnly))
    }

    fn exists(&self, path: &Path) -> bool {
        self.shared(path).is_some()
    }

    fn remove(&self, path: &Path) -> FileResult<()> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| FileError::FileNotFound(path.display().to_string()))
    }
}

/// Handle on an in-memory file
#[derive(Debug)]
pub struct MemoryFile {
    shared: SharedHandle,
    path: PathBuf,
    owner: u64,
    read_only: bool,
}

impl BlockFile for MemoryFile {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> FileResult<()> {
        let shared = lock_shared(&self.shared);
        if shared.fail_reads {
            return Err(FileError::Injected("read"));
        }

        let size = shared.data.len() as u64;
        if offset + buf.len() as u64 > size {
            return Err(FileError::ShortRead {
                offset,
                wanted: buf.len(),
                size,
            });
        }

        let start = offset as usize;
        buf.copy_from_slice(&shared.data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> FileResult<()> {
        if self.read_only {
            return Err(FileError::ReadOnly(self.path.display().to_string()));
        }

        let mut shared = lock_shared(&self.shared);
        if shared.fail_writes {
            return Err(FileError::Injected("write"));
        }

        let start = offset as usize;
        let end = start + data.len();
        if shared.data.len() < end {
            shared.data.resize(end, 0);
        }
        shared.data[start..end].copy_from_slice(data);
        shared.write_count += 1;
        Ok(())
    }

    fn size(&mut self) -> FileResult<u64> {
        Ok(lock_shared(&self.shared).data.len() as u64)
    }

    fn set_len(&mut self, len: u64) -> FileResult<()> {
        if self.read_only {
            return Err(FileError::ReadOnly(self.path.display().to_string()));
        }
        lock_shared(&self.shared).data.resize(len as usize, 0);
        Ok(())
    }

    fn sync(&mut self) -> FileResult<()> {
        Ok(())
    }

    fn try_lock_range(&mut self, offset: u64, len: u64) -> FileResult<bool> {
        let mut shared = lock_shared(&self.shared);
        let conflict = shared
            .locks
            .iter()
            .any(|lock| lock.owner != self.owner && lock.overlaps(offset, len));
        if conflict {
            return Ok(false);
        }

        shared.locks.push(RangeLock {
            owner: self.owner,
            offset,
            len,
        });
        Ok(true)
    }

    fn unlock_range(&mut self, offset: u64, len: u64) -> FileResult<()> {
        let owner = self.owner;
        lock_shared(&self.shared)
            .locks
            .retain(|lock| !(lock.owner == owner && lock.offset == offset && lock.len == len));
        Ok(())
    }
}

impl Drop for MemoryFile {
    fn drop(&mut self) {
        // Closing a handle releases its locks, as closing a descriptor does
        let owner = self.owner;
        lock_shared(&self.shared)
            .locks
            .retain(|lock| lock.owner != owner);
    }
}
