use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::error::{FileError, FileResult};
use super::{AccessMode, BlockFile, Storage};

/// [`Storage`] backed by the local filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskStorage;

impl DiskStorage {
    pub fn new() -> Self {
        Self
    }
}

impl Storage for DiskStorage {
    fn create(&self, path: &Path) -> FileResult<Box<dyn BlockFile>> {
        if path.exists() {
            return Err(FileError::FileAlreadyExists(path.display().to_string()));
        }

        // Create parent directories if they don't exist
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        Ok(Box::new(DiskFile {
            file,
            path: path.to_path_buf(),
            read_only: false,
        }))
    }

    fn open(&self, path: &Path, mode: AccessMode) -> FileResult<Box<dyn BlockFile>> {
        if !path.exists() {
            return Err(FileError::FileNotFound(path.display().to_string()));
        }

        let read_only = mode == AccessMode::ReadOnly;
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;

        Ok(Box::new(DiskFile {
            file,
            path: path.to_path_buf(),
            read_only,
        }))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn remove(&self, path: &Path) -> FileResult<()> {
        std::fs::remove_file(path)?;
        Ok(())
    }
}

/// An open file on disk
#[derive(Debug)]
pub struct DiskFile {
    file: File,
    path: PathBuf,
    read_only: bool,
}

impl DiskFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockFile for DiskFile {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> FileResult<()> {
        let size = self.file.metadata()?.len();
        if offset + buf.len() as u64 > size {
            return Err(FileError::ShortRead {
                offset,
                wanted: buf.len(),
                size,
            });
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> FileResult<()> {
        if self.read_only {
            return Err(FileError::ReadOnly(self.path.display().to_string()));
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        // No sync here: the OS batches writes, callers sync on close
        Ok(())
    }

    fn size(&mut self) -> FileResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> FileResult<()> {
        if self.read_only {
            return Err(FileError::ReadOnly(self.path.display().to_string()));
        }
        self.file.set_len(len)?;
        Ok(())
    }

    fn sync(&mut self) -> FileResult<()> {
        if !self.read_only {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn try_lock_range(&mut self, offset: u64, len: u64) -> FileResult<bool> {
        Ok(range_lock(&self.file, offset, len, LockKind::Exclusive)?)
    }

    fn unlock_range(&mut self, offset: u64, len: u64) -> FileResult<()> {
        range_lock(&self.file, offset, len, LockKind::Unlock)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum LockKind {
    Exclusive,
    Unlock,
}

// Open-file-description locks conflict between two handles of the same
// process, which classic POSIX record locks do not.
#[cfg(target_os = "linux")]
const SET_LOCK: libc::c_int = libc::F_OFD_SETLK;

// Classic record locks belong to the process: two handles in one process
// never conflict, and closing any descriptor of the file drops them all.
#[cfg(all(unix, not(target_os = "linux")))]
const SET_LOCK: libc::c_int = libc::F_SETLK;

#[cfg(unix)]
fn range_lock(file: &File, offset: u64, len: u64, kind: LockKind) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: `flock` is a plain C struct for which all-zero is a valid value.
    // OFD locks additionally require `l_pid` to be zero.
    let mut request: libc::flock = unsafe { std::mem::zeroed() };
    request.l_type = match kind {
        LockKind::Exclusive => libc::F_WRLCK as libc::c_short,
        LockKind::Unlock => libc::F_UNLCK as libc::c_short,
    };
    request.l_whence = libc::SEEK_SET as libc::c_short;
    request.l_start = offset as libc::off_t;
    request.l_len = len as libc::off_t;

    let fd = file.as_raw_fd();
    // SAFETY: `fd` is owned by `file` and `request` outlives the call.
    let rc = unsafe { libc::fcntl(fd, SET_LOCK, &mut request as *mut libc::flock) };
    if rc == 0 {
        return Ok(true);
    }

    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == libc::EAGAIN || code == libc::EACCES => Ok(false),
        _ => Err(err),
    }
}

#[cfg(not(unix))]
fn range_lock(_file: &File, _offset: u64, _len: u64, _kind: LockKind) -> std::io::Result<bool> {
    // No advisory range locks on this platform: every request is granted
    Ok(true)
}
