use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("File already exists: {0}")]
    FileAlreadyExists(String),

    #[error("Short read: wanted {wanted} bytes at offset {offset}, file holds {size}")]
    ShortRead { offset: u64, wanted: usize, size: u64 },

    #[error("File is opened read-only: {0}")]
    ReadOnly(String),

    #[error("Injected fault: {0}")]
    Injected(&'static str),
}

pub type FileResult<T> = Result<T, FileError>;
