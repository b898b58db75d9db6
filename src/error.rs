use thiserror::Error;

use crate::file::FileError;
use crate::table::RecPos;

/// Errors surfaced by table, index and session operations
#[derive(Debug, Error)]
pub enum DbfError {
    #[error("Table is not open")]
    NotOpen,

    #[error("Table is opened read-only")]
    ReadOnly,

    #[error("No index is open on this table")]
    NoIndex,

    #[error("Lock denied on {0}")]
    LockDenied(String),

    #[error("I/O error: {0}")]
    Io(#[from] FileError),

    #[error("Corrupt index page {page}: {reason}")]
    CorruptPage { page: u16, reason: String },

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Record {record} out of range (record count {count})")]
    OutOfRange { record: RecPos, count: RecPos },

    #[error("Invalid table header: {0}")]
    InvalidHeader(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Field not found: {0}")]
    FieldNotFound(String),

    #[error("Invalid field definition: {0}")]
    InvalidField(String),

    #[error("Invalid value for field {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Write would change the key of the index on field {0}")]
    IndexedKeyChanged(String),
}

pub type DbfResult<T> = Result<T, DbfError>;

impl DbfError {
    pub(crate) fn corrupt(page: u16, reason: impl Into<String>) -> Self {
        Self::CorruptPage {
            page,
            reason: reason.into(),
        }
    }
}
