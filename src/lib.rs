//! Flat-file record tables with B-tree indexes
//!
//! Tables are fixed-length record files with a typed field header. Each
//! table may have several index files, each a paged B-tree over one field.
//! Sessions sharing a table coordinate through an advisory lock.

pub mod config;
pub mod error;
pub mod file;
pub mod index;
pub mod session;
pub mod table;


pub use config::{DbfConfig, RecPosWidth};
pub use error::{DbfError, DbfResult};
pub use file::{AccessMode, BlockFile, DiskStorage, FileError, MemoryStorage, Storage};
pub use index::{IndexEntry, IndexPack, KeyTransform};
pub use session::{TableHandle, Workspace};
pub use table::{Date, FieldDescriptor, FieldType, RecPos, ShareMode, Value, WorkArea};
