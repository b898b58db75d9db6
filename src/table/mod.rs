//! Record store
//!
//! A table file is a header, one 32-byte descriptor per field, then
//! fixed-length records. Each record starts with a status byte followed by
//! the fields in descriptor order.

mod field;
mod header;
mod value;
mod work_area;

pub use field::{FIELD_DESCRIPTOR_SIZE, FieldDescriptor, FieldType, MAX_FIELD_NAME};
pub use header::{SIGNATURE_NARROW, SIGNATURE_WIDE, TableHeader};
pub use value::{Date, Value};
pub use work_area::{
    LOCK_LENGTH, LOCK_OFFSET, STATUS_DELETED, STATUS_LIVE, ShareMode, WorkArea,
};

/// Record number, 0-based
pub type RecPos = u32;
