//! Table header codec
//!
//! ```text
//! signature u8 | last_update u8[3] (YY-1900, MM, DD) | record_count u16 or u32
//! header_length u16 | record_length u16 | reserved u8[20]
//! field descriptors, 32 bytes each
//! ```

use crate::config::RecPosWidth;
use crate::error::{DbfError, DbfResult};

use super::RecPos;
use super::field::FIELD_DESCRIPTOR_SIZE;
use super::value::Date;

/// Signature of tables with a 4-byte record count
pub const SIGNATURE_WIDE: u8 = 0x03;

/// Signature of tables with a 2-byte record count
pub const SIGNATURE_NARROW: u8 = 0x02;

const RESERVED_SIZE: usize = 20;

/// Fixed part of the table header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableHeader {
    pub width: RecPosWidth,
    pub last_update: [u8; 3],
    pub record_count: RecPos,
    pub header_length: u16,
    pub record_length: u16,
}

impl TableHeader {
    /// Header for an empty table with `field_count` fields
    pub fn new(width: RecPosWidth, field_count: usize, record_length: usize) -> DbfResult<Self> {
        let header_length = Self::size(width) + field_count * FIELD_DESCRIPTOR_SIZE;
        let header_length = u16::try_from(header_length).map_err(|_| {
            DbfError::CapacityExceeded(format!("{} fields do not fit a table header", field_count))
        })?;
        let record_length = u16::try_from(record_length).map_err(|_| {
            DbfError::CapacityExceeded(format!("record length {} exceeds 65535", record_length))
        })?;

        let mut header = Self {
            width,
            last_update: [0; 3],
            record_count: 0,
            header_length,
            record_length,
        };
        header.touch();
        Ok(header)
    }

    /// Bytes of the fixed part for a record-count width
    pub fn size(width: RecPosWidth) -> usize {
        1 + 3 + width.bytes() + 2 + 2 + RESERVED_SIZE
    }

    /// Width implied by a signature byte
    pub fn width_for_signature(signature: u8) -> DbfResult<RecPosWidth> {
        match signature {
            SIGNATURE_WIDE => Ok(RecPosWidth::Wide),
            SIGNATURE_NARROW => Ok(RecPosWidth::Narrow),
            other => Err(DbfError::InvalidHeader(format!(
                "unknown signature 0x{:02X}",
                other
            ))),
        }
    }

    pub fn signature(&self) -> u8 {
        match self.width {
            RecPosWidth::Wide => SIGNATURE_WIDE,
            RecPosWidth::Narrow => SIGNATURE_NARROW,
        }
    }

    /// Number of fields the header length accounts for
    pub fn field_count(&self) -> usize {
        (usize::from(self.header_length) - Self::size(self.width)) / FIELD_DESCRIPTOR_SIZE
    }

    /// Byte offset of record `record` in the table file
    pub fn record_offset(&self, record: RecPos) -> u64 {
        u64::from(self.header_length) + u64::from(record) * u64::from(self.record_length)
    }

    /// Stamp the header with today's date
    pub fn touch(&mut self) {
        let today = Date::today();
        self.last_update = [
            today.year.saturating_sub(1900).min(255) as u8,
            today.month,
            today.day,
        ];
    }

    /// Date of the last update
    pub fn last_update(&self) -> Option<Date> {
        let [years, month, day] = self.last_update;
        Date::new(1900 + u16::from(years), month, day)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::size(self.width));
        buf.push(self.signature());
        buf.extend_from_slice(&self.last_update);
        match self.width {
            RecPosWidth::Wide => buf.extend_from_slice(&self.record_count.to_le_bytes()),
            RecPosWidth::Narrow => {
                buf.extend_from_slice(&(self.record_count as u16).to_le_bytes())
            }
        }
        buf.extend_from_slice(&self.header_length.to_le_bytes());
        buf.extend_from_slice(&self.record_length.to_le_bytes());
        buf.extend_from_slice(&[0u8; RESERVED_SIZE]);
        buf
    }

    pub fn decode(buf: &[u8]) -> DbfResult<Self> {
        let signature = *buf
            .first()
            .ok_or_else(|| DbfError::InvalidHeader("empty header".to_string()))?;
        let width = Self::width_for_signature(signature)?;
        if buf.len() < Self::size(width) {
            return Err(DbfError::InvalidHeader(format!(
                "header truncated at {} bytes",
                buf.len()
            )));
        }

        let count_end = 4 + width.bytes();
        let record_count = match width {
            RecPosWidth::Wide => u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            RecPosWidth::Narrow => u32::from(u16::from_le_bytes([buf[4], buf[5]])),
        };

        let header = Self {
            width,
            last_update: [buf[1], buf[2], buf[3]],
            record_count,
            header_length: u16::from_le_bytes([buf[count_end], buf[count_end + 1]]),
            record_length: u16::from_le_bytes([buf[count_end + 2], buf[count_end + 3]]),
        };

        let fixed = Self::size(width);
        let header_length = usize::from(header.header_length);
        if header_length < fixed + FIELD_DESCRIPTOR_SIZE
            || (header_length - fixed) % FIELD_DESCRIPTOR_SIZE != 0
        {
            return Err(DbfError::InvalidHeader(format!(
                "header length {} is not {} plus a whole number of field descriptors",
                header_length, fixed
            )));
        }
        if header.record_length < 2 {
            return Err(DbfError::InvalidHeader(format!(
                "record length {} too small",
                header.record_length
            )));
        }

        Ok(header)
    }
}
