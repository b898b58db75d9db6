use std::sync::LazyLock;

use regex::Regex;

use crate::error::{DbfError, DbfResult};

/// Bytes of one field descriptor in the table header
pub const FIELD_DESCRIPTOR_SIZE: usize = 32;

/// Longest field name
pub const MAX_FIELD_NAME: usize = 10;

const FIELD_NAME_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]{0,9}$";

static FIELD_NAME: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(FIELD_NAME_PATTERN));

/// Field type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// `C`: left-justified text, space padded
    Character,
    /// `N`: right-justified ASCII number
    Numeric,
    /// `L`: `T`, `F` or `?`
    Logical,
    /// `D`: `YYYYMMDD`
    Date,
}

impl FieldType {
    pub fn tag(self) -> u8 {
        match self {
            Self::Character => b'C',
            Self::Numeric => b'N',
            Self::Logical => b'L',
            Self::Date => b'D',
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag.to_ascii_uppercase() {
            b'C' => Some(Self::Character),
            b'N' => Some(Self::Numeric),
            b'L' => Some(Self::Logical),
            b'D' => Some(Self::Date),
            _ => None,
        }
    }
}

/// One field of a table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Upper-cased name
    pub name: String,
    pub field_type: FieldType,
    /// Byte offset within a record, counting the status byte
    pub offset: usize,
    pub length: u8,
    pub decimals: u8,
}

impl FieldDescriptor {
    /// Validate and build a descriptor. The offset is assigned when the
    /// table layout is computed.
    pub fn new(name: &str, field_type: FieldType, length: u8, decimals: u8) -> DbfResult<Self> {
        let pattern = FIELD_NAME
            .as_ref()
            .map_err(|err| DbfError::InvalidField(format!("field name pattern: {}", err)))?;
        if !pattern.is_match(name) {
            return Err(DbfError::InvalidField(format!(
                "{:?} is not a valid field name (1-{} letters, digits or underscores)",
                name, MAX_FIELD_NAME
            )));
        }
        let name = name.to_ascii_uppercase();

        let invalid = |reason: &str| DbfError::InvalidField(format!("{}: {}", name, reason));
        match field_type {
            FieldType::Character if length == 0 => return Err(invalid("length must be at least 1")),
            FieldType::Numeric if length == 0 || length > 20 => {
                return Err(invalid("numeric length must be 1..=20"));
            }
            FieldType::Numeric if decimals > 0 && usize::from(decimals) + 2 > usize::from(length) => {
                return Err(invalid("too many decimal places for the length"));
            }
            FieldType::Logical if length != 1 => return Err(invalid("logical length must be 1")),
            FieldType::Date if length != 8 => return Err(invalid("date length must be 8")),
            _ => {}
        }

        let decimals = if field_type == FieldType::Numeric { decimals } else { 0 };
        Ok(Self {
            name,
            field_type,
            offset: 0,
            length,
            decimals,
        })
    }

    pub fn character(name: &str, length: u8) -> DbfResult<Self> {
        Self::new(name, FieldType::Character, length, 0)
    }

    pub fn numeric(name: &str, length: u8, decimals: u8) -> DbfResult<Self> {
        Self::new(name, FieldType::Numeric, length, decimals)
    }

    pub fn logical(name: &str) -> DbfResult<Self> {
        Self::new(name, FieldType::Logical, 1, 0)
    }

    pub fn date(name: &str) -> DbfResult<Self> {
        Self::new(name, FieldType::Date, 8, 0)
    }

    /// Parse a `NAME:TYPE:LENGTH[:DECIMALS]` definition, e.g. `SALARY:N:8:2`
    pub fn parse_definition(text: &str) -> DbfResult<Self> {
        let parts: Vec<&str> = text.split(':').map(str::trim).collect();
        let invalid = || DbfError::InvalidField(format!("cannot parse definition {:?}", text));

        let (name, tag) = match parts.as_slice() {
            [name, tag, ..] if tag.len() == 1 => (*name, tag.as_bytes()[0]),
            _ => return Err(invalid()),
        };
        let field_type = FieldType::from_tag(tag).ok_or_else(invalid)?;

        let number = |index: usize, default: u8| -> DbfResult<u8> {
            match parts.get(index) {
                Some(part) => part.parse().map_err(|_| invalid()),
                None => Ok(default),
            }
        };
        let default_length = match field_type {
            FieldType::Logical => 1,
            FieldType::Date => 8,
            FieldType::Character | FieldType::Numeric => 0,
        };

        Self::new(name, field_type, number(2, default_length)?, number(3, 0)?)
    }

    /// Serialize into the 32-byte header form
    pub fn encode(&self) -> [u8; FIELD_DESCRIPTOR_SIZE] {
        let mut buf = [0u8; FIELD_DESCRIPTOR_SIZE];
        // Name is NUL terminated within 11 bytes
        let name = self.name.as_bytes();
        buf[..name.len()].copy_from_slice(name);
        buf[11] = self.field_type.tag();
        buf[12..16].copy_from_slice(&(self.offset as u32).to_le_bytes());
        buf[16] = self.length;
        buf[17] = self.decimals;
        buf
    }

    /// Deserialize a header entry. The stored offset is ignored.
    pub fn decode(buf: &[u8]) -> DbfResult<Self> {
        if buf.len() < FIELD_DESCRIPTOR_SIZE {
            return Err(DbfError::InvalidHeader(
                "field descriptor truncated".to_string(),
            ));
        }

        let name_end = buf[..11].iter().position(|&b| b == 0).unwrap_or(11);
        let name = String::from_utf8_lossy(&buf[..name_end]).into_owned();
        let field_type = FieldType::from_tag(buf[11]).ok_or_else(|| {
            DbfError::InvalidHeader(format!("field {} has unknown type {:?}", name, buf[11] as char))
        })?;

        Self::new(&name, field_type, buf[16], buf[17])
            .map_err(|err| DbfError::InvalidHeader(err.to_string()))
    }
}

/// Assign record offsets to `fields` (after the status byte) and return the
/// record length
pub(crate) fn layout_fields(fields: &mut [FieldDescriptor]) -> usize {
    let mut offset = 1;
    for field in fields.iter_mut() {
        field.offset = offset;
        offset += usize::from(field.length);
    }
    offset
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_validation() {
        assert_eq!(FieldDescriptor::character("name", 10).unwrap().name, "NAME");
        assert!(FieldDescriptor::character("_id2", 4).is_ok());
        assert!(FieldDescriptor::character("2fast", 4).is_err());
        assert!(FieldDescriptor::character("ELEVENCHARS", 4).is_err());
        assert!(FieldDescriptor::character("", 4).is_err());
    }

    #[test]
    fn test_name_pattern_shared_across_calls() {
        assert!(FIELD_NAME.is_ok());
        let first = FIELD_NAME.as_ref().unwrap() as *const Regex;
        for i in 0..3 {
            FieldDescriptor::character(&format!("F{}", i), 1).unwrap();
        }
        assert_eq!(FIELD_NAME.as_ref().unwrap() as *const Regex, first);
    }

    #[test]
    fn test_type_constraints() {
        assert!(FieldDescriptor::new("F", FieldType::Logical, 2, 0).is_err());
        assert!(FieldDescriptor::new("F", FieldType::Date, 6, 0).is_err());
        assert!(FieldDescriptor::numeric("F", 4, 3).is_err());
        assert!(FieldDescriptor::numeric("F", 8, 2).is_ok());
        assert!(FieldDescriptor::character("F", 0).is_err());
    }

    #[test]
    fn test_descriptor_bytes() {
        let mut fields = vec![
            FieldDescriptor::character("NAME", 12).unwrap(),
            FieldDescriptor::numeric("SALARY", 8, 2).unwrap(),
        ];
        assert_eq!(layout_fields(&mut fields), 21);

        let bytes = fields[1].encode();
        assert_eq!(&bytes[..7], b"SALARY\0");
        assert_eq!(bytes[11], b'N');
        assert_eq!(&bytes[12..16], &13u32.to_le_bytes());
        assert_eq!(bytes[16], 8);
        assert_eq!(bytes[17], 2);

        let mut decoded = FieldDescriptor::decode(&bytes).unwrap();
        decoded.offset = 13;
        assert_eq!(decoded, fields[1]);
    }

    #[test]
    fn test_decode_unknown_type() {
        let mut bytes = FieldDescriptor::logical("OK").unwrap().encode();
        bytes[11] = b'X';
        assert!(matches!(
            FieldDescriptor::decode(&bytes),
            Err(DbfError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_parse_definition() {
        let field = FieldDescriptor::parse_definition("salary:N:8:2").unwrap();
        assert_eq!(field.name, "SALARY");
        assert_eq!(field.field_type, FieldType::Numeric);
        assert_eq!((field.length, field.decimals), (8, 2));

        assert_eq!(
            FieldDescriptor::parse_definition("born:D").unwrap().length,
            8
        );
        assert!(FieldDescriptor::parse_definition("name:C").is_err());
        assert!(FieldDescriptor::parse_definition("name").is_err());
    }
}
