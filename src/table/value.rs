use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{DbfError, DbfResult};

use super::field::{FieldDescriptor, FieldType};

/// Calendar date stored by `D` fields as `YYYYMMDD`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Date {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

impl Date {
    pub fn new(year: u16, month: u8, day: u8) -> Option<Self> {
        let valid = (1..=9999).contains(&year)
            && (1..=12).contains(&month)
            && day >= 1
            && day <= days_in_month(year, month);
        valid.then_some(Self { year, month, day })
    }

    /// Current UTC date
    pub fn today() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0);
        Self::from_days_since_epoch((secs / 86_400) as i64)
    }

    /// Convert a day count relative to 1970-01-01 to a civil date
    pub fn from_days_since_epoch(days: i64) -> Self {
        let z = days + 719_468;
        let era = z.div_euclid(146_097);
        let doe = z.rem_euclid(146_097);
        let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
        let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
        let mp = (5 * doy + 2) / 153;
        let day = doy - (153 * mp + 2) / 5 + 1;
        let month = if mp < 10 { mp + 3 } else { mp - 9 };
        let year = yoe + era * 400 + i64::from(month <= 2);

        Self {
            year: year.clamp(1, 9999) as u16,
            month: month as u8,
            day: day as u8,
        }
    }

    /// Parse `YYYYMMDD` or `YYYY-MM-DD`
    pub fn parse(text: &str) -> Option<Self> {
        let digits: String = text.chars().filter(|c| *c != '-').collect();
        if digits.len() != 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let year = digits[0..4].parse().ok()?;
        let month = digits[4..6].parse().ok()?;
        let day = digits[6..8].parse().ok()?;
        Self::new(year, month, day)
    }

    /// `YYYYMMDD` as stored on disk
    pub fn to_stored(self) -> String {
        format!("{:04}{:02}{:02}", self.year, self.month, self.day)
    }
}

impl fmt::Display for Date {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

fn days_in_month(year: u16, month: u8) -> u8 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 if year % 4 == 0 && (year % 100 != 0 || year % 400 == 0) => 29,
        2 => 28,
        _ => 0,
    }
}

/// A single field value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Text(String),
    Number(f64),
    Logical(bool),
    Date(Date),
    /// Blank field (`?` for logicals)
    Null,
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Encode into exactly `field.length` bytes
    pub fn encode(&self, field: &FieldDescriptor) -> DbfResult<Vec<u8>> {
        let width = usize::from(field.length);
        let invalid = |reason: String| DbfError::InvalidValue {
            field: field.name.clone(),
            reason,
        };

        let bytes = match (self, field.field_type) {
            (Value::Null, FieldType::Logical) => b"?".to_vec(),
            (Value::Null, _) => vec![b' '; width],
            (Value::Text(text), FieldType::Character) => {
                if text.len() > width {
                    return Err(invalid(format!(
                        "{} bytes do not fit a {}-byte field",
                        text.len(),
                        width
                    )));
                }
                let mut bytes = text.as_bytes().to_vec();
                bytes.resize(width, b' ');
                bytes
            }
            (Value::Number(number), FieldType::Numeric) => {
                if !number.is_finite() {
                    return Err(invalid(format!("{} is not a finite number", number)));
                }
                let text = format!(
                    "{:>width$.prec$}",
                    number,
                    width = width,
                    prec = usize::from(field.decimals)
                );
                if text.len() > width {
                    return Err(invalid(format!(
                        "{} needs {} characters, field holds {}",
                        text.trim(),
                        text.len(),
                        width
                    )));
                }
                text.into_bytes()
            }
            (Value::Logical(flag), FieldType::Logical) => {
                if *flag {
                    b"T".to_vec()
                } else {
                    b"F".to_vec()
                }
            }
            (Value::Date(date), FieldType::Date) => date.to_stored().into_bytes(),
            (value, field_type) => {
                return Err(invalid(format!(
                    "{:?} does not match field type {}",
                    value,
                    field_type.tag() as char
                )));
            }
        };

        Ok(bytes)
    }

    /// Decode the stored bytes of `field`
    pub fn decode(bytes: &[u8], field: &FieldDescriptor) -> DbfResult<Self> {
        if bytes.len() != usize::from(field.length) {
            return Err(DbfError::InvalidValue {
                field: field.name.clone(),
                reason: format!(
                    "expected {} bytes, got {}",
                    field.length,
                    bytes.len()
                ),
            });
        }

        let text = String::from_utf8_lossy(bytes);
        let trimmed = text.trim();
        let invalid = || DbfError::InvalidValue {
            field: field.name.clone(),
            reason: format!("cannot decode {:?}", trimmed),
        };

        match field.field_type {
            FieldType::Character => Ok(Value::Text(text.trim_end().to_string())),
            FieldType::Numeric if trimmed.is_empty() => Ok(Value::Null),
            FieldType::Numeric => trimmed
                .parse::<f64>()
                .map(Value::Number)
                .map_err(|_| invalid()),
            FieldType::Logical => match trimmed {
                "T" | "t" | "Y" | "y" => Ok(Value::Logical(true)),
                "F" | "f" | "N" | "n" => Ok(Value::Logical(false)),
                _ => Ok(Value::Null),
            },
            FieldType::Date if trimmed.is_empty() => Ok(Value::Null),
            FieldType::Date => Date::parse(trimmed).map(Value::Date).ok_or_else(invalid),
        }
    }

    /// Parse user input (command line, CSV) for `field`. Empty input is null.
    pub fn parse(input: &str, field: &FieldDescriptor) -> DbfResult<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Ok(Value::Null);
        }

        let invalid = || DbfError::InvalidValue {
            field: field.name.clone(),
            reason: format!("cannot parse {:?}", trimmed),
        };

        match field.field_type {
            FieldType::Character => Ok(Value::Text(input.trim_end().to_string())),
            FieldType::Numeric => trimmed
                .parse::<f64>()
                .map(Value::Number)
                .map_err(|_| invalid()),
            FieldType::Logical => match trimmed.to_ascii_lowercase().as_str() {
                "t" | "y" | "true" | "yes" => Ok(Value::Logical(true)),
                "f" | "n" | "false" | "no" => Ok(Value::Logical(false)),
                _ => Err(invalid()),
            },
            FieldType::Date => Date::parse(trimmed).map(Value::Date).ok_or_else(invalid),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(text) => write!(f, "{}", text),
            Value::Number(number) => write!(f, "{}", number),
            Value::Logical(true) => write!(f, "T"),
            Value::Logical(false) => write!(f, "F"),
            Value::Date(date) => write!(f, "{}", date),
            Value::Null => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(field_type: FieldType, length: u8, decimals: u8) -> FieldDescriptor {
        FieldDescriptor::new("F", field_type, length, decimals).unwrap()
    }

    #[test]
    fn test_character_padding() {
        let name = field(FieldType::Character, 6, 0);
        let bytes = Value::Text("Ann".to_string()).encode(&name).unwrap();
        assert_eq!(bytes, b"Ann   ".to_vec());
        assert_eq!(
            Value::decode(&bytes, &name).unwrap(),
            Value::Text("Ann".to_string())
        );

        let long = Value::Text("Annabelle".to_string());
        assert!(matches!(
            long.encode(&name),
            Err(DbfError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_numeric_right_justified() {
        let amount = field(FieldType::Numeric, 8, 2);
        let bytes = Value::Number(-12.5).encode(&amount).unwrap();
        assert_eq!(bytes, b"  -12.50".to_vec());
        assert_eq!(Value::decode(&bytes, &amount).unwrap(), Value::Number(-12.5));

        assert!(Value::Number(1_000_000.0).encode(&amount).is_err());
        assert_eq!(
            Value::decode(b"        ", &amount).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_logical_and_null() {
        let flag = field(FieldType::Logical, 1, 0);
        assert_eq!(Value::Logical(true).encode(&flag).unwrap(), b"T".to_vec());
        assert_eq!(Value::Null.encode(&flag).unwrap(), b"?".to_vec());
        assert_eq!(Value::decode(b"?", &flag).unwrap(), Value::Null);
        assert_eq!(Value::decode(b"y", &flag).unwrap(), Value::Logical(true));
    }

    #[test]
    fn test_date_values() {
        let born = field(FieldType::Date, 8, 0);
        let date = Date::new(1999, 12, 31).unwrap();
        let bytes = Value::Date(date).encode(&born).unwrap();
        assert_eq!(bytes, b"19991231".to_vec());
        assert_eq!(Value::decode(&bytes, &born).unwrap(), Value::Date(date));

        assert_eq!(Date::parse("2024-02-29"), Date::new(2024, 2, 29));
        assert_eq!(Date::parse("2023-02-29"), None);
        assert!(Value::decode(b"20231399", &born).is_err());
    }

    #[test]
    fn test_type_mismatch() {
        let name = field(FieldType::Character, 6, 0);
        assert!(matches!(
            Value::Number(1.0).encode(&name),
            Err(DbfError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_parse_input() {
        let amount = field(FieldType::Numeric, 6, 1);
        assert_eq!(Value::parse(" 3.5 ", &amount).unwrap(), Value::Number(3.5));
        assert_eq!(Value::parse("", &amount).unwrap(), Value::Null);
        assert!(Value::parse("abc", &amount).is_err());

        let flag = field(FieldType::Logical, 1, 0);
        assert_eq!(Value::parse("yes", &flag).unwrap(), Value::Logical(true));
    }

    #[test]
    fn test_civil_date_from_days() {
        assert_eq!(Date::from_days_since_epoch(0), Date::new(1970, 1, 1).unwrap());
        assert_eq!(Date::from_days_since_epoch(19_723), Date::new(2024, 1, 1).unwrap());
        assert_eq!(Date::from_days_since_epoch(11_016), Date::new(2000, 2, 29).unwrap());
    }
}
