use serde::{Deserialize, Serialize};

/// How raw field bytes become index key bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyTransform {
    /// Field bytes as stored
    #[default]
    Verbatim,
    /// ASCII upper-cased field bytes (case-insensitive index)
    UpperCase,
    /// Parsed number in an 8-byte order-preserving encoding
    Numeric,
}

/// Key length of a numeric index
pub const NUMERIC_KEY_LENGTH: usize = 8;

impl KeyTransform {
    pub fn tag(self) -> u8 {
        match self {
            Self::Verbatim => 0,
            Self::UpperCase => 1,
            Self::Numeric => 2,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Verbatim),
            1 => Some(Self::UpperCase),
            2 => Some(Self::Numeric),
            _ => None,
        }
    }

    /// Key length for an index over a field of `field_length` bytes
    pub fn key_length(self, field_length: usize) -> usize {
        match self {
            Self::Numeric => NUMERIC_KEY_LENGTH,
            Self::Verbatim | Self::UpperCase => field_length,
        }
    }

    /// Build the full-length key for raw field bytes
    pub fn make_key(self, field: &[u8]) -> Vec<u8> {
        match self {
            Self::Verbatim => field.to_vec(),
            Self::UpperCase => field.to_ascii_uppercase(),
            Self::Numeric => {
                let text = String::from_utf8_lossy(field);
                encode_number(text.trim().parse::<f64>().ok()).to_vec()
            }
        }
    }

    /// Build a search key from user input. Text keys may be shorter than the
    /// index key and then match as a prefix; numeric keys are always complete.
    pub fn make_search_key(self, input: &str) -> Vec<u8> {
        match self {
            Self::Verbatim => input.as_bytes().to_vec(),
            Self::UpperCase => input.as_bytes().to_ascii_uppercase(),
            Self::Numeric => encode_number(input.trim().parse::<f64>().ok()).to_vec(),
        }
    }
}

/// Order-preserving big-endian encoding of an optional number.
/// Blank (unparseable) values sort before every number.
fn encode_number(value: Option<f64>) -> [u8; NUMERIC_KEY_LENGTH] {
    match value {
        None => [0u8; NUMERIC_KEY_LENGTH],
        Some(number) => {
            let bits = number.to_bits();
            let ordered = if bits >> 63 == 1 {
                !bits
            } else {
                bits | (1 << 63)
            };
            ordered.to_be_bytes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_round_trip() {
        for transform in [
            KeyTransform::Verbatim,
            KeyTransform::UpperCase,
            KeyTransform::Numeric,
        ] {
            assert_eq!(KeyTransform::from_tag(transform.tag()), Some(transform));
        }
        assert_eq!(KeyTransform::from_tag(9), None);
    }

    #[test]
    fn test_upper_case_keys() {
        let transform = KeyTransform::UpperCase;
        assert_eq!(transform.make_key(b"smith "), b"SMITH ".to_vec());
        assert_eq!(transform.make_search_key("smi"), b"SMI".to_vec());
    }

    #[test]
    fn test_numeric_keys_sort_like_numbers() {
        let transform = KeyTransform::Numeric;
        let values = ["   -12.5", "    -3", "     0", "   2.25", "    10", "   400"];
        let keys: Vec<Vec<u8>> = values.iter().map(|v| transform.make_key(v.as_bytes())).collect();

        for pair in keys.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        // Blank sorts first
        assert!(transform.make_key(b"      ") < keys[0]);
        assert_eq!(transform.key_length(6), NUMERIC_KEY_LENGTH);
    }
}
