//! Table and index configuration
//!
//! The page geometry of index files and the record-count width of table
//! headers are chosen here rather than fixed at compile time. A
//! configuration is validated before any file is created with it.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DbfError, DbfResult};
use crate::index::{PAGE_HEADER_SIZE, SLOT_OVERHEAD};

/// Smallest fan-out that still lets a split leave both halves non-empty
pub const MIN_ENTRIES_PER_PAGE: usize = 3;

/// Hard ceiling on tree depth regardless of configuration
pub const MAX_SUPPORTED_LEVELS: usize = 16;

/// Width of the on-disk record count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecPosWidth {
    /// 2-byte record count
    Narrow,
    /// 4-byte record count
    #[default]
    Wide,
}

impl RecPosWidth {
    /// Bytes occupied by the record count in the table header
    pub fn bytes(self) -> usize {
        match self {
            Self::Narrow => 2,
            Self::Wide => 4,
        }
    }

    /// Largest record count the header can hold
    pub fn max_records(self) -> u64 {
        match self {
            Self::Narrow => u64::from(u16::MAX),
            Self::Wide => u64::from(u32::MAX),
        }
    }
}

/// Configuration shared by every table and index opened through a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbfConfig {
    /// Index page size in bytes
    pub page_size: usize,
    /// Maximum B-tree depth
    pub max_levels: usize,
    /// Optional cap on slots per index page (otherwise as many as fit)
    pub max_entries_per_page: Option<usize>,
    /// Longest key an index may be built over
    pub max_key_length: usize,
    /// Maximum number of indexes open on one table
    pub max_index_files: usize,
    /// Width of the record count in newly created tables
    pub rec_pos_width: RecPosWidth,
}

impl DbfConfig {
    pub const DEFAULT_PAGE_SIZE: usize = 1024;
    pub const DEFAULT_MAX_LEVELS: usize = 4;
    pub const DEFAULT_MAX_KEY_LENGTH: usize = 100;
    pub const DEFAULT_MAX_INDEX_FILES: usize = 7;

    /// Load a configuration from a JSON file. Missing fields take their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> DbfResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|err| {
            DbfError::InvalidConfig(format!("cannot read {}: {}", path.display(), err))
        })?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|err| DbfError::InvalidConfig(format!("{}: {}", path.display(), err)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot hold a valid tree
    pub fn validate(&self) -> DbfResult<()> {
        if self.max_levels == 0 || self.max_levels > MAX_SUPPORTED_LEVELS {
            return Err(DbfError::InvalidConfig(format!(
                "max_levels must be between 1 and {}, got {}",
                MAX_SUPPORTED_LEVELS, self.max_levels
            )));
        }

        if self.max_key_length == 0 || self.max_key_length > usize::from(u8::MAX) {
            return Err(DbfError::InvalidConfig(format!(
                "max_key_length must be between 1 and {}, got {}",
                u8::MAX,
                self.max_key_length
            )));
        }

        let min_page = PAGE_HEADER_SIZE + MIN_ENTRIES_PER_PAGE * (SLOT_OVERHEAD + self.max_key_length);
        if self.page_size < min_page {
            return Err(DbfError::InvalidConfig(format!(
                "page_size {} cannot hold {} slots of {}-byte keys (needs {})",
                self.page_size, MIN_ENTRIES_PER_PAGE, self.max_key_length, min_page
            )));
        }

        if let Some(cap) = self.max_entries_per_page
            && cap < MIN_ENTRIES_PER_PAGE
        {
            return Err(DbfError::InvalidConfig(format!(
                "max_entries_per_page must be at least {}, got {}",
                MIN_ENTRIES_PER_PAGE, cap
            )));
        }

        if self.max_index_files == 0 {
            return Err(DbfError::InvalidConfig(
                "max_index_files must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Number of slots an index page holds for keys of `key_length` bytes
    pub fn page_capacity(&self, key_length: usize) -> usize {
        let fit = self.page_size.saturating_sub(PAGE_HEADER_SIZE) / (SLOT_OVERHEAD + key_length);
        let capped = match self.max_entries_per_page {
            Some(cap) => fit.min(cap),
            None => fit,
        };
        capped.min(i16::MAX as usize)
    }
}

impl Default for DbfConfig {
    fn default() -> Self {
        Self {
            page_size: Self::DEFAULT_PAGE_SIZE,
            max_levels: Self::DEFAULT_MAX_LEVELS,
            max_entries_per_page: None,
            max_key_length: Self::DEFAULT_MAX_KEY_LENGTH,
            max_index_files: Self::DEFAULT_MAX_INDEX_FILES,
            rec_pos_width: RecPosWidth::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = DbfConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.page_size, 1024);
        assert_eq!(config.max_levels, 4);
    }

    #[test]
    fn test_page_capacity() {
        let config = DbfConfig::default();
        // (1024 - 8) / (5 + 10)
        assert_eq!(config.page_capacity(10), 67);

        let capped = DbfConfig {
            max_entries_per_page: Some(4),
            ..DbfConfig::default()
        };
        assert_eq!(capped.page_capacity(10), 4);
    }

    #[test]
    fn test_rejects_small_page() {
        let config = DbfConfig {
            page_size: 64,
            ..DbfConfig::default()
        };
        assert!(matches!(config.validate(), Err(DbfError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_bad_levels_and_fanout() {
        let config = DbfConfig {
            max_levels: 0,
            ..DbfConfig::default()
        };
        assert!(config.validate().is_err());

        let config = DbfConfig {
            max_entries_per_page: Some(2),
            ..DbfConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_with_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("dbf.json");
        std::fs::write(&path, r#"{ "page_size": 512, "rec_pos_width": "narrow" }"#).unwrap();

        let config = DbfConfig::from_json_file(&path).unwrap();
        assert_eq!(config.page_size, 512);
        assert_eq!(config.rec_pos_width, RecPosWidth::Narrow);
        assert_eq!(config.max_levels, DbfConfig::DEFAULT_MAX_LEVELS);
    }

    #[test]
    fn test_json_rejects_invalid() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("dbf.json");
        std::fs::write(&path, r#"{ "max_levels": 0 }"#).unwrap();
        assert!(DbfConfig::from_json_file(&path).is_err());
    }
}
