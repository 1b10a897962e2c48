//! Feature index configuration
//!
//! Controls the cursor window the driver enforces, the chunk size used to
//! repair oversized blobs, the backend query order and the row cache size.

use serde::{Deserialize, Serialize};

use crate::index::IndexLocation;
use crate::{Result, StorageError};

/// 默认 cursor window：2 MiB（与常见移动端 SQLite 驱动一致）
pub const DEFAULT_CURSOR_WINDOW_SIZE: usize = 2 * 1024 * 1024;

/// Blob repair chunk: 1 MiB per `substr` fetch
pub const DEFAULT_BLOB_CHUNK_SIZE: usize = 1024 * 1024;

pub const DEFAULT_INDEX_BATCH_SIZE: usize = 1000;

pub const DEFAULT_ROW_CACHE_SIZE: usize = 1000;

/// Feature index configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureIndexConfig {
    /// Maximum bytes a single cursor window can hold.
    ///
    /// A row larger than this cannot be read in the normal pass and goes
    /// through blob recovery.
    pub cursor_window_size: usize,

    /// Bytes fetched per `substr` call during blob recovery.
    ///
    /// Must not exceed `cursor_window_size`.
    pub blob_chunk_size: usize,

    /// Rows per progress report while building an index
    pub index_batch_size: usize,

    /// 🚀 Backend consultation order for unqualified queries
    pub query_order: Vec<IndexLocation>,

    /// Location used by unqualified `index()` / `delete_index()` calls
    pub index_location: Option<IndexLocation>,

    /// Rows kept per table by the row cache
    ///
    /// Memory usage: row width × row_cache_size × cached tables
    pub row_cache_size: usize,
}

impl Default for FeatureIndexConfig {
    fn default() -> Self {
        Self {
            cursor_window_size: DEFAULT_CURSOR_WINDOW_SIZE,
            blob_chunk_size: DEFAULT_BLOB_CHUNK_SIZE,
            index_batch_size: DEFAULT_INDEX_BATCH_SIZE,
            query_order: IndexLocation::default_order(),
            index_location: None,
            row_cache_size: DEFAULT_ROW_CACHE_SIZE,
        }
    }
}

impl FeatureIndexConfig {
    /// 创建测试用配置（小 window，方便触发 blob 恢复）
    pub fn for_testing() -> Self {
        Self {
            cursor_window_size: 16 * 1024,
            blob_chunk_size: 4 * 1024,
            index_batch_size: 2,
            row_cache_size: 16,
            ..Default::default()
        }
    }

    pub fn with_index_location(mut self, location: IndexLocation) -> Self {
        self.index_location = Some(location);
        self
    }

    pub fn with_query_order(mut self, order: Vec<IndexLocation>) -> Self {
        self.query_order = order;
        self
    }

    pub fn with_cursor_window_size(mut self, bytes: usize) -> Self {
        self.cursor_window_size = bytes;
        self
    }

    pub fn with_blob_chunk_size(mut self, bytes: usize) -> Self {
        self.blob_chunk_size = bytes;
        self
    }

    /// Load from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cursor_window_size == 0 {
            return Err(StorageError::Configuration("cursor_window_size must be > 0".to_string()));
        }
        if self.blob_chunk_size == 0 || self.blob_chunk_size > self.cursor_window_size {
            return Err(StorageError::Configuration(format!(
                "blob_chunk_size must be in 1..={} (got {})",
                self.cursor_window_size, self.blob_chunk_size
            )));
        }
        if self.index_batch_size == 0 {
            return Err(StorageError::Configuration("index_batch_size must be > 0".to_string()));
        }
        if self.query_order.is_empty() {
            return Err(StorageError::Configuration("query_order must name at least one location".to_string()));
        }
        Ok(())
    }
}
