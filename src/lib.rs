//! geofeature: spatially indexed feature access
//!
//! 基于 SQLite 的要素表访问层：空间索引 + 大 blob 恢复 + 行缓存
//!
//! ## 核心特性
//! - Two interchangeable spatial index locations: in-store extension tables
//!   or a private metadata side database
//! - Uniform, lazy query results over either location
//! - Rows whose blobs overflow the driver's cursor window are re-read in
//!   1 MiB `substr` chunks instead of failing
//! - Per-table LRU row cache
//!
//! ## 架构
//! - 存储层: `SqlConnection` → `WindowedCursor` → `FeatureCursor` (recovery) → `FeatureDao`
//! - 索引层: `ExtensionIndex` / `MetadataIndex` behind `SpatialIndex`, coordinated by `FeatureIndexManager`
//! - 缓存层: `RowCache`
//!
//! ```no_run
//! use geofeature::{Envelope, FeatureDao, FeatureIndexConfig, FeatureIndexManager, FeatureStore, IndexLocation, MetadataDb, ResultsExt};
//!
//! # fn main() -> geofeature::Result<()> {
//! let config = FeatureIndexConfig::default().with_index_location(IndexLocation::Extension);
//! let store = FeatureStore::open("roads.gpkg")?;
//! let dao = FeatureDao::new(store, "roads", &config)?;
//! let mut manager = FeatureIndexManager::new(dao, MetadataDb::open("metadata.db")?, &config)?;
//!
//! manager.index(false)?;
//! let ids = manager.query_envelope(&Envelope::new(0.0, 12.0, 0.0, 12.0)?)?.collect_ids()?;
//! # let _ = ids;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod storage;
pub mod index;
pub mod types;
pub mod cache;  // per-table row cache

mod error;

#[cfg(test)]
pub(crate) mod testing;

pub use config::FeatureIndexConfig;
pub use error::{Result, StorageError};

// 主要对外 API
pub use storage::{FeatureCursor, FeatureDao, FeatureStore, FeatureTable, InvalidPositions, QuerySpec};
pub use index::{
    FeatureIndexManager, FeatureIndexResults, GeometryIndexEntry, IndexLocation, IndexProgress, MetadataDb,
    QueryOrder, ResultsExt, SpatialFilter, SpatialIndex,
};
pub use cache::{CacheStats, RowCache};
pub use types::{BoundingBox, BoundingBoxTransform, Envelope, FeatureRow, Projection, RowId, Timestamp, Value};
