//! Cache module - LRU cache of materialized feature rows

pub mod row_cache;

pub use row_cache::{CacheStats, RowCache};
