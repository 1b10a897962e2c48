//! Row Cache - per-table LRU cache of feature rows
//!
//! **Purpose**: Avoid re-reading (and re-repairing) rows the caller keeps
//! coming back to, e.g. while drawing the same tiles again
//!
//! **Memory**: capacity applies to each table separately, so the bound is
//! capacity × cached tables rows
//!
//! Invalid rows are never cached. Resizing only affects later insertions.

use ahash::AHashMap;
use lru::LruCache;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::config::FeatureIndexConfig;
use crate::storage::FeatureDao;
use crate::types::{FeatureRow, RowId};
use crate::Result;

struct CacheInner {
    /// table_name -> (row_id -> Arc<FeatureRow>)
    tables: AHashMap<String, LruCache<RowId, Arc<FeatureRow>>>,
    capacity: usize,
}

/// Row cache with per-table LRU eviction
#[derive(Clone)]
pub struct RowCache {
    inner: Arc<RwLock<CacheInner>>,

    /// Statistics
    stats: Arc<RwLock<CacheStats>>,
}

/// Cache statistics
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CacheStats {
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses
    pub misses: u64,
    /// Rows evicted to make room
    pub evictions: u64,
    /// Current cache size (all tables)
    pub size: usize,
    /// Per-table capacity
    pub capacity: usize,
}

impl CacheStats {
    /// Calculate hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl RowCache {
    /// Create a new row cache
    ///
    /// # Arguments
    /// * `capacity` - Maximum rows kept per table (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(RwLock::new(CacheInner {
                tables: AHashMap::new(),
                capacity,
            })),
            stats: Arc::new(RwLock::new(CacheStats {
                capacity,
                ..Default::default()
            })),
        }
    }

    pub fn from_config(config: &FeatureIndexConfig) -> Self {
        Self::new(config.row_cache_size)
    }

    /// Get a row from cache and mark it recently used
    pub fn get(&self, table_name: &str, row_id: RowId) -> Option<Arc<FeatureRow>> {
        let row = {
            let mut inner = self.inner.write();
            inner
                .tables
                .get_mut(table_name)
                .and_then(|rows| rows.get(&row_id))
                .cloned()
        };

        let mut stats = self.stats.write();
        if row.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
        row
    }

    /// Put a row into the cache, keyed by its table and id.
    ///
    /// Returns false (and caches nothing) for invalid rows.
    pub fn put(&self, row: FeatureRow) -> bool {
        let Some(row_id) = row.id().filter(|_| row.is_valid()) else {
            return false;
        };

        let mut inner = self.inner.write();
        let capacity = inner.capacity;
        let rows = inner
            .tables
            .entry(row.table().to_string())
            .or_insert_with(LruCache::unbounded);

        let mut evicted = 0u64;
        if !rows.contains(&row_id) {
            while rows.len() >= capacity {
                match rows.pop_lru() {
                    Some((old_id, _)) => {
                        evicted += 1;
                        tracing::trace!(table = %row.table(), row_id = old_id, "Evicted cached row");
                    }
                    None => break,
                }
            }
        }
        rows.put(row_id, Arc::new(row));

        let size = inner.tables.values().map(LruCache::len).sum();
        drop(inner);

        let mut stats = self.stats.write();
        stats.evictions += evicted;
        stats.size = size;
        true
    }

    /// Read through the cache, loading misses from `dao`
    pub fn get_or_read(&self, dao: &FeatureDao, row_id: RowId) -> Result<Option<Arc<FeatureRow>>> {
        if let Some(row) = self.get(dao.table_name(), row_id) {
            return Ok(Some(row));
        }
        let Some(row) = dao.get_row(row_id)? else {
            return Ok(None);
        };
        let shared = Arc::new(row.clone());
        self.put(row);
        Ok(Some(shared))
    }

    /// Invalidate a single row
    ///
    /// Called when row is updated or deleted
    pub fn remove(&self, table_name: &str, row_id: RowId) -> Option<Arc<FeatureRow>> {
        let mut inner = self.inner.write();
        let removed = inner.tables.get_mut(table_name).and_then(|rows| rows.pop(&row_id));
        let size = inner.tables.values().map(LruCache::len).sum();
        drop(inner);

        self.stats.write().size = size;
        removed
    }

    /// Change per-table capacity. Tables above the new capacity shrink as
    /// rows are added, not now.
    pub fn resize(&self, capacity: usize) {
        let capacity = capacity.max(1);
        self.inner.write().capacity = capacity;
        self.stats.write().capacity = capacity;
        tracing::debug!(capacity, "Resized row cache");
    }

    pub fn capacity(&self) -> usize {
        self.inner.read().capacity
    }

    /// Empty one table's rows; the table stays known to the cache
    pub fn clear_table(&self, table_name: &str) {
        let mut inner = self.inner.write();
        if let Some(rows) = inner.tables.get_mut(table_name) {
            rows.clear();
        }
        let size = inner.tables.values().map(LruCache::len).sum();
        drop(inner);

        self.stats.write().size = size;
    }

    /// Clear entire cache
    pub fn clear(&self) {
        self.inner.write().tables.clear();

        let mut stats = self.stats.write();
        stats.size = 0;
        stats.hits = 0;
        stats.misses = 0;
        stats.evictions = 0;
    }

    /// Tables with a cache map, sorted
    pub fn tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self.inner.read().tables.keys().cloned().collect();
        tables.sort();
        tables
    }

    /// Rows cached for one table
    pub fn len(&self, table_name: &str) -> usize {
        self.inner
            .read()
            .tables
            .get(table_name)
            .map_or(0, LruCache::len)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().tables.values().all(LruCache::is_empty)
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        self.stats.read().clone()
    }
}

impl Default for RowCache {
    fn default() -> Self {
        Self::from_config(&FeatureIndexConfig::default())
    }
}

impl std::fmt::Debug for RowCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowCache").field("stats", &self.stats()).finish()
    }
}
