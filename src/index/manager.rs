//! Index manager for coordinating spatial indexes
//!
//! One backend per [`IndexLocation`]. Writes go to a pinned location (or the
//! locations named); reads go to the first backend in the query order that
//! reports itself indexed.

use std::sync::Arc;

use ahash::AHashMap;

use crate::config::FeatureIndexConfig;
use crate::storage::FeatureDao;
use crate::types::{BoundingBox, BoundingBoxTransform, Envelope, FeatureRow, Projection, RowId, Timestamp};
use crate::{Result, StorageError};

use super::{
    ExtensionIndex, FeatureIndexResults, IndexBackend, IndexLocation, IndexProgress, MetadataDb, MetadataIndex,
    NoProgress, QueryOrder, SpatialFilter, SpatialIndex,
};

pub struct FeatureIndexManager {
    dao: FeatureDao,
    backends: AHashMap<IndexLocation, IndexBackend>,
    query_order: QueryOrder,
    index_location: Option<IndexLocation>,
    transform: Option<Arc<dyn BoundingBoxTransform>>,
    progress: Option<Box<dyn IndexProgress>>,
}

impl FeatureIndexManager {
    pub fn new(dao: FeatureDao, metadata: MetadataDb, config: &FeatureIndexConfig) -> Result<Self> {
        config.validate()?;

        let mut backends = AHashMap::new();
        backends.insert(
            IndexLocation::Extension,
            IndexBackend::Extension(ExtensionIndex::new(dao.clone(), config.index_batch_size)),
        );
        backends.insert(
            IndexLocation::Metadata,
            IndexBackend::Metadata(MetadataIndex::new(dao.clone(), metadata, config.index_batch_size)),
        );

        Ok(Self {
            dao,
            backends,
            query_order: QueryOrder::new(config.query_order.iter().copied()),
            index_location: config.index_location,
            transform: None,
            progress: None,
        })
    }

    pub fn dao(&self) -> &FeatureDao {
        &self.dao
    }

    pub fn table_name(&self) -> &str {
        self.dao.table_name()
    }

    pub fn backend(&self, location: IndexLocation) -> Result<&IndexBackend> {
        self.backends
            .get(&location)
            .ok_or_else(|| StorageError::UnsupportedLocation(location.to_string()))
    }

    // ---------------------------------------------------------------
    // Configuration
    // ---------------------------------------------------------------

    pub fn query_order(&self) -> &QueryOrder {
        &self.query_order
    }

    pub fn set_query_order(&mut self, order: impl IntoIterator<Item = IndexLocation>) {
        self.query_order = QueryOrder::new(order);
    }

    /// Move `locations` to the front of the query order
    pub fn prioritize_query_order(&mut self, locations: &[IndexLocation]) {
        self.query_order.prioritize(locations);
    }

    pub fn index_location(&self) -> Option<IndexLocation> {
        self.index_location
    }

    pub fn set_index_location(&mut self, location: Option<IndexLocation>) {
        self.index_location = location;
    }

    /// Reprojection used for bounding boxes in a foreign projection
    pub fn set_transform(&mut self, transform: Arc<dyn BoundingBoxTransform>) {
        self.transform = Some(transform);
    }

    pub fn set_progress(&mut self, progress: impl IndexProgress + 'static) {
        self.progress = Some(Box::new(progress));
    }

    pub fn clear_progress(&mut self) {
        self.progress = None;
    }

    fn pinned(&self) -> Result<IndexLocation> {
        self.index_location.ok_or_else(|| {
            StorageError::Configuration(format!(
                "no index location set for table '{}'",
                self.table_name()
            ))
        })
    }

    // ---------------------------------------------------------------
    // Status
    // ---------------------------------------------------------------

    /// Any location in the query order is indexed
    pub fn is_indexed(&self) -> Result<bool> {
        for location in self.query_order.iter() {
            if self.backend(location)?.is_indexed()? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn is_indexed_at(&self, location: IndexLocation) -> Result<bool> {
        self.backend(location)?.is_indexed()
    }

    /// Indexed locations, in query order
    pub fn indexed_types(&self) -> Result<Vec<IndexLocation>> {
        let mut indexed = Vec::new();
        for location in self.query_order.iter() {
            if self.backend(location)?.is_indexed()? {
                indexed.push(location);
            }
        }
        Ok(indexed)
    }

    pub fn last_indexed(&self, location: IndexLocation) -> Result<Option<Timestamp>> {
        self.backend(location)?.last_indexed()
    }

    // ---------------------------------------------------------------
    // Writes
    // ---------------------------------------------------------------

    pub fn index(&mut self, force: bool) -> Result<usize> {
        let location = self.pinned()?;
        self.index_at(location, force)
    }

    pub fn index_at(&mut self, location: IndexLocation, force: bool) -> Result<usize> {
        let mut progress = self.progress.take();
        let result = match progress.as_deref_mut() {
            Some(hook) => self.backend(location).and_then(|b| b.index_table(force, hook)),
            None => self.backend(location).and_then(|b| b.index_table(force, &mut NoProgress)),
        };
        self.progress = progress;

        let indexed = result?;
        tracing::debug!(table = %self.table_name(), %location, force, indexed, "Index pass finished");
        Ok(indexed)
    }

    /// Index at each location; returns the largest count any of them reported
    pub fn index_at_locations(&mut self, locations: &[IndexLocation], force: bool) -> Result<usize> {
        let mut indexed = 0;
        for location in QueryOrder::new(locations.iter().copied()).iter() {
            indexed = indexed.max(self.index_at(location, force)?);
        }
        Ok(indexed)
    }

    pub fn index_row(&self, row: &FeatureRow) -> Result<bool> {
        self.index_row_at(self.pinned()?, row)
    }

    pub fn index_row_at(&self, location: IndexLocation, row: &FeatureRow) -> Result<bool> {
        self.backend(location)?.index_row(row)
    }

    pub fn delete_index(&self) -> Result<bool> {
        self.delete_index_at(self.pinned()?)
    }

    pub fn delete_index_at(&self, location: IndexLocation) -> Result<bool> {
        self.backend(location)?.delete_index()
    }

    pub fn delete_index_at_locations(&self, locations: &[IndexLocation]) -> Result<bool> {
        let mut deleted = false;
        for location in locations {
            deleted |= self.delete_index_at(*location)?;
        }
        Ok(deleted)
    }

    pub fn delete_index_for_id(&self, geometry_id: RowId) -> Result<bool> {
        self.delete_index_for_id_at(self.pinned()?, geometry_id)
    }

    pub fn delete_index_for_id_at(&self, location: IndexLocation, geometry_id: RowId) -> Result<bool> {
        self.backend(location)?.delete_index_for(geometry_id)
    }

    pub fn delete_index_for_id_at_locations(&self, locations: &[IndexLocation], geometry_id: RowId) -> Result<bool> {
        let mut deleted = false;
        for location in locations {
            deleted |= self.delete_index_for_id_at(*location, geometry_id)?;
        }
        Ok(deleted)
    }

    pub fn delete_index_for_row(&self, row: &FeatureRow) -> Result<bool> {
        match row.id() {
            Some(id) => self.delete_index_for_id(id),
            None => Ok(false),
        }
    }

    /// Drop the index at every location
    pub fn delete_all_indexes(&self) -> Result<bool> {
        self.delete_index_at_locations(&IndexLocation::ALL)
    }

    // ---------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------

    /// First backend in query order that is indexed
    fn read_backend(&self) -> Result<&IndexBackend> {
        for location in self.query_order.iter() {
            let backend = self.backend(location)?;
            if backend.is_indexed()? {
                return Ok(backend);
            }
        }
        Err(StorageError::NotIndexed(format!(
            "table '{}' has no index at {:?}",
            self.table_name(),
            self.query_order.as_slice()
        )))
    }

    /// Turn bounding boxes into envelopes in the table's projection
    fn resolve(&self, filter: &SpatialFilter) -> Result<SpatialFilter> {
        Ok(match filter.resolve(self.dao.table(), self.transform.as_deref())? {
            Some(envelope) => SpatialFilter::Envelope(envelope),
            None => SpatialFilter::All,
        })
    }

    pub fn query(&self) -> Result<Box<dyn FeatureIndexResults>> {
        self.query_filter(&SpatialFilter::All)
    }

    pub fn query_envelope(&self, envelope: &Envelope) -> Result<Box<dyn FeatureIndexResults>> {
        self.query_filter(&SpatialFilter::Envelope(*envelope))
    }

    pub fn query_bounding_box(
        &self,
        bbox: &BoundingBox,
        projection: Option<Projection>,
    ) -> Result<Box<dyn FeatureIndexResults>> {
        self.query_filter(&SpatialFilter::BoundingBox(*bbox, projection))
    }

    pub fn query_filter(&self, filter: &SpatialFilter) -> Result<Box<dyn FeatureIndexResults>> {
        let backend = self.read_backend()?;
        backend.query(&self.resolve(filter)?)
    }

    pub fn count(&self) -> Result<u64> {
        self.count_filter(&SpatialFilter::All)
    }

    pub fn count_envelope(&self, envelope: &Envelope) -> Result<u64> {
        self.count_filter(&SpatialFilter::Envelope(*envelope))
    }

    pub fn count_bounding_box(&self, bbox: &BoundingBox, projection: Option<Projection>) -> Result<u64> {
        self.count_filter(&SpatialFilter::BoundingBox(*bbox, projection))
    }

    pub fn count_filter(&self, filter: &SpatialFilter) -> Result<u64> {
        let backend = self.read_backend()?;
        backend.count(&self.resolve(filter)?)
    }

    /// Union of indexed envelopes, from the first indexed location
    pub fn bounds(&self) -> Result<Option<Envelope>> {
        self.read_backend()?.bounds()
    }
}

impl std::fmt::Debug for FeatureIndexManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureIndexManager")
            .field("table", &self.table_name())
            .field("query_order", &self.query_order)
            .field("index_location", &self.index_location)
            .finish()
    }
}
