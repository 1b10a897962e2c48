//! Index layer implementation
//!
//! Geometry-id → envelope indexes over one feature table, at two locations:
//! inside the feature store itself (`Extension`) or in a private side
//! database (`Metadata`). [`FeatureIndexManager`] picks between them.

mod manager;
pub mod extension;
pub mod metadata;
pub mod query_order;
pub mod results;

pub use manager::FeatureIndexManager;
pub use extension::ExtensionIndex;
pub use metadata::{MetadataDb, MetadataIndex};
pub use query_order::QueryOrder;
pub use results::{
    CursorResults, ExtensionResults, FeatureIndexResults, Ids, ListResults, MetadataResults,
    MultiplexResults, ResultsExt, Rows,
};

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::storage::{FeatureDao, FeatureTable, QuerySpec};
use crate::types::{BoundingBox, BoundingBoxTransform, Envelope, Projection, RowId, Timestamp, Value};
use crate::{Result, StorageError};

/// Where a spatial index lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexLocation {
    /// Index tables inside the feature store
    Extension,
    /// Private side database keyed by store name
    Metadata,
}

impl IndexLocation {
    pub const ALL: [IndexLocation; 2] = [IndexLocation::Extension, IndexLocation::Metadata];

    pub fn default_order() -> Vec<IndexLocation> {
        Self::ALL.to_vec()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IndexLocation::Extension => "extension",
            IndexLocation::Metadata => "metadata",
        }
    }
}

impl FromStr for IndexLocation {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "extension" => Ok(IndexLocation::Extension),
            "metadata" => Ok(IndexLocation::Metadata),
            _ => Err(StorageError::UnsupportedLocation(s.to_string())),
        }
    }
}

impl fmt::Display for IndexLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Spatial predicate for query/count
#[derive(Debug, Clone, PartialEq)]
pub enum SpatialFilter {
    All,
    Envelope(Envelope),
    /// Box plus the projection it is expressed in; `None` means the table's
    BoundingBox(BoundingBox, Option<Projection>),
}

impl SpatialFilter {
    /// Reduce to an envelope in the table's projection; `None` matches everything.
    pub fn resolve(
        &self,
        table: &FeatureTable,
        transform: Option<&dyn BoundingBoxTransform>,
    ) -> Result<Option<Envelope>> {
        match self {
            SpatialFilter::All => Ok(None),
            SpatialFilter::Envelope(envelope) => {
                envelope.validate()?;
                Ok(Some(*envelope))
            }
            SpatialFilter::BoundingBox(bbox, projection) => {
                let target = table.srs_id().map(Projection::new);
                match (projection, target) {
                    (Some(from), Some(to)) if *from != to => {
                        let transform = transform.ok_or_else(|| {
                            StorageError::UnsupportedProjection(format!(
                                "no transform registered from srs {} to srs {}",
                                from.srs_id, to.srs_id
                            ))
                        })?;
                        Ok(Some(transform.transform(bbox, *from, to)?.to_envelope()))
                    }
                    _ => Ok(Some(bbox.to_envelope())),
                }
            }
        }
    }
}

/// One stored geometry-id → envelope association
#[derive(Debug, Clone, PartialEq)]
pub struct GeometryIndexEntry {
    pub table_name: String,
    pub geometry_id: RowId,
    pub envelope: Envelope,
}

/// Progress hook for index builds
pub trait IndexProgress {
    /// Total rows about to be scanned
    fn set_max(&mut self, _total: u64) {}

    /// `count` more rows were scanned
    fn add_progress(&mut self, count: usize);
}

/// Discards progress
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl IndexProgress for NoProgress {
    fn add_progress(&mut self, _count: usize) {}
}

impl<F: FnMut(usize)> IndexProgress for F {
    fn add_progress(&mut self, count: usize) {
        self(count)
    }
}

/// Operations every index location supports
pub trait SpatialIndex {
    fn location(&self) -> IndexLocation;

    fn table_name(&self) -> &str;

    /// A build finished and the table has not changed since
    fn is_indexed(&self) -> Result<bool>;

    /// Rebuild over every row. Without `force` an indexed table is left
    /// alone and 0 is returned; otherwise the number of geometries indexed.
    fn index_table(&self, force: bool, progress: &mut dyn IndexProgress) -> Result<usize>;

    /// Upsert one row's envelope; false if the row has no id or no geometry
    fn index_row(&self, row: &crate::types::FeatureRow) -> Result<bool>;

    fn delete_index(&self) -> Result<bool>;

    fn delete_index_for(&self, geometry_id: RowId) -> Result<bool>;

    fn query(&self, filter: &SpatialFilter) -> Result<Box<dyn FeatureIndexResults>>;

    fn count(&self, filter: &SpatialFilter) -> Result<u64>;

    fn last_indexed(&self) -> Result<Option<Timestamp>>;

    /// Union of every indexed envelope
    fn bounds(&self) -> Result<Option<Envelope>>;

    fn query_all(&self) -> Result<Box<dyn FeatureIndexResults>> {
        self.query(&SpatialFilter::All)
    }

    fn query_envelope(&self, envelope: &Envelope) -> Result<Box<dyn FeatureIndexResults>> {
        self.query(&SpatialFilter::Envelope(*envelope))
    }

    fn query_bounding_box(&self, bbox: &BoundingBox) -> Result<Box<dyn FeatureIndexResults>> {
        self.query(&SpatialFilter::BoundingBox(*bbox, None))
    }

    fn count_all(&self) -> Result<u64> {
        self.count(&SpatialFilter::All)
    }

    fn count_envelope(&self, envelope: &Envelope) -> Result<u64> {
        self.count(&SpatialFilter::Envelope(*envelope))
    }
}

/// Closed set of index backends
pub enum IndexBackend {
    Extension(ExtensionIndex),
    Metadata(MetadataIndex),
}

impl IndexBackend {
    fn inner(&self) -> &dyn SpatialIndex {
        match self {
            IndexBackend::Extension(index) => index,
            IndexBackend::Metadata(index) => index,
        }
    }
}

impl SpatialIndex for IndexBackend {
    fn location(&self) -> IndexLocation {
        self.inner().location()
    }

    fn table_name(&self) -> &str {
        self.inner().table_name()
    }

    fn is_indexed(&self) -> Result<bool> {
        self.inner().is_indexed()
    }

    fn index_table(&self, force: bool, progress: &mut dyn IndexProgress) -> Result<usize> {
        self.inner().index_table(force, progress)
    }

    fn index_row(&self, row: &crate::types::FeatureRow) -> Result<bool> {
        self.inner().index_row(row)
    }

    fn delete_index(&self) -> Result<bool> {
        self.inner().delete_index()
    }

    fn delete_index_for(&self, geometry_id: RowId) -> Result<bool> {
        self.inner().delete_index_for(geometry_id)
    }

    fn query(&self, filter: &SpatialFilter) -> Result<Box<dyn FeatureIndexResults>> {
        self.inner().query(filter)
    }

    fn count(&self, filter: &SpatialFilter) -> Result<u64> {
        self.inner().count(filter)
    }

    fn last_indexed(&self) -> Result<Option<Timestamp>> {
        self.inner().last_indexed()
    }

    fn bounds(&self) -> Result<Option<Envelope>> {
        self.inner().bounds()
    }
}

/// Whether a build stamped at `last_indexed` still covers the table
pub(crate) fn is_current(last_indexed: Option<Timestamp>, last_change: Option<Timestamp>) -> bool {
    match (last_indexed, last_change) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(indexed), Some(changed)) => indexed >= changed,
    }
}

/// Boundary-inclusive intersection terms against the entry columns.
///
/// Z/M terms are added only when the query carries them; entries without
/// Z/M always pass those terms.
pub(crate) fn envelope_clause(envelope: &Envelope) -> (String, Vec<Value>) {
    let mut sql = String::from("min_x <= ? AND max_x >= ? AND min_y <= ? AND max_y >= ?");
    let mut args = vec![
        Value::Real(envelope.max_x),
        Value::Real(envelope.min_x),
        Value::Real(envelope.max_y),
        Value::Real(envelope.min_y),
    ];
    if let (Some(min_z), Some(max_z)) = (envelope.min_z, envelope.max_z) {
        sql.push_str(" AND (min_z IS NULL OR (min_z <= ? AND max_z >= ?))");
        args.push(Value::Real(max_z));
        args.push(Value::Real(min_z));
    }
    if let (Some(min_m), Some(max_m)) = (envelope.min_m, envelope.max_m) {
        sql.push_str(" AND (min_m IS NULL OR (min_m <= ? AND max_m >= ?))");
        args.push(Value::Real(max_m));
        args.push(Value::Real(min_m));
    }
    (sql, args)
}

/// Envelope columns in storage order, as bind values
pub(crate) fn envelope_values(envelope: &Envelope) -> [Value; 8] {
    let opt = |v: Option<f64>| v.map_or(Value::Null, Value::Real);
    [
        Value::Real(envelope.min_x),
        Value::Real(envelope.max_x),
        Value::Real(envelope.min_y),
        Value::Real(envelope.max_y),
        opt(envelope.min_z),
        opt(envelope.max_z),
        opt(envelope.min_m),
        opt(envelope.max_m),
    ]
}

/// Read an envelope from 8 consecutive columns starting at `start`
pub(crate) fn envelope_from_row(row: &rusqlite::Row<'_>, start: usize) -> rusqlite::Result<Option<Envelope>> {
    let bounds: [Option<f64>; 4] = [row.get(start)?, row.get(start + 1)?, row.get(start + 2)?, row.get(start + 3)?];
    let [Some(min_x), Some(max_x), Some(min_y), Some(max_y)] = bounds else {
        return Ok(None);
    };
    Ok(Some(Envelope {
        min_x,
        max_x,
        min_y,
        max_y,
        min_z: row.get(start + 4)?,
        max_z: row.get(start + 5)?,
        min_m: row.get(start + 6)?,
        max_m: row.get(start + 7)?,
    }))
}

/// Decode an entry from cursor values `[id, min_x .. max_m]`
pub(crate) fn entry_from_values(table_name: &str, values: &[Value]) -> Result<GeometryIndexEntry> {
    let real = |i: usize| -> Option<f64> {
        match values.get(i) {
            Some(Value::Real(v)) => Some(*v),
            Some(Value::Integer(v)) => Some(*v as f64),
            _ => None,
        }
    };
    let corrupt = || StorageError::InvalidData(format!("corrupt index entry for table '{}'", table_name));

    let geometry_id = values.first().and_then(Value::as_integer).ok_or_else(corrupt)?;
    let envelope = Envelope {
        min_x: real(1).ok_or_else(corrupt)?,
        max_x: real(2).ok_or_else(corrupt)?,
        min_y: real(3).ok_or_else(corrupt)?,
        max_y: real(4).ok_or_else(corrupt)?,
        min_z: real(5),
        max_z: real(6),
        min_m: real(7),
        max_m: real(8),
    };
    envelope.validate()?;
    Ok(GeometryIndexEntry {
        table_name: table_name.to_string(),
        geometry_id,
        envelope,
    })
}

/// Scan every row of the table and hand `(id, envelope)` to `sink`.
///
/// Rows are read through the recovering cursor, so oversized rows come back
/// repaired after the main pass. Rows with no geometry are skipped; rows with
/// an unreadable geometry are skipped with a warning.
pub(crate) fn scan_envelopes(
    dao: &FeatureDao,
    batch_size: usize,
    progress: &mut dyn IndexProgress,
    mut sink: impl FnMut(RowId, &Envelope) -> Result<()>,
) -> Result<usize> {
    progress.set_max(dao.count(&QuerySpec::new())?);

    let mut indexed = 0usize;
    let mut pending = 0usize;
    for row in dao.query_all()? {
        let row = row?;
        pending += 1;
        if pending >= batch_size {
            progress.add_progress(pending);
            pending = 0;
        }
        let Some(id) = row.id() else {
            // the repaired copy follows after the main pass
            continue;
        };
        match dao.envelope(&row) {
            Ok(Some(envelope)) => {
                sink(id, &envelope)?;
                indexed += 1;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(table = %dao.table_name(), id, error = %e, "Skipping row with unreadable geometry");
            }
        }
    }
    if pending > 0 {
        progress.add_progress(pending);
    }
    Ok(indexed)
}
