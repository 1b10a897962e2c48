//! Feature table access: queries, single-row reads and blob reads

use std::sync::Arc;

use super::connection::quote_ident;
use super::reader::{read_blob_chunked, FeatureCursor, Recovery};
use super::store::{FeatureStore, FeatureTable};
use super::WindowedCursor;
use crate::config::FeatureIndexConfig;
use crate::index::CursorResults;
use crate::types::{Envelope, EnvelopeReader, FeatureRow, GeoPackageHeaderReader, RowId, Value};
use crate::{Result, StorageError};

/// Query shape over one feature table.
///
/// Rows come back ordered by primary key unless `order_by` says otherwise;
/// blob recovery re-issues the same query and relies on a stable order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuerySpec {
    pub where_clause: Option<String>,
    pub args: Vec<Value>,
    pub order_by: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl QuerySpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, where_clause: impl Into<String>, args: Vec<Value>) -> Self {
        self.where_clause = Some(where_clause.into());
        self.args = args;
        self
    }

    pub fn order_by(mut self, order_by: impl Into<String>) -> Self {
        self.order_by = Some(order_by.into());
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// `SELECT` over `table`; with `null_blobs` every blob column becomes
    /// `NULL AS "col"` so the row fits the cursor window again.
    pub(crate) fn select_sql(&self, table: &FeatureTable, null_blobs: bool) -> String {
        let columns = table
            .columns()
            .iter()
            .enumerate()
            .map(|(i, name)| {
                if null_blobs && table.blob_columns().contains(&i) {
                    format!("NULL AS {}", quote_ident(name))
                } else {
                    quote_ident(name)
                }
            })
            .collect::<Vec<_>>()
            .join(", ");

        let mut sql = format!("SELECT {} FROM {}", columns, quote_ident(table.name()));
        self.push_where(&mut sql);
        match &self.order_by {
            Some(order) => sql.push_str(&format!(" ORDER BY {}", order)),
            None => sql.push_str(&format!(" ORDER BY {}", quote_ident(table.pk_column()))),
        }
        if self.limit.is_some() || self.offset.is_some() {
            let limit = self.limit.map_or(-1, |l| l as i64);
            sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, self.offset.unwrap_or(0)));
        }
        sql
    }

    pub(crate) fn count_sql(&self, table: &FeatureTable) -> String {
        if self.limit.is_some() || self.offset.is_some() {
            return format!("SELECT COUNT(*) FROM ({})", self.select_sql(table, true));
        }
        let mut sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table.name()));
        self.push_where(&mut sql);
        sql
    }

    fn push_where(&self, sql: &mut String) {
        if let Some(where_clause) = &self.where_clause {
            sql.push_str(&format!(" WHERE {}", where_clause));
        }
    }
}

/// Reader for one feature table
#[derive(Clone)]
pub struct FeatureDao {
    store: FeatureStore,
    table: Arc<FeatureTable>,
    envelope_reader: Arc<dyn EnvelopeReader>,
    window_size: usize,
    chunk_size: usize,
}

impl FeatureDao {
    pub fn new(store: FeatureStore, table: &str, config: &FeatureIndexConfig) -> Result<Self> {
        config.validate()?;
        let table = Arc::new(store.feature_table(table)?);
        if table.geometry_index().is_none() {
            tracing::warn!(table = %table.name(), "Feature table has no geometry column");
        }
        Ok(Self {
            store,
            table,
            envelope_reader: Arc::new(GeoPackageHeaderReader),
            window_size: config.cursor_window_size,
            chunk_size: config.blob_chunk_size,
        })
    }

    /// Replace the default GeoPackage header envelope reader
    pub fn with_envelope_reader(mut self, reader: Arc<dyn EnvelopeReader>) -> Self {
        self.envelope_reader = reader;
        self
    }

    pub fn store(&self) -> &FeatureStore {
        &self.store
    }

    pub fn table(&self) -> &FeatureTable {
        &self.table
    }

    pub fn table_name(&self) -> &str {
        self.table.name()
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Cursor over rows matching `spec`, with oversized-blob recovery attached
    pub fn query(&self, spec: &QuerySpec) -> Result<FeatureCursor> {
        let cursor = self.open_cursor(spec)?;
        let recovery = Recovery {
            store: self.store.clone(),
            spec: spec.clone(),
            window_size: self.window_size,
            chunk_size: self.chunk_size,
        };
        Ok(FeatureCursor::new(Arc::clone(&self.table), cursor, Some(recovery)))
    }

    /// Cursor that reports oversized rows as invalid and never repairs them
    pub fn query_without_recovery(&self, spec: &QuerySpec) -> Result<FeatureCursor> {
        let cursor = self.open_cursor(spec)?;
        Ok(FeatureCursor::new(Arc::clone(&self.table), cursor, None))
    }

    pub fn query_all(&self) -> Result<FeatureCursor> {
        self.query(&QuerySpec::new())
    }

    /// Cursor-backed results with an eagerly computed count
    pub fn query_results(&self, spec: &QuerySpec) -> Result<CursorResults> {
        let count = self.count(spec)?;
        Ok(CursorResults::new(self.query(spec)?, count))
    }

    pub fn count(&self, spec: &QuerySpec) -> Result<u64> {
        let sql = spec.count_sql(&self.table);
        let count: i64 = self.store.connection().with(|conn| {
            conn.query_row(&sql, rusqlite::params_from_iter(spec.args.iter()), |row| row.get(0))
        })?;
        Ok(count.max(0) as u64)
    }

    /// Read one row by primary key, repairing oversized blobs if needed.
    ///
    /// `Ok(None)` if no such row; `IrreparableRow` if the row exists but no
    /// copy with a readable id could be produced.
    pub fn get_row(&self, id: RowId) -> Result<Option<FeatureRow>> {
        match self.fetch_row(id)? {
            Some(row) if !row.is_valid() => Err(StorageError::IrreparableRow {
                table: self.table.name().to_string(),
                detail: format!("id {} unreadable after requery", id),
            }),
            row => Ok(row),
        }
    }

    /// Like [`get_row`](Self::get_row), but an irreparable row comes back as
    /// its degraded (`is_valid() == false`) copy instead of an error
    pub(crate) fn fetch_row(&self, id: RowId) -> Result<Option<FeatureRow>> {
        let spec = QuerySpec::new().filter(
            format!("{} = ?", quote_ident(self.table.pk_column())),
            vec![Value::Integer(id)],
        );
        let mut cursor = self.query(&spec)?;
        let mut degraded = None;
        for row in &mut cursor {
            let row = row?;
            if row.is_valid() {
                return Ok(Some(row));
            }
            degraded = Some(row);
        }
        Ok(degraded)
    }

    /// Chunked read of a blob column, bypassing the cursor window.
    ///
    /// `Ok(None)` when the value is null, empty or the row is missing.
    pub fn read_blob(&self, id: RowId, column: &str) -> Result<Option<Vec<u8>>> {
        let index = self
            .table
            .columns()
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .ok_or_else(|| StorageError::ColumnNotFound(format!("{}.{}", self.table.name(), column)))?;
        let bytes = read_blob_chunked(&self.store, &self.table, index, id, self.chunk_size)?;
        Ok(if bytes.is_empty() { None } else { Some(bytes) })
    }

    /// Envelope of the row's geometry, `None` for null/empty geometries
    pub fn envelope(&self, row: &FeatureRow) -> Result<Option<Envelope>> {
        match row.geometry() {
            Some(bytes) if !bytes.is_empty() => self.envelope_reader.envelope(bytes),
            _ => Ok(None),
        }
    }

    fn open_cursor(&self, spec: &QuerySpec) -> Result<WindowedCursor> {
        WindowedCursor::open(
            self.store.connection().clone(),
            spec.select_sql(&self.table, false),
            spec.args.clone(),
            self.window_size,
        )
    }
}

impl std::fmt::Debug for FeatureDao {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureDao")
            .field("store", &self.store.name())
            .field("table", &self.table.name())
            .field("window_size", &self.window_size)
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}
