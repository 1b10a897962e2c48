//! Feature store: the SQLite file holding feature tables
//!
//! Provides schema introspection for feature tables and the handful of
//! scalar reads the index layer needs. Everything else goes through
//! [`WindowedCursor`](super::WindowedCursor).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::OptionalExtension;

use super::connection::{quote_ident, Savepoint, SqlConnection};
use crate::types::{RowId, Timestamp, Value};
use crate::{Result, StorageError};

/// Declared types that mark a geometry column when there is no
/// `gpkg_geometry_columns` entry for the table
const GEOMETRY_TYPES: &[&str] = &[
    "GEOMETRY",
    "POINT",
    "LINESTRING",
    "POLYGON",
    "MULTIPOINT",
    "MULTILINESTRING",
    "MULTIPOLYGON",
    "GEOMETRYCOLLECTION",
    "CIRCULARSTRING",
    "COMPOUNDCURVE",
    "CURVEPOLYGON",
    "MULTICURVE",
    "MULTISURFACE",
    "CURVE",
    "SURFACE",
];

/// Handle to an open feature store
#[derive(Clone)]
pub struct FeatureStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    name: String,
    path: Option<PathBuf>,
    conn: SqlConnection,
}

impl FeatureStore {
    /// Open (or create) a store file; its identity is the file stem
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = SqlConnection::open(path)?;
        Ok(Self::with_connection(name_from_path(path), Some(path.to_path_buf()), conn))
    }

    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = SqlConnection::open_read_only(path)?;
        Ok(Self::with_connection(name_from_path(path), Some(path.to_path_buf()), conn))
    }

    pub fn open_in_memory(name: &str) -> Result<Self> {
        Ok(Self::with_connection(name.to_string(), None, SqlConnection::open_in_memory()?))
    }

    pub fn with_connection(name: String, path: Option<PathBuf>, conn: SqlConnection) -> Self {
        Self {
            inner: Arc::new(StoreInner { name, path, conn }),
        }
    }

    /// Store identity used to key the metadata side store
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn connection(&self) -> &SqlConnection {
        &self.inner.conn
    }

    pub fn execute(&self, sql: &str, args: &[Value]) -> Result<usize> {
        self.inner
            .conn
            .with(|conn| conn.execute(sql, rusqlite::params_from_iter(args.iter())))
    }

    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.inner.conn.execute_batch(sql)
    }

    pub fn savepoint(&self) -> Result<Savepoint> {
        self.inner.conn.savepoint()
    }

    pub fn table_exists(&self, table: &str) -> Result<bool> {
        self.inner.conn.with(|conn| table_exists(conn, table))
    }

    /// Introspect a feature table
    pub fn feature_table(&self, table: &str) -> Result<FeatureTable> {
        let (columns, geometry) = self.inner.conn.with(|conn| {
            let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
            let columns = stmt
                .query_map([], |row| {
                    Ok(ColumnInfo {
                        name: row.get(1)?,
                        declared_type: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                        not_null: row.get::<_, i64>(3)? != 0,
                        pk: row.get::<_, i64>(5)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let geometry = if table_exists(conn, "gpkg_geometry_columns")? {
                conn.query_row(
                    "SELECT column_name, srs_id FROM gpkg_geometry_columns WHERE lower(table_name) = lower(?1)",
                    [table],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<i32>>(1)?)),
                )
                .optional()?
            } else {
                None
            };
            Ok((columns, geometry))
        })?;

        if columns.is_empty() {
            return Err(StorageError::TableNotFound(table.to_string()));
        }
        FeatureTable::from_columns(table, columns, geometry)
    }

    /// `gpkg_contents.last_change` for `table`, when the store tracks it
    pub fn contents_last_change(&self, table: &str) -> Result<Option<Timestamp>> {
        let text = self.inner.conn.with(|conn| {
            if !table_exists(conn, "gpkg_contents")? {
                return Ok(None);
            }
            conn.query_row(
                "SELECT last_change FROM gpkg_contents WHERE lower(table_name) = lower(?1)",
                [table],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .map(Option::flatten)
        })?;
        text.as_deref().map(Timestamp::parse).transpose()
    }

    /// One `substr(column, offset, length)` fetch keyed by primary key.
    ///
    /// `offset` is 1-based. A missing row or a null column reads as empty.
    pub(crate) fn read_blob_chunk(
        &self,
        table: &FeatureTable,
        column: usize,
        id: RowId,
        offset: usize,
        length: usize,
    ) -> Result<Vec<u8>> {
        let sql = format!(
            "SELECT substr({}, ?1, ?2) FROM {} WHERE {} = ?3",
            quote_ident(&table.columns()[column]),
            quote_ident(table.name()),
            quote_ident(table.pk_column()),
        );
        let chunk = self.inner.conn.with(|conn| {
            conn.query_row(&sql, rusqlite::params![offset as i64, length as i64, id], |row| {
                Ok(Value::from(row.get_ref(0)?))
            })
            .optional()
        })?;
        Ok(match chunk {
            Some(Value::Blob(bytes)) => bytes,
            Some(Value::Text(text)) => text.into_bytes(),
            _ => Vec::new(),
        })
    }
}

impl std::fmt::Debug for FeatureStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureStore")
            .field("name", &self.inner.name)
            .field("path", &self.inner.path)
            .finish()
    }
}

fn name_from_path(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

pub(crate) fn table_exists(conn: &rusqlite::Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND lower(name) = lower(?1)",
        [table],
        |row| row.get::<_, i64>(0),
    )
    .map(|count| count > 0)
}

struct ColumnInfo {
    name: String,
    declared_type: String,
    not_null: bool,
    pk: i64,
}

/// Schema of one feature table
#[derive(Debug, Clone)]
pub struct FeatureTable {
    name: Arc<str>,
    columns: Arc<[String]>,
    declared_types: Vec<String>,
    not_null: Vec<bool>,
    pk_index: usize,
    geometry_index: Option<usize>,
    blob_columns: Vec<usize>,
    srs_id: Option<i32>,
}

impl FeatureTable {
    fn from_columns(
        table: &str,
        columns: Vec<ColumnInfo>,
        geometry: Option<(String, Option<i32>)>,
    ) -> Result<Self> {
        let pk_columns: Vec<usize> = columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.pk > 0)
            .map(|(i, _)| i)
            .collect();
        let pk_index = match pk_columns.as_slice() {
            [single] => *single,
            _ => {
                return Err(StorageError::InvalidData(format!(
                    "Feature table '{}' needs a single integer primary key",
                    table
                )))
            }
        };

        let geometry_index = match &geometry {
            Some((column, _)) => Some(
                columns
                    .iter()
                    .position(|c| c.name.eq_ignore_ascii_case(column))
                    .ok_or_else(|| StorageError::ColumnNotFound(format!("{}.{}", table, column)))?,
            ),
            None => columns.iter().position(|c| is_geometry_type(&c.declared_type)),
        };

        let blob_columns = columns
            .iter()
            .enumerate()
            .filter(|(i, c)| {
                Some(*i) == geometry_index
                    || is_geometry_type(&c.declared_type)
                    || c.declared_type.to_ascii_uppercase().contains("BLOB")
            })
            .map(|(i, _)| i)
            .collect();

        Ok(Self {
            name: Arc::from(table),
            declared_types: columns.iter().map(|c| c.declared_type.clone()).collect(),
            not_null: columns.iter().map(|c| c.not_null || c.pk > 0).collect(),
            columns: columns.into_iter().map(|c| c.name).collect::<Vec<_>>().into(),
            pk_index,
            geometry_index,
            blob_columns,
            srs_id: geometry.and_then(|(_, srs)| srs),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub(crate) fn shared_columns(&self) -> Arc<[String]> {
        Arc::clone(&self.columns)
    }

    pub fn declared_type(&self, index: usize) -> Option<&str> {
        self.declared_types.get(index).map(String::as_str)
    }

    pub fn is_not_null(&self, index: usize) -> bool {
        self.not_null.get(index).copied().unwrap_or(false)
    }

    pub fn pk_index(&self) -> usize {
        self.pk_index
    }

    pub fn pk_column(&self) -> &str {
        &self.columns[self.pk_index]
    }

    pub fn geometry_index(&self) -> Option<usize> {
        self.geometry_index
    }

    pub fn geometry_column(&self) -> Option<&str> {
        self.geometry_index.map(|i| self.columns[i].as_str())
    }

    /// Columns recovered by chunked reads when a row overflows the window
    pub fn blob_columns(&self) -> &[usize] {
        &self.blob_columns
    }

    pub fn srs_id(&self) -> Option<i32> {
        self.srs_id
    }
}

fn is_geometry_type(declared: &str) -> bool {
    GEOMETRY_TYPES.iter().any(|t| declared.eq_ignore_ascii_case(t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn test_feature_table_introspection() {
        let store = testing::sample_store();
        let table = store.feature_table("T").unwrap();

        assert_eq!(table.name(), "T");
        assert_eq!(table.pk_column(), "id");
        assert_eq!(table.geometry_column(), Some("geom"));
        assert_eq!(table.blob_columns(), &[2, 3]);
        assert!(table.is_not_null(0));
        assert_eq!(table.srs_id(), None);
    }

    #[test]
    fn test_geometry_columns_registry_wins() {
        let store = FeatureStore::open_in_memory("registry").unwrap();
        store
            .execute_batch(
                "CREATE TABLE gpkg_geometry_columns (table_name TEXT, column_name TEXT, srs_id INTEGER);
                 CREATE TABLE roads (fid INTEGER PRIMARY KEY, shape BLOB, label TEXT);
                 INSERT INTO gpkg_geometry_columns VALUES ('roads', 'shape', 3857);",
            )
            .unwrap();

        let table = store.feature_table("roads").unwrap();
        assert_eq!(table.geometry_column(), Some("shape"));
        assert_eq!(table.srs_id(), Some(3857));
    }

    #[test]
    fn test_missing_table_and_composite_pk() {
        let store = FeatureStore::open_in_memory("bad").unwrap();
        assert!(matches!(store.feature_table("nope"), Err(StorageError::TableNotFound(_))));

        store
            .execute_batch("CREATE TABLE pairs (a INTEGER, b INTEGER, PRIMARY KEY (a, b))")
            .unwrap();
        assert!(matches!(store.feature_table("pairs"), Err(StorageError::InvalidData(_))));
    }

    #[test]
    fn test_contents_last_change() {
        let store = testing::sample_store();
        assert_eq!(store.contents_last_change("T").unwrap(), None);

        store
            .execute_batch(
                "CREATE TABLE gpkg_contents (table_name TEXT PRIMARY KEY, last_change DATETIME);
                 INSERT INTO gpkg_contents VALUES ('T', '2024-03-01T12:00:00.000Z');",
            )
            .unwrap();
        assert_eq!(
            store.contents_last_change("t").unwrap(),
            Some(Timestamp::from_millis(1_709_294_400_000))
        );
    }

    #[test]
    fn test_read_blob_chunk() {
        let store = testing::sample_store();
        let table = store.feature_table("T").unwrap();
        let full = testing::geometry_blob(&testing::envelope(0.0, 10.0, 0.0, 10.0));

        let first = store.read_blob_chunk(&table, 2, 1, 1, 4).unwrap();
        assert_eq!(first, full[..4].to_vec());
        let past_end = store.read_blob_chunk(&table, 2, 1, full.len() + 1, 4).unwrap();
        assert!(past_end.is_empty());
        let missing_row = store.read_blob_chunk(&table, 2, 999, 1, 4).unwrap();
        assert!(missing_row.is_empty());
    }
}
