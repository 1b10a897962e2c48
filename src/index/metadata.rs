//! Metadata-backed spatial index
//!
//! Envelopes live in a private side database shared by every store the
//! application opens, keyed by store name:
//!
//! ```text
//! geopackage             (id, name UNIQUE, external_path)
//! geopackage_table_index (geopackage_id, table_name, last_indexed millis)
//! geometry_metadata      (geopackage_id, table_name, id, min_x .. max_m)
//! ```
//!
//! Deleting a store row cascades to its table state and entries.

use std::path::{Path, PathBuf};

use rusqlite::OptionalExtension;

use crate::storage::{FeatureDao, SqlConnection, WindowedCursor};
use crate::types::{Envelope, FeatureRow, RowId, Timestamp, Value};
use crate::Result;

use super::results::EntryCursor;
use super::{
    envelope_clause, envelope_from_row, envelope_values, is_current, scan_envelopes, FeatureIndexResults,
    IndexLocation, IndexProgress, ListResults, MetadataResults, SpatialFilter, SpatialIndex,
};

const SCHEMA: &str = "
PRAGMA foreign_keys = ON;
CREATE TABLE IF NOT EXISTS geopackage (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    external_path TEXT
);
CREATE TABLE IF NOT EXISTS geopackage_table_index (
    geopackage_id INTEGER NOT NULL,
    table_name TEXT NOT NULL,
    last_indexed INTEGER,
    CONSTRAINT pk_table_index PRIMARY KEY (geopackage_id, table_name),
    CONSTRAINT fk_ti_gp FOREIGN KEY (geopackage_id) REFERENCES geopackage(id) ON DELETE CASCADE
);
CREATE TABLE IF NOT EXISTS geometry_metadata (
    geopackage_id INTEGER NOT NULL,
    table_name TEXT NOT NULL,
    id INTEGER NOT NULL,
    min_x DOUBLE NOT NULL,
    max_x DOUBLE NOT NULL,
    min_y DOUBLE NOT NULL,
    max_y DOUBLE NOT NULL,
    min_z DOUBLE,
    max_z DOUBLE,
    min_m DOUBLE,
    max_m DOUBLE,
    CONSTRAINT pk_geometry_metadata PRIMARY KEY (geopackage_id, table_name, id),
    CONSTRAINT fk_gm_ti FOREIGN KEY (geopackage_id, table_name)
        REFERENCES geopackage_table_index(geopackage_id, table_name) ON DELETE CASCADE
);";

const ENTRY_COLUMNS: &str = "id, min_x, max_x, min_y, max_y, min_z, max_z, min_m, max_m";

/// Side database holding metadata indexes for every known store
#[derive(Clone)]
pub struct MetadataDb {
    conn: SqlConnection,
    path: Option<PathBuf>,
}

impl MetadataDb {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(SqlConnection::open(&path)?, Some(path))
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(SqlConnection::open_in_memory()?, None)
    }

    fn init(conn: SqlConnection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn, path })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn connection(&self) -> &SqlConnection {
        &self.conn
    }

    pub fn find_store_id(&self, name: &str) -> Result<Option<i64>> {
        self.conn.with(|conn| {
            conn.query_row("SELECT id FROM geopackage WHERE name = ?1", [name], |row| row.get(0))
                .optional()
        })
    }

    /// Id of the named store, registering it on first use
    pub fn store_id(&self, name: &str, external_path: Option<&Path>) -> Result<i64> {
        if let Some(id) = self.find_store_id(name)? {
            return Ok(id);
        }
        let path = external_path.map(|p| p.to_string_lossy().into_owned());
        let id = self.conn.with(|conn| {
            conn.execute(
                "INSERT INTO geopackage (name, external_path) VALUES (?1, ?2)",
                rusqlite::params![name, path],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        tracing::debug!(store = name, id, "Registered store in metadata db");
        Ok(id)
    }

    /// Remove a store and, by cascade, all of its index state
    pub fn delete_store(&self, name: &str) -> Result<bool> {
        let deleted = self
            .conn
            .with(|conn| conn.execute("DELETE FROM geopackage WHERE name = ?1", [name]))?;
        Ok(deleted > 0)
    }

    pub fn store_names(&self) -> Result<Vec<String>> {
        self.conn.with(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM geopackage ORDER BY name")?;
            let names = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(names)
        })
    }

    pub fn store_path(&self, name: &str) -> Result<Option<PathBuf>> {
        let path: Option<String> = self.conn.with(|conn| {
            conn.query_row("SELECT external_path FROM geopackage WHERE name = ?1", [name], |row| row.get(0))
                .optional()
                .map(Option::flatten)
        })?;
        Ok(path.map(PathBuf::from))
    }

    fn execute(&self, sql: &str, args: &[Value]) -> Result<usize> {
        self.conn
            .with(|conn| conn.execute(sql, rusqlite::params_from_iter(args.iter())))
    }
}

impl std::fmt::Debug for MetadataDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataDb").field("path", &self.path).finish()
    }
}

pub struct MetadataIndex {
    dao: FeatureDao,
    db: MetadataDb,
    batch_size: usize,
}

impl MetadataIndex {
    pub fn new(dao: FeatureDao, db: MetadataDb, batch_size: usize) -> Self {
        Self {
            dao,
            db,
            batch_size: batch_size.max(1),
        }
    }

    pub fn db(&self) -> &MetadataDb {
        &self.db
    }

    fn store_name(&self) -> &str {
        self.dao.store().name()
    }

    fn store_id(&self) -> Result<i64> {
        self.db.store_id(self.store_name(), self.dao.store().path())
    }

    fn ensure_table_index(&self, store_id: i64) -> Result<()> {
        self.db.execute(
            "INSERT INTO geopackage_table_index (geopackage_id, table_name, last_indexed) VALUES (?1, ?2, NULL)
             ON CONFLICT(geopackage_id, table_name) DO NOTHING",
            &[Value::Integer(store_id), Value::from(self.table_name())],
        )?;
        Ok(())
    }

    fn touch_last_indexed(&self, store_id: i64) -> Result<()> {
        self.db.execute(
            "UPDATE geopackage_table_index SET last_indexed = ?1 WHERE geopackage_id = ?2 AND table_name = ?3",
            &[
                Value::Integer(Timestamp::now().as_millis()),
                Value::Integer(store_id),
                Value::from(self.table_name()),
            ],
        )?;
        Ok(())
    }

    fn insert_entry(&self, store_id: i64, id: RowId, envelope: &Envelope) -> Result<()> {
        let mut args = vec![Value::Integer(store_id), Value::from(self.table_name()), Value::Integer(id)];
        args.extend(envelope_values(envelope));
        self.db.execute(
            "INSERT OR REPLACE INTO geometry_metadata
             (geopackage_id, table_name, id, min_x, max_x, min_y, max_y, min_z, max_z, min_m, max_m)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            &args,
        )?;
        Ok(())
    }

    fn entry_filter(&self, store_id: i64, filter: &SpatialFilter) -> Result<(String, Vec<Value>)> {
        let mut sql = String::from("geopackage_id = ? AND table_name = ?");
        let mut args = vec![Value::Integer(store_id), Value::from(self.table_name())];
        if let Some(envelope) = filter.resolve(self.dao.table(), None)? {
            let (clause, clause_args) = envelope_clause(&envelope);
            sql.push_str(" AND ");
            sql.push_str(&clause);
            args.extend(clause_args);
        }
        Ok((sql, args))
    }
}

impl SpatialIndex for MetadataIndex {
    fn location(&self) -> IndexLocation {
        IndexLocation::Metadata
    }

    fn table_name(&self) -> &str {
        self.dao.table_name()
    }

    fn is_indexed(&self) -> Result<bool> {
        let last_indexed = self.last_indexed()?;
        let last_change = self.dao.store().contents_last_change(self.table_name())?;
        Ok(is_current(last_indexed, last_change))
    }

    fn index_table(&self, force: bool, progress: &mut dyn IndexProgress) -> Result<usize> {
        if !force && self.is_indexed()? {
            return Ok(0);
        }
        let store_id = self.store_id()?;

        let savepoint = self.db.conn.savepoint()?;
        self.ensure_table_index(store_id)?;
        self.db.execute(
            "DELETE FROM geometry_metadata WHERE geopackage_id = ?1 AND table_name = ?2",
            &[Value::Integer(store_id), Value::from(self.table_name())],
        )?;
        let indexed = scan_envelopes(&self.dao, self.batch_size, progress, |id, envelope| {
            self.insert_entry(store_id, id, envelope)
        })?;
        self.touch_last_indexed(store_id)?;
        savepoint.release()?;

        tracing::debug!(
            store = %self.store_name(),
            table = %self.table_name(),
            indexed,
            "Built metadata index"
        );
        Ok(indexed)
    }

    fn index_row(&self, row: &FeatureRow) -> Result<bool> {
        let Some(id) = row.id() else {
            return Ok(false);
        };
        let store_id = self.store_id()?;
        self.ensure_table_index(store_id)?;
        let indexed = match self.dao.envelope(row)? {
            Some(envelope) => {
                self.insert_entry(store_id, id, &envelope)?;
                true
            }
            None => {
                self.delete_index_for(id)?;
                false
            }
        };
        self.touch_last_indexed(store_id)?;
        Ok(indexed)
    }

    fn delete_index(&self) -> Result<bool> {
        let Some(store_id) = self.db.find_store_id(self.store_name())? else {
            return Ok(false);
        };
        // entries go with the table row
        let deleted = self.db.execute(
            "DELETE FROM geopackage_table_index WHERE geopackage_id = ?1 AND table_name = ?2",
            &[Value::Integer(store_id), Value::from(self.table_name())],
        )?;
        Ok(deleted > 0)
    }

    fn delete_index_for(&self, geometry_id: RowId) -> Result<bool> {
        let Some(store_id) = self.db.find_store_id(self.store_name())? else {
            return Ok(false);
        };
        let deleted = self.db.execute(
            "DELETE FROM geometry_metadata WHERE geopackage_id = ?1 AND table_name = ?2 AND id = ?3",
            &[Value::Integer(store_id), Value::from(self.table_name()), Value::Integer(geometry_id)],
        )?;
        Ok(deleted > 0)
    }

    fn query(&self, filter: &SpatialFilter) -> Result<Box<dyn FeatureIndexResults>> {
        let Some(store_id) = self.db.find_store_id(self.store_name())? else {
            return Ok(Box::new(ListResults::empty()));
        };
        let count = self.count(filter)?;
        let (clause, args) = self.entry_filter(store_id, filter)?;
        let cursor = WindowedCursor::open(
            self.db.conn.clone(),
            format!("SELECT {} FROM geometry_metadata WHERE {} ORDER BY id", ENTRY_COLUMNS, clause),
            args,
            self.dao.window_size(),
        )?;
        let entries = EntryCursor::new(self.table_name(), cursor);
        Ok(Box::new(MetadataResults::new(entries, self.dao.clone(), count)))
    }

    fn count(&self, filter: &SpatialFilter) -> Result<u64> {
        let Some(store_id) = self.db.find_store_id(self.store_name())? else {
            return Ok(0);
        };
        let (clause, args) = self.entry_filter(store_id, filter)?;
        let sql = format!("SELECT COUNT(*) FROM geometry_metadata WHERE {}", clause);
        let count: i64 = self
            .db
            .conn
            .with(|conn| conn.query_row(&sql, rusqlite::params_from_iter(args.iter()), |row| row.get(0)))?;
        Ok(count.max(0) as u64)
    }

    fn last_indexed(&self) -> Result<Option<Timestamp>> {
        let Some(store_id) = self.db.find_store_id(self.store_name())? else {
            return Ok(None);
        };
        let millis: Option<i64> = self.db.conn.with(|conn| {
            conn.query_row(
                "SELECT last_indexed FROM geopackage_table_index WHERE geopackage_id = ?1 AND table_name = ?2",
                rusqlite::params![store_id, self.table_name()],
                |row| row.get(0),
            )
            .optional()
            .map(Option::flatten)
        })?;
        Ok(millis.map(Timestamp::from_millis))
    }

    fn bounds(&self) -> Result<Option<Envelope>> {
        let Some(store_id) = self.db.find_store_id(self.store_name())? else {
            return Ok(None);
        };
        self.db.conn.with(|conn| {
            conn.query_row(
                "SELECT MIN(min_x), MAX(max_x), MIN(min_y), MAX(max_y),
                        MIN(min_z), MAX(max_z), MIN(min_m), MAX(max_m)
                 FROM geometry_metadata WHERE geopackage_id = ?1 AND table_name = ?2",
                rusqlite::params![store_id, self.table_name()],
                |row| envelope_from_row(row, 0),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{NoProgress, ResultsExt};
    use crate::testing;

    fn index() -> MetadataIndex {
        MetadataIndex::new(testing::sample_dao(), MetadataDb::open_in_memory().unwrap(), 2)
    }

    #[test]
    fn test_three_geometry_scenario() {
        let index = index();
        assert!(!index.is_indexed().unwrap());
        assert_eq!(index.index_table(false, &mut NoProgress).unwrap(), 3);
        assert!(index.is_indexed().unwrap());

        let query = testing::envelope(0.0, 12.0, 0.0, 12.0);
        assert_eq!(index.query_envelope(&query).unwrap().collect_ids().unwrap(), vec![1, 2]);
        assert_eq!(index.count_envelope(&query).unwrap(), 2);
        assert_eq!(
            index.count_envelope(&testing::envelope(100.0, 110.0, 100.0, 110.0)).unwrap(),
            0
        );
        assert_eq!(index.bounds().unwrap(), Some(testing::envelope(0.0, 30.0, 0.0, 30.0)));
    }

    #[test]
    fn test_z_range_against_stored_entries() {
        let index = index();
        let with_z = testing::envelope(0.0, 10.0, 0.0, 10.0).with_z(0.0, 1.0).unwrap();
        index
            .dao
            .store()
            .execute("UPDATE T SET geom = ?1 WHERE id = 1", &[Value::Blob(testing::geometry_blob(&with_z))])
            .unwrap();
        index.index_table(true, &mut NoProgress).unwrap();

        // xy-only entry 2 matches any z range
        let disjoint = testing::envelope(0.0, 12.0, 0.0, 12.0).with_z(5.0, 6.0).unwrap();
        assert_eq!(index.query_envelope(&disjoint).unwrap().collect_ids().unwrap(), vec![2]);
        assert_eq!(index.count_envelope(&disjoint).unwrap(), 1);

        let touching = testing::envelope(0.0, 12.0, 0.0, 12.0).with_z(1.0, 6.0).unwrap();
        assert_eq!(index.query_envelope(&touching).unwrap().collect_ids().unwrap(), vec![1, 2]);
        assert_eq!(index.count_envelope(&touching).unwrap(), 2);

        let flat = testing::envelope(0.0, 12.0, 0.0, 12.0);
        assert_eq!(index.count_envelope(&flat).unwrap(), 2);
    }

    #[test]
    fn test_feature_store_untouched() {
        let index = index();
        index.index_table(true, &mut NoProgress).unwrap();
        assert!(!index.dao.store().table_exists("nga_geometry_index").unwrap());
        assert_eq!(index.db().store_names().unwrap(), vec!["sample".to_string()]);
    }

    #[test]
    fn test_delete_index_cascades() {
        let index = index();
        index.index_table(true, &mut NoProgress).unwrap();
        assert!(index.delete_index_for(2).unwrap());
        assert_eq!(index.count_all().unwrap(), 2);

        assert!(index.delete_index().unwrap());
        assert!(!index.delete_index().unwrap());
        assert_eq!(index.count_all().unwrap(), 0);
        assert_eq!(index.last_indexed().unwrap(), None);
    }

    #[test]
    fn test_delete_store_cascades() {
        let index = index();
        index.index_table(true, &mut NoProgress).unwrap();
        assert!(index.db().delete_store("sample").unwrap());
        assert!(index.db().store_names().unwrap().is_empty());
        assert!(!index.is_indexed().unwrap());
        assert_eq!(index.query_all().unwrap().count(), 0);

        let leftovers: i64 = index
            .db()
            .connection()
            .with(|c| c.query_row("SELECT COUNT(*) FROM geometry_metadata", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_stores_are_isolated() {
        let db = MetadataDb::open_in_memory().unwrap();
        let a = MetadataIndex::new(testing::sample_dao(), db.clone(), 2);
        let other = crate::storage::FeatureStore::open_in_memory("other").unwrap();
        testing::populate(&other);
        let b = MetadataIndex::new(
            crate::storage::FeatureDao::new(other, "T", &crate::config::FeatureIndexConfig::for_testing())
                .unwrap(),
            db.clone(),
            2,
        );

        a.index_table(true, &mut NoProgress).unwrap();
        assert!(a.is_indexed().unwrap());
        assert!(!b.is_indexed().unwrap());
        assert_eq!(b.count_all().unwrap(), 0);
        assert_eq!(db.store_names().unwrap(), vec!["sample".to_string()]);
    }

    #[test]
    fn test_index_row_and_rows() {
        let index = index();
        let row = index.dao.get_row(3).unwrap().unwrap();
        assert!(index.index_row(&row).unwrap());
        assert_eq!(index.count_all().unwrap(), 1);

        let mut results = index.query_all().unwrap();
        let fetched = results.next_row().unwrap().unwrap();
        assert_eq!(fetched.id(), Some(3));
        assert!(results.next_row().is_none());
        results.close().unwrap();
    }

    #[test]
    fn test_on_disk_side_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("side").join("metadata.db");
        {
            let db = MetadataDb::open(&path).unwrap();
            MetadataIndex::new(testing::sample_dao(), db, 2)
                .index_table(true, &mut NoProgress)
                .unwrap();
        }
        let db = MetadataDb::open(&path).unwrap();
        assert_eq!(db.path(), Some(path.as_path()));
        let index = MetadataIndex::new(testing::sample_dao(), db, 2);
        assert!(index.is_indexed().unwrap());
        assert_eq!(index.count_all().unwrap(), 3);
        assert_eq!(index.db().store_path("sample").unwrap(), None);
    }
}
