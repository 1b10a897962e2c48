//! Extension-backed spatial index
//!
//! Envelopes live inside the feature store, next to the features:
//!
//! ```text
//! nga_table_index    (table_name PK, last_indexed DATETIME)
//! nga_geometry_index (table_name, geom_id, min_x .. max_m)  PK (table_name, geom_id)
//! ```
//!
//! The tables are created on first write. A store without them (read-only,
//! or never indexed) simply reports nothing indexed.

use rusqlite::OptionalExtension;

use crate::storage::{quote_ident, FeatureDao, QuerySpec, WindowedCursor};
use crate::types::{Envelope, FeatureRow, RowId, Timestamp, Value};
use crate::Result;

use super::results::EntryCursor;
use super::{
    envelope_clause, envelope_from_row, envelope_values, is_current, scan_envelopes, ExtensionResults,
    FeatureIndexResults, IndexLocation, IndexProgress, ListResults, SpatialFilter, SpatialIndex,
};

pub const TABLE_INDEX: &str = "nga_table_index";
pub const GEOMETRY_INDEX: &str = "nga_geometry_index";

const CREATE_TABLES: &str = "
CREATE TABLE IF NOT EXISTS nga_table_index (
    table_name TEXT NOT NULL PRIMARY KEY,
    last_indexed DATETIME
);
CREATE TABLE IF NOT EXISTS nga_geometry_index (
    table_name TEXT NOT NULL,
    geom_id INTEGER NOT NULL,
    min_x DOUBLE NOT NULL,
    max_x DOUBLE NOT NULL,
    min_y DOUBLE NOT NULL,
    max_y DOUBLE NOT NULL,
    min_z DOUBLE,
    max_z DOUBLE,
    min_m DOUBLE,
    max_m DOUBLE,
    CONSTRAINT pk_ngi PRIMARY KEY (table_name, geom_id),
    CONSTRAINT fk_ngi_nti_tn FOREIGN KEY (table_name) REFERENCES nga_table_index(table_name)
);";

const ENTRY_COLUMNS: &str = "geom_id, min_x, max_x, min_y, max_y, min_z, max_z, min_m, max_m";

pub struct ExtensionIndex {
    dao: FeatureDao,
    batch_size: usize,
}

impl ExtensionIndex {
    pub fn new(dao: FeatureDao, batch_size: usize) -> Self {
        Self {
            dao,
            batch_size: batch_size.max(1),
        }
    }

    pub fn dao(&self) -> &FeatureDao {
        &self.dao
    }

    /// Whether both index tables exist in the store
    pub fn has_tables(&self) -> Result<bool> {
        let store = self.dao.store();
        Ok(store.table_exists(TABLE_INDEX)? && store.table_exists(GEOMETRY_INDEX)?)
    }

    /// Feature rows matching `filter`, read through one joined query
    pub fn query_features(&self, filter: &SpatialFilter) -> Result<Box<dyn FeatureIndexResults>> {
        if !self.has_tables()? {
            return Ok(Box::new(ListResults::empty()));
        }
        let (clause, args) = self.entry_filter(filter)?;
        let spec = QuerySpec::new().filter(
            format!(
                "{} IN (SELECT geom_id FROM {} WHERE {})",
                quote_ident(self.dao.table().pk_column()),
                GEOMETRY_INDEX,
                clause
            ),
            args,
        );
        Ok(Box::new(self.dao.query_results(&spec)?))
    }

    fn ensure_tables(&self) -> Result<()> {
        let store = self.dao.store();
        store.execute_batch(CREATE_TABLES)?;
        store.execute(
            "INSERT INTO nga_table_index (table_name, last_indexed) VALUES (?1, NULL)
             ON CONFLICT(table_name) DO NOTHING",
            &[Value::from(self.table_name())],
        )?;
        Ok(())
    }

    fn touch_last_indexed(&self) -> Result<()> {
        self.dao.store().execute(
            "UPDATE nga_table_index SET last_indexed = ?1 WHERE table_name = ?2",
            &[Value::Text(Timestamp::now().to_datetime_string()), Value::from(self.table_name())],
        )?;
        Ok(())
    }

    fn insert_entry(&self, id: RowId, envelope: &Envelope) -> Result<()> {
        let mut args = vec![Value::from(self.table_name()), Value::Integer(id)];
        args.extend(envelope_values(envelope));
        self.dao.store().execute(
            "INSERT OR REPLACE INTO nga_geometry_index
             (table_name, geom_id, min_x, max_x, min_y, max_y, min_z, max_z, min_m, max_m)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            &args,
        )?;
        Ok(())
    }

    /// `table_name = ?` plus the envelope terms, if any
    fn entry_filter(&self, filter: &SpatialFilter) -> Result<(String, Vec<Value>)> {
        let mut sql = String::from("table_name = ?");
        let mut args = vec![Value::from(self.table_name())];
        if let Some(envelope) = filter.resolve(self.dao.table(), None)? {
            let (clause, clause_args) = envelope_clause(&envelope);
            sql.push_str(" AND ");
            sql.push_str(&clause);
            args.extend(clause_args);
        }
        Ok((sql, args))
    }
}

impl SpatialIndex for ExtensionIndex {
    fn location(&self) -> IndexLocation {
        IndexLocation::Extension
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
        self.ensure_tables()?;

        let savepoint = self.dao.store().savepoint()?;
        self.dao.store().execute(
            "DELETE FROM nga_geometry_index WHERE table_name = ?1",
            &[Value::from(self.table_name())],
        )?;
        let indexed = scan_envelopes(&self.dao, self.batch_size, progress, |id, envelope| {
            self.insert_entry(id, envelope)
        })?;
        self.touch_last_indexed()?;
        savepoint.release()?;

        tracing::debug!(table = %self.table_name(), indexed, "Built extension index");
        Ok(indexed)
    }

    fn index_row(&self, row: &FeatureRow) -> Result<bool> {
        let Some(id) = row.id() else {
            return Ok(false);
        };
        self.ensure_tables()?;
        let indexed = match self.dao.envelope(row)? {
            Some(envelope) => {
                self.insert_entry(id, &envelope)?;
                true
            }
            None => {
                self.delete_index_for(id)?;
                false
            }
        };
        self.touch_last_indexed()?;
        Ok(indexed)
    }

    fn delete_index(&self) -> Result<bool> {
        if !self.has_tables()? {
            return Ok(false);
        }
        let table = [Value::from(self.table_name())];
        let savepoint = self.dao.store().savepoint()?;
        let entries = self
            .dao
            .store()
            .execute("DELETE FROM nga_geometry_index WHERE table_name = ?1", &table)?;
        let tables = self
            .dao
            .store()
            .execute("DELETE FROM nga_table_index WHERE table_name = ?1", &table)?;
        savepoint.release()?;
        Ok(entries + tables > 0)
    }

    fn delete_index_for(&self, geometry_id: RowId) -> Result<bool> {
        if !self.has_tables()? {
            return Ok(false);
        }
        let deleted = self.dao.store().execute(
            "DELETE FROM nga_geometry_index WHERE table_name = ?1 AND geom_id = ?2",
            &[Value::from(self.table_name()), Value::Integer(geometry_id)],
        )?;
        Ok(deleted > 0)
    }

    fn query(&self, filter: &SpatialFilter) -> Result<Box<dyn FeatureIndexResults>> {
        if !self.has_tables()? {
            return Ok(Box::new(ListResults::empty()));
        }
        let count = self.count(filter)?;
        let (clause, args) = self.entry_filter(filter)?;
        let cursor = WindowedCursor::open(
            self.dao.store().connection().clone(),
            format!("SELECT {} FROM {} WHERE {} ORDER BY geom_id", ENTRY_COLUMNS, GEOMETRY_INDEX, clause),
            args,
            self.dao.window_size(),
        )?;
        let entries = EntryCursor::new(self.table_name(), cursor);
        Ok(Box::new(ExtensionResults::new(entries, self.dao.clone(), count)))
    }

    fn count(&self, filter: &SpatialFilter) -> Result<u64> {
        if !self.has_tables()? {
            return Ok(0);
        }
        let (clause, args) = self.entry_filter(filter)?;
        let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", GEOMETRY_INDEX, clause);
        let count: i64 = self
            .dao
            .store()
            .connection()
            .with(|conn| conn.query_row(&sql, rusqlite::params_from_iter(args.iter()), |row| row.get(0)))?;
        Ok(count.max(0) as u64)
    }

    fn last_indexed(&self) -> Result<Option<Timestamp>> {
        if !self.dao.store().table_exists(TABLE_INDEX)? {
            return Ok(None);
        }
        let text: Option<String> = self.dao.store().connection().with(|conn| {
            conn.query_row(
                "SELECT last_indexed FROM nga_table_index WHERE table_name = ?1",
                [self.table_name()],
                |row| row.get(0),
            )
            .optional()
            .map(Option::flatten)
        })?;
        text.as_deref().map(Timestamp::parse).transpose()
    }

    fn bounds(&self) -> Result<Option<Envelope>> {
        if !self.has_tables()? {
            return Ok(None);
        }
        self.dao.store().connection().with(|conn| {
            conn.query_row(
                "SELECT MIN(min_x), MAX(max_x), MIN(min_y), MAX(max_y),
                        MIN(min_z), MAX(max_z), MIN(min_m), MAX(max_m)
                 FROM nga_geometry_index WHERE table_name = ?1",
                [self.table_name()],
                |row| envelope_from_row(row, 0),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeatureIndexConfig;
    use crate::index::{NoProgress, ResultsExt};
    use crate::storage::FeatureStore;
    use crate::testing;

    fn index() -> ExtensionIndex {
        ExtensionIndex::new(testing::sample_dao(), 2)
    }

    #[test]
    fn test_three_geometry_scenario() {
        let index = index();
        assert!(!index.is_indexed().unwrap());
        assert_eq!(index.index_table(false, &mut NoProgress).unwrap(), 3);
        assert!(index.is_indexed().unwrap());

        let query = testing::envelope(0.0, 12.0, 0.0, 12.0);
        let mut ids = index.query_envelope(&query).unwrap().collect_ids().unwrap();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(index.count_envelope(&query).unwrap(), 2);

        let far = testing::envelope(100.0, 110.0, 100.0, 110.0);
        assert_eq!(index.query_envelope(&far).unwrap().count(), 0);
        assert!(index.query_envelope(&far).unwrap().collect_ids().unwrap().is_empty());

        // already indexed and not forced
        assert_eq!(index.index_table(false, &mut NoProgress).unwrap(), 0);
        assert_eq!(index.index_table(true, &mut NoProgress).unwrap(), 3);
        assert_eq!(index.count_all().unwrap(), 3);
    }

    #[test]
    fn test_z_range_against_stored_entries() {
        let index = index();
        let with_z = testing::envelope(0.0, 10.0, 0.0, 10.0).with_z(0.0, 1.0).unwrap();
        index
            .dao()
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
    fn test_irreparable_row_is_yielded_degraded() {
        let index = index();
        index.index_table(true, &mut NoProgress).unwrap();
        index
            .dao()
            .store()
            .execute("UPDATE T SET name = ?1 WHERE id = 2", &[Value::Text("x".repeat(32 * 1024))])
            .unwrap();

        let mut results = index.query_all().unwrap();
        assert_eq!(results.count(), 3);
        let rows = results.rows().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(rows.len(), 3);
        assert!(!rows[1].is_valid());
        assert_eq!(rows.iter().filter_map(FeatureRow::id).collect::<Vec<_>>(), vec![1, 3]);
        results.close().unwrap();
    }

    #[test]
    fn test_boundary_touch_counts() {
        let index = index();
        index.index_table(true, &mut NoProgress).unwrap();
        // touches the max corner of geometry 3 only
        let corner = testing::envelope(30.0, 40.0, 30.0, 40.0);
        assert_eq!(index.query_envelope(&corner).unwrap().collect_ids().unwrap(), vec![3]);
    }

    #[test]
    fn test_rows_come_back_materialized() {
        let index = index();
        index.index_table(true, &mut NoProgress).unwrap();
        let mut results = index.query_envelope(&testing::envelope(4.0, 6.0, 4.0, 6.0)).unwrap();
        let rows: Vec<_> = results.rows().map(|r| r.unwrap()).collect();
        assert_eq!(rows.iter().map(|r| r.id().unwrap()).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(rows[1].value_by_name("name"), Some(&Value::from("second")));
    }

    #[test]
    fn test_absent_tables_read_empty() {
        let index = index();
        assert!(!index.has_tables().unwrap());
        assert_eq!(index.last_indexed().unwrap(), None);
        assert_eq!(index.count_all().unwrap(), 0);
        assert_eq!(index.query_all().unwrap().count(), 0);
        assert_eq!(index.bounds().unwrap(), None);
        assert!(!index.delete_index().unwrap());
    }

    #[test]
    fn test_stale_after_contents_change() {
        let index = index();
        index.index_table(true, &mut NoProgress).unwrap();
        index
            .dao()
            .store()
            .execute_batch(
                "CREATE TABLE gpkg_contents (table_name TEXT PRIMARY KEY, last_change DATETIME);
                 INSERT INTO gpkg_contents VALUES ('T', '2999-01-01T00:00:00.000Z');",
            )
            .unwrap();
        assert!(index.last_indexed().unwrap().is_some());
        assert!(!index.is_indexed().unwrap());
    }

    #[test]
    fn test_index_row_and_delete() {
        let index = index();
        let dao = index.dao().clone();
        index.index_table(true, &mut NoProgress).unwrap();

        dao.store()
            .execute(
                "UPDATE T SET geom = ?1 WHERE id = 3",
                &[Value::Blob(testing::geometry_blob(&testing::envelope(1.0, 2.0, 1.0, 2.0)))],
            )
            .unwrap();
        let row = dao.get_row(3).unwrap().unwrap();
        assert!(index.index_row(&row).unwrap());
        let mut ids = index
            .query_envelope(&testing::envelope(1.5, 1.5, 1.5, 1.5))
            .unwrap()
            .collect_ids()
            .unwrap();
        ids.sort();
        assert_eq!(ids, vec![1, 3]);

        dao.store().execute_batch("UPDATE T SET geom = NULL WHERE id = 3").unwrap();
        let row = dao.get_row(3).unwrap().unwrap();
        assert!(!index.index_row(&row).unwrap());
        assert_eq!(index.count_all().unwrap(), 2);

        assert!(index.delete_index_for(1).unwrap());
        assert!(!index.delete_index_for(1).unwrap());
        assert!(index.delete_index().unwrap());
        assert!(!index.is_indexed().unwrap());
        assert_eq!(index.count_all().unwrap(), 0);
    }

    #[test]
    fn test_bounds_and_query_features() {
        let index = index();
        index.index_table(true, &mut NoProgress).unwrap();
        assert_eq!(index.bounds().unwrap(), Some(testing::envelope(0.0, 30.0, 0.0, 30.0)));

        let mut results = index
            .query_features(&SpatialFilter::Envelope(testing::envelope(0.0, 12.0, 0.0, 12.0)))
            .unwrap();
        assert_eq!(results.count(), 2);
        assert_eq!(results.collect_ids().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_oversized_row_is_indexed() {
        let store = testing::sample_store();
        store
            .execute(
                "UPDATE T SET payload = ?1 WHERE id = 2",
                &[Value::Blob(testing::patterned_bytes(100 * 1024))],
            )
            .unwrap();
        let dao = crate::storage::FeatureDao::new(store, "T", &FeatureIndexConfig::for_testing()).unwrap();
        let index = ExtensionIndex::new(dao, 10);

        assert_eq!(index.index_table(true, &mut NoProgress).unwrap(), 3);
        let mut results = index.query_envelope(&testing::envelope(14.0, 15.0, 14.0, 15.0)).unwrap();
        let row = results.next_row().unwrap().unwrap();
        assert_eq!(row.id(), Some(2));
        assert_eq!(
            row.value_by_name("payload"),
            Some(&Value::Blob(testing::patterned_bytes(100 * 1024)))
        );
    }

    #[test]
    fn test_on_disk_store_persists_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roads.gpkg");
        {
            let store = FeatureStore::open(&path).unwrap();
            testing::populate(&store);
            let dao = crate::storage::FeatureDao::new(store, "T", &FeatureIndexConfig::for_testing()).unwrap();
            ExtensionIndex::new(dao, 2).index_table(true, &mut NoProgress).unwrap();
        }
        let store = FeatureStore::open(&path).unwrap();
        let dao = crate::storage::FeatureDao::new(store, "T", &FeatureIndexConfig::for_testing()).unwrap();
        let index = ExtensionIndex::new(dao, 2);
        assert!(index.is_indexed().unwrap());
        assert_eq!(index.count_all().unwrap(), 3);
    }
}
