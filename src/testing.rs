//! Shared test fixtures
//!
//! The sample table `T`:
//!
//! | id | name     | geom envelope        | payload |
//! |----|----------|----------------------|---------|
//! | 1  | "first"  | x 0..10,  y 0..10    | NULL    |
//! | 2  | "second" | x 5..15,  y 5..15    | NULL    |
//! | 3  | "third"  | x 20..30, y 20..30   | NULL    |

use std::sync::Arc;

use crate::config::FeatureIndexConfig;
use crate::index::{FeatureIndexManager, MetadataDb};
use crate::storage::{FeatureDao, FeatureStore};
use crate::types::{encode_header, Envelope, FeatureRow, RowId, Value};

pub(crate) fn envelope(min_x: f64, max_x: f64, min_y: f64, max_y: f64) -> Envelope {
    Envelope::new(min_x, max_x, min_y, max_y).unwrap()
}

/// GeoPackage header with `envelope` plus a stand-in WKB body
pub(crate) fn geometry_blob(envelope: &Envelope) -> Vec<u8> {
    let mut blob = encode_header(4326, Some(envelope));
    // little-endian WKB point header, coordinates left zeroed
    blob.extend_from_slice(&[0x01, 0x01, 0x00, 0x00, 0x00]);
    blob.extend_from_slice(&[0u8; 16]);
    blob
}

/// Deterministic non-repeating-looking bytes
pub(crate) fn patterned_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) ^ (i >> 8)) as u8).collect()
}

/// Create and fill table `T`
pub(crate) fn populate(store: &FeatureStore) {
    store
        .execute_batch(
            "CREATE TABLE T (
                id INTEGER PRIMARY KEY NOT NULL,
                name TEXT,
                geom GEOMETRY,
                payload BLOB
            )",
        )
        .unwrap();
    let rows = [
        (1, "first", envelope(0.0, 10.0, 0.0, 10.0)),
        (2, "second", envelope(5.0, 15.0, 5.0, 15.0)),
        (3, "third", envelope(20.0, 30.0, 20.0, 30.0)),
    ];
    for (id, name, env) in rows {
        store
            .execute(
                "INSERT INTO T (id, name, geom, payload) VALUES (?1, ?2, ?3, NULL)",
                &[Value::Integer(id), Value::from(name), Value::Blob(geometry_blob(&env))],
            )
            .unwrap();
    }
}

pub(crate) fn sample_store() -> FeatureStore {
    let store = FeatureStore::open_in_memory("sample").unwrap();
    populate(&store);
    store
}

pub(crate) fn sample_dao() -> FeatureDao {
    FeatureDao::new(sample_store(), "T", &FeatureIndexConfig::for_testing()).unwrap()
}

pub(crate) fn sample_manager() -> FeatureIndexManager {
    FeatureIndexManager::new(
        sample_dao(),
        MetadataDb::open_in_memory().unwrap(),
        &FeatureIndexConfig::for_testing(),
    )
    .unwrap()
}

/// Sample table registered in `gpkg_geometry_columns` with `srs_id`
pub(crate) fn sample_manager_with_srs(srs_id: i32) -> FeatureIndexManager {
    let store = sample_store();
    store
        .execute_batch("CREATE TABLE gpkg_geometry_columns (table_name TEXT, column_name TEXT, srs_id INTEGER)")
        .unwrap();
    store
        .execute(
            "INSERT INTO gpkg_geometry_columns VALUES ('T', 'geom', ?1)",
            &[Value::Integer(srs_id as i64)],
        )
        .unwrap();
    let config = FeatureIndexConfig::for_testing();
    let dao = FeatureDao::new(store, "T", &config).unwrap();
    FeatureIndexManager::new(dao, MetadataDb::open_in_memory().unwrap(), &config).unwrap()
}

/// Detached two-column row `(id, name)`
pub(crate) fn plain_row(table: &str, id: RowId) -> FeatureRow {
    FeatureRow::new(
        Arc::from(table),
        Arc::from(vec!["id".to_string(), "name".to_string()]),
        vec![Value::Integer(id), Value::from(format!("row {}", id))],
        0,
        None,
    )
}

pub(crate) fn invalid_row(table: &str) -> FeatureRow {
    FeatureRow::degraded(
        Arc::from(table),
        Arc::from(vec!["id".to_string(), "name".to_string()]),
        0,
        None,
    )
}
