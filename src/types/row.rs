//! Materialized feature rows

use std::sync::Arc;

use super::{RowId, Value, ValueType};

/// One materialized record of a feature table.
///
/// Column names are shared with every other row read from the same table.
/// A row is *valid* unless its primary key could not be read; invalid rows are
/// still handed to callers (positions must stay countable) but their values
/// are not authoritative.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    table: Arc<str>,
    columns: Arc<[String]>,
    values: Vec<Value>,
    types: Vec<ValueType>,
    id: Option<RowId>,
    pk_index: usize,
    geometry_index: Option<usize>,
    valid: bool,
}

impl FeatureRow {
    /// Build a row; validity follows from whether the primary key is readable.
    pub(crate) fn new(
        table: Arc<str>,
        columns: Arc<[String]>,
        values: Vec<Value>,
        pk_index: usize,
        geometry_index: Option<usize>,
    ) -> Self {
        let types = values.iter().map(Value::value_type).collect();
        let id = values.get(pk_index).and_then(Value::as_integer);
        Self {
            table,
            columns,
            values,
            types,
            id,
            pk_index,
            geometry_index,
            valid: id.is_some(),
        }
    }

    /// Placeholder for a row the cursor could not materialize
    pub(crate) fn degraded(
        table: Arc<str>,
        columns: Arc<[String]>,
        pk_index: usize,
        geometry_index: Option<usize>,
    ) -> Self {
        let width = columns.len();
        Self {
            table,
            columns,
            values: vec![Value::Null; width],
            types: vec![ValueType::Null; width],
            id: None,
            pk_index,
            geometry_index,
            valid: false,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Primary key, `None` when it could not be read
    pub fn id(&self) -> Option<RowId> {
        self.id
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn value(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn value_by_name(&self, column: &str) -> Option<&Value> {
        self.column_index(column).and_then(|i| self.values.get(i))
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(column))
    }

    pub fn column_type(&self, index: usize) -> Option<ValueType> {
        self.types.get(index).copied()
    }

    pub fn pk_index(&self) -> usize {
        self.pk_index
    }

    pub fn geometry_index(&self) -> Option<usize> {
        self.geometry_index
    }

    /// Encoded geometry, `None` for null geometries or tables without one
    pub fn geometry(&self) -> Option<&[u8]> {
        self.geometry_index
            .and_then(|i| self.values.get(i))
            .and_then(Value::as_blob)
    }

    /// Install a value read out of band (blob repair) and retype the column
    pub(crate) fn set_value(&mut self, index: usize, value: Value) {
        if index < self.values.len() {
            self.types[index] = value.value_type();
            self.values[index] = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns() -> Arc<[String]> {
        vec!["id".to_string(), "name".to_string(), "geom".to_string()].into()
    }

    #[test]
    fn test_row_accessors() {
        let row = FeatureRow::new(
            Arc::from("roads"),
            columns(),
            vec![Value::Integer(7), Value::from("main"), Value::Blob(vec![1, 2])],
            0,
            Some(2),
        );
        assert!(row.is_valid());
        assert_eq!(row.id(), Some(7));
        assert_eq!(row.table(), "roads");
        assert_eq!(row.geometry(), Some(&[1u8, 2][..]));
        assert_eq!(row.value_by_name("NAME"), Some(&Value::from("main")));
        assert_eq!(row.column_type(2), Some(ValueType::Blob));
    }

    #[test]
    fn test_null_pk_is_invalid() {
        let row = FeatureRow::new(
            Arc::from("roads"),
            columns(),
            vec![Value::Null, Value::Null, Value::Null],
            0,
            Some(2),
        );
        assert!(!row.is_valid());
        assert_eq!(row.id(), None);
        assert_eq!(row.geometry(), None);
    }

    #[test]
    fn test_set_value_retypes_column() {
        let mut row = FeatureRow::new(
            Arc::from("roads"),
            columns(),
            vec![Value::Integer(1), Value::Null, Value::Null],
            0,
            Some(2),
        );
        assert_eq!(row.column_type(2), Some(ValueType::Null));
        row.set_value(2, Value::Blob(vec![0; 4]));
        assert_eq!(row.column_type(2), Some(ValueType::Blob));
        assert_eq!(row.geometry().map(<[u8]>::len), Some(4));
    }
}
