//! Feature index results
//!
//! Single-pass, lazy results over feature rows. `next_row` and `next_id`
//! advance the same position. Every implementation closes on drop; calling
//! `close` explicitly surfaces close errors.

use crate::storage::{FeatureCursor, FeatureDao, WindowedCursor};
use crate::types::{FeatureRow, RowId};
use crate::Result;

use super::{entry_from_values, GeometryIndexEntry};

pub trait FeatureIndexResults {
    fn next_row(&mut self) -> Option<Result<FeatureRow>>;

    /// Id of the next row. Rows without a readable id are skipped.
    fn next_id(&mut self) -> Option<Result<RowId>>;

    /// Number of results, computed when the results were created
    fn count(&self) -> u64;

    /// Idempotent
    fn close(&mut self) -> Result<()>;
}

impl<R: FeatureIndexResults + ?Sized> FeatureIndexResults for Box<R> {
    fn next_row(&mut self) -> Option<Result<FeatureRow>> {
        (**self).next_row()
    }

    fn next_id(&mut self) -> Option<Result<RowId>> {
        (**self).next_id()
    }

    fn count(&self) -> u64 {
        (**self).count()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Iterator adapters over any results
pub trait ResultsExt: FeatureIndexResults {
    fn rows(&mut self) -> Rows<'_, Self> {
        Rows { inner: self }
    }

    fn ids(&mut self) -> Ids<'_, Self> {
        Ids { inner: self }
    }

    /// Drain the remaining ids
    fn collect_ids(&mut self) -> Result<Vec<RowId>> {
        self.ids().collect()
    }
}

impl<R: FeatureIndexResults + ?Sized> ResultsExt for R {}

pub struct Rows<'a, R: ?Sized> {
    inner: &'a mut R,
}

impl<R: FeatureIndexResults + ?Sized> Iterator for Rows<'_, R> {
    type Item = Result<FeatureRow>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next_row()
    }
}

pub struct Ids<'a, R: ?Sized> {
    inner: &'a mut R,
}

impl<R: FeatureIndexResults + ?Sized> Iterator for Ids<'_, R> {
    type Item = Result<RowId>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next_id()
    }
}

/// Results backed by a feature cursor
pub struct CursorResults {
    cursor: FeatureCursor,
    count: u64,
}

impl CursorResults {
    pub fn new(cursor: FeatureCursor, count: u64) -> Self {
        Self { cursor, count }
    }

    pub fn cursor(&self) -> &FeatureCursor {
        &self.cursor
    }
}

impl FeatureIndexResults for CursorResults {
    fn next_row(&mut self) -> Option<Result<FeatureRow>> {
        self.cursor.next()
    }

    fn next_id(&mut self) -> Option<Result<RowId>> {
        loop {
            match self.cursor.next()? {
                Ok(row) => {
                    if let Some(id) = row.id() {
                        return Some(Ok(id));
                    }
                }
                Err(e) => return Some(Err(e)),
            }
        }
    }

    fn count(&self) -> u64 {
        self.count
    }

    fn close(&mut self) -> Result<()> {
        self.cursor.close();
        Ok(())
    }
}

/// Lazy reader of index entries `[id, min_x .. max_m]`
pub(crate) struct EntryCursor {
    table_name: String,
    cursor: Option<WindowedCursor>,
}

impl EntryCursor {
    pub(crate) fn new(table_name: &str, cursor: WindowedCursor) -> Self {
        Self {
            table_name: table_name.to_string(),
            cursor: Some(cursor),
        }
    }

    fn next_entry(&mut self) -> Option<Result<GeometryIndexEntry>> {
        let cursor = self.cursor.as_mut()?;
        match read_entry(cursor, &self.table_name) {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.close();
                None
            }
            Err(e) => {
                self.close();
                Some(Err(e))
            }
        }
    }

    fn close(&mut self) {
        if let Some(mut cursor) = self.cursor.take() {
            cursor.close();
        }
    }
}

fn read_entry(cursor: &mut WindowedCursor, table_name: &str) -> Result<Option<GeometryIndexEntry>> {
    if !cursor.move_to_next()? {
        return Ok(None);
    }
    let values = (0..cursor.column_count())
        .map(|i| cursor.value(i).map(|v| v.ready().unwrap_or_default()))
        .collect::<Result<Vec<_>>>()?;
    entry_from_values(table_name, &values).map(Some)
}

/// Entry id → feature row, skipping entries whose row is gone.
///
/// A row that stays unreadable after recovery is yielded degraded, not as an
/// error, so one bad row never ends the iteration.
fn resolve_row(entries: &mut EntryCursor, dao: &FeatureDao) -> Option<Result<FeatureRow>> {
    loop {
        let entry = match entries.next_entry()? {
            Ok(entry) => entry,
            Err(e) => return Some(Err(e)),
        };
        match dao.fetch_row(entry.geometry_id) {
            Ok(Some(row)) => {
                if !row.is_valid() {
                    tracing::warn!(
                        table = %entry.table_name,
                        id = entry.geometry_id,
                        "Indexed row unreadable after requery, yielding degraded row"
                    );
                }
                return Some(Ok(row));
            }
            Ok(None) => {
                tracing::warn!(
                    table = %entry.table_name,
                    id = entry.geometry_id,
                    "Index entry refers to a missing row, skipping"
                );
            }
            Err(e) => return Some(Err(e)),
        }
    }
}

/// Results from the in-store extension index
pub struct ExtensionResults {
    entries: EntryCursor,
    dao: FeatureDao,
    count: u64,
}

impl ExtensionResults {
    pub(crate) fn new(entries: EntryCursor, dao: FeatureDao, count: u64) -> Self {
        Self { entries, dao, count }
    }

    /// Next raw index entry, without reading the feature row
    pub fn next_entry(&mut self) -> Option<Result<GeometryIndexEntry>> {
        self.entries.next_entry()
    }
}

impl FeatureIndexResults for ExtensionResults {
    fn next_row(&mut self) -> Option<Result<FeatureRow>> {
        resolve_row(&mut self.entries, &self.dao)
    }

    fn next_id(&mut self) -> Option<Result<RowId>> {
        self.entries.next_entry().map(|e| e.map(|entry| entry.geometry_id))
    }

    /// Index entry count. Exceeds the rows yielded when the index is out of
    /// date and some entries point at deleted rows.
    fn count(&self) -> u64 {
        self.count
    }

    fn close(&mut self) -> Result<()> {
        self.entries.close();
        Ok(())
    }
}

/// Results from the metadata side store
pub struct MetadataResults {
    entries: EntryCursor,
    dao: FeatureDao,
    count: u64,
}

impl MetadataResults {
    pub(crate) fn new(entries: EntryCursor, dao: FeatureDao, count: u64) -> Self {
        Self { entries, dao, count }
    }

    pub fn next_entry(&mut self) -> Option<Result<GeometryIndexEntry>> {
        self.entries.next_entry()
    }
}

impl FeatureIndexResults for MetadataResults {
    fn next_row(&mut self) -> Option<Result<FeatureRow>> {
        resolve_row(&mut self.entries, &self.dao)
    }

    fn next_id(&mut self) -> Option<Result<RowId>> {
        self.entries.next_entry().map(|e| e.map(|entry| entry.geometry_id))
    }

    /// Index entry count. Exceeds the rows yielded when the index is out of
    /// date and some entries point at deleted rows.
    fn count(&self) -> u64 {
        self.count
    }

    fn close(&mut self) -> Result<()> {
        self.entries.close();
        Ok(())
    }
}

/// Results over rows already in memory
pub struct ListResults {
    rows: std::vec::IntoIter<FeatureRow>,
    count: u64,
}

impl ListResults {
    pub fn new(rows: Vec<FeatureRow>) -> Self {
        let count = rows.len() as u64;
        Self {
            rows: rows.into_iter(),
            count,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

impl FeatureIndexResults for ListResults {
    fn next_row(&mut self) -> Option<Result<FeatureRow>> {
        self.rows.next().map(Ok)
    }

    fn next_id(&mut self) -> Option<Result<RowId>> {
        self.rows.find_map(|row| row.id()).map(Ok)
    }

    fn count(&self) -> u64 {
        self.count
    }

    fn close(&mut self) -> Result<()> {
        self.rows = Vec::new().into_iter();
        Ok(())
    }
}

/// Concatenation of several results, in order
pub struct MultiplexResults {
    children: Vec<Box<dyn FeatureIndexResults>>,
    current: usize,
}

impl MultiplexResults {
    pub fn new(children: Vec<Box<dyn FeatureIndexResults>>) -> Self {
        Self { children, current: 0 }
    }

    fn advance<T>(
        &mut self,
        mut next: impl FnMut(&mut dyn FeatureIndexResults) -> Option<Result<T>>,
    ) -> Option<Result<T>> {
        while let Some(child) = self.children.get_mut(self.current) {
            if let Some(item) = next(child.as_mut()) {
                return Some(item);
            }
            self.current += 1;
        }
        None
    }
}

impl FeatureIndexResults for MultiplexResults {
    fn next_row(&mut self) -> Option<Result<FeatureRow>> {
        self.advance(|child| child.next_row())
    }

    fn next_id(&mut self) -> Option<Result<RowId>> {
        self.advance(|child| child.next_id())
    }

    fn count(&self) -> u64 {
        self.children.iter().map(|c| c.count()).sum()
    }

    /// Closes every child; the first failure is returned after all were tried
    fn close(&mut self) -> Result<()> {
        let mut first_err = None;
        for child in &mut self.children {
            if let Err(e) = child.close() {
                tracing::warn!(error = %e, "Failed to close child results");
                first_err.get_or_insert(e);
            }
        }
        self.current = self.children.len();
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for MultiplexResults {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl Drop for ListResults {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::QuerySpec;
    use crate::testing;
    use crate::StorageError;

    struct Failing {
        closed: std::rc::Rc<std::cell::Cell<bool>>,
    }

    impl FeatureIndexResults for Failing {
        fn next_row(&mut self) -> Option<Result<FeatureRow>> {
            None
        }

        fn next_id(&mut self) -> Option<Result<RowId>> {
            None
        }

        fn count(&self) -> u64 {
            0
        }

        fn close(&mut self) -> Result<()> {
            self.closed.set(true);
            Err(StorageError::InvalidData("close failed".to_string()))
        }
    }

    fn list(dao: &FeatureDao, ids: &[RowId]) -> ListResults {
        ListResults::new(ids.iter().map(|id| dao.get_row(*id).unwrap().unwrap()).collect())
    }

    #[test]
    fn test_list_results() {
        let dao = testing::sample_dao();
        let mut results = list(&dao, &[3, 1]);
        assert_eq!(results.count(), 2);

        let first = results.next_row().unwrap().unwrap();
        assert_eq!(first.id(), Some(3));
        assert_eq!(results.next_id().unwrap().unwrap(), 1);
        assert!(results.next_id().is_none());
        results.close().unwrap();
        results.close().unwrap();
    }

    #[test]
    fn test_multiplex_concatenates_and_sums() {
        let dao = testing::sample_dao();
        let cursor = dao.query_results(&QuerySpec::new()).unwrap();
        let mut results = MultiplexResults::new(vec![
            Box::new(list(&dao, &[2])),
            Box::new(ListResults::empty()),
            Box::new(cursor),
        ]);
        assert_eq!(results.count(), 4);
        assert_eq!(results.collect_ids().unwrap(), vec![2, 1, 2, 3]);
        results.close().unwrap();
    }

    #[test]
    fn test_multiplex_rows_iterator() {
        let dao = testing::sample_dao();
        let mut results = MultiplexResults::new(vec![Box::new(list(&dao, &[1, 3]))]);
        let names: Vec<_> = results
            .rows()
            .map(|r| r.unwrap().value_by_name("name").cloned().unwrap())
            .collect();
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn test_multiplex_close_tries_every_child() {
        let closed = std::rc::Rc::new(std::cell::Cell::new(false));
        let dao = testing::sample_dao();
        let mut results = MultiplexResults::new(vec![
            Box::new(Failing { closed: closed.clone() }),
            Box::new(list(&dao, &[1])),
        ]);
        assert!(results.close().is_err());
        assert!(closed.get());
        assert!(results.next_id().is_none());
    }

    #[test]
    fn test_cursor_results_skip_invalid_ids() {
        let store = testing::sample_store();
        store
            .execute(
                "UPDATE T SET name = ?1 WHERE id = 2",
                &[crate::types::Value::Text("x".repeat(32 * 1024))],
            )
            .unwrap();
        let dao = FeatureDao::new(store, "T", &crate::config::FeatureIndexConfig::for_testing()).unwrap();
        let mut results = dao.query_results(&QuerySpec::new()).unwrap();
        assert_eq!(results.count(), 3);
        assert_eq!(results.collect_ids().unwrap(), vec![1, 3]);
    }
}
