//! Feature row reader with oversized-blob recovery
//!
//! # State machine
//! ```text
//!   Normal ──(original cursor exhausted, invalid rows seen, recovery attached)──▶ Requery ──▶ Done
//!     │                                                                                      ▲
//!     └──────────────(nothing to repair / no recovery handle)────────────────────────────────┘
//! ```
//!
//! - **Normal**: rows come straight from the original cursor. A row whose
//!   primary key reads `TooLarge` or null is recorded as an invalid position
//!   and still yielded, with `valid = false`. If the count itself is
//!   `TooLarge` every position is invalid and the original pass yields nothing.
//! - **Requery**: the same query is re-issued with every blob column replaced
//!   by `NULL`, so rows fit the window again. Recorded positions are re-sought
//!   one by one (or, for the all-invalid case, the requery cursor is driven to
//!   completion). Each blob column of a recovered row is then read in
//!   `chunk_size` slices via `substr`, keyed by primary key.
//!
//! Re-reading the whole row would hit the same window limit; only the blob
//! columns are isolated and chunked.

use std::sync::Arc;

use super::cursor::{Fetch, WindowedCursor};
use super::dao::QuerySpec;
use super::store::{FeatureStore, FeatureTable};
use crate::types::{FeatureRow, RowId, Value};
use crate::Result;

/// Ordinal positions of the original pass whose primary key was unreadable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidPositions {
    Positions(Vec<usize>),
    /// The first read of the result set failed; every position is suspect
    All,
}

impl InvalidPositions {
    pub fn is_empty(&self) -> bool {
        matches!(self, InvalidPositions::Positions(p) if p.is_empty())
    }
}

/// Everything needed to re-issue the query out of band
#[derive(Clone)]
pub(crate) struct Recovery {
    pub(crate) store: FeatureStore,
    pub(crate) spec: QuerySpec,
    pub(crate) window_size: usize,
    pub(crate) chunk_size: usize,
}

enum ReaderState {
    Normal,
    Requery {
        cursor: WindowedCursor,
        /// `None` drives the requery cursor to completion
        pending: Option<std::vec::IntoIter<usize>>,
    },
    Done,
}

/// Forward iterator over feature rows
pub struct FeatureCursor {
    table: Arc<FeatureTable>,
    cursor: WindowedCursor,
    recovery: Option<Recovery>,
    invalid: InvalidPositions,
    state: ReaderState,
    started: bool,
    repaired: usize,
}

impl FeatureCursor {
    pub(crate) fn new(table: Arc<FeatureTable>, cursor: WindowedCursor, recovery: Option<Recovery>) -> Self {
        Self {
            table,
            cursor,
            recovery,
            invalid: InvalidPositions::Positions(Vec::new()),
            state: ReaderState::Normal,
            started: false,
            repaired: 0,
        }
    }

    pub fn table(&self) -> &FeatureTable {
        &self.table
    }

    /// Row count of the original pass as the driver reports it
    pub fn count(&mut self) -> Result<Fetch<usize>> {
        self.cursor.count()
    }

    pub fn invalid_positions(&self) -> &InvalidPositions {
        &self.invalid
    }

    pub fn is_requerying(&self) -> bool {
        matches!(self.state, ReaderState::Requery { .. })
    }

    /// Rows whose blobs were restored by chunked reads so far
    pub fn repaired_rows(&self) -> usize {
        self.repaired
    }

    /// Idempotent
    pub fn close(&mut self) {
        self.cursor.close();
        if let ReaderState::Requery { cursor, .. } = &mut self.state {
            cursor.close();
        }
        self.state = ReaderState::Done;
    }

    fn step(&mut self) -> Result<Option<FeatureRow>> {
        loop {
            match &mut self.state {
                ReaderState::Normal => {
                    if !self.started {
                        self.started = true;
                        if self.cursor.count()?.is_too_large() {
                            tracing::debug!(
                                table = %self.table.name(),
                                "First row exceeds the cursor window, treating every position as invalid"
                            );
                            self.invalid = InvalidPositions::All;
                            self.begin_requery()?;
                            continue;
                        }
                    }
                    if self.cursor.move_to_next()? {
                        let row = read_row(&self.table, &self.cursor)?;
                        if !row.is_valid() {
                            if let (InvalidPositions::Positions(positions), Some(position)) =
                                (&mut self.invalid, self.cursor.position())
                            {
                                positions.push(position);
                            }
                        }
                        return Ok(Some(row));
                    }
                    self.begin_requery()?;
                }
                ReaderState::Requery { cursor, pending } => {
                    let moved = match pending {
                        Some(positions) => match positions.next() {
                            Some(position) => {
                                let found = cursor.move_to_position(position)?;
                                if !found {
                                    tracing::warn!(
                                        table = %self.table.name(),
                                        position,
                                        "Invalid row vanished before requery"
                                    );
                                    continue;
                                }
                                true
                            }
                            None => false,
                        },
                        None => cursor.move_to_next()?,
                    };
                    if !moved {
                        cursor.close();
                        self.state = ReaderState::Done;
                        continue;
                    }

                    let mut row = read_row(&self.table, cursor)?;
                    match (row.id(), &self.recovery) {
                        (Some(id), Some(recovery)) => {
                            for &column in self.table.blob_columns() {
                                let bytes = read_blob_chunked(
                                    &recovery.store,
                                    &self.table,
                                    column,
                                    id,
                                    recovery.chunk_size,
                                )?;
                                if !bytes.is_empty() {
                                    row.set_value(column, Value::Blob(bytes));
                                }
                            }
                            self.repaired += 1;
                        }
                        _ => {
                            tracing::warn!(
                                table = %self.table.name(),
                                position = ?cursor.position(),
                                "Row still unreadable after requery"
                            );
                        }
                    }
                    return Ok(Some(row));
                }
                ReaderState::Done => return Ok(None),
            }
        }
    }

    fn begin_requery(&mut self) -> Result<()> {
        self.cursor.close();
        if self.invalid.is_empty() {
            self.state = ReaderState::Done;
            return Ok(());
        }
        let Some(recovery) = &self.recovery else {
            tracing::debug!(
                table = %self.table.name(),
                invalid = ?self.invalid,
                "Invalid rows left unrepaired, no recovery handle"
            );
            self.state = ReaderState::Done;
            return Ok(());
        };

        let cursor = WindowedCursor::open(
            recovery.store.connection().clone(),
            recovery.spec.select_sql(&self.table, true),
            recovery.spec.args.clone(),
            recovery.window_size,
        )?;
        let pending = match &self.invalid {
            InvalidPositions::All => None,
            InvalidPositions::Positions(positions) => Some(positions.clone().into_iter()),
        };
        tracing::debug!(
            table = %self.table.name(),
            invalid = ?self.invalid,
            "Requerying rows with blob columns nulled"
        );
        self.state = ReaderState::Requery { cursor, pending };
        Ok(())
    }
}

impl Iterator for FeatureCursor {
    type Item = Result<FeatureRow>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => None,
            Err(e) => {
                self.close();
                Some(Err(e))
            }
        }
    }
}

impl Drop for FeatureCursor {
    fn drop(&mut self) {
        self.close();
    }
}

/// Materialize the current cursor row.
///
/// An overflowing row becomes a degraded placeholder; a column that reads
/// `TooLarge` on an otherwise readable row is left null.
fn read_row(table: &FeatureTable, cursor: &WindowedCursor) -> Result<FeatureRow> {
    if cursor.value(table.pk_index())?.is_too_large() {
        return Ok(FeatureRow::degraded(
            table.shared_name(),
            table.shared_columns(),
            table.pk_index(),
            table.geometry_index(),
        ));
    }
    let values = (0..table.columns().len())
        .map(|i| cursor.value(i).map(|v| v.ready().unwrap_or(Value::Null)))
        .collect::<Result<Vec<_>>>()?;
    Ok(FeatureRow::new(
        table.shared_name(),
        table.shared_columns(),
        values,
        table.pk_index(),
        table.geometry_index(),
    ))
}

/// Read a blob column in `chunk_size` slices until an empty slice comes back
pub(crate) fn read_blob_chunked(
    store: &FeatureStore,
    table: &FeatureTable,
    column: usize,
    id: RowId,
    chunk_size: usize,
) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    let mut offset = 1usize;
    loop {
        let chunk = store.read_blob_chunk(table, column, id, offset, chunk_size)?;
        if chunk.is_empty() {
            break;
        }
        bytes.extend_from_slice(&chunk);
        offset += chunk_size;
    }
    Ok(bytes)
}
