//! Windowed forward cursor
//!
//! Rows are pulled from SQLite into a bounded byte window, one window at a
//! time, the way mobile SQLite drivers fill a cursor window:
//!
//! - a window holds as many consecutive rows as fit in `window_size` bytes
//! - a row that alone exceeds the window occupies a window of its own as an
//!   overflow slot; every read on it returns [`Fetch::TooLarge`]
//! - the row count is established by the first window fill; if the very first
//!   row overflows, the count itself is [`Fetch::TooLarge`]
//!
//! Oversized values are an expected case, not an error, so callers can decide
//! how to recover (see [`FeatureCursor`](super::FeatureCursor)).

use std::sync::Arc;

use super::connection::SqlConnection;
use crate::types::{value_ref_size, Value};
use crate::{Result, StorageError};

/// Outcome of a cursor read
#[derive(Debug, Clone, PartialEq)]
pub enum Fetch<T> {
    Ready(T),
    /// The row did not fit in the cursor window
    TooLarge,
}

impl<T> Fetch<T> {
    pub fn ready(self) -> Option<T> {
        match self {
            Fetch::Ready(v) => Some(v),
            Fetch::TooLarge => None,
        }
    }

    pub fn is_too_large(&self) -> bool {
        matches!(self, Fetch::TooLarge)
    }
}

#[derive(Debug)]
enum Slot {
    Row(Vec<Value>),
    Overflow,
}

pub struct WindowedCursor {
    conn: SqlConnection,
    sql: String,
    args: Vec<Value>,
    columns: Arc<[String]>,
    window_size: usize,
    window_start: usize,
    window: Vec<Slot>,
    filled: bool,
    count: Option<Fetch<usize>>,
    /// `None` = before the first row
    position: Option<usize>,
    closed: bool,
}

impl WindowedCursor {
    /// Prepare `sql` (validating it) without reading any row yet
    pub fn open(conn: SqlConnection, sql: String, args: Vec<Value>, window_size: usize) -> Result<Self> {
        let columns: Vec<String> = conn.with(|c| {
            let stmt = c.prepare(&sql)?;
            Ok(stmt.column_names().into_iter().map(str::to_string).collect())
        })?;

        Ok(Self {
            conn,
            sql,
            args,
            columns: columns.into(),
            window_size: window_size.max(1),
            window_start: 0,
            window: Vec::new(),
            filled: false,
            count: None,
            position: None,
            closed: false,
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn position(&self) -> Option<usize> {
        self.position
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Total rows, established by the first window fill
    pub fn count(&mut self) -> Result<Fetch<usize>> {
        self.ensure_open()?;
        if self.count.is_none() {
            self.fill(0)?;
        }
        Ok(self.count.clone().unwrap_or(Fetch::Ready(0)))
    }

    pub fn move_to_next(&mut self) -> Result<bool> {
        let next = self.position.map_or(0, |p| p + 1);
        self.move_to_position(next)
    }

    pub fn move_to_position(&mut self, position: usize) -> Result<bool> {
        self.ensure_open()?;
        if let Some(Fetch::Ready(count)) = self.count {
            if position >= count {
                self.position = Some(count);
                return Ok(false);
            }
        }
        if !self.in_window(position) {
            self.fill(position)?;
        }
        self.position = Some(position);
        Ok(self.in_window(position))
    }

    /// Read a column of the current row
    pub fn value(&self, column: usize) -> Result<Fetch<Value>> {
        self.ensure_open()?;
        let slot = self
            .position
            .filter(|p| self.in_window(*p))
            .map(|p| &self.window[p - self.window_start])
            .ok_or_else(|| StorageError::InvalidData("Cursor is not positioned on a row".to_string()))?;

        match slot {
            Slot::Overflow => Ok(Fetch::TooLarge),
            Slot::Row(values) => values
                .get(column)
                .cloned()
                .map(Fetch::Ready)
                .ok_or_else(|| StorageError::ColumnNotFound(format!("column index {}", column))),
        }
    }

    /// Idempotent
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.window = Vec::new();
            self.filled = false;
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(StorageError::CursorClosed)
        } else {
            Ok(())
        }
    }

    fn in_window(&self, position: usize) -> bool {
        self.filled && position >= self.window_start && position < self.window_start + self.window.len()
    }

    /// Load the window starting at `start`.
    ///
    /// A fill from row 0 with an unknown count keeps stepping past the window
    /// to count the remaining rows (stepping does not read column data).
    fn fill(&mut self, start: usize) -> Result<()> {
        let counting = start == 0 && self.count.is_none();
        let window_size = self.window_size;
        let width = self.columns.len();
        let sql = format!("SELECT * FROM ({}) LIMIT -1 OFFSET {}", self.sql, start);
        let args = &self.args;

        let (slots, seen) = self.conn.with(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(rusqlite::params_from_iter(args.iter()))?;
            let mut slots = Vec::new();
            let mut used = 0usize;
            let mut full = false;
            let mut seen = 0usize;

            while let Some(row) = rows.next()? {
                seen += 1;
                if !full {
                    let size = (0..width)
                        .map(|i| row.get_ref(i).map(|v| value_ref_size(&v)))
                        .sum::<rusqlite::Result<usize>>()?;
                    if slots.is_empty() && size > window_size {
                        slots.push(Slot::Overflow);
                        full = true;
                    } else if used + size > window_size {
                        full = true;
                    } else {
                        used += size;
                        let values = (0..width)
                            .map(|i| row.get_ref(i).map(Value::from))
                            .collect::<rusqlite::Result<Vec<_>>>()?;
                        slots.push(Slot::Row(values));
                    }
                }
                if full && !counting {
                    break;
                }
                if full && counting && matches!(slots.first(), Some(Slot::Overflow)) {
                    // the driver cannot size a result whose first row does not fit
                    break;
                }
            }
            Ok((slots, seen))
        })?;

        if counting {
            self.count = Some(match slots.first() {
                Some(Slot::Overflow) => Fetch::TooLarge,
                _ => Fetch::Ready(seen),
            });
        }
        tracing::trace!(start, rows = slots.len(), "Filled cursor window");
        self.window_start = start;
        self.window = slots;
        self.filled = true;
        Ok(())
    }
}

impl Drop for WindowedCursor {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for WindowedCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowedCursor")
            .field("sql", &self.sql)
            .field("position", &self.position)
            .field("window_start", &self.window_start)
            .field("window_rows", &self.window.len())
            .field("closed", &self.closed)
            .finish()
    }
}
