//! Shared SQLite connection handle
//!
//! The feature store and the metadata side store both hand out clones of one
//! connection. The mutex is held for a single statement or window fill at a
//! time, never across a row handed to the caller.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};

use crate::Result;

static SAVEPOINT_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Clone)]
pub struct SqlConnection {
    conn: Arc<Mutex<Connection>>,
}

impl SqlConnection {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::from_connection(Connection::open(path)?))
    }

    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI,
        )?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run `f` with the connection locked
    pub fn with<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        Ok(f(&conn)?)
    }

    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.with(|conn| conn.execute_batch(sql))
    }

    /// Open a savepoint; rolled back on drop unless released
    pub fn savepoint(&self) -> Result<Savepoint> {
        let name = format!("geofeature_sp_{}", SAVEPOINT_SEQ.fetch_add(1, Ordering::Relaxed));
        self.execute_batch(&format!("SAVEPOINT {}", name))?;
        Ok(Savepoint {
            conn: self.clone(),
            name,
            finished: false,
        })
    }
}

/// Nestable transaction scope.
///
/// Does not hold the connection lock, so statements issued while it is open
/// (including window fills of a cursor on the same connection) still run.
pub struct Savepoint {
    conn: SqlConnection,
    name: String,
    finished: bool,
}

impl Savepoint {
    pub fn release(mut self) -> Result<()> {
        self.finished = true;
        self.conn.execute_batch(&format!("RELEASE {}", self.name))
    }

    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.rollback_inner()
    }

    fn rollback_inner(&self) -> Result<()> {
        self.conn
            .execute_batch(&format!("ROLLBACK TO {0}; RELEASE {0}", self.name))
    }
}

impl Drop for Savepoint {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.rollback_inner() {
                tracing::warn!(savepoint = %self.name, error = %e, "Savepoint rollback failed");
            }
        }
    }
}

/// Quote an SQL identifier
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_savepoint_rollback_on_drop() {
        let conn = SqlConnection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (v INTEGER)").unwrap();

        {
            let _sp = conn.savepoint().unwrap();
            conn.execute_batch("INSERT INTO t VALUES (1)").unwrap();
        }
        let sp = conn.savepoint().unwrap();
        conn.execute_batch("INSERT INTO t VALUES (2)").unwrap();
        sp.release().unwrap();

        let total: i64 = conn
            .with(|c| c.query_row("SELECT COALESCE(SUM(v), 0) FROM t", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(total, 2);
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("geom"), "\"geom\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
