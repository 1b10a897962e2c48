//! Storage layer implementation
//!
//! SQLite-backed feature tables read through a bounded cursor window, with
//! chunked recovery of rows that do not fit

pub mod connection;
pub mod store;
pub mod cursor;
pub mod dao;
pub mod reader;  // oversized-blob recovery

pub use connection::{quote_ident, Savepoint, SqlConnection};
pub use store::{FeatureStore, FeatureTable};
pub use cursor::{Fetch, WindowedCursor};
pub use dao::{FeatureDao, QuerySpec};
pub use reader::{FeatureCursor, InvalidPositions};
