//! Error types for the feature index layer

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    /// An operation needed a pinned index location and none was set or implied.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unsupported index location: {0}")]
    UnsupportedLocation(String),

    /// Query/count with no backend in the query order reporting itself indexed.
    #[error("Features are not indexed: {0}")]
    NotIndexed(String),

    /// Driver/SQL failure. Never retried.
    #[error("Storage read error: {0}")]
    StorageRead(#[from] rusqlite::Error),

    /// A row whose identifier stays unreadable even after the requery pass.
    #[error("Irreparable row in table '{table}': {detail}")]
    IrreparableRow { table: String, detail: String },

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Unsupported projection: {0}")]
    UnsupportedProjection(String),

    #[error("Cursor is closed")]
    CursorClosed,

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
