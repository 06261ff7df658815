//! Storage-specific error types.
//!
//! Every persistence call returns [`StorageError`]; collectors map it onto the
//! storage-write failure class so a failing write aborts the current cycle
//! without touching the schedule.

use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database operation failed (sqlx error).
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error (e.g., directory creation failure).
    #[error("internal error: {0}")]
    Internal(String),

    /// Invalid data in database or in a record handed to the persister.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Referenced source does not exist.
    #[error("source not found: {0}")]
    SourceNotFound(String),
}

impl StorageError {
    /// Whether the error is caused by a record rather than the database.
    pub fn is_invalid_data(&self) -> bool {
        matches!(self, Self::InvalidData(_))
    }
}
