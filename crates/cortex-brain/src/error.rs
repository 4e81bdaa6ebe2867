//! Error types for the brain crate.

use thiserror::Error;

use crate::validation::ValidationError;

/// Errors that can occur in the brain crate.
#[derive(Debug, Error)]
pub enum BrainError {
    /// The store file could not be opened or is not a store of a known schema.
    #[error("Cannot open store: {0}")]
    StoreOpen(String),

    /// A referenced record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Input rejected at the store boundary.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Writer contention exhausted the retry budget.
    #[error("Store busy: write abandoned after {attempts} attempts")]
    Concurrency { attempts: u32 },

    /// The embedding collaborator is absent or failed.
    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// A snapshot file is not a recognized backup of this store.
    #[error("Snapshot format error: {0}")]
    SnapshotFormat(String),

    /// Import target already exists.
    #[error("Target already exists: {0}")]
    TargetExists(String),

    /// Write attempted through a read-only handle.
    #[error("Store was opened read-only")]
    ReadOnly,

    /// Database connection or operation failed.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored data could not be decoded.
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl BrainError {
    /// Whether this error is SQLite reporting a busy or locked database.
    pub fn is_contention(&self) -> bool {
        match self {
            BrainError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Result type alias for brain operations.
pub type Result<T> = std::result::Result<T, BrainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contention_detection() {
        let busy = BrainError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(busy.is_contention());

        let locked = BrainError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
            None,
        ));
        assert!(locked.is_contention());

        assert!(!BrainError::NotFound("x".into()).is_contention());
        assert!(
            !BrainError::Database(rusqlite::Error::QueryReturnedNoRows).is_contention()
        );
    }

    #[test]
    fn test_validation_converts() {
        let err: BrainError = ValidationError::EmptyField("subject").into();
        assert!(matches!(err, BrainError::Validation(_)));
        assert!(err.to_string().contains("subject"));
    }
}
