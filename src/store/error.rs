//! Error types for the store module

use thiserror::Error;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by a job or leadership store
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite rejected the operation
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A document could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row holds a value that does not decode
    #[error("Corrupt value in column '{column}': {reason}")]
    Corrupt { column: String, reason: String },

    /// A lock guarding store state was poisoned by a panicking writer
    #[error("Store lock poisoned: {0}")]
    LockPoisoned(&'static str),

    /// Any other backend failure
    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Create a corrupt-column error
    pub fn corrupt(column: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            column: column.into(),
            reason: reason.into(),
        }
    }

    /// Create a generic backend error
    pub fn backend(reason: impl Into<String>) -> Self {
        Self::Backend(reason.into())
    }
}
