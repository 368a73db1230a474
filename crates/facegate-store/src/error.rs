//! Error types for the storage layer.

use facegate_core::ValidationError;
use thiserror::Error;

/// A result type using `StoreError`.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The caller supplied an invalid vector or an unknown employee.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// An employee referenced a department or shift that does not exist.
    #[error("unknown {kind}: {name}")]
    UnknownReference { kind: &'static str, name: String },

    /// A database error occurred.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored row could not be decoded.
    #[error("invalid database value: {0}")]
    InvalidDbValue(String),
}
