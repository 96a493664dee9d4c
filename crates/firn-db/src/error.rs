//! Store error taxonomy.

use thiserror::Error;

/// Errors surfaced by the store layers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DatabaseError {
    #[error("database closed")]
    Closed,

    #[error("batch already applied")]
    BatchApplied,

    #[error("io: {0}")]
    Io(String),

    #[error("corruption: {0}")]
    Corruption(String),
}

impl From<std::io::Error> for DatabaseError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, DatabaseError>;
