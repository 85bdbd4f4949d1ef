//! Error types for the store module.

use mdsync_core::{CoreError, ValidationError};
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Payload serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] CoreError),

    /// Row not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The bounded queue is full. Backpressure signal for the caller.
    #[error("queue is full: {live} live operations, capacity {capacity}")]
    QueueFull { live: usize, capacity: usize },

    /// Rejected input or state transition.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Invalid data in storage.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// A lock guarding the store was poisoned by a panicking writer.
    #[error("store lock poisoned: {0}")]
    Poisoned(String),

    /// A blocking database task failed to complete.
    #[error("blocking task failed: {0}")]
    TaskJoin(String),
}

impl StoreError {
    /// Whether the caller hit the capacity bound.
    pub fn is_queue_full(&self) -> bool {
        matches!(self, StoreError::QueueFull { .. })
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
