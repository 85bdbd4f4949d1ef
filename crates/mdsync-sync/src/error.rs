//! Error types for the sync module.

use thiserror::Error;

use mdsync_core::{ConflictId, CoreError, ValidationError};
use mdsync_events::EventError;
use mdsync_store::StoreError;

use crate::remote::RemoteError;

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another drain pass is already running on this engine.
    #[error("a drain pass is already in progress")]
    DrainInProgress,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("event error: {0}")]
    Event(#[from] EventError),

    #[error("encoding error: {0}")]
    Encoding(#[from] CoreError),

    #[error("conflict not found: {0}")]
    ConflictNotFound(ConflictId),

    /// The pass was cancelled before it finished.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// The conflict was already resolved or ignored, whichever layer noticed.
    pub fn is_already_settled(&self) -> bool {
        matches!(
            self,
            SyncError::Validation(ValidationError::AlreadySettled { .. })
                | SyncError::Store(StoreError::Validation(
                    ValidationError::AlreadySettled { .. }
                ))
        )
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Remote(e) if e.is_transient())
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
