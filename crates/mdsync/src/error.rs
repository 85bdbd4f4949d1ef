//! Error types for the service.

use mdsync_core::ValidationError;
use mdsync_events::EventError;
use mdsync_store::StoreError;
use mdsync_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during service operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Validation error.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Event error.
    #[error("event error: {0}")]
    Event(#[from] EventError),

    /// The service was already started.
    #[error("service already started")]
    AlreadyStarted,

    /// The service has been shut down.
    #[error("service is shut down")]
    ShutDown,

    /// A background task panicked or was aborted.
    #[error("background task failed: {0}")]
    Task(String),
}

impl ServiceError {
    pub fn is_queue_full(&self) -> bool {
        match self {
            ServiceError::Store(e) => e.is_queue_full(),
            ServiceError::Sync(SyncError::Store(e)) => e.is_queue_full(),
            _ => false,
        }
    }

    pub fn is_already_settled(&self) -> bool {
        match self {
            ServiceError::Sync(e) => e.is_already_settled(),
            ServiceError::Validation(ValidationError::AlreadySettled { .. }) => true,
            _ => false,
        }
    }

    pub fn is_drain_in_progress(&self) -> bool {
        matches!(self, ServiceError::Sync(SyncError::DrainInProgress))
    }
}

/// Result type for service operations.
pub type Result<T> = std::result::Result<T, ServiceError>;
