//! Error types for the sync core primitives.

use thiserror::Error;

use crate::conflict::ConflictStatus;
use crate::operation::OperationStatus;
use crate::types::{ConflictId, EntityType, OperationId};

/// Encoding errors.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

/// Validation errors: malformed input or an illegal state transition.
///
/// Operations that fail validation are terminal and never retried.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("entity id must not be empty")]
    EmptyEntityId,

    #[error("{kind} payload does not fit entity type {entity_type}")]
    PayloadMismatch {
        entity_type: EntityType,
        kind: &'static str,
    },

    #[error("unknown {field}: {value}")]
    UnknownValue { field: &'static str, value: String },

    #[error("cannot {action} {id}: status is {status}")]
    InvalidTransition {
        id: OperationId,
        status: OperationStatus,
        action: &'static str,
    },

    #[error("{id} is already {status}")]
    AlreadySettled { id: ConflictId, status: ConflictStatus },

    #[error("merge resolution of {0} requires resolved data")]
    MergeRequiresData(ConflictId),

    #[error("retry count {retry_count} exceeds max retries {max_retries}")]
    RetryBudgetExceeded { retry_count: u32, max_retries: u32 },

    #[error("payload could not be encoded: {0}")]
    Unencodable(#[from] CoreError),
}
