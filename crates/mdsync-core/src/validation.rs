//! Operation validation: structural checks run before an operation is
//! queued and again before it is applied.

use crate::canonical::to_cbor;
use crate::error::ValidationError;
use crate::operation::{NewOperation, OfflineOperation};
use crate::types::EntityRef;
use crate::data::EntityData;

/// Validate an operation submitted by the write path.
///
/// This performs:
/// - Entity id check
/// - Payload kind vs entity type
/// - Payload encodability (it must survive storage and the broker)
pub fn validate_new_operation(op: &NewOperation) -> Result<(), ValidationError> {
    validate_payload(&op.entity, &op.payload)
}

/// Validate a queued operation before applying it.
///
/// Adds the retry budget invariant on top of the structural checks.
pub fn validate_operation(op: &OfflineOperation) -> Result<(), ValidationError> {
    if op.retry_count > op.max_retries {
        return Err(ValidationError::RetryBudgetExceeded {
            retry_count: op.retry_count,
            max_retries: op.max_retries,
        });
    }
    validate_payload(&op.entity, &op.payload)
}

/// Validate a payload against the entity it describes.
pub fn validate_payload(entity: &EntityRef, payload: &EntityData) -> Result<(), ValidationError> {
    if entity.entity_id.trim().is_empty() {
        return Err(ValidationError::EmptyEntityId);
    }

    if !payload.fits(&entity.entity_type) {
        return Err(ValidationError::PayloadMismatch {
            entity_type: entity.entity_type.clone(),
            kind: payload.kind(),
        });
    }

    to_cbor(payload)?;
    Ok(())
}
