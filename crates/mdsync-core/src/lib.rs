//! # mdsync Core
//!
//! Pure primitives for the master data sync core: operations, conflicts,
//! events and the payloads they carry.
//!
//! This crate contains no I/O, no storage, no networking. State machines
//! and encodings live here so every backend applies them identically.
//!
//! ## Key Types
//!
//! - [`OfflineOperation`] - A mutation queued while disconnected
//! - [`SyncConflict`] - A divergence between a queued operation and the remote
//! - [`MasterDataEvent`] - An immutable record of a committed change
//! - [`EntityData`] - Tagged payload union (typed records, field maps, opaque bytes)
//! - [`Fingerprint`] - BLAKE3 base-state token for optimistic writes
//!
//! ## Encoding
//!
//! Payloads and events are encoded as CBOR. See [`canonical`] module.

pub mod canonical;
pub mod conflict;
pub mod data;
pub mod error;
pub mod event;
pub mod fingerprint;
pub mod operation;
pub mod types;
pub mod validation;

pub use canonical::{from_cbor, to_cbor};
pub use conflict::{
    ConflictState, ConflictStatus, ConflictType, NewConflict, Resolution, ResolvedData,
    SyncConflict,
};
pub use data::{CustomerRecord, EntityData, ProductRecord};
pub use error::{CoreError, ValidationError};
pub use event::{EventType, MasterDataEvent, Metadata, NewEvent, Topic, META_COUNT, META_ENTITY_IDS};
pub use fingerprint::{ExpectedBase, Fingerprint};
pub use operation::{
    backoff_delay, next_ready, FailOutcome, NewOperation, OfflineOperation, OperationStatus,
    OperationType, Priority, Retry, DEFAULT_MAX_RETRIES,
};
pub use types::{now_millis, ConflictId, EntityRef, EntityType, EventId, OperationId, Page, Paged};
pub use validation::{validate_new_operation, validate_operation, validate_payload};
