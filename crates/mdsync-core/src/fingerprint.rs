//! Fingerprints: the optimistic base-state token.
//!
//! An operation remembers the fingerprint of the record it was authored
//! against. The remote store compares it with the fingerprint of its
//! current record at write time.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::canonical::to_cbor;
use crate::data::EntityData;
use crate::error::CoreError;

/// Domain separator mixed into every fingerprint.
const FINGERPRINT_DOMAIN: &[u8] = b"mdsync-record-v0:";

/// BLAKE3 hash of a record's CBOR encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    /// Fingerprint a record.
    pub fn of(data: &EntityData) -> Result<Self, CoreError> {
        let encoded = to_cbor(data)?;
        let mut hasher = blake3::Hasher::new();
        hasher.update(FINGERPRINT_DOMAIN);
        hasher.update(&encoded);
        Ok(Self(*hasher.finalize().as_bytes()))
    }

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

/// What an operation expects the remote record to look like before it applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectedBase {
    /// The record must not exist (creates).
    Absent,
    /// The record must currently hash to this fingerprint.
    Matches(Fingerprint),
    /// No baseline was known when the operation was authored; the write
    /// is unconditional.
    Any,
}

impl ExpectedBase {
    /// Derive the expectation from the record an operation was authored against.
    pub fn from_known(known: Option<&EntityData>) -> Result<Self, CoreError> {
        match known {
            Some(data) => Ok(ExpectedBase::Matches(Fingerprint::of(data)?)),
            None => Ok(ExpectedBase::Absent),
        }
    }

    /// Check the expectation against the current remote record.
    pub fn admits(&self, current: Option<&EntityData>) -> Result<bool, CoreError> {
        match (self, current) {
            (ExpectedBase::Any, _) => Ok(true),
            (ExpectedBase::Absent, None) => Ok(true),
            (ExpectedBase::Absent, Some(_)) => Ok(false),
            (ExpectedBase::Matches(_), None) => Ok(false),
            (ExpectedBase::Matches(expected), Some(data)) => Ok(*expected == Fingerprint::of(data)?),
        }
    }
}
