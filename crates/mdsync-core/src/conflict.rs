//! Sync conflicts: divergences between a queued operation's base state and
//! the remote store's actual state.
//!
//! A conflict starts `Pending` and settles exactly once, either `Resolved`
//! (with the data every observer converges on) or `Ignored`. The settled
//! data and timestamp only exist inside the `Resolved` variant.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::data::EntityData;
use crate::error::ValidationError;
use crate::operation::OperationType;
use crate::types::{ConflictId, EntityRef, OperationId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    UpdateConflict,
    DeleteConflict,
}

impl ConflictType {
    /// Classify a mismatch.
    ///
    /// Deletes, and writes against a record that no longer exists remotely,
    /// are delete conflicts. Everything else is an update conflict.
    pub fn classify(operation_type: OperationType, remote: Option<&EntityData>) -> Self {
        match (operation_type, remote) {
            (OperationType::Delete, _) => ConflictType::DeleteConflict,
            (_, None) => ConflictType::DeleteConflict,
            _ => ConflictType::UpdateConflict,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::UpdateConflict => "update_conflict",
            ConflictType::DeleteConflict => "delete_conflict",
        }
    }
}

impl FromStr for ConflictType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "update_conflict" => Ok(ConflictType::UpdateConflict),
            "delete_conflict" => Ok(ConflictType::DeleteConflict),
            other => Err(ValidationError::UnknownValue {
                field: "conflict_type",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Pending,
    Resolved,
    Ignored,
}

impl ConflictStatus {
    pub const ALL: [ConflictStatus; 3] = [
        ConflictStatus::Pending,
        ConflictStatus::Resolved,
        ConflictStatus::Ignored,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStatus::Pending => "pending",
            ConflictStatus::Resolved => "resolved",
            ConflictStatus::Ignored => "ignored",
        }
    }
}

impl fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ConflictStatus::Pending),
            "resolved" => Ok(ConflictStatus::Resolved),
            "ignored" => Ok(ConflictStatus::Ignored),
            other => Err(ValidationError::UnknownValue {
                field: "conflict_status",
                value: other.to_string(),
            }),
        }
    }
}

/// The operator's (or rule's) choice for a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Keep the local change and force it onto the remote.
    Local,
    /// Keep the remote state and discard the local change.
    Remote,
    /// Keep caller-supplied data and force it onto the remote.
    Merge,
    /// Dismiss the conflict; nothing is written or published.
    Ignored,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Local => "local",
            Resolution::Remote => "remote",
            Resolution::Merge => "merge",
            Resolution::Ignored => "ignored",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Resolution::Local),
            "remote" => Ok(Resolution::Remote),
            "merge" => Ok(Resolution::Merge),
            "ignored" | "ignore" => Ok(Resolution::Ignored),
            other => Err(ValidationError::UnknownValue {
                field: "resolution",
                value: other.to_string(),
            }),
        }
    }
}

/// The state every observer converges on once a conflict is resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedData {
    Record(EntityData),
    /// The record does not exist after resolution.
    Deleted,
}

impl ResolvedData {
    pub fn record(&self) -> Option<&EntityData> {
        match self {
            ResolvedData::Record(data) => Some(data),
            ResolvedData::Deleted => None,
        }
    }

    pub fn into_record(self) -> Option<EntityData> {
        match self {
            ResolvedData::Record(data) => Some(data),
            ResolvedData::Deleted => None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        matches!(self, ResolvedData::Deleted)
    }
}

impl From<Option<EntityData>> for ResolvedData {
    fn from(data: Option<EntityData>) -> Self {
        data.map_or(ResolvedData::Deleted, ResolvedData::Record)
    }
}

/// Lifecycle of a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConflictState {
    Pending,
    Resolved {
        resolution: Resolution,
        resolved_data: ResolvedData,
        resolved_at: i64,
    },
    Ignored {
        ignored_at: i64,
    },
}

impl ConflictState {
    pub fn status(&self) -> ConflictStatus {
        match self {
            ConflictState::Pending => ConflictStatus::Pending,
            ConflictState::Resolved { .. } => ConflictStatus::Resolved,
            ConflictState::Ignored { .. } => ConflictStatus::Ignored,
        }
    }
}

/// A conflict as detected by the sync engine, before it has an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewConflict {
    pub operation_id: OperationId,
    pub operation_type: OperationType,
    pub entity: EntityRef,
    pub local_data: EntityData,
    pub remote_data: Option<EntityData>,
    pub conflict_type: ConflictType,
    pub detected_at: i64,
}

/// A recorded conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: ConflictId,
    /// The queued operation that hit the mismatch.
    pub operation_id: OperationId,
    pub operation_type: OperationType,
    pub entity: EntityRef,
    /// The operation's payload.
    pub local_data: EntityData,
    /// Remote record at detection time; `None` if it no longer existed.
    pub remote_data: Option<EntityData>,
    pub conflict_type: ConflictType,
    pub state: ConflictState,
    pub notes: Option<String>,
    pub detected_at: i64,
}

impl SyncConflict {
    pub fn from_new(id: ConflictId, new: NewConflict) -> Self {
        Self {
            id,
            operation_id: new.operation_id,
            operation_type: new.operation_type,
            entity: new.entity,
            local_data: new.local_data,
            remote_data: new.remote_data,
            conflict_type: new.conflict_type,
            state: ConflictState::Pending,
            notes: None,
            detected_at: new.detected_at,
        }
    }

    pub fn status(&self) -> ConflictStatus {
        self.state.status()
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, ConflictState::Pending)
    }

    pub fn resolution(&self) -> Option<Resolution> {
        match &self.state {
            ConflictState::Resolved { resolution, .. } => Some(*resolution),
            ConflictState::Ignored { .. } => Some(Resolution::Ignored),
            ConflictState::Pending => None,
        }
    }

    /// Present exactly when the conflict is resolved.
    pub fn resolved_data(&self) -> Option<&ResolvedData> {
        match &self.state {
            ConflictState::Resolved { resolved_data, .. } => Some(resolved_data),
            _ => None,
        }
    }

    /// The record a resolution kept, if it kept one.
    pub fn resolved_record(&self) -> Option<&EntityData> {
        self.resolved_data().and_then(ResolvedData::record)
    }

    pub fn resolved_at(&self) -> Option<i64> {
        match &self.state {
            ConflictState::Resolved { resolved_at, .. } => Some(*resolved_at),
            _ => None,
        }
    }

    /// Whether a resolution re-applies the local deletion.
    pub fn resolves_to_delete(&self, resolution: Resolution) -> bool {
        resolution == Resolution::Local && self.operation_type == OperationType::Delete
    }

    /// Compute the settled state for a resolution without applying it.
    ///
    /// `supplied` is only consulted for `Merge`, where it is required.
    pub fn plan(
        &self,
        resolution: Resolution,
        supplied: Option<EntityData>,
        now: i64,
    ) -> Result<ConflictState, ValidationError> {
        if !self.is_pending() {
            return Err(ValidationError::AlreadySettled {
                id: self.id,
                status: self.status(),
            });
        }

        let resolved_data = match resolution {
            Resolution::Ignored => return Ok(ConflictState::Ignored { ignored_at: now }),
            _ if self.resolves_to_delete(resolution) => ResolvedData::Deleted,
            Resolution::Local => ResolvedData::Record(self.local_data.clone()),
            Resolution::Remote => ResolvedData::from(self.remote_data.clone()),
            Resolution::Merge => {
                let data = supplied.ok_or(ValidationError::MergeRequiresData(self.id))?;
                if !data.fits(&self.entity.entity_type) {
                    return Err(ValidationError::PayloadMismatch {
                        entity_type: self.entity.entity_type.clone(),
                        kind: data.kind(),
                    });
                }
                ResolvedData::Record(data)
            }
        };

        Ok(ConflictState::Resolved {
            resolution,
            resolved_data,
            resolved_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ProductRecord;

    fn product(price: f64) -> EntityData {
        EntityData::from(ProductRecord::default().with_price(price))
    }

    fn conflict(operation_type: OperationType) -> SyncConflict {
        SyncConflict::from_new(
            ConflictId(1),
            NewConflict {
                operation_id: OperationId(7),
                operation_type,
                entity: EntityRef::new("product", "42"),
                local_data: product(10.0),
                remote_data: Some(product(12.0)),
                conflict_type: ConflictType::UpdateConflict,
                detected_at: 100,
            },
        )
    }

    #[test]
    fn test_classify() {
        let remote = product(1.0);
        assert_eq!(
            ConflictType::classify(OperationType::Update, Some(&remote)),
            ConflictType::UpdateConflict
        );
        assert_eq!(
            ConflictType::classify(OperationType::Update, None),
            ConflictType::DeleteConflict
        );
        assert_eq!(
            ConflictType::classify(OperationType::Delete, Some(&remote)),
            ConflictType::DeleteConflict
        );
    }

    #[test]
    fn test_plan_local_and_remote() {
        let c = conflict(OperationType::Update);

        let local = c.plan(Resolution::Local, None, 200).unwrap();
        assert!(matches!(
            local,
            ConflictState::Resolved { resolved_data: ResolvedData::Record(ref d), resolved_at: 200, .. } if *d == product(10.0)
        ));

        let remote = c.plan(Resolution::Remote, Some(product(99.0)), 200).unwrap();
        assert!(matches!(
            remote,
            ConflictState::Resolved { resolved_data: ResolvedData::Record(ref d), .. } if *d == product(12.0)
        ));
    }

    #[test]
    fn test_plan_merge_requires_data() {
        let c = conflict(OperationType::Update);
        assert!(matches!(
            c.plan(Resolution::Merge, None, 1),
            Err(ValidationError::MergeRequiresData(_))
        ));

        let merged = c.plan(Resolution::Merge, Some(product(11.0)), 1).unwrap();
        assert!(matches!(
            merged,
            ConflictState::Resolved { resolution: Resolution::Merge, resolved_data: ResolvedData::Record(ref d), .. } if *d == product(11.0)
        ));
    }

    #[test]
    fn test_plan_ignored_and_double_settle() {
        let mut c = conflict(OperationType::Update);
        let state = c.plan(Resolution::Ignored, None, 5).unwrap();
        assert_eq!(state, ConflictState::Ignored { ignored_at: 5 });
        assert_eq!(state.status(), ConflictStatus::Ignored);

        c.state = state;
        assert!(c.resolved_data().is_none());
        assert!(c.resolved_at().is_none());
        assert!(matches!(
            c.plan(Resolution::Local, None, 6),
            Err(ValidationError::AlreadySettled { .. })
        ));
    }

    #[test]
    fn test_local_resolution_of_delete_resolves_to_absent() {
        let c = conflict(OperationType::Delete);
        assert!(c.resolves_to_delete(Resolution::Local));
        let state = c.plan(Resolution::Local, None, 1).unwrap();
        assert!(matches!(state, ConflictState::Resolved { resolved_data: ResolvedData::Deleted, .. }));
    }

    #[test]
    fn test_remote_resolution_of_vanished_record_is_deleted() {
        let mut c = conflict(OperationType::Update);
        c.remote_data = None;
        c.state = c.plan(Resolution::Remote, None, 3).unwrap();

        assert_eq!(c.resolved_data(), Some(&ResolvedData::Deleted));
        assert!(c.resolved_record().is_none());
        assert_eq!(c.resolved_at(), Some(3));
    }

    #[test]
    fn test_resolution_parse() {
        assert_eq!("local".parse::<Resolution>().unwrap(), Resolution::Local);
        assert_eq!("ignored".parse::<Resolution>().unwrap(), Resolution::Ignored);
        assert!("theirs".parse::<Resolution>().is_err());
    }
}
