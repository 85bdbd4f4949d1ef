//! Master data events: immutable records of committed entity changes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::canonical::{from_cbor, to_cbor};
use crate::data::EntityData;
use crate::error::CoreError;
use crate::operation::OperationType;
use crate::types::{EntityRef, EntityType, EventId};

/// Free-form event metadata.
pub type Metadata = BTreeMap<String, Value>;

/// Metadata key holding the id list of a bulk event.
pub const META_ENTITY_IDS: &str = "entity_ids";
/// Metadata key holding the id count of a bulk event.
pub const META_COUNT: &str = "count";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum EventType {
    Create,
    Update,
    Delete,
    /// Application-defined events (imports, price list refreshes, ...).
    Custom(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::Create => "CREATE",
            EventType::Update => "UPDATE",
            EventType::Delete => "DELETE",
            EventType::Custom(name) => name,
        }
    }

    /// CREATE, UPDATE and DELETE also go to the sync topic.
    pub fn is_mutation(&self) -> bool {
        matches!(self, EventType::Create | EventType::Update | EventType::Delete)
    }
}

impl From<OperationType> for EventType {
    fn from(op: OperationType) -> Self {
        match op {
            OperationType::Create => EventType::Create,
            OperationType::Update => EventType::Update,
            OperationType::Delete => EventType::Delete,
        }
    }
}

impl From<String> for EventType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "CREATE" => EventType::Create,
            "UPDATE" => EventType::Update,
            "DELETE" => EventType::Delete,
            _ => EventType::Custom(s),
        }
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broker topics the publisher writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Topic {
    Events,
    Audit,
    Sync,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Events => "events",
            Topic::Audit => "audit",
            Topic::Sync => "sync",
        }
    }

    /// Topics an event of this type fans out to.
    pub fn for_event(event_type: &EventType) -> Vec<Topic> {
        let mut topics = vec![Topic::Events, Topic::Audit];
        if event_type.is_mutation() {
            topics.push(Topic::Sync);
        }
        topics
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event before publication. The publisher stamps id and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_type: EventType,
    pub entity_type: EntityType,
    pub entity_id: Option<String>,
    pub old_data: Option<EntityData>,
    pub new_data: Option<EntityData>,
    pub user_id: Option<String>,
    pub metadata: Metadata,
}

impl NewEvent {
    pub fn new(event_type: EventType, entity: &EntityRef) -> Self {
        Self {
            event_type,
            entity_type: entity.entity_type.clone(),
            entity_id: Some(entity.entity_id.clone()),
            old_data: None,
            new_data: None,
            user_id: None,
            metadata: Metadata::new(),
        }
    }

    /// One event standing in for a bulk change of many entities.
    pub fn bulk(
        event_type: EventType,
        entity_type: EntityType,
        entity_ids: &[String],
        mut metadata: Metadata,
    ) -> Self {
        metadata.insert(
            META_ENTITY_IDS.into(),
            Value::Array(entity_ids.iter().cloned().map(Value::String).collect()),
        );
        metadata.insert(META_COUNT.into(), Value::from(entity_ids.len()));
        Self {
            event_type,
            entity_type,
            entity_id: None,
            old_data: None,
            new_data: None,
            user_id: None,
            metadata,
        }
    }

    pub fn old_data(mut self, data: Option<EntityData>) -> Self {
        self.old_data = data;
        self
    }

    pub fn new_data(mut self, data: Option<EntityData>) -> Self {
        self.new_data = data;
        self
    }

    /// The actor behind the change, if known.
    pub fn user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Stamp the draft, making it an immutable published event.
    pub fn stamp(self, event_id: EventId, timestamp: i64, source: impl Into<String>) -> MasterDataEvent {
        MasterDataEvent {
            event_id,
            event_type: self.event_type,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            old_data: self.old_data,
            new_data: self.new_data,
            user_id: self.user_id,
            timestamp,
            source: source.into(),
            metadata: self.metadata,
        }
    }
}

/// A published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterDataEvent {
    pub event_id: EventId,
    pub event_type: EventType,
    pub entity_type: EntityType,
    /// `None` for bulk events; see the `entity_ids` metadata.
    pub entity_id: Option<String>,
    pub old_data: Option<EntityData>,
    pub new_data: Option<EntityData>,
    pub user_id: Option<String>,
    pub timestamp: i64,
    pub source: String,
    pub metadata: Metadata,
}

impl MasterDataEvent {
    /// Wire encoding used on the broker.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CoreError> {
        to_cbor(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        from_cbor(bytes)
    }

    pub fn entity(&self) -> Option<EntityRef> {
        self.entity_id
            .as_ref()
            .map(|id| EntityRef::new(self.entity_type.clone(), id.clone()))
    }

    pub fn is_bulk(&self) -> bool {
        self.entity_id.is_none() && self.metadata.contains_key(META_ENTITY_IDS)
    }

    /// Number of entities this event covers.
    pub fn entity_count(&self) -> u64 {
        if self.entity_id.is_some() {
            return 1;
        }
        self.metadata
            .get(META_COUNT)
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }
}
