//! Entity payloads.
//!
//! Payloads are a tagged union: known entity kinds get a typed record,
//! anything else travels as a field map or as opaque bytes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::EntityType;

/// Product master data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stock: Option<i64>,
    /// Columns the core does not model.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProductRecord {
    pub fn with_price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Customer master data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomerRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The payload of an operation or event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EntityData {
    Product(ProductRecord),
    Customer(CustomerRecord),
    /// Schemaless fields for entity kinds without a typed record.
    Fields(Map<String, Value>),
    /// Bytes the core never looks into.
    Opaque(Bytes),
}

impl EntityData {
    /// Build a `Fields` payload from a JSON object.
    ///
    /// Non-object JSON values are wrapped under a `value` key.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Object(map) => EntityData::Fields(map),
            other => {
                let mut map = Map::new();
                map.insert("value".into(), other);
                EntityData::Fields(map)
            }
        }
    }

    /// Short name of the variant, used in logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            EntityData::Product(_) => "product",
            EntityData::Customer(_) => "customer",
            EntityData::Fields(_) => "fields",
            EntityData::Opaque(_) => "opaque",
        }
    }

    /// Whether this payload can describe an entity of the given type.
    ///
    /// Typed records only fit their own entity type; `Fields` and
    /// `Opaque` fit any.
    pub fn fits(&self, entity_type: &EntityType) -> bool {
        match self {
            EntityData::Product(_) => *entity_type == EntityType::Product,
            EntityData::Customer(_) => *entity_type == EntityType::Customer,
            EntityData::Fields(_) | EntityData::Opaque(_) => true,
        }
    }

    /// Read a single field as JSON. Always `None` for opaque payloads.
    pub fn field(&self, name: &str) -> Option<Value> {
        let value = match self {
            EntityData::Product(record) => serde_json::to_value(record).ok()?,
            EntityData::Customer(record) => serde_json::to_value(record).ok()?,
            EntityData::Fields(map) => return map.get(name).cloned(),
            EntityData::Opaque(_) => return None,
        };
        value.get(name).cloned()
    }

    pub fn as_product(&self) -> Option<&ProductRecord> {
        match self {
            EntityData::Product(record) => Some(record),
            _ => None,
        }
    }
}

impl From<ProductRecord> for EntityData {
    fn from(record: ProductRecord) -> Self {
        EntityData::Product(record)
    }
}

impl From<CustomerRecord> for EntityData {
    fn from(record: CustomerRecord) -> Self {
        EntityData::Customer(record)
    }
}
