//! Proptest generators for property-based testing.

use proptest::prelude::*;
use serde_json::{Map, Value};

use mdsync::core::{
    CustomerRecord, EntityData, EntityRef, EntityType, ExpectedBase, NewOperation,
    OperationType, Priority, ProductRecord,
};

/// Generate one of the modeled entity types.
pub fn entity_type() -> impl Strategy<Value = EntityType> {
    prop_oneof![
        Just(EntityType::Product),
        Just(EntityType::Customer),
        Just(EntityType::Employee),
        Just(EntityType::Supplier),
        Just(EntityType::Account),
        "[a-z]{3,12}".prop_map(|name| EntityType::from(name)),
    ]
}

/// Generate an entity id.
pub fn entity_id() -> impl Strategy<Value = String> {
    "[A-Z0-9]{1,12}".prop_map(String::from)
}

/// Generate a reference drawn from a small pool, so generated scripts
/// touch the same entity repeatedly.
pub fn pooled_entity(pool: usize) -> impl Strategy<Value = EntityRef> {
    (0..pool.max(1)).prop_map(|i| EntityRef::new(EntityType::Product, format!("P{i}")))
}

pub fn priority() -> impl Strategy<Value = Priority> {
    prop_oneof![Just(Priority::High), Just(Priority::Medium), Just(Priority::Low)]
}

/// Generate a price in cents, as a float.
pub fn price() -> impl Strategy<Value = f64> {
    (0u32..1_000_000).prop_map(|cents| f64::from(cents) / 100.0)
}

pub fn product_record() -> impl Strategy<Value = ProductRecord> {
    (
        proptest::option::of("[A-Z]{3}-[0-9]{4}"),
        proptest::option::of("[a-zA-Z ]{1,24}"),
        proptest::option::of(price()),
        proptest::option::of(0i64..10_000),
    )
        .prop_map(|(sku, name, price, stock)| ProductRecord {
            sku,
            name,
            price,
            stock,
            extra: Map::new(),
        })
}

pub fn customer_record() -> impl Strategy<Value = CustomerRecord> {
    (
        proptest::option::of("[a-zA-Z ]{1,24}"),
        proptest::option::of("[a-z]{1,8}@[a-z]{1,8}\\.com"),
    )
        .prop_map(|(name, email)| CustomerRecord {
            name,
            email,
            phone: None,
            extra: Map::new(),
        })
}

/// Generate a schemaless field map.
pub fn fields() -> impl Strategy<Value = Map<String, Value>> {
    proptest::collection::btree_map("[a-z_]{1,10}", any::<i64>(), 0..6).prop_map(|entries| {
        entries
            .into_iter()
            .map(|(k, v)| (k, Value::from(v)))
            .collect()
    })
}

/// Generate a payload that fits `entity_type`.
pub fn entity_data_for(entity_type: EntityType) -> BoxedStrategy<EntityData> {
    match entity_type {
        EntityType::Product => product_record().prop_map(EntityData::Product).boxed(),
        EntityType::Customer => customer_record().prop_map(EntityData::Customer).boxed(),
        _ => prop_oneof![
            fields().prop_map(EntityData::Fields),
            proptest::collection::vec(any::<u8>(), 0..64)
                .prop_map(|bytes| EntityData::Opaque(bytes.into())),
        ]
        .boxed(),
    }
}

/// Generate an entity reference together with a payload that fits it.
pub fn entity_with_data() -> impl Strategy<Value = (EntityRef, EntityData)> {
    (entity_type(), entity_id()).prop_flat_map(|(entity_type, id)| {
        let entity = EntityRef::new(entity_type.clone(), id);
        entity_data_for(entity_type).prop_map(move |data| (entity.clone(), data))
    })
}

/// Parameters for generating a queued operation.
#[derive(Debug, Clone)]
pub struct OperationParams {
    pub operation_type: OperationType,
    pub entity: EntityRef,
    pub payload: EntityData,
    pub priority: Priority,
    pub max_retries: u32,
}

impl OperationParams {
    /// The operation with an unconditional base.
    pub fn to_new_operation(&self) -> NewOperation {
        NewOperation::new(
            self.operation_type,
            self.entity.clone(),
            self.payload.clone(),
            ExpectedBase::Any,
        )
        .priority(self.priority)
        .max_retries(self.max_retries)
    }
}

impl Arbitrary for OperationParams {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (
            prop_oneof![
                Just(OperationType::Create),
                Just(OperationType::Update),
                Just(OperationType::Delete),
            ],
            entity_with_data(),
            priority(),
            0u32..=5,
        )
            .prop_map(
                |(operation_type, (entity, payload), priority, max_retries)| OperationParams {
                    operation_type,
                    entity,
                    payload,
                    priority,
                    max_retries,
                },
            )
            .boxed()
    }
}

/// Generate a script of price updates over a small product pool.
///
/// Each entry is `(entity, price, priority)`.
pub fn update_script(
    pool: usize,
    max_len: usize,
) -> impl Strategy<Value = Vec<(EntityRef, f64, Priority)>> {
    proptest::collection::vec((pooled_entity(pool), price(), priority()), 1..=max_len.max(1))
}
