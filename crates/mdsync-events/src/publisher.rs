//! Best-effort multicast of master data events.
//!
//! A publish stamps the draft with a fresh id and timestamp, encodes it
//! once and writes it to every topic the event type fans out to. Topic
//! writes are independent: one failing topic never prevents the others
//! and never fails the call. Callers get a [`PublishReport`] saying which
//! topics took the event.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use tracing::{debug, warn};

use mdsync_core::{
    now_millis, EntityType, EventId, EventType, MasterDataEvent, Metadata, NewEvent, Topic,
};

use crate::broker::Broker;
use crate::error::{BrokerError, Result};

/// Outcome of one topic write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicDelivery {
    pub topic: Topic,
    pub result: std::result::Result<(), BrokerError>,
}

impl TopicDelivery {
    pub fn is_delivered(&self) -> bool {
        self.result.is_ok()
    }
}

/// What a publish did.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishReport {
    /// The event as published.
    pub event: MasterDataEvent,
    pub deliveries: Vec<TopicDelivery>,
}

impl PublishReport {
    pub fn event_id(&self) -> EventId {
        self.event.event_id
    }

    /// Every topic accepted the event.
    pub fn is_complete(&self) -> bool {
        self.deliveries.iter().all(TopicDelivery::is_delivered)
    }

    pub fn delivered_to(&self, topic: Topic) -> bool {
        self.deliveries
            .iter()
            .any(|d| d.topic == topic && d.is_delivered())
    }

    pub fn failed_topics(&self) -> Vec<Topic> {
        self.deliveries
            .iter()
            .filter(|d| !d.is_delivered())
            .map(|d| d.topic)
            .collect()
    }
}

/// Publishes events to a broker.
#[derive(Clone)]
pub struct EventPublisher {
    broker: Arc<dyn Broker>,
    source: String,
}

impl EventPublisher {
    pub fn new(broker: Arc<dyn Broker>, source: impl Into<String>) -> Self {
        Self {
            broker,
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Stamp and publish an event.
    ///
    /// Fails only if the event cannot be encoded; topic failures are
    /// logged and reported.
    pub async fn publish(&self, draft: NewEvent) -> Result<PublishReport> {
        let event = draft.stamp(EventId::generate(), now_millis(), self.source.clone());
        let payload = Bytes::from(event.to_bytes()?);

        let topics = Topic::for_event(&event.event_type);
        let writes = topics.iter().map(|topic| {
            let payload = payload.clone();
            async move {
                TopicDelivery {
                    topic: *topic,
                    result: self.broker.publish(*topic, payload).await,
                }
            }
        });
        let deliveries = join_all(writes).await;

        for delivery in &deliveries {
            if let Err(e) = &delivery.result {
                warn!(
                    event_id = %event.event_id,
                    topic = %delivery.topic,
                    error = %e,
                    "event topic write failed"
                );
            }
        }
        debug!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            entity_type = %event.entity_type,
            topics = deliveries.len(),
            "published event"
        );

        Ok(PublishReport { event, deliveries })
    }

    /// Publish one event standing in for a change to many entities.
    ///
    /// The ids travel in the `entity_ids` metadata, with their `count`.
    pub async fn publish_bulk(
        &self,
        event_type: EventType,
        entity_type: EntityType,
        entity_ids: &[String],
        metadata: Metadata,
    ) -> Result<PublishReport> {
        self.publish(NewEvent::bulk(event_type, entity_type, entity_ids, metadata))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use mdsync_core::{EntityData, EntityRef, ProductRecord};

    fn publisher() -> (Arc<MemoryBroker>, EventPublisher) {
        let broker = Arc::new(MemoryBroker::default());
        let publisher = EventPublisher::new(broker.clone(), "test");
        (broker, publisher)
    }

    #[tokio::test]
    async fn test_mutation_goes_to_three_topics() {
        let (broker, publisher) = publisher();
        let draft = NewEvent::new(EventType::Update, &EntityRef::new("product", "42"))
            .new_data(Some(EntityData::from(ProductRecord::default().with_price(12.0))));

        let report = publisher.publish(draft).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.deliveries.len(), 3);
        assert_eq!(report.event.source, "test");

        let on_sync = broker.published(Topic::Sync).await;
        let decoded = MasterDataEvent::from_bytes(&on_sync[0]).unwrap();
        assert_eq!(decoded, report.event);
    }

    #[tokio::test]
    async fn test_custom_event_skips_sync_topic() {
        let (broker, publisher) = publisher();
        let draft = NewEvent::new(
            EventType::Custom("PRICE_LIST_REFRESH".into()),
            &EntityRef::new("product", "42"),
        );

        let report = publisher.publish(draft).await.unwrap();
        assert!(!report.delivered_to(Topic::Sync));
        assert!(broker.published(Topic::Sync).await.is_empty());
        assert_eq!(broker.published(Topic::Audit).await.len(), 1);
    }

    #[tokio::test]
    async fn test_topic_failure_is_reported_not_raised() {
        let (broker, publisher) = publisher();
        broker.fail_topic(Topic::Audit).await;

        let draft = NewEvent::new(EventType::Create, &EntityRef::new("customer", "7"));
        let report = publisher.publish(draft).await.unwrap();

        assert!(!report.is_complete());
        assert_eq!(report.failed_topics(), vec![Topic::Audit]);
        assert!(report.delivered_to(Topic::Events));
        assert!(report.delivered_to(Topic::Sync));
    }

    #[tokio::test]
    async fn test_event_ids_are_unique() {
        let (_, publisher) = publisher();
        let entity = EntityRef::new("product", "1");
        let a = publisher
            .publish(NewEvent::new(EventType::Update, &entity))
            .await
            .unwrap();
        let b = publisher
            .publish(NewEvent::new(EventType::Update, &entity))
            .await
            .unwrap();
        assert_ne!(a.event_id(), b.event_id());
    }

    #[tokio::test]
    async fn test_bulk_emits_single_event() {
        let (broker, publisher) = publisher();
        let ids: Vec<String> = (0..1000).map(|i| i.to_string()).collect();

        let report = publisher
            .publish_bulk(EventType::Update, EntityType::Customer, &ids, Metadata::new())
            .await
            .unwrap();

        assert!(report.event.is_bulk());
        assert_eq!(report.event.entity_count(), 1000);
        assert_eq!(broker.published(Topic::Events).await.len(), 1);
    }
}
