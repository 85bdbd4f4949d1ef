//! Broker abstraction for event fan-out.
//!
//! The broker delivers opaque encoded events to topic subscribers with
//! at-least-once semantics. Implementations may sit on Kafka, NATS, Redis
//! streams or anything else with topic publish/subscribe.

use async_trait::async_trait;
use bytes::Bytes;

use mdsync_core::Topic;

use crate::error::BrokerError;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Topic publish/subscribe.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Broker: Send + Sync {
    /// Write one message to a topic.
    async fn publish(&self, topic: Topic, payload: Bytes) -> Result<()>;

    /// Open a subscription that sees messages published from now on.
    async fn subscribe(&self, topic: Topic) -> Result<Box<dyn Subscription>>;
}

/// A live subscription to one topic.
#[async_trait]
pub trait Subscription: Send {
    fn topic(&self) -> Topic;

    /// Wait for the next message.
    ///
    /// Returns `None` once the topic is closed. Blocks indefinitely
    /// otherwise; callers cancel by dropping the future.
    async fn recv(&mut self) -> Result<Option<Bytes>>;
}

/// An in-memory broker for testing and single-process deployments.
///
/// Each topic is a tokio broadcast channel. Published messages are also
/// retained so tests can inspect them or redeliver them to exercise
/// subscriber idempotency.
pub mod memory {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use tokio::sync::{broadcast, RwLock};

    const TOPICS: [Topic; 3] = [Topic::Events, Topic::Audit, Topic::Sync];

    /// In-memory broker implementation.
    pub struct MemoryBroker {
        senders: HashMap<Topic, broadcast::Sender<Bytes>>,
        retained: RwLock<HashMap<Topic, Vec<Bytes>>>,
        failing: RwLock<HashSet<Topic>>,
    }

    impl MemoryBroker {
        /// Create a broker whose topics buffer up to `capacity` messages
        /// per slow subscriber.
        pub fn new(capacity: usize) -> Self {
            let senders = TOPICS
                .iter()
                .map(|topic| (*topic, broadcast::channel(capacity.max(1)).0))
                .collect();
            Self {
                senders,
                retained: RwLock::new(HashMap::new()),
                failing: RwLock::new(HashSet::new()),
            }
        }

        /// Make every publish to `topic` fail until [`heal`](Self::heal).
        pub async fn fail_topic(&self, topic: Topic) {
            self.failing.write().await.insert(topic);
        }

        pub async fn heal(&self, topic: Topic) {
            self.failing.write().await.remove(&topic);
        }

        /// Messages successfully published to a topic, in order.
        pub async fn published(&self, topic: Topic) -> Vec<Bytes> {
            self.retained
                .read()
                .await
                .get(&topic)
                .cloned()
                .unwrap_or_default()
        }

        /// Send every retained message on `topic` again.
        ///
        /// Returns how many messages were redelivered.
        pub async fn redeliver(&self, topic: Topic) -> usize {
            let messages = self.published(topic).await;
            if let Some(sender) = self.senders.get(&topic) {
                for message in &messages {
                    // No receivers is not an error for a broadcast.
                    let _ = sender.send(message.clone());
                }
            }
            messages.len()
        }

        fn sender(&self, topic: Topic) -> Result<&broadcast::Sender<Bytes>> {
            self.senders.get(&topic).ok_or(BrokerError::Closed(topic))
        }
    }

    impl Default for MemoryBroker {
        fn default() -> Self {
            Self::new(1024)
        }
    }

    #[async_trait]
    impl Broker for MemoryBroker {
        async fn publish(&self, topic: Topic, payload: Bytes) -> Result<()> {
            if self.failing.read().await.contains(&topic) {
                return Err(BrokerError::Unavailable {
                    topic,
                    reason: "injected failure".into(),
                });
            }

            let sender = self.sender(topic)?;
            self.retained
                .write()
                .await
                .entry(topic)
                .or_default()
                .push(payload.clone());
            let _ = sender.send(payload);
            Ok(())
        }

        async fn subscribe(&self, topic: Topic) -> Result<Box<dyn Subscription>> {
            let receiver = self.sender(topic)?.subscribe();
            Ok(Box::new(MemorySubscription { topic, receiver }))
        }
    }

    /// Subscription handed out by [`MemoryBroker`].
    pub struct MemorySubscription {
        topic: Topic,
        receiver: broadcast::Receiver<Bytes>,
    }

    #[async_trait]
    impl Subscription for MemorySubscription {
        fn topic(&self) -> Topic {
            self.topic
        }

        async fn recv(&mut self) -> Result<Option<Bytes>> {
            match self.receiver.recv().await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(broadcast::error::RecvError::Closed) => Ok(None),
                Err(broadcast::error::RecvError::Lagged(skipped)) => Err(BrokerError::Lagged {
                    topic: self.topic,
                    skipped,
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryBroker;
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let broker = MemoryBroker::default();
        let mut sub = broker.subscribe(Topic::Events).await.unwrap();

        broker
            .publish(Topic::Events, Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let received = sub.recv().await.unwrap().unwrap();
        assert_eq!(&received[..], b"hello");
        assert_eq!(sub.topic(), Topic::Events);
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let broker = MemoryBroker::default();
        broker
            .publish(Topic::Audit, Bytes::from_static(b"a"))
            .await
            .unwrap();

        assert_eq!(broker.published(Topic::Audit).await.len(), 1);
        assert!(broker.published(Topic::Sync).await.is_empty());
    }

    #[tokio::test]
    async fn test_injected_failure_is_per_topic() {
        let broker = MemoryBroker::default();
        broker.fail_topic(Topic::Audit).await;

        let failed = broker.publish(Topic::Audit, Bytes::from_static(b"x")).await;
        assert!(matches!(failed, Err(BrokerError::Unavailable { topic: Topic::Audit, .. })));
        broker
            .publish(Topic::Events, Bytes::from_static(b"x"))
            .await
            .unwrap();

        broker.heal(Topic::Audit).await;
        broker
            .publish(Topic::Audit, Bytes::from_static(b"x"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_redeliver_repeats_messages() {
        let broker = MemoryBroker::default();
        broker
            .publish(Topic::Sync, Bytes::from_static(b"1"))
            .await
            .unwrap();

        let mut sub = broker.subscribe(Topic::Sync).await.unwrap();
        assert_eq!(broker.redeliver(Topic::Sync).await, 1);
        assert_eq!(&sub.recv().await.unwrap().unwrap()[..], b"1");
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags() {
        let broker = MemoryBroker::new(2);
        let mut sub = broker.subscribe(Topic::Events).await.unwrap();
        for i in 0..5u8 {
            broker
                .publish(Topic::Events, Bytes::from(vec![i]))
                .await
                .unwrap();
        }

        assert!(matches!(
            sub.recv().await,
            Err(BrokerError::Lagged { skipped: 3, .. })
        ));
        assert_eq!(&sub.recv().await.unwrap().unwrap()[..], &[3]);
    }
}
