//! # mdsync Events
//!
//! Fan-out of committed master data changes to independent consumers.
//!
//! ## Overview
//!
//! The [`EventPublisher`] stamps an event, encodes it as CBOR and writes it
//! to every topic its type fans out to (`events` and `audit`, plus `sync`
//! for CREATE/UPDATE/DELETE). Each topic write stands alone and the
//! per-topic outcome comes back in a [`PublishReport`].
//!
//! A [`Subscriber`] consumes one topic until its cancellation token fires
//! and hands every event to its [`EventHandler`]s. Delivery is
//! at-least-once; subscribers drop redeliveries with a bounded
//! [`DedupWindow`].
//!
//! ## Key Types
//!
//! - [`Broker`] / [`Subscription`] - Topic publish/subscribe seam
//! - [`MemoryBroker`] - In-process broker for tests and single-node use
//! - [`CacheInvalidator`], [`AnalyticsAggregator`], [`LiveBroadcaster`] - Built-in handlers

pub mod broker;
pub mod config;
pub mod dedup;
pub mod error;
pub mod handlers;
pub mod publisher;
pub mod subscriber;

pub use broker::memory::{MemoryBroker, MemorySubscription};
pub use broker::{Broker, Subscription};
pub use config::EventsConfig;
pub use dedup::DedupWindow;
pub use error::{BrokerError, EventError, Result};
pub use handlers::{
    AnalyticsAggregator, Cache, CacheInvalidator, FnHandler, LiveBroadcaster, MemoryCache, Tally,
};
pub use publisher::{EventPublisher, PublishReport, TopicDelivery};
pub use subscriber::{ConsumeStats, EventHandler, Subscriber};
