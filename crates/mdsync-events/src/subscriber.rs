//! Event consumption loop.
//!
//! A [`Subscriber`] reads one topic and dispatches every decoded event to
//! its handlers. Handlers are independent: a failing handler is logged and
//! neither stops the loop nor the other handlers. Undecodable messages are
//! logged and skipped. Redelivered events (same `event_id` within the dedup
//! window) are dropped before dispatch.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mdsync_core::MasterDataEvent;

use crate::broker::Subscription;
use crate::dedup::DedupWindow;
use crate::error::{BrokerError, Result};

/// A side effect driven by published events.
///
/// Implementations should tolerate seeing an event more than once.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, event: &MasterDataEvent) -> Result<()>;
}

/// Counters for one consume loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeStats {
    pub received: u64,
    pub dispatched: u64,
    pub duplicates: u64,
    pub undecodable: u64,
    pub handler_errors: u64,
    /// Messages the broker dropped because this subscriber fell behind.
    pub lagged: u64,
}

/// Dispatches events from one subscription to a set of handlers.
pub struct Subscriber {
    name: String,
    handlers: Vec<Arc<dyn EventHandler>>,
    seen: Mutex<DedupWindow>,
}

impl Subscriber {
    pub fn new(name: impl Into<String>, dedup_window: usize) -> Self {
        Self {
            name: name.into(),
            handlers: Vec::new(),
            seen: Mutex::new(DedupWindow::new(dedup_window)),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Consume until `cancel` fires.
    ///
    /// Cancellation is the only exit. If the topic closes the loop parks
    /// until cancelled.
    pub async fn consume(
        &self,
        mut subscription: Box<dyn Subscription>,
        cancel: CancellationToken,
    ) -> ConsumeStats {
        let topic = subscription.topic();
        let mut stats = ConsumeStats::default();
        info!(subscriber = %self.name, %topic, "consumer started");

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = subscription.recv() => next,
            };

            match next {
                Ok(Some(bytes)) => {
                    stats.received += 1;
                    self.dispatch(&bytes, &mut stats).await;
                }
                Ok(None) => {
                    warn!(subscriber = %self.name, %topic, "topic closed, waiting for shutdown");
                    cancel.cancelled().await;
                    break;
                }
                Err(BrokerError::Lagged { skipped, .. }) => {
                    stats.lagged += skipped;
                    warn!(subscriber = %self.name, %topic, skipped, "consumer lagged");
                }
                Err(e) => {
                    warn!(subscriber = %self.name, %topic, error = %e, "receive failed");
                }
            }
        }

        info!(subscriber = %self.name, %topic, ?stats, "consumer stopped");
        stats
    }

    /// Decode and dispatch one message.
    pub async fn dispatch(&self, bytes: &[u8], stats: &mut ConsumeStats) {
        let event = match MasterDataEvent::from_bytes(bytes) {
            Ok(event) => event,
            Err(e) => {
                stats.undecodable += 1;
                warn!(subscriber = %self.name, error = %e, "skipping undecodable message");
                return;
            }
        };

        if self.seen.lock().await.contains(&event.event_id) {
            stats.duplicates += 1;
            debug!(subscriber = %self.name, event_id = %event.event_id, "duplicate delivery dropped");
            return;
        }

        let results = join_all(self.handlers.iter().map(|h| h.handle(&event))).await;
        for (handler, result) in self.handlers.iter().zip(results) {
            if let Err(e) = result {
                stats.handler_errors += 1;
                warn!(
                    subscriber = %self.name,
                    handler = handler.name(),
                    event_id = %event.event_id,
                    error = %e,
                    "event handler failed"
                );
            }
        }

        self.seen.lock().await.insert(event.event_id);
        stats.dispatched += 1;
    }
}
