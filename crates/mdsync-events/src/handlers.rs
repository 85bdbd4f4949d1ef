//! Built-in event handlers: cache invalidation, analytics, live broadcast.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::debug;

use mdsync_core::{EntityType, EventType, MasterDataEvent};

use crate::dedup::DedupWindow;
use crate::error::{EventError, Result};
use crate::subscriber::EventHandler;

// ---------------------------------------------------------------------------
// Cache invalidation
// ---------------------------------------------------------------------------

/// A cache that supports glob-style invalidation.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Drop every key matching `pattern`. A trailing `*` matches any suffix.
    ///
    /// Returns the number of keys removed.
    async fn invalidate(&self, pattern: &str) -> Result<usize>;
}

/// In-memory cache, mostly for tests.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, serde_json::Value>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, key: impl Into<String>, value: serde_json::Value) {
        self.entries.write().await.insert(key.into(), value);
    }

    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

fn glob_match(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn invalidate(&self, pattern: &str) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| !glob_match(pattern, key));
        Ok(before - entries.len())
    }
}

/// Drops every cached entry of the event's entity type.
///
/// Coarse on purpose: `product:*` goes on any product event, bulk or not.
/// Naturally idempotent.
pub struct CacheInvalidator {
    cache: Arc<dyn Cache>,
}

impl CacheInvalidator {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl EventHandler for CacheInvalidator {
    fn name(&self) -> &str {
        "cache_invalidator"
    }

    async fn handle(&self, event: &MasterDataEvent) -> Result<()> {
        let pattern = event.entity_type.cache_pattern();
        let removed = self.cache.invalidate(&pattern).await?;
        debug!(%pattern, removed, event_id = %event.event_id, "cache invalidated");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Analytics
// ---------------------------------------------------------------------------

/// Counts for one (entity type, event type) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub events: u64,
    /// Entities covered; a bulk event counts all of its ids.
    pub entities: u64,
}

#[derive(Default)]
struct AnalyticsState {
    tallies: HashMap<(EntityType, EventType), Tally>,
}

/// Aggregates event counts per entity type and event type.
///
/// Keeps its own dedup window so a redelivered event is never counted twice,
/// even when shared between subscribers.
pub struct AnalyticsAggregator {
    state: RwLock<AnalyticsState>,
    seen: Mutex<DedupWindow>,
}

impl AnalyticsAggregator {
    pub fn new(dedup_window: usize) -> Self {
        Self {
            state: RwLock::new(AnalyticsState::default()),
            seen: Mutex::new(DedupWindow::new(dedup_window)),
        }
    }

    pub async fn tally(&self, entity_type: &EntityType, event_type: &EventType) -> Tally {
        self.state
            .read()
            .await
            .tallies
            .get(&(entity_type.clone(), event_type.clone()))
            .copied()
            .unwrap_or_default()
    }

    /// Events seen for an entity type, across event types.
    pub async fn total_for(&self, entity_type: &EntityType) -> u64 {
        self.state
            .read()
            .await
            .tallies
            .iter()
            .filter(|((et, _), _)| et == entity_type)
            .map(|(_, tally)| tally.events)
            .sum()
    }
}

#[async_trait]
impl EventHandler for AnalyticsAggregator {
    fn name(&self) -> &str {
        "analytics"
    }

    async fn handle(&self, event: &MasterDataEvent) -> Result<()> {
        if !self.seen.lock().await.insert(event.event_id) {
            return Ok(());
        }

        let mut state = self.state.write().await;
        let tally = state
            .tallies
            .entry((event.entity_type.clone(), event.event_type.clone()))
            .or_default();
        tally.events += 1;
        tally.entities += event.entity_count();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Live broadcast
// ---------------------------------------------------------------------------

/// Forwards events to connected live clients (websocket sessions, SSE
/// streams, ...) over a broadcast channel.
pub struct LiveBroadcaster {
    sender: broadcast::Sender<Arc<MasterDataEvent>>,
}

impl LiveBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Attach a live client.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<MasterDataEvent>> {
        self.sender.subscribe()
    }

    pub fn client_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl EventHandler for LiveBroadcaster {
    fn name(&self) -> &str {
        "live_broadcast"
    }

    async fn handle(&self, event: &MasterDataEvent) -> Result<()> {
        // No connected clients is fine.
        let _ = self.sender.send(Arc::new(event.clone()));
        Ok(())
    }
}

/// Adapter so a plain async closure can be registered as a handler.
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(MasterDataEvent) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = std::result::Result<(), String>> + Send + 'static,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(MasterDataEvent) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = std::result::Result<(), String>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &MasterDataEvent) -> Result<()> {
        (self.f)(event.clone())
            .await
            .map_err(|reason| EventError::handler(self.name.clone(), reason))
    }
}
