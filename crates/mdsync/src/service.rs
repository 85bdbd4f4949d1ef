//! SyncCore: the assembled service.
//!
//! Brings the queue, sync engine, conflict resolver and event fan-out
//! together behind one explicitly constructed value. Nothing is global:
//! the host builds a `SyncCore`, registers subscribers, calls
//! [`start`](SyncCore::start) and eventually [`shutdown`](SyncCore::shutdown).

use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mdsync_core::{
    now_millis, ConflictId, ConflictStatus, EntityData, EntityRef, EntityType, EventType,
    FailOutcome, Metadata, NewEvent, NewOperation, OfflineOperation, OperationId,
    OperationStatus, OperationType, Page, Paged, Priority, Resolution, Retry, SyncConflict,
    Topic,
};
use mdsync_events::{
    AnalyticsAggregator, Broker, Cache, CacheInvalidator, ConsumeStats, EventError,
    EventHandler, EventPublisher, LiveBroadcaster, PublishReport, Subscriber, Subscription,
};
use mdsync_store::{MemoryStore, QueueStats, SqliteStore, Store, StoreError};
use mdsync_sync::{
    Baseline, ConflictResolver, DrainReport, RemoteStore, ResolveOutcome, SubmitOutcome,
    SyncEngine, SyncStatus,
};

use crate::config::SyncCoreConfig;
use crate::error::{Result, ServiceError};

#[derive(Default)]
struct Lifecycle {
    started: bool,
    /// Subscribers registered before `start`, with their subscriptions
    /// already open so nothing published in between is missed.
    waiting: Vec<(Arc<Subscriber>, Box<dyn Subscription>)>,
    tasks: Vec<(String, JoinHandle<ConsumeStats>)>,
}

/// Handles to the built-in handlers, for reading their state.
pub struct BuiltinHandlers {
    pub analytics: Arc<AnalyticsAggregator>,
    pub live: Arc<LiveBroadcaster>,
}

/// The offline-first master data sync service.
pub struct SyncCore<S: Store + 'static> {
    config: SyncCoreConfig,
    store: Arc<S>,
    broker: Arc<dyn Broker>,
    publisher: EventPublisher,
    engine: SyncEngine<S>,
    resolver: ConflictResolver<S>,
    shutdown: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
}

impl SyncCore<MemoryStore> {
    /// A service over an in-memory queue.
    pub fn in_memory(
        config: SyncCoreConfig,
        remote: Arc<dyn RemoteStore>,
        broker: Arc<dyn Broker>,
    ) -> Result<Self> {
        let store = MemoryStore::with_config(config.queue.clone());
        Self::new(config, store, remote, broker)
    }
}

impl SyncCore<SqliteStore> {
    /// A service over a SQLite queue at `path`.
    pub fn open_sqlite(
        path: impl AsRef<Path>,
        config: SyncCoreConfig,
        remote: Arc<dyn RemoteStore>,
        broker: Arc<dyn Broker>,
    ) -> Result<Self> {
        let store = SqliteStore::open(path)?.with_config(config.queue.clone());
        Self::new(config, store, remote, broker)
    }
}

impl<S: Store + 'static> SyncCore<S> {
    /// Assemble a service. The store should already carry `config.queue`.
    pub fn new(
        config: SyncCoreConfig,
        store: S,
        remote: Arc<dyn RemoteStore>,
        broker: Arc<dyn Broker>,
    ) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(store);
        let baseline = Arc::new(Baseline::new());
        let publisher = EventPublisher::new(broker.clone(), config.events.source.clone());
        let engine = SyncEngine::new(
            store.clone(),
            remote.clone(),
            publisher.clone(),
            baseline.clone(),
        )
        .with_config(config.sync.clone())
        .with_claim_timeout(config.queue.claim_timeout_ms);
        let resolver = ConflictResolver::new(store.clone(), remote, publisher.clone(), baseline);

        Ok(Self {
            config,
            store,
            broker,
            publisher,
            engine,
            resolver,
            shutdown: CancellationToken::new(),
            lifecycle: Mutex::new(Lifecycle::default()),
        })
    }

    pub fn config(&self) -> &SyncCoreConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn engine(&self) -> &SyncEngine<S> {
        &self.engine
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Start every registered subscriber.
    pub async fn start(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(ServiceError::ShutDown);
        }
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.started {
            return Err(ServiceError::AlreadyStarted);
        }
        lifecycle.started = true;

        let waiting = std::mem::take(&mut lifecycle.waiting);
        for (subscriber, subscription) in waiting {
            let task = self.spawn_consumer(subscriber.clone(), subscription);
            lifecycle.tasks.push((subscriber.name().to_string(), task));
        }
        info!(subscribers = lifecycle.tasks.len(), "sync core started");
        Ok(())
    }

    /// Stop consumers and any running drain pass.
    ///
    /// Returns each subscriber's final counters.
    pub async fn shutdown(&self) -> Result<Vec<(String, ConsumeStats)>> {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut self.lifecycle.lock().await.tasks);

        let mut stats = Vec::with_capacity(tasks.len());
        for (name, task) in tasks {
            let consumed = task
                .await
                .map_err(|e| ServiceError::Task(format!("{name}: {e}")))?;
            stats.push((name, consumed));
        }
        info!(subscribers = stats.len(), "sync core stopped");
        Ok(stats)
    }

    pub async fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled() && self.lifecycle.lock().await.started
    }

    fn spawn_consumer(
        &self,
        subscriber: Arc<Subscriber>,
        subscription: Box<dyn Subscription>,
    ) -> JoinHandle<ConsumeStats> {
        let cancel = self.shutdown.child_token();
        tokio::spawn(async move { subscriber.consume(subscription, cancel).await })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Subscribers
    // ─────────────────────────────────────────────────────────────────────────

    /// Run `handler` on every event of `topic`, in its own subscriber.
    pub async fn subscribe(&self, topic: Topic, handler: Arc<dyn EventHandler>) -> Result<()> {
        let subscriber =
            Subscriber::new(handler.name().to_string(), self.config.events.dedup_window)
                .with_handler(handler);
        self.subscribe_with(topic, subscriber).await
    }

    /// Register a subscriber with several handlers on one topic.
    ///
    /// Consumption begins at [`start`](Self::start), or immediately if the
    /// service is already running.
    pub async fn subscribe_with(&self, topic: Topic, subscriber: Subscriber) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(ServiceError::ShutDown);
        }
        let subscription = self
            .broker
            .subscribe(topic)
            .await
            .map_err(EventError::from)?;
        let subscriber = Arc::new(subscriber);

        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.started {
            let task = self.spawn_consumer(subscriber.clone(), subscription);
            lifecycle.tasks.push((subscriber.name().to_string(), task));
        } else {
            lifecycle.waiting.push((subscriber.clone(), subscription));
        }
        debug!(subscriber = subscriber.name(), %topic, "subscriber registered");
        Ok(())
    }

    /// Register cache invalidation, analytics and live broadcast on the
    /// `events` topic.
    pub async fn install_builtin_handlers(&self, cache: Arc<dyn Cache>) -> Result<BuiltinHandlers> {
        let analytics = Arc::new(AnalyticsAggregator::new(self.config.events.dedup_window));
        let live = Arc::new(LiveBroadcaster::new(self.config.events.live_channel_capacity));

        self.subscribe(Topic::Events, Arc::new(CacheInvalidator::new(cache)))
            .await?;
        self.subscribe(Topic::Events, analytics.clone()).await?;
        self.subscribe(Topic::Events, live.clone()).await?;

        Ok(BuiltinHandlers { analytics, live })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Write path
    // ─────────────────────────────────────────────────────────────────────────

    /// Apply a mutation now, or queue it if the remote is unreachable.
    pub async fn submit(
        &self,
        operation_type: OperationType,
        entity: EntityRef,
        payload: EntityData,
        priority: Priority,
    ) -> Result<SubmitOutcome> {
        Ok(self
            .engine
            .submit(operation_type, entity, payload, priority)
            .await?)
    }

    /// [`submit`](Self::submit) recording `user_id` as the author.
    pub async fn submit_as(
        &self,
        user_id: Option<String>,
        operation_type: OperationType,
        entity: EntityRef,
        payload: EntityData,
        priority: Priority,
    ) -> Result<SubmitOutcome> {
        Ok(self
            .engine
            .submit_as(user_id, operation_type, entity, payload, priority)
            .await?)
    }

    /// Queue an operation with the expected base it carries.
    pub async fn enqueue(&self, op: NewOperation) -> Result<OfflineOperation> {
        Ok(self.engine.enqueue(op).await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Manual queue processing
    // ─────────────────────────────────────────────────────────────────────────

    /// Claim the next ready operation for processing outside the engine.
    pub async fn claim(&self) -> Result<Option<OfflineOperation>> {
        self.engine.restore().await?;
        Ok(self.store.claim(now_millis()).await?)
    }

    /// Record that a claimed operation was applied.
    pub async fn mark_completed(&self, id: OperationId) -> Result<OfflineOperation> {
        let op = self.store.mark_completed(id, now_millis()).await?;
        self.engine
            .baseline()
            .settle(&op.entity, Some(op.intended_result().cloned()))
            .await;
        Ok(op)
    }

    /// Record that a claimed operation failed.
    pub async fn mark_failed(&self, id: OperationId, error: &str, retry: Retry) -> Result<FailOutcome> {
        let op = self
            .store
            .get_operation(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let outcome = self.store.mark_failed(id, error, retry, now_millis()).await?;
        if outcome == FailOutcome::Failed {
            self.engine.baseline().settle(&op.entity, None).await;
            warn!(operation_id = %id, entity = %op.entity, error, "operation failed");
        }
        Ok(outcome)
    }

    pub async fn get_operation(&self, id: OperationId) -> Result<Option<OfflineOperation>> {
        Ok(self.store.get_operation(id).await?)
    }

    pub async fn list_operations(
        &self,
        status: Option<OperationStatus>,
        page: Page,
    ) -> Result<Paged<OfflineOperation>> {
        Ok(self.store.list_operations(status, page).await?)
    }

    /// Drop completed operations processed before `before` (epoch millis).
    pub async fn purge_completed(&self, before: i64) -> Result<usize> {
        Ok(self.store.purge_completed(before).await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sync
    // ─────────────────────────────────────────────────────────────────────────

    /// Run one drain pass. Shutdown cancels it.
    pub async fn drain_and_sync(&self, force_full: bool) -> Result<DrainReport> {
        if self.shutdown.is_cancelled() {
            return Err(ServiceError::ShutDown);
        }
        let pass = self.shutdown.child_token();
        Ok(self.engine.drain_and_sync(force_full, &pass).await?)
    }

    /// Run one drain pass that also stops when `cancel` fires.
    pub async fn drain_and_sync_with(
        &self,
        force_full: bool,
        cancel: &CancellationToken,
    ) -> Result<DrainReport> {
        if self.shutdown.is_cancelled() {
            return Err(ServiceError::ShutDown);
        }
        let pass = self.shutdown.child_token();
        let drain = async {
            let report = self.engine.drain_and_sync(force_full, &pass).await;
            // Ends the link below.
            pass.cancel();
            report
        };
        let link = async {
            tokio::select! {
                _ = cancel.cancelled() => pass.cancel(),
                _ = pass.cancelled() => {}
            }
        };
        let (report, ()) = tokio::join!(drain, link);
        Ok(report?)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        Ok(self.store.queue_stats().await?)
    }

    pub async fn sync_status(&self) -> Result<SyncStatus> {
        Ok(self.engine.sync_status().await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Conflicts
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn get_conflict(&self, id: ConflictId) -> Result<SyncConflict> {
        Ok(self.resolver.get(id).await?)
    }

    pub async fn list_conflicts(
        &self,
        status: Option<ConflictStatus>,
        page: Page,
    ) -> Result<Paged<SyncConflict>> {
        Ok(self.resolver.list(status, page).await?)
    }

    pub async fn resolve_conflict(
        &self,
        id: ConflictId,
        resolution: Resolution,
        resolved_data: Option<EntityData>,
        notes: Option<String>,
    ) -> Result<ResolveOutcome> {
        Ok(self
            .resolver
            .resolve(id, resolution, resolved_data, notes)
            .await?)
    }

    /// [`resolve_conflict`](Self::resolve_conflict) recording `user_id` on
    /// the resolution event.
    pub async fn resolve_conflict_as(
        &self,
        user_id: Option<String>,
        id: ConflictId,
        resolution: Resolution,
        resolved_data: Option<EntityData>,
        notes: Option<String>,
    ) -> Result<ResolveOutcome> {
        Ok(self
            .resolver
            .resolve_as(user_id, id, resolution, resolved_data, notes)
            .await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Events
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn publish(&self, draft: NewEvent) -> Result<PublishReport> {
        Ok(self.publisher.publish(draft).await?)
    }

    pub async fn publish_bulk(
        &self,
        event_type: EventType,
        entity_type: EntityType,
        entity_ids: &[String],
        metadata: Metadata,
    ) -> Result<PublishReport> {
        Ok(self
            .publisher
            .publish_bulk(event_type, entity_type, entity_ids, metadata)
            .await?)
    }
}

impl<S: Store + 'static> Drop for SyncCore<S> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdsync_events::{FnHandler, MemoryBroker};
    use mdsync_sync::MemoryRemote;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn service() -> SyncCore<MemoryStore> {
        SyncCore::in_memory(
            SyncCoreConfig::default(),
            Arc::new(MemoryRemote::new()),
            Arc::new(MemoryBroker::default()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let core = service();
        assert!(!core.is_running().await);

        core.start().await.unwrap();
        assert!(core.is_running().await);
        assert!(matches!(core.start().await, Err(ServiceError::AlreadyStarted)));

        core.shutdown().await.unwrap();
        assert!(!core.is_running().await);
        assert!(matches!(core.start().await, Err(ServiceError::ShutDown)));
        assert!(matches!(
            core.drain_and_sync(false).await,
            Err(ServiceError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = SyncCoreConfig::default();
        config.queue.capacity = 0;
        let result = SyncCore::in_memory(
            config,
            Arc::new(MemoryRemote::new()),
            Arc::new(MemoryBroker::default()),
        );
        assert!(matches!(result, Err(ServiceError::Config(_))));
    }

    #[tokio::test]
    async fn test_subscriber_registered_before_start_sees_events() {
        let core = service();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        core.subscribe(
            Topic::Audit,
            Arc::new(FnHandler::new("counter", move |_event| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), String>(())
                }
            })),
        )
        .await
        .unwrap();

        // Published before start; the subscription is already open.
        core.publish(NewEvent::new(
            EventType::Custom("price_check".into()),
            &EntityRef::new("product", "1"),
        ))
        .await
        .unwrap();
        core.start().await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while seen.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let stats = core.shutdown().await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].0, "counter");
        assert_eq!(stats[0].1.dispatched, 1);
    }

    #[tokio::test]
    async fn test_manual_processing() {
        let core = service();
        let op = core
            .enqueue(NewOperation::create(
                EntityRef::new("product", "1"),
                EntityData::from(mdsync_core::ProductRecord::default().with_price(3.0)),
            ))
            .await
            .unwrap();

        let claimed = core.claim().await.unwrap().unwrap();
        assert_eq!(claimed.id, op.id);
        let outcome = core.mark_failed(op.id, "remote said no", Retry::Never).await.unwrap();
        assert_eq!(outcome, FailOutcome::Failed);

        let stats = core.queue_stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert!(!core
            .engine()
            .baseline()
            .has_pending(&EntityRef::new("product", "1"))
            .await);
    }

    #[tokio::test]
    async fn test_submit_as_records_author() {
        let broker = Arc::new(MemoryBroker::default());
        let core = SyncCore::in_memory(
            SyncCoreConfig::default(),
            Arc::new(MemoryRemote::new()),
            broker.clone(),
        )
        .unwrap();

        let outcome = core
            .submit_as(
                Some("clerk-7".into()),
                OperationType::Create,
                EntityRef::new("product", "1"),
                EntityData::from(mdsync_core::ProductRecord::default().with_price(3.0)),
                Priority::High,
            )
            .await
            .unwrap();
        assert!(matches!(outcome, SubmitOutcome::Applied { .. }));

        let published = broker.published(Topic::Sync).await;
        let event = mdsync_core::MasterDataEvent::from_bytes(&published[0]).unwrap();
        assert_eq!(event.user_id.as_deref(), Some("clerk-7"));
    }
}
