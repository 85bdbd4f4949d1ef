//! The sync engine: drains the offline queue into the remote store.
//!
//! A pass claims operations in priority/FIFO order and applies each one
//! with its expected base. Clean applications complete and publish an
//! event; base mismatches become conflicts; transient remote failures are
//! retried with backoff; everything else fails terminally.
//!
//! Passes are single-flight per engine. Within a pass up to
//! [`SyncConfig::workers`] operations on different entities are in flight
//! at once; the queue never hands out two operations on the same entity
//! concurrently.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OnceCell, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mdsync_core::{
    now_millis, validate_operation, validate_payload, ConflictId, ConflictType, EntityData,
    EntityRef, ExpectedBase, FailOutcome, NewConflict, NewEvent, NewOperation, OfflineOperation,
    OperationType, Priority, Retry,
};
use mdsync_events::{EventPublisher, PublishReport};
use mdsync_store::{QueueStats, Store};

use crate::baseline::Baseline;
use crate::error::{Result, SyncError};
use crate::remote::{ApplyOutcome, RemoteStore, RemoteWrite};

/// Configuration for sync behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Operations applied concurrently within one pass.
    pub workers: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { workers: 4 }
    }
}

/// Result of a drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub started_at: i64,
    pub finished_at: i64,
    /// Stale claims returned to pending before the pass.
    pub reclaimed: usize,
    /// Records loaded when the baseline was rebuilt (`force_full`).
    pub baseline_rebuilt: Option<usize>,
    pub claimed: usize,
    pub completed: usize,
    /// Completed operations whose write had already landed earlier.
    pub replayed: usize,
    /// Conflicts recorded during the pass.
    pub conflicts: Vec<ConflictId>,
    /// Transient failures requeued for a later pass.
    pub retried: usize,
    /// Terminal failures other than conflicts.
    pub failed: usize,
    /// Claims handed back because the pass was cancelled.
    pub released: usize,
    pub events_published: usize,
    /// Publishes that missed at least one topic.
    pub publish_failures: usize,
    pub cancelled: bool,
}

impl DrainReport {
    fn merge(&mut self, other: DrainReport) {
        self.claimed += other.claimed;
        self.completed += other.completed;
        self.replayed += other.replayed;
        self.conflicts.extend(other.conflicts);
        self.retried += other.retried;
        self.failed += other.failed;
        self.released += other.released;
        self.events_published += other.events_published;
        self.publish_failures += other.publish_failures;
    }

    /// Nothing conflicted or failed.
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty() && self.failed == 0 && !self.cancelled
    }
}

/// Snapshot of the engine for operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub running: bool,
    pub last_report: Option<DrainReport>,
    pub last_finished_at: Option<i64>,
    pub queue: QueueStats,
    pub pending_conflicts: usize,
}

/// What happened to a submitted mutation.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// Written to the remote and published.
    Applied { event: Option<PublishReport> },
    /// Remote unreachable or entity busy; queued for the next drain.
    Queued(OfflineOperation),
    /// The local view was out of date. Nothing was written; the baseline
    /// now holds `current` and the caller may retry.
    Stale { current: Option<EntityData> },
}

/// Resets the running flag even if the pass future is dropped.
struct Running<'a>(&'a AtomicBool);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Drains queued operations into the remote store.
pub struct SyncEngine<S: Store> {
    store: Arc<S>,
    remote: Arc<dyn RemoteStore>,
    publisher: EventPublisher,
    baseline: Arc<Baseline>,
    config: SyncConfig,
    claim_timeout_ms: i64,
    drain_lock: Mutex<()>,
    running: AtomicBool,
    last_report: RwLock<Option<DrainReport>>,
    restored: OnceCell<()>,
}

impl<S: Store> SyncEngine<S> {
    pub fn new(
        store: Arc<S>,
        remote: Arc<dyn RemoteStore>,
        publisher: EventPublisher,
        baseline: Arc<Baseline>,
    ) -> Self {
        Self {
            store,
            remote,
            publisher,
            baseline,
            config: SyncConfig::default(),
            claim_timeout_ms: 5 * 60 * 1_000,
            drain_lock: Mutex::new(()),
            running: AtomicBool::new(false),
            last_report: RwLock::new(None),
            restored: OnceCell::new(),
        }
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Claims older than this are reclaimed at the start of every pass.
    pub fn with_claim_timeout(mut self, claim_timeout_ms: i64) -> Self {
        self.claim_timeout_ms = claim_timeout_ms;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn baseline(&self) -> &Arc<Baseline> {
        &self.baseline
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Project operations already in the queue onto the baseline.
    ///
    /// Runs once per engine. Every write path and drain pass waits for it,
    /// so a queue left behind by an earlier process is accounted for
    /// before anything new is captured against it.
    pub async fn restore(&self) -> Result<()> {
        self.restored
            .get_or_try_init(|| async {
                let live = self.store.live_operations().await?;
                for op in &live {
                    self.baseline
                        .project(&op.entity, op.intended_result().cloned())
                        .await;
                }
                if !live.is_empty() {
                    info!(count = live.len(), "restored queued operations into baseline");
                }
                Ok::<(), SyncError>(())
            })
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Write path
    // -----------------------------------------------------------------------

    /// Apply a mutation directly, or queue it if the remote is unreachable.
    ///
    /// Entities with queued operations always queue, so a direct write
    /// never overtakes an earlier offline edit.
    pub async fn submit(
        &self,
        operation_type: OperationType,
        entity: EntityRef,
        payload: EntityData,
        priority: Priority,
    ) -> Result<SubmitOutcome> {
        self.submit_as(None, operation_type, entity, payload, priority)
            .await
    }

    /// [`submit`](Self::submit) on behalf of `user_id`, who is recorded on
    /// the queued operation and on every event it produces.
    pub async fn submit_as(
        &self,
        user_id: Option<String>,
        operation_type: OperationType,
        entity: EntityRef,
        payload: EntityData,
        priority: Priority,
    ) -> Result<SubmitOutcome> {
        validate_payload(&entity, &payload)?;
        self.restore().await?;

        if self.baseline.has_pending(&entity).await || self.store.has_live(&entity).await? {
            debug!(%entity, "entity has queued operations, queueing");
            return self
                .queue(user_id, operation_type, entity, payload, priority)
                .await;
        }

        let expected = match operation_type {
            OperationType::Create => ExpectedBase::Absent,
            _ => self.baseline.expected_for(&entity).await?,
        };
        let write = match operation_type {
            OperationType::Delete => RemoteWrite::Delete,
            _ => RemoteWrite::Put(payload.clone()),
        };

        match self.remote.apply(&entity, write, &expected).await {
            Ok(ApplyOutcome::Applied { previous, current }) => {
                self.baseline.observe(&entity, current.clone()).await;
                let draft = NewEvent::new(operation_type.into(), &entity)
                    .old_data(previous)
                    .new_data(current)
                    .user(user_id);
                let event = self.publish(draft, &mut DrainReport::default()).await;
                Ok(SubmitOutcome::Applied { event })
            }
            Ok(ApplyOutcome::Mismatch { current }) => {
                info!(%entity, "direct write against stale state");
                self.baseline.observe(&entity, current.clone()).await;
                Ok(SubmitOutcome::Stale { current })
            }
            Err(e) if e.is_transient() => {
                debug!(%entity, error = %e, "remote unavailable, queueing");
                self.queue(user_id, operation_type, entity, payload, priority)
                    .await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn queue(
        &self,
        user_id: Option<String>,
        operation_type: OperationType,
        entity: EntityRef,
        payload: EntityData,
        priority: Priority,
    ) -> Result<SubmitOutcome> {
        let result = match operation_type {
            OperationType::Delete => None,
            _ => Some(payload.clone()),
        };
        let captured = self.baseline.capture(&entity, result).await?;
        let expected = match operation_type {
            OperationType::Create => ExpectedBase::Absent,
            _ => captured,
        };

        let op = NewOperation::new(operation_type, entity.clone(), payload, expected)
            .priority(priority)
            .user(user_id);
        match self.store.enqueue(op).await {
            Ok(stored) => Ok(SubmitOutcome::Queued(stored)),
            Err(e) => {
                self.baseline.settle(&entity, None).await;
                Err(e.into())
            }
        }
    }

    /// Queue an operation as given, keeping the baseline projection in step.
    pub async fn enqueue(&self, op: NewOperation) -> Result<OfflineOperation> {
        self.restore().await?;
        let entity = op.entity.clone();
        let result = match op.operation_type {
            OperationType::Delete => None,
            _ => Some(op.payload.clone()),
        };

        self.baseline.project(&entity, result).await;
        match self.store.enqueue(op).await {
            Ok(stored) => Ok(stored),
            Err(e) => {
                self.baseline.settle(&entity, None).await;
                Err(e.into())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Drain
    // -----------------------------------------------------------------------

    /// Run one drain pass.
    ///
    /// With `force_full` the baseline is rebuilt from a full remote snapshot
    /// first. Fails with [`SyncError::DrainInProgress`] if a pass is already
    /// running. Cancelling hands claimed operations back to the queue and
    /// returns the partial report.
    pub async fn drain_and_sync(
        &self,
        force_full: bool,
        cancel: &CancellationToken,
    ) -> Result<DrainReport> {
        let _pass = self
            .drain_lock
            .try_lock()
            .map_err(|_| SyncError::DrainInProgress)?;
        self.running.store(true, Ordering::SeqCst);
        let _running = Running(&self.running);

        let report = self.run_pass(force_full, cancel).await?;
        info!(
            claimed = report.claimed,
            completed = report.completed,
            conflicts = report.conflicts.len(),
            retried = report.retried,
            failed = report.failed,
            cancelled = report.cancelled,
            "drain pass finished"
        );
        *self.last_report.write().await = Some(report.clone());
        Ok(report)
    }

    async fn run_pass(&self, force_full: bool, cancel: &CancellationToken) -> Result<DrainReport> {
        self.restore().await?;
        let mut report = DrainReport {
            started_at: now_millis(),
            ..DrainReport::default()
        };

        let reclaimed = self
            .store
            .reclaim_expired(report.started_at - self.claim_timeout_ms)
            .await?;
        if !reclaimed.is_empty() {
            warn!(count = reclaimed.len(), "reclaimed expired claims");
        }
        report.reclaimed = reclaimed.len();

        if force_full {
            let snapshot = self.remote.snapshot().await?;
            let loaded = self.baseline.rebuild(snapshot).await;
            debug!(loaded, "baseline rebuilt from remote snapshot");
            report.baseline_rebuilt = Some(loaded);
        }

        let workers = self.config.workers.max(1);
        let tallies = join_all((0..workers).map(|worker| self.worker(worker, cancel))).await;
        for tally in tallies {
            report.merge(tally?);
        }

        report.cancelled = cancel.is_cancelled();
        report.finished_at = now_millis();
        Ok(report)
    }

    async fn worker(&self, worker: usize, cancel: &CancellationToken) -> Result<DrainReport> {
        let mut tally = DrainReport::default();

        while !cancel.is_cancelled() {
            let Some(op) = self.store.claim(now_millis()).await? else {
                break;
            };
            tally.claimed += 1;
            debug!(worker, operation_id = %op.id, entity = %op.entity, "claimed operation");
            self.process(op, cancel, &mut tally).await?;
        }

        Ok(tally)
    }

    async fn process(
        &self,
        op: OfflineOperation,
        cancel: &CancellationToken,
        tally: &mut DrainReport,
    ) -> Result<()> {
        if let Err(e) = validate_operation(&op) {
            return self.fail_terminal(&op, &e.to_string(), tally).await;
        }

        let write = RemoteWrite::for_operation(&op);
        let applied = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.store.release(op.id).await?;
                tally.released += 1;
                debug!(operation_id = %op.id, "released on cancellation");
                return Ok(());
            }
            applied = self.remote.apply(&op.entity, write, &op.expected_base) => applied,
        };

        match applied {
            Ok(ApplyOutcome::Applied { previous, current }) => {
                self.complete(&op, previous, current, false, tally).await
            }
            // The write landed on an earlier attempt that never got to
            // record it.
            Ok(ApplyOutcome::Mismatch { current }) if current.as_ref() == op.intended_result() => {
                debug!(operation_id = %op.id, entity = %op.entity, "idempotent replay");
                self.complete(&op, None, current, true, tally).await
            }
            Ok(ApplyOutcome::Mismatch { current }) => self.record_conflict(&op, current, tally).await,
            Err(e) if e.is_transient() => {
                let outcome = self
                    .store
                    .mark_failed(op.id, &e.to_string(), Retry::Allowed, now_millis())
                    .await?;
                match outcome {
                    FailOutcome::Requeued {
                        retry_count,
                        available_at,
                    } => {
                        tally.retried += 1;
                        debug!(operation_id = %op.id, retry_count, available_at, "requeued after transient failure");
                    }
                    FailOutcome::Failed => {
                        tally.failed += 1;
                        self.baseline.settle(&op.entity, None).await;
                        warn!(operation_id = %op.id, entity = %op.entity, error = %e, "retries exhausted");
                    }
                }
                Ok(())
            }
            Err(e) => self.fail_terminal(&op, &e.to_string(), tally).await,
        }
    }

    async fn complete(
        &self,
        op: &OfflineOperation,
        previous: Option<EntityData>,
        current: Option<EntityData>,
        replayed: bool,
        tally: &mut DrainReport,
    ) -> Result<()> {
        self.store.mark_completed(op.id, now_millis()).await?;
        tally.completed += 1;
        if replayed {
            tally.replayed += 1;
        }
        self.baseline.settle(&op.entity, Some(current.clone())).await;

        let mut draft = NewEvent::new(op.operation_type.into(), &op.entity)
            .old_data(previous)
            .new_data(current)
            .user(op.user_id.clone())
            .meta("operation_id", op.id.0);
        if replayed {
            draft = draft.meta("replayed", true);
        }
        self.publish(draft, tally).await;
        Ok(())
    }

    async fn record_conflict(
        &self,
        op: &OfflineOperation,
        current: Option<EntityData>,
        tally: &mut DrainReport,
    ) -> Result<()> {
        let now = now_millis();
        let conflict = self
            .store
            .insert_conflict(NewConflict {
                operation_id: op.id,
                operation_type: op.operation_type,
                entity: op.entity.clone(),
                local_data: op.payload.clone(),
                remote_data: current.clone(),
                conflict_type: ConflictType::classify(op.operation_type, current.as_ref()),
                detected_at: now,
            })
            .await?;

        self.store
            .mark_failed(op.id, &format!("conflict recorded as {}", conflict.id), Retry::Never, now)
            .await?;
        self.baseline.settle(&op.entity, Some(current)).await;
        tally.conflicts.push(conflict.id);

        warn!(
            operation_id = %op.id,
            conflict_id = %conflict.id,
            entity = %op.entity,
            conflict_type = conflict.conflict_type.as_str(),
            "sync conflict"
        );
        Ok(())
    }

    async fn fail_terminal(
        &self,
        op: &OfflineOperation,
        error: &str,
        tally: &mut DrainReport,
    ) -> Result<()> {
        self.store
            .mark_failed(op.id, error, Retry::Never, now_millis())
            .await?;
        tally.failed += 1;
        self.baseline.settle(&op.entity, None).await;
        warn!(operation_id = %op.id, entity = %op.entity, error, "operation failed");
        Ok(())
    }

    async fn publish(&self, draft: NewEvent, tally: &mut DrainReport) -> Option<PublishReport> {
        match self.publisher.publish(draft).await {
            Ok(report) => {
                tally.events_published += 1;
                if !report.is_complete() {
                    tally.publish_failures += 1;
                }
                Some(report)
            }
            Err(e) => {
                tally.publish_failures += 1;
                warn!(error = %e, "event publish failed");
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    pub async fn sync_status(&self) -> Result<SyncStatus> {
        let queue = self.store.queue_stats().await?;
        let conflicts = self.store.conflict_stats().await?;
        let last_report = self.last_report.read().await.clone();

        Ok(SyncStatus {
            running: self.is_running(),
            last_finished_at: last_report.as_ref().map(|r| r.finished_at),
            last_report,
            queue,
            pending_conflicts: conflicts.pending,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::MemoryRemote;
    use crate::remote::RemoteError;
    use mdsync_core::{MasterDataEvent, OperationStatus, ProductRecord, Topic};
    use mdsync_events::MemoryBroker;
    use mdsync_store::{ConflictStore, MemoryStore, OperationQueue, QueueConfig};
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        remote: Arc<MemoryRemote>,
        broker: Arc<MemoryBroker>,
        engine: SyncEngine<MemoryStore>,
    }

    fn fixture_with(remote: MemoryRemote, workers: usize) -> Fixture {
        let store = Arc::new(MemoryStore::with_config(QueueConfig {
            retry_backoff_ms: 0,
            ..QueueConfig::default()
        }));
        let remote = Arc::new(remote);
        let broker = Arc::new(MemoryBroker::default());
        let engine = SyncEngine::new(
            store.clone(),
            remote.clone(),
            EventPublisher::new(broker.clone(), "test"),
            Arc::new(Baseline::new()),
        )
        .with_config(SyncConfig { workers });
        Fixture {
            store,
            remote,
            broker,
            engine,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(MemoryRemote::new(), 4)
    }

    fn product(price: f64) -> EntityData {
        EntityData::from(ProductRecord::default().with_price(price))
    }

    fn p42() -> EntityRef {
        EntityRef::new("product", "42")
    }

    #[tokio::test]
    async fn test_submit_applies_directly_when_online() {
        let f = fixture();
        let outcome = f
            .engine
            .submit(OperationType::Create, p42(), product(10.0), Priority::Medium)
            .await
            .unwrap();

        assert!(matches!(outcome, SubmitOutcome::Applied { event: Some(_) }));
        assert_eq!(f.remote.get(&p42()).await, Some(product(10.0)));
        assert_eq!(f.broker.published(Topic::Sync).await.len(), 1);
        assert_eq!(f.store.queue_stats().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_offline_edits_chain_and_drain() {
        let f = fixture();
        f.engine
            .submit(OperationType::Create, p42(), product(9.0), Priority::Medium)
            .await
            .unwrap();

        f.remote.set_online(false);
        for price in [10.0, 11.0] {
            let outcome = f
                .engine
                .submit(OperationType::Update, p42(), product(price), Priority::Medium)
                .await
                .unwrap();
            assert!(matches!(outcome, SubmitOutcome::Queued(_)));
        }

        f.remote.set_online(true);
        let report = f
            .engine
            .drain_and_sync(false, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.completed, 2);
        assert!(report.is_clean());
        assert_eq!(f.remote.get(&p42()).await, Some(product(11.0)));
    }

    #[tokio::test]
    async fn test_author_travels_with_queued_operation() {
        let f = fixture();
        f.remote.set_online(false);
        let outcome = f
            .engine
            .submit_as(
                Some("clerk-7".into()),
                OperationType::Create,
                p42(),
                product(9.0),
                Priority::Medium,
            )
            .await
            .unwrap();
        let SubmitOutcome::Queued(queued) = outcome else {
            panic!("expected the write to queue, got {outcome:?}");
        };
        assert_eq!(queued.user_id.as_deref(), Some("clerk-7"));

        f.remote.set_online(true);
        f.engine
            .drain_and_sync(false, &CancellationToken::new())
            .await
            .unwrap();

        let published = f.broker.published(Topic::Sync).await;
        let event = MasterDataEvent::from_bytes(&published[0]).unwrap();
        assert_eq!(event.user_id.as_deref(), Some("clerk-7"));
    }

    #[tokio::test]
    async fn test_submit_waits_behind_operations_queued_before_start() {
        let f = fixture();
        f.remote.put(p42(), product(9.0)).await;
        // Left behind by an earlier process; this engine's baseline never saw it.
        f.store
            .enqueue(NewOperation::update(p42(), product(10.0), ExpectedBase::Any))
            .await
            .unwrap();

        let outcome = f
            .engine
            .submit(OperationType::Update, p42(), product(11.0), Priority::High)
            .await
            .unwrap();
        let SubmitOutcome::Queued(queued) = outcome else {
            panic!("expected the write to queue, got {outcome:?}");
        };
        assert_eq!(
            queued.expected_base,
            ExpectedBase::from_known(Some(&product(10.0))).unwrap()
        );
        assert_eq!(f.remote.write_count().await, 0);

        let report = f
            .engine
            .drain_and_sync(false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.completed, 2);
        assert!(report.is_clean());
        assert_eq!(f.remote.get(&p42()).await, Some(product(11.0)));
    }

    #[tokio::test]
    async fn test_remote_change_becomes_conflict() {
        let f = fixture();
        f.engine
            .submit(OperationType::Create, p42(), product(9.0), Priority::Medium)
            .await
            .unwrap();

        f.remote.set_online(false);
        f.engine
            .submit(OperationType::Update, p42(), product(10.0), Priority::Medium)
            .await
            .unwrap();

        // Someone else sets 12 while we are offline.
        f.remote.set_online(true);
        f.remote.put(p42(), product(12.0)).await;

        let report = f
            .engine
            .drain_and_sync(false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(report.retried, 0);

        let conflict = f
            .store
            .get_conflict(report.conflicts[0])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conflict.local_data, product(10.0));
        assert_eq!(conflict.remote_data, Some(product(12.0)));
        assert_eq!(conflict.conflict_type, ConflictType::UpdateConflict);

        let failed = f.store.queue_stats().await.unwrap().failed;
        assert_eq!(failed, 1);
        assert_eq!(f.remote.get(&p42()).await, Some(product(12.0)));
    }

    #[tokio::test]
    async fn test_replayed_write_is_completed() {
        let f = fixture();
        f.remote.put(p42(), product(10.0)).await;
        let expected = ExpectedBase::from_known(Some(&product(9.0))).unwrap();
        f.engine
            .enqueue(NewOperation::update(p42(), product(10.0), expected))
            .await
            .unwrap();

        let report = f
            .engine
            .drain_and_sync(false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(report.replayed, 1);
        assert!(report.conflicts.is_empty());
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_retries() {
        let f = fixture();
        let op = f
            .engine
            .enqueue(NewOperation::update(p42(), product(1.0), ExpectedBase::Any).max_retries(2))
            .await
            .unwrap();
        for _ in 0..3 {
            f.remote
                .fail_next(RemoteError::Unavailable("timeout".into()))
                .await;
        }

        let report = f
            .engine
            .drain_and_sync(false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.retried, 2);
        assert_eq!(report.failed, 1);

        let stored = f.store.get_operation(op.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Failed);
        assert_eq!(stored.retry_count, 2);
    }

    #[tokio::test]
    async fn test_rejection_is_terminal() {
        let f = fixture();
        f.engine
            .enqueue(NewOperation::update(p42(), product(1.0), ExpectedBase::Any))
            .await
            .unwrap();
        f.remote
            .fail_next(RemoteError::Rejected("negative stock".into()))
            .await;

        let report = f
            .engine
            .drain_and_sync(false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.retried, 0);
    }

    #[tokio::test]
    async fn test_same_entity_order_under_workers() {
        let f = fixture_with(MemoryRemote::new().with_latency(Duration::from_millis(2)), 4);
        for i in 0..10 {
            for entity in ["a", "b", "c"] {
                f.engine
                    .enqueue(NewOperation::update(
                        EntityRef::new("product", entity),
                        product(i as f64),
                        ExpectedBase::Any,
                    ))
                    .await
                    .unwrap();
            }
        }

        let report = f
            .engine
            .drain_and_sync(false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.completed, 30);

        for entity in ["a", "b", "c"] {
            let entity = EntityRef::new("product", entity);
            let prices: Vec<EntityData> = f
                .remote
                .write_log()
                .await
                .into_iter()
                .filter(|(e, _)| *e == entity)
                .filter_map(|(_, w)| w.into_result())
                .collect();
            let expected: Vec<EntityData> = (0..10).map(|i| product(i as f64)).collect();
            assert_eq!(prices, expected);
        }
    }

    #[tokio::test]
    async fn test_second_drain_is_rejected() {
        let f = fixture_with(MemoryRemote::new().with_latency(Duration::from_millis(50)), 1);
        f.engine
            .enqueue(NewOperation::update(p42(), product(1.0), ExpectedBase::Any))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let (first, second) = tokio::join!(f.engine.drain_and_sync(false, &cancel), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            f.engine.drain_and_sync(false, &cancel).await
        });

        assert!(first.is_ok());
        assert!(matches!(second, Err(SyncError::DrainInProgress)));
    }

    #[tokio::test]
    async fn test_cancel_releases_claims() {
        let f = fixture_with(MemoryRemote::new().with_latency(Duration::from_millis(200)), 1);
        let op = f
            .engine
            .enqueue(NewOperation::update(p42(), product(1.0), ExpectedBase::Any))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            }
        };
        let (report, ()) = tokio::join!(f.engine.drain_and_sync(false, &cancel), canceller);
        let report = report.unwrap();

        assert!(report.cancelled);
        assert_eq!(report.released, 1);
        let stored = f.store.get_operation(op.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Pending);
        assert_eq!(stored.retry_count, 0);
    }

    #[tokio::test]
    async fn test_crashed_claim_is_reclaimed() {
        let f = fixture();
        let engine = SyncEngine::new(
            f.store.clone(),
            f.remote.clone(),
            EventPublisher::new(f.broker.clone(), "test"),
            Arc::new(Baseline::new()),
        )
        .with_claim_timeout(0);

        let op = engine
            .enqueue(NewOperation::update(p42(), product(1.0), ExpectedBase::Any))
            .await
            .unwrap();
        // A worker claims and dies without finishing.
        f.store.claim(now_millis()).await.unwrap().unwrap();

        let report = engine
            .drain_and_sync(false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.reclaimed, 1);
        assert_eq!(report.completed, 1);
        let stored = f.store.get_operation(op.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OperationStatus::Completed);
    }

    #[tokio::test]
    async fn test_force_full_rebuilds_baseline() {
        let f = fixture();
        f.remote.put(p42(), product(12.0)).await;

        let report = f
            .engine
            .drain_and_sync(true, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.baseline_rebuilt, Some(1));
        assert_eq!(
            f.engine.baseline().known(&p42()).await,
            Some(Some(product(12.0)))
        );

        let status = f.engine.sync_status().await.unwrap();
        assert!(!status.running);
        assert_eq!(status.last_report, Some(report));
    }
}
