//! In-memory implementation of the store traits.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use mdsync_core::{
    next_ready, validate_new_operation, ConflictId, ConflictState, ConflictStatus, EntityRef,
    FailOutcome,
    NewConflict, NewOperation, OfflineOperation, OperationId, OperationStatus, Page, Paged, Retry,
    SyncConflict, ValidationError,
};

use crate::error::{Result, StoreError};
use crate::traits::{ConflictStats, ConflictStore, OperationQueue, QueueConfig, QueueStats};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock; the
/// write lock makes every transition atomic.
pub struct MemoryStore {
    config: QueueConfig,
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    /// Operations indexed by id (ids are assigned in enqueue order).
    operations: BTreeMap<OperationId, OfflineOperation>,
    next_operation_id: i64,

    /// Conflicts indexed by id.
    conflicts: BTreeMap<ConflictId, SyncConflict>,
    next_conflict_id: i64,
}

impl MemoryStore {
    /// Create a new empty in-memory store with default queue settings.
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    pub fn with_config(config: QueueConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(MemoryStoreInner::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreInner>> {
        self.inner
            .read()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreInner>> {
        self.inner
            .write()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStoreInner {
    fn operation_mut(&mut self, id: OperationId) -> Result<&mut OfflineOperation> {
        self.operations
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn live_operations(&self) -> usize {
        self.operations
            .values()
            .filter(|op| !op.status.is_terminal())
            .count()
    }
}

fn paginate<T: Clone>(matching: Vec<&T>, page: Page) -> Paged<T> {
    let total = matching.len();
    let items = matching
        .into_iter()
        .skip(page.offset)
        .take(page.limit)
        .cloned()
        .collect();
    Paged { items, total, page }
}

#[async_trait]
impl OperationQueue for MemoryStore {
    async fn enqueue(&self, op: NewOperation) -> Result<OfflineOperation> {
        validate_new_operation(&op)?;

        let mut inner = self.write()?;

        let live = inner.live_operations();
        if live >= self.config.capacity {
            return Err(StoreError::QueueFull {
                live,
                capacity: self.config.capacity,
            });
        }

        inner.next_operation_id += 1;
        let id = OperationId(inner.next_operation_id);
        let stored = OfflineOperation::from_new(
            id,
            op,
            self.config.default_max_retries,
            mdsync_core::now_millis(),
        );
        inner.operations.insert(id, stored.clone());

        Ok(stored)
    }

    async fn claim(&self, now: i64) -> Result<Option<OfflineOperation>> {
        let mut inner = self.write()?;

        let Some(id) = next_ready(inner.operations.values(), now) else {
            return Ok(None);
        };

        let op = inner.operation_mut(id)?;
        op.claim(now)?;
        Ok(Some(op.clone()))
    }

    async fn mark_completed(&self, id: OperationId, now: i64) -> Result<OfflineOperation> {
        let mut inner = self.write()?;
        let op = inner.operation_mut(id)?;
        op.complete(now)?;
        Ok(op.clone())
    }

    async fn mark_failed(
        &self,
        id: OperationId,
        error: &str,
        retry: Retry,
        now: i64,
    ) -> Result<FailOutcome> {
        let mut inner = self.write()?;
        let op = inner.operation_mut(id)?;
        Ok(op.fail(error, retry, self.config.retry_backoff_ms, now)?)
    }

    async fn release(&self, id: OperationId) -> Result<()> {
        let mut inner = self.write()?;
        inner.operation_mut(id)?.release()?;
        Ok(())
    }

    async fn reclaim_expired(&self, claimed_before: i64) -> Result<Vec<OperationId>> {
        let mut inner = self.write()?;

        let mut reclaimed = Vec::new();
        for op in inner.operations.values_mut() {
            let expired = op.status == OperationStatus::Processing
                && op.claimed_at.map_or(true, |at| at <= claimed_before);
            if expired {
                op.release()?;
                reclaimed.push(op.id);
            }
        }

        Ok(reclaimed)
    }

    async fn get_operation(&self, id: OperationId) -> Result<Option<OfflineOperation>> {
        let inner = self.read()?;
        Ok(inner.operations.get(&id).cloned())
    }

    async fn list_operations(
        &self,
        status: Option<OperationStatus>,
        page: Page,
    ) -> Result<Paged<OfflineOperation>> {
        let inner = self.read()?;
        let matching: Vec<&OfflineOperation> = inner
            .operations
            .values()
            .filter(|op| status.map_or(true, |s| op.status == s))
            .collect();
        Ok(paginate(matching, page))
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let inner = self.read()?;
        let mut stats = QueueStats::default();
        for op in inner.operations.values() {
            stats.bump(op.status, 1);
        }
        Ok(stats)
    }

    async fn has_live(&self, entity: &EntityRef) -> Result<bool> {
        let inner = self.read()?;
        Ok(inner
            .operations
            .values()
            .any(|op| !op.status.is_terminal() && op.entity == *entity))
    }

    async fn live_operations(&self) -> Result<Vec<OfflineOperation>> {
        let inner = self.read()?;
        Ok(inner
            .operations
            .values()
            .filter(|op| !op.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn purge_completed(&self, processed_before: i64) -> Result<usize> {
        let mut inner = self.write()?;
        let before = inner.operations.len();
        inner.operations.retain(|_, op| {
            !(op.status == OperationStatus::Completed
                && op.processed_at.map_or(false, |at| at < processed_before))
        });
        Ok(before - inner.operations.len())
    }
}

#[async_trait]
impl ConflictStore for MemoryStore {
    async fn insert_conflict(&self, conflict: NewConflict) -> Result<SyncConflict> {
        let mut inner = self.write()?;
        inner.next_conflict_id += 1;
        let id = ConflictId(inner.next_conflict_id);
        let stored = SyncConflict::from_new(id, conflict);
        inner.conflicts.insert(id, stored.clone());
        Ok(stored)
    }

    async fn get_conflict(&self, id: ConflictId) -> Result<Option<SyncConflict>> {
        let inner = self.read()?;
        Ok(inner.conflicts.get(&id).cloned())
    }

    async fn list_conflicts(
        &self,
        status: Option<ConflictStatus>,
        page: Page,
    ) -> Result<Paged<SyncConflict>> {
        let inner = self.read()?;
        let matching: Vec<&SyncConflict> = inner
            .conflicts
            .values()
            .filter(|c| status.map_or(true, |s| c.status() == s))
            .collect();
        Ok(paginate(matching, page))
    }

    async fn settle_conflict(
        &self,
        id: ConflictId,
        state: ConflictState,
        notes: Option<String>,
    ) -> Result<SyncConflict> {
        if state == ConflictState::Pending {
            return Err(StoreError::InvalidData(format!(
                "{id} cannot be settled back to pending"
            )));
        }

        let mut inner = self.write()?;
        let conflict = inner
            .conflicts
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        if !conflict.is_pending() {
            return Err(ValidationError::AlreadySettled {
                id,
                status: conflict.status(),
            }
            .into());
        }

        conflict.state = state;
        if notes.is_some() {
            conflict.notes = notes;
        }
        Ok(conflict.clone())
    }

    async fn conflict_stats(&self) -> Result<ConflictStats> {
        let inner = self.read()?;
        let mut stats = ConflictStats::default();
        for conflict in inner.conflicts.values() {
            stats.bump(conflict.status(), 1);
        }
        Ok(stats)
    }
}
