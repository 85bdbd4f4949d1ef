//! Store traits: the abstract interface for queue and conflict persistence.
//!
//! These traits keep the sync engine storage-agnostic. Implementations
//! include SQLite (primary) and in-memory (for tests).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use mdsync_core::{
    ConflictId, ConflictState, ConflictStatus, EntityRef, FailOutcome, NewConflict, NewOperation,
    OfflineOperation, OperationId, OperationStatus, Page, Paged, Retry, SyncConflict,
    DEFAULT_MAX_RETRIES,
};

use crate::error::Result;

/// Queue configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of live (pending + processing) operations.
    pub capacity: usize,
    /// Retry budget for operations that do not set their own.
    pub default_max_retries: u32,
    /// Base delay before a transiently failed operation is claimable again.
    /// Doubles with every retry.
    pub retry_backoff_ms: i64,
    /// Claims older than this are presumed abandoned by a crashed worker
    /// and reclaimed.
    pub claim_timeout_ms: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            default_max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff_ms: 1_000,
            claim_timeout_ms: 5 * 60 * 1_000,
        }
    }
}

/// Per-status snapshot of the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueStats {
    pub fn count(&self, status: OperationStatus) -> usize {
        match status {
            OperationStatus::Pending => self.pending,
            OperationStatus::Processing => self.processing,
            OperationStatus::Completed => self.completed,
            OperationStatus::Failed => self.failed,
        }
    }

    pub(crate) fn bump(&mut self, status: OperationStatus, by: usize) {
        match status {
            OperationStatus::Pending => self.pending += by,
            OperationStatus::Processing => self.processing += by,
            OperationStatus::Completed => self.completed += by,
            OperationStatus::Failed => self.failed += by,
        }
    }

    /// Operations that still need work.
    pub fn live(&self) -> usize {
        self.pending + self.processing
    }

    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed
    }
}

/// Per-status snapshot of recorded conflicts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictStats {
    pub pending: usize,
    pub resolved: usize,
    pub ignored: usize,
}

impl ConflictStats {
    pub(crate) fn bump(&mut self, status: ConflictStatus, by: usize) {
        match status {
            ConflictStatus::Pending => self.pending += by,
            ConflictStatus::Resolved => self.resolved += by,
            ConflictStatus::Ignored => self.ignored += by,
        }
    }
}

/// The durable, ordered operation queue.
///
/// # Design Notes
///
/// - **Atomic claim**: `claim` moves exactly one operation from pending to
///   processing with a compare-and-swap on status; two concurrent claims
///   never return the same operation.
/// - **Entity ordering**: an operation is only claimable once every earlier
///   operation on the same entity is terminal.
/// - **Bounded**: `enqueue` fails with `QueueFull` at capacity.
#[async_trait]
pub trait OperationQueue: Send + Sync {
    /// Append an operation with status pending.
    async fn enqueue(&self, op: NewOperation) -> Result<OfflineOperation>;

    /// Claim the next ready operation, ordered by priority then FIFO.
    ///
    /// Returns `None` when nothing is ready.
    async fn claim(&self, now: i64) -> Result<Option<OfflineOperation>>;

    /// processing -> completed.
    async fn mark_completed(&self, id: OperationId, now: i64) -> Result<OfflineOperation>;

    /// processing -> pending (retry) or failed.
    async fn mark_failed(
        &self,
        id: OperationId,
        error: &str,
        retry: Retry,
        now: i64,
    ) -> Result<FailOutcome>;

    /// processing -> pending without consuming a retry.
    async fn release(&self, id: OperationId) -> Result<()>;

    /// Release every operation claimed at or before `claimed_before`.
    ///
    /// Returns the reclaimed ids.
    async fn reclaim_expired(&self, claimed_before: i64) -> Result<Vec<OperationId>>;

    /// Get an operation by id.
    async fn get_operation(&self, id: OperationId) -> Result<Option<OfflineOperation>>;

    /// List operations, optionally filtered by status, in enqueue order.
    async fn list_operations(
        &self,
        status: Option<OperationStatus>,
        page: Page,
    ) -> Result<Paged<OfflineOperation>>;

    /// Per-status counts.
    async fn queue_stats(&self) -> Result<QueueStats>;

    /// Whether any pending or processing operation targets the entity.
    async fn has_live(&self, entity: &EntityRef) -> Result<bool>;

    /// Every pending or processing operation, in enqueue order.
    ///
    /// Bounded by the queue capacity.
    async fn live_operations(&self) -> Result<Vec<OfflineOperation>>;

    /// Delete completed operations processed before the given time.
    ///
    /// Failed operations are kept for operator visibility.
    async fn purge_completed(&self, processed_before: i64) -> Result<usize>;
}

/// Persistence for sync conflicts.
#[async_trait]
pub trait ConflictStore: Send + Sync {
    /// Record a new pending conflict.
    async fn insert_conflict(&self, conflict: NewConflict) -> Result<SyncConflict>;

    /// Get a conflict by id.
    async fn get_conflict(&self, id: ConflictId) -> Result<Option<SyncConflict>>;

    /// List conflicts, optionally filtered by status, oldest first.
    async fn list_conflicts(
        &self,
        status: Option<ConflictStatus>,
        page: Page,
    ) -> Result<Paged<SyncConflict>>;

    /// Move a pending conflict to its settled state.
    ///
    /// Compare-and-swap: fails with `AlreadySettled` unless the conflict is
    /// still pending.
    async fn settle_conflict(
        &self,
        id: ConflictId,
        state: ConflictState,
        notes: Option<String>,
    ) -> Result<SyncConflict>;

    /// Per-status counts.
    async fn conflict_stats(&self) -> Result<ConflictStats>;
}

/// Everything the sync engine needs from storage.
///
/// Blanket-implemented for any type providing both the queue and the
/// conflict log.
pub trait Store: OperationQueue + ConflictStore {}

impl<T: OperationQueue + ConflictStore> Store for T {}
