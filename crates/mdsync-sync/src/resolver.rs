//! Conflict resolution.
//!
//! Resolving a conflict settles it exactly once. `Local` and `Merge` force
//! the chosen record onto the remote before the conflict is settled, so a
//! failed remote write leaves the conflict pending and retryable. `Remote`
//! keeps what the remote already has. `Ignored` touches nothing and emits
//! no event.
//!
//! Resolutions of the same conflict are serialized within a process: the
//! read, the remote write and the settle all happen under one lock, so a
//! losing resolver never writes to the remote. The store's compare-and-swap
//! still decides between processes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use mdsync_core::{
    now_millis, ConflictId, ConflictState, ConflictStatus, EntityData, EventType, NewEvent, Page,
    Paged, Resolution, ResolvedData, SyncConflict,
};
use mdsync_events::{EventPublisher, PublishReport};
use mdsync_store::Store;

use crate::baseline::Baseline;
use crate::error::{Result, SyncError};
use crate::remote::{RemoteStore, RemoteWrite};

/// A settled conflict and the event announcing it.
#[derive(Debug, Clone)]
pub struct ResolveOutcome {
    pub conflict: SyncConflict,
    /// `None` for ignored conflicts, or if publishing failed.
    pub event: Option<PublishReport>,
    /// Whether the remote record was overwritten.
    pub remote_written: bool,
}

/// One async lock per conflict being resolved.
#[derive(Default)]
struct ConflictLocks {
    locks: StdMutex<HashMap<ConflictId, Arc<Mutex<()>>>>,
}

impl ConflictLocks {
    async fn acquire(&self, id: ConflictId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Entries only the map still references are idle.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(id).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Applies operator decisions to recorded conflicts.
pub struct ConflictResolver<S: Store> {
    store: Arc<S>,
    remote: Arc<dyn RemoteStore>,
    publisher: EventPublisher,
    baseline: Arc<Baseline>,
    locks: ConflictLocks,
}

impl<S: Store> ConflictResolver<S> {
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
            locks: ConflictLocks::default(),
        }
    }

    pub async fn get(&self, id: ConflictId) -> Result<SyncConflict> {
        self.store
            .get_conflict(id)
            .await?
            .ok_or(SyncError::ConflictNotFound(id))
    }

    pub async fn list(
        &self,
        status: Option<ConflictStatus>,
        page: Page,
    ) -> Result<Paged<SyncConflict>> {
        Ok(self.store.list_conflicts(status, page).await?)
    }

    /// Settle a pending conflict.
    ///
    /// `data` is required for [`Resolution::Merge`] and ignored otherwise.
    /// Fails with `AlreadySettled` if the conflict is no longer pending,
    /// including when a concurrent resolve won the race.
    pub async fn resolve(
        &self,
        id: ConflictId,
        resolution: Resolution,
        data: Option<EntityData>,
        notes: Option<String>,
    ) -> Result<ResolveOutcome> {
        self.resolve_as(None, id, resolution, data, notes).await
    }

    /// [`resolve`](Self::resolve) on behalf of `user_id`, who is recorded
    /// on the resolution event.
    pub async fn resolve_as(
        &self,
        user_id: Option<String>,
        id: ConflictId,
        resolution: Resolution,
        data: Option<EntityData>,
        notes: Option<String>,
    ) -> Result<ResolveOutcome> {
        let _guard = self.locks.acquire(id).await;
        debug!(conflict_id = %id, resolution = resolution.as_str(), "resolving conflict");

        let conflict = self.get(id).await?;
        let state = conflict.plan(resolution, data, now_millis())?;

        let resolved = match &state {
            ConflictState::Resolved { resolved_data, .. } => resolved_data.clone(),
            _ => {
                let conflict = self.store.settle_conflict(id, state, notes).await?;
                info!(conflict_id = %id, entity = %conflict.entity, "conflict ignored");
                return Ok(ResolveOutcome {
                    conflict,
                    event: None,
                    remote_written: false,
                });
            }
        };

        let forced = matches!(resolution, Resolution::Local | Resolution::Merge);
        let mut previous = None;
        if forced {
            let write = match &resolved {
                ResolvedData::Record(data) => RemoteWrite::Put(data.clone()),
                ResolvedData::Deleted => RemoteWrite::Delete,
            };
            previous = self.remote.force_write(&conflict.entity, write).await?;
        }

        let settled = self.store.settle_conflict(id, state, notes).await?;
        let event_type = if resolved.is_deleted() {
            EventType::Delete
        } else {
            EventType::Update
        };
        let resolved = resolved.into_record();
        self.baseline.observe(&settled.entity, resolved.clone()).await;

        let draft = NewEvent::new(event_type, &settled.entity)
            .user(user_id)
            .old_data(previous)
            .new_data(resolved)
            .meta("conflict_id", id.0)
            .meta("resolution", resolution.as_str());
        let event = match self.publisher.publish(draft).await {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(conflict_id = %id, error = %e, "resolution event not published");
                None
            }
        };

        info!(
            conflict_id = %id,
            entity = %settled.entity,
            resolution = resolution.as_str(),
            "conflict resolved"
        );
        Ok(ResolveOutcome {
            conflict: settled,
            event,
            remote_written: forced,
        })
    }
}
