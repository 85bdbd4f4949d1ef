//! SQLite implementation of the store traits.
//!
//! This is the primary storage backend. It uses rusqlite with bundled
//! SQLite, wrapped in async via tokio::spawn_blocking. Payloads are stored
//! as CBOR blobs; statuses and kinds as their wire strings so the database
//! stays inspectable with the sqlite3 shell.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, Row, ToSql, TransactionBehavior};
use tracing::debug;

use mdsync_core::{
    from_cbor, to_cbor, validate_new_operation, ConflictId, ConflictState, ConflictStatus,
    EntityData, EntityRef, FailOutcome, NewConflict, NewOperation, OfflineOperation,
    OperationId, OperationStatus, Page, Paged, Priority, Resolution, Retry, SyncConflict,
    ValidationError,
};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{ConflictStats, ConflictStore, OperationQueue, QueueConfig, QueueStats};

const OPERATION_COLUMNS: &str = "id, operation_type, entity_type, entity_id, payload, \
     expected_base, status, priority, retry_count, max_retries, last_error, created_at, \
     available_at, claimed_at, processed_at, user_id";

const CONFLICT_COLUMNS: &str = "id, operation_id, operation_type, entity_type, entity_id, \
     local_data, remote_data, conflict_type, status, resolution, resolved_data, resolved_at, \
     ignored_at, notes, detected_at";

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    config: QueueConfig,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        migration::migrate(&mut conn)?;
        debug!(path = %path.display(), "opened sqlite store");
        Ok(Self::from_connection(conn))
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            config: QueueConfig::default(),
        }
    }

    /// Replace the queue settings.
    pub fn with_config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::Poisoned(e.to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::TaskJoin(e.to_string()))?
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn invalid(column: &str, value: impl std::fmt::Display) -> StoreError {
    StoreError::InvalidData(format!("{column}: {value}"))
}

fn read_operation(row: &Row<'_>) -> Result<OfflineOperation> {
    let operation_type: String = row.get("operation_type")?;
    let entity_type: String = row.get("entity_type")?;
    let entity_id: String = row.get("entity_id")?;
    let payload: Vec<u8> = row.get("payload")?;
    let expected_base: Vec<u8> = row.get("expected_base")?;
    let status: String = row.get("status")?;
    let priority: u8 = row.get("priority")?;

    Ok(OfflineOperation {
        id: OperationId(row.get("id")?),
        operation_type: operation_type.parse()?,
        entity: EntityRef::new(entity_type, entity_id),
        payload: from_cbor(&payload)?,
        expected_base: from_cbor(&expected_base)?,
        status: status.parse()?,
        priority: Priority::from_rank(priority).ok_or_else(|| invalid("priority", priority))?,
        retry_count: row.get("retry_count")?,
        max_retries: row.get("max_retries")?,
        last_error: row.get("last_error")?,
        created_at: row.get("created_at")?,
        available_at: row.get("available_at")?,
        claimed_at: row.get("claimed_at")?,
        processed_at: row.get("processed_at")?,
        user_id: row.get("user_id")?,
    })
}

fn read_conflict(row: &Row<'_>) -> Result<SyncConflict> {
    let operation_type: String = row.get("operation_type")?;
    let entity_type: String = row.get("entity_type")?;
    let entity_id: String = row.get("entity_id")?;
    let local_data: Vec<u8> = row.get("local_data")?;
    let remote_data: Option<Vec<u8>> = row.get("remote_data")?;
    let conflict_type: String = row.get("conflict_type")?;
    let status: String = row.get("status")?;

    let state = match status.parse::<ConflictStatus>()? {
        ConflictStatus::Pending => ConflictState::Pending,
        ConflictStatus::Resolved => {
            let resolution: Option<String> = row.get("resolution")?;
            let resolution = resolution
                .ok_or_else(|| invalid("resolution", "missing for resolved conflict"))?
                .parse::<Resolution>()?;
            let resolved_data: Option<Vec<u8>> = row.get("resolved_data")?;
            let resolved_data = resolved_data
                .ok_or_else(|| invalid("resolved_data", "missing for resolved conflict"))?;
            let resolved_at: Option<i64> = row.get("resolved_at")?;
            ConflictState::Resolved {
                resolution,
                resolved_data: from_cbor(&resolved_data)?,
                resolved_at: resolved_at
                    .ok_or_else(|| invalid("resolved_at", "missing for resolved conflict"))?,
            }
        }
        ConflictStatus::Ignored => {
            let ignored_at: Option<i64> = row.get("ignored_at")?;
            ConflictState::Ignored {
                ignored_at: ignored_at
                    .ok_or_else(|| invalid("ignored_at", "missing for ignored conflict"))?,
            }
        }
    };

    Ok(SyncConflict {
        id: ConflictId(row.get("id")?),
        operation_id: OperationId(row.get("operation_id")?),
        operation_type: operation_type.parse()?,
        entity: EntityRef::new(entity_type, entity_id),
        local_data: from_cbor(&local_data)?,
        remote_data: decode_optional(remote_data)?,
        conflict_type: conflict_type.parse()?,
        state,
        notes: row.get("notes")?,
        detected_at: row.get("detected_at")?,
    })
}

fn decode_optional(bytes: Option<Vec<u8>>) -> Result<Option<EntityData>> {
    Ok(bytes.map(|b| from_cbor(&b)).transpose()?)
}

fn encode_optional(data: Option<&EntityData>) -> Result<Option<Vec<u8>>> {
    Ok(data.map(to_cbor).transpose()?)
}

fn query_operations(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> Result<Vec<OfflineOperation>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut ops = Vec::new();
    while let Some(row) = rows.next()? {
        ops.push(read_operation(row)?);
    }
    Ok(ops)
}

fn load_operation(conn: &Connection, id: OperationId) -> Result<Option<OfflineOperation>> {
    let sql = format!("SELECT {OPERATION_COLUMNS} FROM offline_operations WHERE id = ?1");
    Ok(query_operations(conn, &sql, params![id.0])?.into_iter().next())
}

fn require_operation(conn: &Connection, id: OperationId) -> Result<OfflineOperation> {
    load_operation(conn, id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))
}

/// Persist a transition computed in memory.
///
/// Compare-and-swap on the status the transition started from.
fn write_transition(
    conn: &Connection,
    op: &OfflineOperation,
    from: OperationStatus,
    action: &'static str,
) -> Result<()> {
    let changed = conn.execute(
        "UPDATE offline_operations
         SET status = ?1, retry_count = ?2, last_error = ?3, available_at = ?4,
             claimed_at = ?5, processed_at = ?6
         WHERE id = ?7 AND status = ?8",
        params![
            op.status.as_str(),
            op.retry_count,
            op.last_error,
            op.available_at,
            op.claimed_at,
            op.processed_at,
            op.id.0,
            from.as_str(),
        ],
    )?;

    if changed == 0 {
        let current = require_operation(conn, op.id)?;
        return Err(ValidationError::InvalidTransition {
            id: op.id,
            status: current.status,
            action,
        }
        .into());
    }
    Ok(())
}

/// Load, transition, and write back one operation in an immediate transaction.
fn transition<T>(
    conn: &mut Connection,
    id: OperationId,
    action: &'static str,
    apply: impl FnOnce(&mut OfflineOperation) -> std::result::Result<T, ValidationError>,
) -> Result<(OfflineOperation, T)> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut op = require_operation(&tx, id)?;
    let from = op.status;
    let out = apply(&mut op)?;
    write_transition(&tx, &op, from, action)?;
    tx.commit()?;
    Ok((op, out))
}

fn count_where(conn: &Connection, table: &str, status: Option<&str>) -> Result<usize> {
    let sql = format!("SELECT COUNT(*) FROM {table} WHERE (?1 IS NULL OR status = ?1)");
    let total: i64 = conn.query_row(&sql, params![status], |row| row.get(0))?;
    Ok(total as usize)
}

// ---------------------------------------------------------------------------
// OperationQueue
// ---------------------------------------------------------------------------

#[async_trait]
impl OperationQueue for SqliteStore {
    async fn enqueue(&self, op: NewOperation) -> Result<OfflineOperation> {
        validate_new_operation(&op)?;
        let config = self.config.clone();

        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let live: i64 = tx.query_row(
                "SELECT COUNT(*) FROM offline_operations
                 WHERE status IN ('pending', 'processing')",
                [],
                |row| row.get(0),
            )?;
            let live = live as usize;
            if live >= config.capacity {
                return Err(StoreError::QueueFull {
                    live,
                    capacity: config.capacity,
                });
            }

            let mut stored = OfflineOperation::from_new(
                OperationId(0),
                op,
                config.default_max_retries,
                mdsync_core::now_millis(),
            );

            tx.execute(
                "INSERT INTO offline_operations (
                    operation_type, entity_type, entity_id, payload, expected_base,
                    status, priority, retry_count, max_retries, created_at, available_at,
                    user_id
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    stored.operation_type.as_str(),
                    stored.entity.entity_type.as_str(),
                    stored.entity.entity_id,
                    to_cbor(&stored.payload)?,
                    to_cbor(&stored.expected_base)?,
                    stored.status.as_str(),
                    stored.priority.rank(),
                    stored.retry_count,
                    stored.max_retries,
                    stored.created_at,
                    stored.available_at,
                    stored.user_id,
                ],
            )?;
            stored.id = OperationId(tx.last_insert_rowid());

            tx.commit()?;
            Ok(stored)
        })
        .await
    }

    async fn claim(&self, now: i64) -> Result<Option<OfflineOperation>> {
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            // Only the oldest live operation of each entity is eligible.
            let sql = format!(
                "SELECT {OPERATION_COLUMNS} FROM offline_operations o
                 WHERE o.status = 'pending' AND o.available_at <= ?1
                   AND NOT EXISTS (
                       SELECT 1 FROM offline_operations e
                       WHERE e.entity_type = o.entity_type
                         AND e.entity_id = o.entity_id
                         AND e.id < o.id
                         AND e.status IN ('pending', 'processing'))
                 ORDER BY o.priority, o.id
                 LIMIT 1"
            );
            let Some(mut op) = query_operations(&tx, &sql, params![now])?.into_iter().next() else {
                return Ok(None);
            };

            op.claim(now)?;
            write_transition(&tx, &op, OperationStatus::Pending, "claim")?;
            tx.commit()?;
            Ok(Some(op))
        })
        .await
    }

    async fn mark_completed(&self, id: OperationId, now: i64) -> Result<OfflineOperation> {
        self.blocking(move |conn| {
            let (op, ()) = transition(conn, id, "complete", |op| op.complete(now))?;
            Ok(op)
        })
        .await
    }

    async fn mark_failed(
        &self,
        id: OperationId,
        error: &str,
        retry: Retry,
        now: i64,
    ) -> Result<FailOutcome> {
        let error = error.to_string();
        let backoff_ms = self.config.retry_backoff_ms;

        self.blocking(move |conn| {
            let (_, outcome) = transition(conn, id, "fail", |op| {
                op.fail(&error, retry, backoff_ms, now)
            })?;
            Ok(outcome)
        })
        .await
    }

    async fn release(&self, id: OperationId) -> Result<()> {
        self.blocking(move |conn| {
            transition(conn, id, "release", |op| op.release())?;
            Ok(())
        })
        .await
    }

    async fn reclaim_expired(&self, claimed_before: i64) -> Result<Vec<OperationId>> {
        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let sql = format!(
                "SELECT {OPERATION_COLUMNS} FROM offline_operations
                 WHERE status = 'processing' AND claimed_at <= ?1
                 ORDER BY id"
            );
            let expired = query_operations(&tx, &sql, params![claimed_before])?;

            let mut reclaimed = Vec::with_capacity(expired.len());
            for mut op in expired {
                op.release()?;
                write_transition(&tx, &op, OperationStatus::Processing, "release")?;
                reclaimed.push(op.id);
            }

            tx.commit()?;
            Ok(reclaimed)
        })
        .await
    }

    async fn get_operation(&self, id: OperationId) -> Result<Option<OfflineOperation>> {
        self.blocking(move |conn| load_operation(conn, id)).await
    }

    async fn list_operations(
        &self,
        status: Option<OperationStatus>,
        page: Page,
    ) -> Result<Paged<OfflineOperation>> {
        self.blocking(move |conn| {
            let status = status.map(|s| s.as_str());
            let total = count_where(conn, "offline_operations", status)?;

            let sql = format!(
                "SELECT {OPERATION_COLUMNS} FROM offline_operations
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY id
                 LIMIT ?2 OFFSET ?3"
            );
            let items = query_operations(
                conn,
                &sql,
                params![status, page.limit as i64, page.offset as i64],
            )?;

            Ok(Paged { items, total, page })
        })
        .await
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        self.blocking(|conn| {
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM offline_operations GROUP BY status")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut stats = QueueStats::default();
            for (status, count) in rows {
                stats.bump(status.parse()?, count as usize);
            }
            Ok(stats)
        })
        .await
    }

    async fn has_live(&self, entity: &EntityRef) -> Result<bool> {
        let entity = entity.clone();
        self.blocking(move |conn| {
            let live: bool = conn.query_row(
                "SELECT EXISTS (
                     SELECT 1 FROM offline_operations
                     WHERE entity_type = ?1 AND entity_id = ?2
                       AND status IN ('pending', 'processing')
                 )",
                params![entity.entity_type.as_str(), entity.entity_id],
                |row| row.get(0),
            )?;
            Ok(live)
        })
        .await
    }

    async fn live_operations(&self) -> Result<Vec<OfflineOperation>> {
        self.blocking(|conn| {
            let sql = format!(
                "SELECT {OPERATION_COLUMNS} FROM offline_operations
                 WHERE status IN ('pending', 'processing')
                 ORDER BY id"
            );
            query_operations(conn, &sql, params![])
        })
        .await
    }

    async fn purge_completed(&self, processed_before: i64) -> Result<usize> {
        self.blocking(move |conn| {
            let deleted = conn.execute(
                "DELETE FROM offline_operations
                 WHERE status = 'completed' AND processed_at < ?1",
                params![processed_before],
            )?;
            debug!(deleted, processed_before, "purged completed operations");
            Ok(deleted)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// ConflictStore
// ---------------------------------------------------------------------------

fn query_conflicts(
    conn: &Connection,
    sql: &str,
    params: &[&dyn ToSql],
) -> Result<Vec<SyncConflict>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query(params)?;
    let mut conflicts = Vec::new();
    while let Some(row) = rows.next()? {
        conflicts.push(read_conflict(row)?);
    }
    Ok(conflicts)
}

fn load_conflict(conn: &Connection, id: ConflictId) -> Result<Option<SyncConflict>> {
    let sql = format!("SELECT {CONFLICT_COLUMNS} FROM sync_conflicts WHERE id = ?1");
    Ok(query_conflicts(conn, &sql, params![id.0])?.into_iter().next())
}

#[async_trait]
impl ConflictStore for SqliteStore {
    async fn insert_conflict(&self, conflict: NewConflict) -> Result<SyncConflict> {
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO sync_conflicts (
                    operation_id, operation_type, entity_type, entity_id, local_data,
                    remote_data, conflict_type, status, detected_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8)",
                params![
                    conflict.operation_id.0,
                    conflict.operation_type.as_str(),
                    conflict.entity.entity_type.as_str(),
                    conflict.entity.entity_id,
                    to_cbor(&conflict.local_data)?,
                    encode_optional(conflict.remote_data.as_ref())?,
                    conflict.conflict_type.as_str(),
                    conflict.detected_at,
                ],
            )?;
            let id = ConflictId(conn.last_insert_rowid());
            Ok(SyncConflict::from_new(id, conflict))
        })
        .await
    }

    async fn get_conflict(&self, id: ConflictId) -> Result<Option<SyncConflict>> {
        self.blocking(move |conn| load_conflict(conn, id)).await
    }

    async fn list_conflicts(
        &self,
        status: Option<ConflictStatus>,
        page: Page,
    ) -> Result<Paged<SyncConflict>> {
        self.blocking(move |conn| {
            let status = status.map(|s| s.as_str());
            let total = count_where(conn, "sync_conflicts", status)?;

            let sql = format!(
                "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY id
                 LIMIT ?2 OFFSET ?3"
            );
            let items = query_conflicts(
                conn,
                &sql,
                params![status, page.limit as i64, page.offset as i64],
            )?;

            Ok(Paged { items, total, page })
        })
        .await
    }

    async fn settle_conflict(
        &self,
        id: ConflictId,
        state: ConflictState,
        notes: Option<String>,
    ) -> Result<SyncConflict> {
        let (resolution, resolved_data, resolved_at, ignored_at) = match &state {
            ConflictState::Pending => {
                return Err(StoreError::InvalidData(format!(
                    "{id} cannot be settled back to pending"
                )))
            }
            ConflictState::Resolved {
                resolution,
                resolved_data,
                resolved_at,
            } => (
                Some(resolution.as_str()),
                Some(to_cbor(resolved_data)?),
                Some(*resolved_at),
                None,
            ),
            ConflictState::Ignored { ignored_at } => (None, None, None, Some(*ignored_at)),
        };
        let status = state.status();

        self.blocking(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let changed = tx.execute(
                "UPDATE sync_conflicts
                 SET status = ?1, resolution = ?2, resolved_data = ?3, resolved_at = ?4,
                     ignored_at = ?5, notes = COALESCE(?6, notes)
                 WHERE id = ?7 AND status = 'pending'",
                params![
                    status.as_str(),
                    resolution,
                    resolved_data,
                    resolved_at,
                    ignored_at,
                    notes,
                    id.0,
                ],
            )?;

            let current =
                load_conflict(&tx, id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            if changed == 0 {
                return Err(ValidationError::AlreadySettled {
                    id,
                    status: current.status(),
                }
                .into());
            }

            tx.commit()?;
            Ok(current)
        })
        .await
    }

    async fn conflict_stats(&self) -> Result<ConflictStats> {
        self.blocking(|conn| {
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM sync_conflicts GROUP BY status")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut stats = ConflictStats::default();
            for (status, count) in rows {
                stats.bump(status.parse()?, count as usize);
            }
            Ok(stats)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdsync_core::{ConflictType, ExpectedBase, OperationType, ProductRecord, ResolvedData};

    fn product(price: f64) -> EntityData {
        EntityData::from(ProductRecord::default().with_price(price))
    }

    fn update(entity_id: &str, price: f64) -> NewOperation {
        NewOperation::update(
            EntityRef::new("product", entity_id),
            product(price),
            ExpectedBase::Any,
        )
    }

    fn new_conflict() -> NewConflict {
        NewConflict {
            operation_id: OperationId(1),
            operation_type: OperationType::Update,
            entity: EntityRef::new("product", "42"),
            local_data: product(10.0),
            remote_data: Some(product(12.0)),
            conflict_type: ConflictType::UpdateConflict,
            detected_at: 100,
        }
    }

    #[tokio::test]
    async fn test_enqueue_and_get_roundtrip() {
        let store = SqliteStore::open_memory().unwrap();
        let expected = ExpectedBase::from_known(Some(&product(9.0))).unwrap();
        let op = store
            .enqueue(
                NewOperation::update(EntityRef::new("product", "42"), product(10.0), expected)
                    .priority(Priority::High)
                    .user(Some("clerk-7".into())),
            )
            .await
            .unwrap();

        let loaded = store.get_operation(op.id).await.unwrap().unwrap();
        assert_eq!(loaded, op);
        assert_eq!(loaded.priority, Priority::High);
        assert_eq!(loaded.user_id.as_deref(), Some("clerk-7"));
        assert_eq!(loaded.max_retries, store.config().default_max_retries);
    }

    #[tokio::test]
    async fn test_claim_order_and_entity_gate() {
        let store = SqliteStore::open_memory().unwrap();
        let a1 = store.enqueue(update("a", 1.0).priority(Priority::Low)).await.unwrap();
        let a2 = store.enqueue(update("a", 2.0).priority(Priority::High)).await.unwrap();
        let b = store.enqueue(update("b", 1.0)).await.unwrap();

        let now = mdsync_core::now_millis();
        // a2 is high priority but gated behind a1.
        assert_eq!(store.claim(now).await.unwrap().unwrap().id, b.id);
        assert_eq!(store.claim(now).await.unwrap().unwrap().id, a1.id);
        assert!(store.claim(now).await.unwrap().is_none());

        store.mark_completed(a1.id, now).await.unwrap();
        assert_eq!(store.claim(now).await.unwrap().unwrap().id, a2.id);
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_exclusive() {
        let store = Arc::new(SqliteStore::open_memory().unwrap());
        for i in 0..20 {
            store.enqueue(update(&i.to_string(), 1.0)).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(op) = store.claim(mdsync_core::now_millis()).await.unwrap() {
                    claimed.push(op.id);
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 20);
    }

    #[tokio::test]
    async fn test_fail_requeues_with_backoff() {
        let store = SqliteStore::open_memory().unwrap().with_config(QueueConfig {
            retry_backoff_ms: 1_000,
            ..QueueConfig::default()
        });
        let op = store.enqueue(update("42", 10.0)).await.unwrap();

        store.claim(5_000_000_000_000).await.unwrap().unwrap();
        let outcome = store
            .mark_failed(op.id, "timeout", Retry::Allowed, 5_000_000_000_000)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FailOutcome::Requeued {
                retry_count: 1,
                available_at: 5_000_000_001_000
            }
        );

        assert!(store.claim(5_000_000_000_500).await.unwrap().is_none());
        assert!(store.claim(5_000_000_001_000).await.unwrap().is_some());

        let stored = store.get_operation(op.id).await.unwrap().unwrap();
        assert_eq!(stored.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_invalid_transition_rejected() {
        let store = SqliteStore::open_memory().unwrap();
        let op = store.enqueue(update("42", 10.0)).await.unwrap();

        let err = store.mark_completed(op.id, 1).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Validation(ValidationError::InvalidTransition { .. })
        ));

        let missing = store.release(OperationId(999)).await.unwrap_err();
        assert!(matches!(missing, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_capacity_and_stats() {
        let store = SqliteStore::open_memory().unwrap().with_config(QueueConfig {
            capacity: 1,
            ..QueueConfig::default()
        });
        let op = store.enqueue(update("1", 1.0)).await.unwrap();
        assert!(store.enqueue(update("2", 1.0)).await.unwrap_err().is_queue_full());

        let now = mdsync_core::now_millis();
        store.claim(now).await.unwrap();
        store.mark_failed(op.id, "rejected", Retry::Never, now).await.unwrap();

        let stats = store.queue_stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.live(), 0);
        store.enqueue(update("2", 1.0)).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_operations_paginates() {
        let store = SqliteStore::open_memory().unwrap();
        for i in 0..5 {
            store.enqueue(update(&i.to_string(), 1.0)).await.unwrap();
        }

        let page = store
            .list_operations(Some(OperationStatus::Pending), Page::new(2, 2))
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].id, OperationId(3));
        assert!(page.has_more());
    }

    #[tokio::test]
    async fn test_reclaim_and_purge() {
        let store = SqliteStore::open_memory().unwrap();
        let op = store.enqueue(update("42", 1.0)).await.unwrap();
        let now = mdsync_core::now_millis();
        store.claim(now).await.unwrap();

        assert!(store.reclaim_expired(now - 1).await.unwrap().is_empty());
        assert_eq!(store.reclaim_expired(now).await.unwrap(), vec![op.id]);
        assert!(store.has_live(&op.entity).await.unwrap());

        store.claim(now + 100).await.unwrap();
        store.mark_completed(op.id, now + 100).await.unwrap();
        assert!(!store.has_live(&op.entity).await.unwrap());

        assert_eq!(store.purge_completed(now + 100).await.unwrap(), 0);
        assert_eq!(store.purge_completed(now + 101).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_conflict_lifecycle() {
        let store = SqliteStore::open_memory().unwrap();
        let conflict = store.insert_conflict(new_conflict()).await.unwrap();
        assert!(conflict.is_pending());

        let loaded = store.get_conflict(conflict.id).await.unwrap().unwrap();
        assert_eq!(loaded, conflict);

        let state = conflict.plan(Resolution::Remote, None, 200).unwrap();
        let settled = store
            .settle_conflict(conflict.id, state.clone(), None)
            .await
            .unwrap();
        assert_eq!(settled.resolution(), Some(Resolution::Remote));
        assert_eq!(settled.resolved_record(), Some(&product(12.0)));
        assert_eq!(settled.resolved_at(), Some(200));

        let again = store.settle_conflict(conflict.id, state, None).await;
        assert!(matches!(
            again,
            Err(StoreError::Validation(ValidationError::AlreadySettled {
                status: ConflictStatus::Resolved,
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn test_conflict_resolved_to_absent() {
        let store = SqliteStore::open_memory().unwrap();
        let mut new = new_conflict();
        new.operation_type = OperationType::Delete;
        new.conflict_type = ConflictType::DeleteConflict;
        let conflict = store.insert_conflict(new).await.unwrap();

        let state = conflict.plan(Resolution::Local, None, 5).unwrap();
        store
            .settle_conflict(conflict.id, state, Some("forced".into()))
            .await
            .unwrap();

        let loaded = store.get_conflict(conflict.id).await.unwrap().unwrap();
        assert_eq!(loaded.status(), ConflictStatus::Resolved);
        assert_eq!(loaded.resolved_data(), Some(&ResolvedData::Deleted));
        assert!(loaded.resolved_at().is_some());
        assert_eq!(loaded.notes.as_deref(), Some("forced"));
    }

    #[tokio::test]
    async fn test_remote_resolution_of_vanished_record_round_trips() {
        let store = SqliteStore::open_memory().unwrap();
        let mut new = new_conflict();
        new.remote_data = None;
        new.conflict_type = ConflictType::DeleteConflict;
        let conflict = store.insert_conflict(new).await.unwrap();

        let state = conflict.plan(Resolution::Remote, None, 9).unwrap();
        store.settle_conflict(conflict.id, state, None).await.unwrap();

        let loaded = store.get_conflict(conflict.id).await.unwrap().unwrap();
        assert_eq!(loaded.resolved_data(), Some(&ResolvedData::Deleted));
        assert_eq!(loaded.resolved_at(), Some(9));
    }

    #[test]
    fn test_resolved_row_without_data_is_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        migration::migrate(&mut conn).unwrap();

        let result = conn.execute(
            "INSERT INTO sync_conflicts (
                operation_id, operation_type, entity_type, entity_id, local_data,
                conflict_type, status, resolution, resolved_at, detected_at
            ) VALUES (1, 'delete', 'product', '42', x'00', 'delete_conflict', 'resolved', 'local', 5, 0)",
            [],
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_list_conflicts_by_status() {
        let store = SqliteStore::open_memory().unwrap();
        let first = store.insert_conflict(new_conflict()).await.unwrap();
        store.insert_conflict(new_conflict()).await.unwrap();

        store
            .settle_conflict(first.id, ConflictState::Ignored { ignored_at: 1 }, None)
            .await
            .unwrap();

        let pending = store
            .list_conflicts(Some(ConflictStatus::Pending), Page::default())
            .await
            .unwrap();
        assert_eq!(pending.total, 1);

        let stats = store.conflict_stats().await.unwrap();
        assert_eq!(stats.ignored, 1);
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mdsync.db");

        let id = {
            let store = SqliteStore::open(&path).unwrap();
            store.enqueue(update("42", 10.0)).await.unwrap().id
        };

        let store = SqliteStore::open(&path).unwrap();
        let op = store.get_operation(id).await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.payload, product(10.0));

        assert!(store.has_live(&EntityRef::new("product", "42")).await.unwrap());
        assert!(!store.has_live(&EntityRef::new("product", "7")).await.unwrap());
        let live = store.live_operations().await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, id);
    }

    #[tokio::test]
    async fn test_live_operations_skip_terminal() {
        let store = SqliteStore::open_memory().unwrap();
        let done = store.enqueue(update("42", 1.0)).await.unwrap();
        let queued = store.enqueue(update("42", 2.0)).await.unwrap();

        let now = mdsync_core::now_millis();
        store.claim(now).await.unwrap().unwrap();
        store.mark_completed(done.id, now).await.unwrap();

        let live = store.live_operations().await.unwrap();
        assert_eq!(live.iter().map(|op| op.id).collect::<Vec<_>>(), vec![queued.id]);
        assert!(store.has_live(&queued.entity).await.unwrap());
    }
}
