//! Versioned SQLite schema for the queue and conflict log.
//!
//! `schema_migrations` records every applied version. Opening a database
//! written by a newer build fails instead of guessing.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema.
///
/// Idempotent: safe to run on every open.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema v{current} is newer than supported v{CURRENT_VERSION}"
        )));
    }

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, mdsync_core::now_millis()],
            )?;
            tracing::debug!(version, "applied schema migration");
        }

        tx.commit()?;
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: offline queue and conflict log.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Offline operation queue
        CREATE TABLE offline_operations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,   -- enqueue order
            operation_type TEXT NOT NULL
                CHECK (operation_type IN ('create', 'update', 'delete')),
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            payload BLOB NOT NULL,                  -- CBOR EntityData
            expected_base BLOB NOT NULL,            -- CBOR ExpectedBase
            status TEXT NOT NULL
                CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
            priority INTEGER NOT NULL,              -- 0=high, 1=medium, 2=low
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            available_at INTEGER NOT NULL,          -- not claimable before this
            claimed_at INTEGER,
            processed_at INTEGER,
            user_id TEXT,                           -- author, copied onto events

            CHECK (retry_count <= max_retries),
            CHECK ((status = 'processing') = (claimed_at IS NOT NULL))
        );

        -- Conflict log
        CREATE TABLE sync_conflicts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            operation_id INTEGER NOT NULL,
            operation_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            local_data BLOB NOT NULL,               -- CBOR EntityData
            remote_data BLOB,                       -- NULL when absent remotely
            conflict_type TEXT NOT NULL
                CHECK (conflict_type IN ('update_conflict', 'delete_conflict')),
            status TEXT NOT NULL
                CHECK (status IN ('pending', 'resolved', 'ignored')),
            resolution TEXT,
            resolved_data BLOB,                     -- CBOR ResolvedData
            resolved_at INTEGER,
            ignored_at INTEGER,
            notes TEXT,
            detected_at INTEGER NOT NULL,

            CHECK ((status = 'resolved') = (resolved_at IS NOT NULL)),
            CHECK ((status = 'resolved') = (resolution IS NOT NULL)),
            CHECK ((status = 'resolved') = (resolved_data IS NOT NULL)),
            CHECK ((status = 'ignored') = (ignored_at IS NOT NULL))
        );

        CREATE INDEX idx_operations_claim ON offline_operations(status, priority, id);
        CREATE INDEX idx_operations_entity ON offline_operations(entity_type, entity_id, id);
        CREATE INDEX idx_operations_processed ON offline_operations(status, processed_at);
        CREATE INDEX idx_conflicts_status ON sync_conflicts(status, id);
        CREATE INDEX idx_conflicts_entity ON sync_conflicts(entity_type, entity_id);
        "#,
    )?;

    Ok(())
}
