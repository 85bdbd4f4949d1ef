//! # mdsync
//!
//! Offline-first synchronization core for master data (products,
//! customers, suppliers, ...).
//!
//! ## Overview
//!
//! Clients keep mutating master data while the authoritative store is
//! unreachable. `mdsync` provides:
//!
//! - **Operation queue**: durable, bounded, priority/FIFO ordered, with
//!   per-entity ordering and retry backoff
//! - **Sync engine**: drains the queue with optimistic writes against the
//!   remote, replays idempotently, records conflicts
//! - **Conflict resolution**: local, remote, merge or ignore, settled once
//! - **Event fan-out**: committed changes go to `events`, `audit` and
//!   `sync` topics and on to independent subscribers
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mdsync::{SyncCore, SyncCoreConfig};
//! use mdsync::core::{EntityData, EntityRef, OperationType, Priority, ProductRecord};
//! use mdsync::events::{MemoryBroker, MemoryCache};
//! use mdsync::sync::MemoryRemote;
//!
//! async fn example() -> mdsync::Result<()> {
//!     let core = SyncCore::in_memory(
//!         SyncCoreConfig::default(),
//!         Arc::new(MemoryRemote::new()),
//!         Arc::new(MemoryBroker::default()),
//!     )?;
//!     let builtin = core.install_builtin_handlers(Arc::new(MemoryCache::new())).await?;
//!     core.start().await?;
//!
//!     let price = EntityData::from(ProductRecord::default().with_price(10.0));
//!     core.submit(OperationType::Update, EntityRef::new("product", "42"), price, Priority::High)
//!         .await?;
//!
//!     let report = core.drain_and_sync(false).await?;
//!     println!("{} synced, {} conflicts", report.completed, report.conflicts.len());
//!
//!     let _live = builtin.live.subscribe();
//!     core.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `mdsync::core` - Data model, operations, conflicts, events
//! - `mdsync::store` - Queue and conflict persistence (memory, SQLite)
//! - `mdsync::events` - Broker, publisher, subscribers, handlers
//! - `mdsync::sync` - Sync engine, remote store, resolver

pub mod config;
pub mod error;
pub mod service;

// Re-export component crates
pub use mdsync_core as core;
pub use mdsync_events as events;
pub use mdsync_store as store;
pub use mdsync_sync as sync;

pub use config::SyncCoreConfig;
pub use error::{Result, ServiceError};
pub use service::{BuiltinHandlers, SyncCore};

// Re-export commonly used types
pub use mdsync_core::{
    ConflictId, ConflictStatus, EntityData, EntityRef, EntityType, EventType, MasterDataEvent,
    NewEvent, NewOperation, OfflineOperation, OperationId, OperationStatus, OperationType, Page,
    Priority, Resolution, ResolvedData, SyncConflict, Topic,
};
pub use mdsync_sync::{DrainReport, SubmitOutcome, SyncStatus};
