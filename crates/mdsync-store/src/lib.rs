//! # mdsync Store
//!
//! Persistence for the offline operation queue and the conflict log.
//!
//! ## Overview
//!
//! The sync engine talks to storage through two traits, [`OperationQueue`]
//! and [`ConflictStore`], so it never depends on a particular backend. The
//! primary implementation is [`SqliteStore`], with [`MemoryStore`] for
//! tests. Both implement both traits.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mdsync_core::{EntityData, EntityRef, ExpectedBase, NewOperation, ProductRecord};
//! use mdsync_store::{OperationQueue, SqliteStore};
//!
//! async fn example() -> mdsync_store::Result<()> {
//!     let store = SqliteStore::open("mdsync.db")?;
//!
//!     let op = NewOperation::update(
//!         EntityRef::new("product", "42"),
//!         EntityData::from(ProductRecord::default().with_price(10.0)),
//!         ExpectedBase::Any,
//!     );
//!     store.enqueue(op).await?;
//!
//!     if let Some(claimed) = store.claim(mdsync_core::now_millis()).await? {
//!         store.mark_completed(claimed.id, mdsync_core::now_millis()).await?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Exclusive claims**: a claim is a compare-and-swap on status, so an
//!   operation is handed to at most one worker.
//! - **Per-entity ordering**: operations on the same entity are claimable
//!   strictly in enqueue order.
//! - **Backpressure**: `enqueue` fails with [`StoreError::QueueFull`] at capacity.
//! - **Single settlement**: a conflict leaves `pending` exactly once.

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{
    ConflictStats, ConflictStore, OperationQueue, QueueConfig, QueueStats, Store,
};
