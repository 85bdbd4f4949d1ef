//! # mdsync sync
//!
//! Drains the offline operation queue into the authoritative remote store.
//!
//! ## Overview
//!
//! Writes made while the remote is unreachable are queued with the remote
//! state they were authored against. A drain pass claims them in priority
//! and FIFO order and applies each one optimistically: the remote only
//! takes the write if its record still matches that base. Clean writes
//! complete and publish an event. Mismatches become conflicts that an
//! operator settles through the [`ConflictResolver`].
//!
//! ## Key Types
//!
//! - [`SyncEngine`]: submit path and single-flight drain passes
//! - [`ConflictResolver`]: settles conflicts exactly once
//! - [`RemoteStore`]: the optimistic remote, with an in-memory impl
//! - [`Baseline`]: the local view used to author expected bases
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mdsync_events::{EventPublisher, MemoryBroker};
//! use mdsync_store::MemoryStore;
//! use mdsync_sync::{Baseline, MemoryRemote, SyncEngine};
//! use tokio_util::sync::CancellationToken;
//!
//! async fn example() -> mdsync_sync::Result<()> {
//!     let publisher = EventPublisher::new(Arc::new(MemoryBroker::default()), "pos-7");
//!     let engine = SyncEngine::new(
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(MemoryRemote::new()),
//!         publisher,
//!         Arc::new(Baseline::new()),
//!     );
//!
//!     let report = engine.drain_and_sync(false, &CancellationToken::new()).await?;
//!     println!("{} completed, {} conflicts", report.completed, report.conflicts.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Entity order**: the queue never hands out an operation while an
//!   earlier one on the same entity is live, so per-entity order holds
//!   with any number of workers.
//! - **Replay**: a write that landed before a crash shows up as a base
//!   mismatch whose current record equals the intended result. It is
//!   completed, not turned into a conflict.
//! - **Baseline**: kept in memory. After a restart, run a pass with
//!   `force_full` to rebuild it from a remote snapshot.

pub mod baseline;
pub mod engine;
pub mod error;
pub mod remote;
pub mod resolver;

pub use baseline::Baseline;
pub use engine::{DrainReport, SubmitOutcome, SyncConfig, SyncEngine, SyncStatus};
pub use error::{Result, SyncError};
pub use remote::{memory::MemoryRemote, ApplyOutcome, RemoteError, RemoteStore, RemoteWrite};
pub use resolver::{ConflictResolver, ResolveOutcome};
