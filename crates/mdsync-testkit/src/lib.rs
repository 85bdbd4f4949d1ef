//! # mdsync Testkit
//!
//! Testing utilities for mdsync.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: a [`TestHarness`] wiring `SyncCore` to in-memory
//!   remote, broker and cache, plus payload helpers
//! - **Generators**: Proptest strategies for payloads and operations
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use mdsync::core::{OperationType, Priority};
//! use mdsync_testkit::{product, product_ref, TestHarness};
//!
//! # async fn example() {
//! let harness = TestHarness::new();
//! harness.go_offline();
//! harness
//!     .core
//!     .submit(OperationType::Update, product_ref("42"), product(10.0), Priority::High)
//!     .await
//!     .unwrap();
//! harness.go_online();
//! let report = harness.core.drain_and_sync(false).await.unwrap();
//! assert_eq!(report.completed, 1);
//! # }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use mdsync_testkit::generators::OperationParams;
//!
//! proptest! {
//!     #[test]
//!     fn operations_validate(params: OperationParams) {
//!         prop_assert!(mdsync::core::validate_new_operation(&params.to_new_operation()).is_ok());
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{customer, customer_ref, init_tracing, product, product_ref, TestHarness};
pub use generators::{entity_with_data, update_script, OperationParams};
