//! The authoritative remote store.
//!
//! Writes are optimistic: every queued write carries the base state it was
//! authored against and the remote only applies it if its current record
//! still matches. Forced writes skip the check and are reserved for
//! conflict resolution.

use async_trait::async_trait;
use thiserror::Error;

use mdsync_core::{EntityData, EntityRef, ExpectedBase, OfflineOperation, OperationType};

/// Result type for remote operations.
pub type Result<T> = std::result::Result<T, RemoteError>;

/// Remote failures, split by whether retrying can help.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Network, timeout or overload. Worth retrying.
    #[error("remote unavailable: {0}")]
    Unavailable(String),

    /// The remote refused the write as invalid. Never retried.
    #[error("remote rejected write: {0}")]
    Rejected(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Unavailable(_))
    }
}

/// A write against one remote record.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteWrite {
    /// Create or replace the record.
    Put(EntityData),
    Delete,
}

impl RemoteWrite {
    /// The write an operation performs.
    pub fn for_operation(op: &OfflineOperation) -> Self {
        match op.operation_type {
            OperationType::Create | OperationType::Update => RemoteWrite::Put(op.payload.clone()),
            OperationType::Delete => RemoteWrite::Delete,
        }
    }

    /// The record left behind once the write lands.
    pub fn result(&self) -> Option<&EntityData> {
        match self {
            RemoteWrite::Put(data) => Some(data),
            RemoteWrite::Delete => None,
        }
    }

    pub fn into_result(self) -> Option<EntityData> {
        match self {
            RemoteWrite::Put(data) => Some(data),
            RemoteWrite::Delete => None,
        }
    }
}

/// Outcome of an optimistic write.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The base matched and the write landed.
    Applied {
        previous: Option<EntityData>,
        current: Option<EntityData>,
    },
    /// The base did not match; nothing was written.
    Mismatch { current: Option<EntityData> },
}

/// The authoritative store the queue drains into.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Current record, `None` if it does not exist.
    async fn fetch(&self, entity: &EntityRef) -> Result<Option<EntityData>>;

    /// Apply `write` only if the current record satisfies `expected`.
    async fn apply(
        &self,
        entity: &EntityRef,
        write: RemoteWrite,
        expected: &ExpectedBase,
    ) -> Result<ApplyOutcome>;

    /// Apply `write` unconditionally. Returns the record it replaced.
    async fn force_write(&self, entity: &EntityRef, write: RemoteWrite)
        -> Result<Option<EntityData>>;

    /// Every record, for rebuilding the local baseline.
    async fn snapshot(&self) -> Result<Vec<(EntityRef, EntityData)>>;
}

/// An in-memory remote for tests.
///
/// Supports going offline, scripted failures, artificial latency and
/// out-of-band edits that simulate another client changing a record.
pub mod memory {
    use super::*;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::{Mutex, RwLock};

    /// In-memory remote implementation.
    pub struct MemoryRemote {
        records: RwLock<BTreeMap<EntityRef, EntityData>>,
        online: AtomicBool,
        scripted: Mutex<VecDeque<RemoteError>>,
        log: Mutex<Vec<(EntityRef, RemoteWrite)>>,
        latency: Option<Duration>,
    }

    impl MemoryRemote {
        pub fn new() -> Self {
            Self {
                records: RwLock::new(BTreeMap::new()),
                online: AtomicBool::new(true),
                scripted: Mutex::new(VecDeque::new()),
                log: Mutex::new(Vec::new()),
                latency: None,
            }
        }

        /// Delay every call, to make worker interleavings observable.
        pub fn with_latency(mut self, latency: Duration) -> Self {
            self.latency = Some(latency);
            self
        }

        pub fn set_online(&self, online: bool) {
            self.online.store(online, Ordering::SeqCst);
        }

        pub fn is_online(&self) -> bool {
            self.online.load(Ordering::SeqCst)
        }

        /// Fail the next write call with `error`.
        pub async fn fail_next(&self, error: RemoteError) {
            self.scripted.lock().await.push_back(error);
        }

        /// Change a record out of band, as another client would.
        pub async fn put(&self, entity: EntityRef, data: EntityData) {
            self.records.write().await.insert(entity, data);
        }

        pub async fn remove(&self, entity: &EntityRef) {
            self.records.write().await.remove(entity);
        }

        pub async fn get(&self, entity: &EntityRef) -> Option<EntityData> {
            self.records.read().await.get(entity).cloned()
        }

        /// Every write that landed, in order.
        pub async fn write_log(&self) -> Vec<(EntityRef, RemoteWrite)> {
            self.log.lock().await.clone()
        }

        pub async fn write_count(&self) -> usize {
            self.log.lock().await.len()
        }

        async fn enter(&self) -> Result<()> {
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }
            if !self.is_online() {
                return Err(RemoteError::Unavailable("offline".into()));
            }
            Ok(())
        }

        async fn enter_write(&self) -> Result<()> {
            self.enter().await?;
            match self.scripted.lock().await.pop_front() {
                Some(error) => Err(error),
                None => Ok(()),
            }
        }

        async fn write(
            &self,
            records: &mut BTreeMap<EntityRef, EntityData>,
            entity: &EntityRef,
            write: RemoteWrite,
        ) -> Result<Option<EntityData>> {
            if let RemoteWrite::Put(data) = &write {
                if !data.fits(&entity.entity_type) {
                    return Err(RemoteError::Rejected(format!(
                        "{} payload for {}",
                        data.kind(),
                        entity
                    )));
                }
            }

            let previous = match write.result() {
                Some(data) => records.insert(entity.clone(), data.clone()),
                None => records.remove(entity),
            };
            self.log.lock().await.push((entity.clone(), write));
            Ok(previous)
        }
    }

    impl Default for MemoryRemote {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl RemoteStore for MemoryRemote {
        async fn fetch(&self, entity: &EntityRef) -> Result<Option<EntityData>> {
            self.enter().await?;
            Ok(self.get(entity).await)
        }

        async fn apply(
            &self,
            entity: &EntityRef,
            write: RemoteWrite,
            expected: &ExpectedBase,
        ) -> Result<ApplyOutcome> {
            self.enter_write().await?;

            let mut records = self.records.write().await;
            let current = records.get(entity).cloned();
            let admitted = expected
                .admits(current.as_ref())
                .map_err(|e| RemoteError::Rejected(e.to_string()))?;
            if !admitted {
                return Ok(ApplyOutcome::Mismatch { current });
            }

            let landed = write.result().cloned();
            let previous = self.write(&mut records, entity, write).await?;
            Ok(ApplyOutcome::Applied {
                previous,
                current: landed,
            })
        }

        async fn force_write(
            &self,
            entity: &EntityRef,
            write: RemoteWrite,
        ) -> Result<Option<EntityData>> {
            self.enter_write().await?;
            let mut records = self.records.write().await;
            self.write(&mut records, entity, write).await
        }

        async fn snapshot(&self) -> Result<Vec<(EntityRef, EntityData)>> {
            self.enter().await?;
            Ok(self
                .records
                .read()
                .await
                .iter()
                .map(|(entity, data)| (entity.clone(), data.clone()))
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryRemote;
    use super::*;
    use mdsync_core::ProductRecord;

    fn product(price: f64) -> EntityData {
        EntityData::from(ProductRecord::default().with_price(price))
    }

    #[tokio::test]
    async fn test_apply_checks_base() {
        let remote = MemoryRemote::new();
        let entity = EntityRef::new("product", "42");
        remote.put(entity.clone(), product(12.0)).await;

        let stale = ExpectedBase::from_known(Some(&product(9.0))).unwrap();
        let outcome = remote
            .apply(&entity, RemoteWrite::Put(product(10.0)), &stale)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome::Mismatch {
                current: Some(product(12.0))
            }
        );
        assert_eq!(remote.write_count().await, 0);

        let fresh = ExpectedBase::from_known(Some(&product(12.0))).unwrap();
        let outcome = remote
            .apply(&entity, RemoteWrite::Put(product(10.0)), &fresh)
            .await
            .unwrap();
        assert!(matches!(outcome, ApplyOutcome::Applied { previous: Some(_), .. }));
        assert_eq!(remote.get(&entity).await, Some(product(10.0)));
    }

    #[tokio::test]
    async fn test_create_requires_absent() {
        let remote = MemoryRemote::new();
        let entity = EntityRef::new("product", "1");

        let first = remote
            .apply(&entity, RemoteWrite::Put(product(1.0)), &ExpectedBase::Absent)
            .await
            .unwrap();
        assert!(matches!(first, ApplyOutcome::Applied { previous: None, .. }));

        let second = remote
            .apply(&entity, RemoteWrite::Put(product(2.0)), &ExpectedBase::Absent)
            .await
            .unwrap();
        assert!(matches!(second, ApplyOutcome::Mismatch { .. }));
    }

    #[tokio::test]
    async fn test_offline_and_scripted_failures() {
        let remote = MemoryRemote::new();
        let entity = EntityRef::new("product", "1");

        remote.set_online(false);
        let err = remote.fetch(&entity).await.unwrap_err();
        assert!(err.is_transient());

        remote.set_online(true);
        remote
            .fail_next(RemoteError::Rejected("bad sku".into()))
            .await;
        let err = remote
            .force_write(&entity, RemoteWrite::Put(product(1.0)))
            .await
            .unwrap_err();
        assert!(!err.is_transient());

        remote
            .force_write(&entity, RemoteWrite::Put(product(1.0)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_payload_kind_must_fit() {
        let remote = MemoryRemote::new();
        let customer = EntityRef::new("customer", "1");
        let err = remote
            .force_write(&customer, RemoteWrite::Put(product(1.0)))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Rejected(_)));
    }
}
