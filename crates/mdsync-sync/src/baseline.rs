//! Local view of the remote records, used to author optimistic writes.
//!
//! For every entity the baseline keeps the last remote state it confirmed
//! and, while operations on the entity are queued, the state those
//! operations will have produced once they land. A new offline edit is
//! authored against that projected state, so a chain of edits to one
//! entity carries a correct expected base at every link.

use std::collections::HashMap;

use tokio::sync::RwLock;

use mdsync_core::{CoreError, EntityData, EntityRef, ExpectedBase};

#[derive(Debug, Clone, Default)]
struct Entry {
    /// Last state confirmed by the remote; `None` if never observed.
    confirmed: Option<Option<EntityData>>,
    /// State after every queued operation lands.
    projected: Option<EntityData>,
    /// Queued operations not yet terminal.
    pending: usize,
}

impl Entry {
    fn current(&self) -> Option<&Option<EntityData>> {
        if self.pending > 0 {
            // Projected state is meaningful whenever something is queued.
            return Some(&self.projected);
        }
        self.confirmed.as_ref()
    }
}

/// In-memory baseline shared by the write path and the sync engine.
#[derive(Debug, Default)]
pub struct Baseline {
    entries: RwLock<HashMap<EntityRef, Entry>>,
}

impl Baseline {
    pub fn new() -> Self {
        Self::default()
    }

    /// The base a write authored now should carry.
    ///
    /// Unknown entities get [`ExpectedBase::Any`]: with nothing to compare
    /// against the write is last-writer-wins.
    pub async fn expected_for(&self, entity: &EntityRef) -> Result<ExpectedBase, CoreError> {
        let entries = self.entries.read().await;
        match entries.get(entity).and_then(Entry::current) {
            Some(state) => ExpectedBase::from_known(state.as_ref()),
            None => Ok(ExpectedBase::Any),
        }
    }

    /// Last known state, or `None` if the entity was never observed.
    pub async fn known(&self, entity: &EntityRef) -> Option<Option<EntityData>> {
        let entries = self.entries.read().await;
        entries.get(entity).and_then(Entry::current).cloned()
    }

    /// Capture the base for a queued write and project its result.
    ///
    /// Atomic with respect to other captures, so two edits racing on one
    /// entity still chain.
    pub async fn capture(
        &self,
        entity: &EntityRef,
        result: Option<EntityData>,
    ) -> Result<ExpectedBase, CoreError> {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(entity.clone()).or_default();
        let expected = match entry.current() {
            Some(state) => ExpectedBase::from_known(state.as_ref())?,
            None => ExpectedBase::Any,
        };
        entry.projected = result;
        entry.pending += 1;
        Ok(expected)
    }

    /// Record a queued write whose base the caller chose.
    pub async fn project(&self, entity: &EntityRef, result: Option<EntityData>) {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(entity.clone()).or_default();
        entry.projected = result;
        entry.pending += 1;
    }

    /// A queued operation reached a terminal state.
    ///
    /// `remote` is the remote state the outcome revealed, if any.
    pub async fn settle(&self, entity: &EntityRef, remote: Option<Option<EntityData>>) {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(entity) else {
            if let Some(state) = remote {
                entries.insert(
                    entity.clone(),
                    Entry {
                        confirmed: Some(state),
                        ..Entry::default()
                    },
                );
            }
            return;
        };

        if remote.is_some() {
            entry.confirmed = remote;
        }
        entry.pending = entry.pending.saturating_sub(1);
        if entry.pending == 0 {
            match entry.confirmed.clone() {
                Some(state) => entry.projected = state,
                None => {
                    entries.remove(entity);
                }
            }
        }
    }

    /// Record remote state seen outside the queue (direct writes, fetches,
    /// conflict resolutions).
    pub async fn observe(&self, entity: &EntityRef, state: Option<EntityData>) {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(entity.clone()).or_default();
        if entry.pending == 0 {
            entry.projected = state.clone();
        }
        entry.confirmed = Some(state);
    }

    /// Whether queued operations for the entity are still outstanding.
    pub async fn has_pending(&self, entity: &EntityRef) -> bool {
        self.entries
            .read()
            .await
            .get(entity)
            .map_or(false, |e| e.pending > 0)
    }

    /// Replace every confirmed state with a full remote snapshot.
    ///
    /// Entities missing from the snapshot are confirmed absent. Pending
    /// projections are kept. Returns the number of records loaded.
    pub async fn rebuild(&self, snapshot: Vec<(EntityRef, EntityData)>) -> usize {
        let mut entries = self.entries.write().await;

        entries.retain(|_, entry| entry.pending > 0);
        for entry in entries.values_mut() {
            entry.confirmed = Some(None);
        }

        let loaded = snapshot.len();
        for (entity, data) in snapshot {
            let entry = entries.entry(entity).or_default();
            if entry.pending == 0 {
                entry.projected = Some(data.clone());
            }
            entry.confirmed = Some(Some(data));
        }
        loaded
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdsync_core::ProductRecord;

    fn product(price: f64) -> EntityData {
        EntityData::from(ProductRecord::default().with_price(price))
    }

    fn matches(data: &EntityData) -> ExpectedBase {
        ExpectedBase::from_known(Some(data)).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_entity_is_unconditional() {
        let baseline = Baseline::new();
        let entity = EntityRef::new("product", "42");
        assert_eq!(baseline.expected_for(&entity).await.unwrap(), ExpectedBase::Any);
    }

    #[tokio::test]
    async fn test_chained_edits_carry_projected_base() {
        let baseline = Baseline::new();
        let entity = EntityRef::new("product", "42");
        baseline.observe(&entity, Some(product(9.0))).await;

        let first = baseline.capture(&entity, Some(product(10.0))).await.unwrap();
        let second = baseline.capture(&entity, Some(product(11.0))).await.unwrap();
        assert_eq!(first, matches(&product(9.0)));
        assert_eq!(second, matches(&product(10.0)));

        baseline.settle(&entity, Some(Some(product(10.0)))).await;
        assert!(baseline.has_pending(&entity).await);
        // Still authored against the end of the chain.
        assert_eq!(
            baseline.expected_for(&entity).await.unwrap(),
            matches(&product(11.0))
        );

        baseline.settle(&entity, Some(Some(product(11.0)))).await;
        assert!(!baseline.has_pending(&entity).await);
        assert_eq!(baseline.known(&entity).await, Some(Some(product(11.0))));
    }

    #[tokio::test]
    async fn test_conflict_resets_to_confirmed() {
        let baseline = Baseline::new();
        let entity = EntityRef::new("product", "42");
        baseline.observe(&entity, Some(product(9.0))).await;
        baseline.capture(&entity, Some(product(10.0))).await.unwrap();

        // The remote had moved on to 12.
        baseline.settle(&entity, Some(Some(product(12.0)))).await;
        assert_eq!(
            baseline.expected_for(&entity).await.unwrap(),
            matches(&product(12.0))
        );
    }

    #[tokio::test]
    async fn test_unobserved_chain_forgets_after_settle() {
        let baseline = Baseline::new();
        let entity = EntityRef::new("product", "42");

        assert_eq!(
            baseline.capture(&entity, Some(product(1.0))).await.unwrap(),
            ExpectedBase::Any
        );
        baseline.settle(&entity, None).await;
        assert_eq!(baseline.len().await, 0);
    }

    #[tokio::test]
    async fn test_rebuild_from_snapshot() {
        let baseline = Baseline::new();
        let gone = EntityRef::new("product", "1");
        let kept = EntityRef::new("product", "2");
        baseline.observe(&gone, Some(product(1.0))).await;

        let loaded = baseline.rebuild(vec![(kept.clone(), product(2.0))]).await;
        assert_eq!(loaded, 1);
        assert_eq!(baseline.known(&gone).await, None);
        assert_eq!(
            baseline.expected_for(&kept).await.unwrap(),
            matches(&product(2.0))
        );
    }
}
