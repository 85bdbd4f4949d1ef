//! Offline operations: mutations waiting to be applied to the remote store.
//!
//! The state machine lives here so that every queue backend applies the
//! same transitions:
//!
//! ```text
//! pending --claim--> processing --complete--> completed
//!    ^                   |  \--fail (retries left)--> pending
//!    +----release--------+   \-fail (exhausted/never)--> failed
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::data::EntityData;
use crate::error::ValidationError;
use crate::fingerprint::ExpectedBase;
use crate::types::{EntityRef, OperationId};

/// Default number of retries for transient failures.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Upper bound for the retry backoff, in milliseconds.
pub const MAX_BACKOFF_MS: i64 = 10 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(OperationType::Create),
            "update" => Ok(OperationType::Update),
            "delete" => Ok(OperationType::Delete),
            other => Err(ValidationError::UnknownValue {
                field: "operation_type",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl OperationStatus {
    pub const ALL: [OperationStatus; 4] = [
        OperationStatus::Pending,
        OperationStatus::Processing,
        OperationStatus::Completed,
        OperationStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Processing => "processing",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Failed)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OperationStatus::Pending),
            "processing" => Ok(OperationStatus::Processing),
            "completed" => Ok(OperationStatus::Completed),
            "failed" => Ok(OperationStatus::Failed),
            other => Err(ValidationError::UnknownValue {
                field: "status",
                value: other.to_string(),
            }),
        }
    }
}

/// Claim priority. `High` is claimed before `Medium` before `Low`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Sort rank; lower is claimed first.
    pub fn rank(&self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }

    pub fn from_rank(rank: u8) -> Option<Self> {
        match rank {
            0 => Some(Priority::High),
            1 => Some(Priority::Medium),
            2 => Some(Priority::Low),
            _ => None,
        }
    }
}

/// Whether a failure may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Transient failure: requeue while retries remain.
    Allowed,
    /// Conflict or validation failure: terminal immediately.
    Never,
}

/// What `fail` did with the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back to pending, claimable again from `available_at`.
    Requeued { retry_count: u32, available_at: i64 },
    /// Terminal failure.
    Failed,
}

/// An operation as submitted by the write path, before the queue assigns
/// it an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    pub operation_type: OperationType,
    pub entity: EntityRef,
    pub payload: EntityData,
    pub expected_base: ExpectedBase,
    pub priority: Priority,
    /// `None` uses the queue's configured default.
    pub max_retries: Option<u32>,
    /// Who authored the change; carried onto the events it produces.
    pub user_id: Option<String>,
}

impl NewOperation {
    pub fn new(
        operation_type: OperationType,
        entity: EntityRef,
        payload: EntityData,
        expected_base: ExpectedBase,
    ) -> Self {
        Self {
            operation_type,
            entity,
            payload,
            expected_base,
            priority: Priority::default(),
            max_retries: None,
            user_id: None,
        }
    }

    pub fn create(entity: EntityRef, payload: EntityData) -> Self {
        Self::new(OperationType::Create, entity, payload, ExpectedBase::Absent)
    }

    pub fn update(entity: EntityRef, payload: EntityData, expected_base: ExpectedBase) -> Self {
        Self::new(OperationType::Update, entity, payload, expected_base)
    }

    /// A delete carries the record as last seen locally.
    pub fn delete(entity: EntityRef, last_seen: EntityData, expected_base: ExpectedBase) -> Self {
        Self::new(OperationType::Delete, entity, last_seen, expected_base)
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }
}

/// A queued mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineOperation {
    pub id: OperationId,
    pub operation_type: OperationType,
    pub entity: EntityRef,
    pub payload: EntityData,
    pub expected_base: ExpectedBase,
    pub status: OperationStatus,
    pub priority: Priority,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub created_at: i64,
    /// Earliest time the operation may be claimed.
    pub available_at: i64,
    pub claimed_at: Option<i64>,
    pub processed_at: Option<i64>,
    pub user_id: Option<String>,
}

impl OfflineOperation {
    /// Materialize a submitted operation with its queue-assigned id.
    pub fn from_new(id: OperationId, new: NewOperation, default_max_retries: u32, now: i64) -> Self {
        Self {
            id,
            operation_type: new.operation_type,
            entity: new.entity,
            payload: new.payload,
            expected_base: new.expected_base,
            status: OperationStatus::Pending,
            priority: new.priority,
            retry_count: 0,
            max_retries: new.max_retries.unwrap_or(default_max_retries),
            last_error: None,
            created_at: now,
            available_at: now,
            claimed_at: None,
            processed_at: None,
            user_id: new.user_id,
        }
    }

    /// The remote record this operation wants to leave behind.
    ///
    /// `None` for deletes.
    pub fn intended_result(&self) -> Option<&EntityData> {
        match self.operation_type {
            OperationType::Create | OperationType::Update => Some(&self.payload),
            OperationType::Delete => None,
        }
    }

    /// Claim order key: priority first, then enqueue order.
    pub fn claim_key(&self) -> (u8, OperationId) {
        (self.priority.rank(), self.id)
    }

    pub fn is_claimable(&self, now: i64) -> bool {
        self.status == OperationStatus::Pending && self.available_at <= now
    }

    /// pending -> processing.
    pub fn claim(&mut self, now: i64) -> Result<(), ValidationError> {
        self.expect_status(OperationStatus::Pending, "claim")?;
        self.status = OperationStatus::Processing;
        self.claimed_at = Some(now);
        Ok(())
    }

    /// processing -> completed.
    pub fn complete(&mut self, now: i64) -> Result<(), ValidationError> {
        self.expect_status(OperationStatus::Processing, "complete")?;
        self.status = OperationStatus::Completed;
        self.claimed_at = None;
        self.processed_at = Some(now);
        Ok(())
    }

    /// processing -> pending (retry) or failed.
    pub fn fail(
        &mut self,
        error: &str,
        retry: Retry,
        backoff_ms: i64,
        now: i64,
    ) -> Result<FailOutcome, ValidationError> {
        self.expect_status(OperationStatus::Processing, "fail")?;
        self.last_error = Some(error.to_string());
        self.claimed_at = None;

        if retry == Retry::Allowed && self.retry_count < self.max_retries {
            self.retry_count += 1;
            self.status = OperationStatus::Pending;
            self.available_at = now + backoff_delay(backoff_ms, self.retry_count);
            Ok(FailOutcome::Requeued {
                retry_count: self.retry_count,
                available_at: self.available_at,
            })
        } else {
            self.status = OperationStatus::Failed;
            self.processed_at = Some(now);
            Ok(FailOutcome::Failed)
        }
    }

    /// processing -> pending without consuming a retry.
    ///
    /// Used when a claim expires or a drain is cancelled.
    pub fn release(&mut self) -> Result<(), ValidationError> {
        self.expect_status(OperationStatus::Processing, "release")?;
        self.status = OperationStatus::Pending;
        self.claimed_at = None;
        Ok(())
    }

    fn expect_status(&self, expected: OperationStatus, action: &'static str) -> Result<(), ValidationError> {
        if self.status != expected {
            return Err(ValidationError::InvalidTransition {
                id: self.id,
                status: self.status,
                action,
            });
        }
        Ok(())
    }
}

/// Exponential backoff: `base * 2^(retry_count - 1)`, capped.
pub fn backoff_delay(base_ms: i64, retry_count: u32) -> i64 {
    if base_ms <= 0 || retry_count == 0 {
        return base_ms.max(0);
    }
    let shift = (retry_count - 1).min(20);
    base_ms.saturating_mul(1i64 << shift).min(MAX_BACKOFF_MS)
}

/// Pick the next operation a worker may claim.
///
/// An operation is ready when it is claimable and no earlier operation on
/// the same entity is still pending or processing. Among ready operations
/// the lowest `(priority, id)` wins. `ops` may be in any order.
pub fn next_ready<'a, I>(ops: I, now: i64) -> Option<OperationId>
where
    I: IntoIterator<Item = &'a OfflineOperation>,
{
    use std::collections::HashMap;

    let ops: Vec<&OfflineOperation> = ops.into_iter().collect();

    // Oldest live operation per entity gates everything after it.
    let mut head: HashMap<&EntityRef, OperationId> = HashMap::new();
    for op in ops.iter().filter(|op| !op.status.is_terminal()) {
        head.entry(&op.entity)
            .and_modify(|id| *id = (*id).min(op.id))
            .or_insert(op.id);
    }

    ops.iter()
        .filter(|op| op.is_claimable(now))
        .filter(|op| head.get(&op.entity) == Some(&op.id))
        .min_by_key(|op| op.claim_key())
        .map(|op| op.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ProductRecord;

    fn op(id: i64, entity: &str, priority: Priority) -> OfflineOperation {
        let new = NewOperation::update(
            EntityRef::new("product", entity),
            EntityData::from(ProductRecord::default().with_price(1.0)),
            ExpectedBase::Any,
        )
        .priority(priority);
        OfflineOperation::from_new(OperationId(id), new, 2, 0)
    }

    #[test]
    fn test_retry_then_terminal_failure() {
        let mut op = op(1, "42", Priority::Medium);

        for attempt in 1..=2 {
            op.claim(0).unwrap();
            let outcome = op.fail("timeout", Retry::Allowed, 0, 0).unwrap();
            assert_eq!(
                outcome,
                FailOutcome::Requeued {
                    retry_count: attempt,
                    available_at: 0
                }
            );
        }

        op.claim(0).unwrap();
        assert_eq!(op.fail("timeout", Retry::Allowed, 0, 0).unwrap(), FailOutcome::Failed);
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.retry_count, op.max_retries);
        assert!(op.claim(0).is_err());
    }

    #[test]
    fn test_never_retry_is_terminal_immediately() {
        let mut op = op(1, "42", Priority::Medium);
        op.claim(0).unwrap();
        assert_eq!(op.fail("conflict", Retry::Never, 0, 5).unwrap(), FailOutcome::Failed);
        assert_eq!(op.retry_count, 0);
        assert_eq!(op.last_error.as_deref(), Some("conflict"));
        assert_eq!(op.processed_at, Some(5));
    }

    #[test]
    fn test_complete_requires_claim() {
        let mut op = op(1, "42", Priority::Medium);
        assert!(matches!(
            op.complete(0),
            Err(ValidationError::InvalidTransition { action: "complete", .. })
        ));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        assert_eq!(backoff_delay(1000, 1), 1000);
        assert_eq!(backoff_delay(1000, 2), 2000);
        assert_eq!(backoff_delay(1000, 3), 4000);
        assert_eq!(backoff_delay(1000, 40), MAX_BACKOFF_MS);
        assert_eq!(backoff_delay(0, 3), 0);
    }

    #[test]
    fn test_next_ready_orders_by_priority_then_fifo() {
        let ops = vec![
            op(1, "a", Priority::Low),
            op(2, "b", Priority::High),
            op(3, "c", Priority::High),
        ];
        assert_eq!(next_ready(&ops, 0), Some(OperationId(2)));
    }

    #[test]
    fn test_next_ready_gates_same_entity() {
        let mut ops = vec![op(1, "a", Priority::Low), op(2, "a", Priority::High)];
        // The high priority update must wait behind the older one.
        assert_eq!(next_ready(&ops, 0), Some(OperationId(1)));

        ops[0].claim(0).unwrap();
        assert_eq!(next_ready(&ops, 0), None);

        ops[0].complete(1).unwrap();
        assert_eq!(next_ready(&ops, 1), Some(OperationId(2)));
    }

    #[test]
    fn test_next_ready_respects_backoff() {
        let mut ops = vec![op(1, "a", Priority::Medium)];
        ops[0].claim(0).unwrap();
        ops[0].fail("timeout", Retry::Allowed, 1000, 0).unwrap();
        assert_eq!(next_ready(&ops, 500), None);
        assert_eq!(next_ready(&ops, 1000), Some(OperationId(1)));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn retry_count_never_exceeds_max(
                max_retries in 0u32..6,
                retryable in prop::collection::vec(any::<bool>(), 1..20),
            ) {
                let mut op = op(1, "42", Priority::Medium);
                op.max_retries = max_retries;

                for allowed in retryable {
                    if op.status.is_terminal() {
                        prop_assert!(op.claim(0).is_err());
                        break;
                    }
                    op.claim(0).unwrap();
                    let retry = if allowed { Retry::Allowed } else { Retry::Never };
                    let outcome = op.fail("boom", retry, 0, 0).unwrap();
                    prop_assert!(op.retry_count <= op.max_retries);
                    if op.retry_count == op.max_retries && outcome == FailOutcome::Failed {
                        prop_assert_eq!(op.status, OperationStatus::Failed);
                    }
                }
            }
        }
    }
}
