use crate::error::Result;
use crate::models::{IdempotencyRecord, NewIdempotencyRecord, RecordState};
use async_trait::async_trait;
use std::time::Duration;

/// Result of inserting a new `pending` record.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(IdempotencyRecord),
    /// The `(key, scope)` uniqueness constraint rejected the insert.
    AlreadyExists,
}

/// Result of the conditional claim update.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The caller now holds the record exclusively.
    Claimed(IdempotencyRecord),
    /// Another caller won the claim; carries the live record.
    AlreadyProcessing(IdempotencyRecord),
    /// The record moved on (settled, released and re-versioned, or deleted).
    Stale,
}

/// Persistence contract for idempotency records.
///
/// Every mutation that grants exclusivity goes through a single conditional
/// update on `(id, version, state)`; implementations must make that update
/// atomic with respect to concurrent callers in other processes.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn get(&self, key: &str, scope: Option<&str>) -> Result<Option<IdempotencyRecord>>;

    /// Inserts a `pending` record expiring `ttl` from now.
    async fn create(&self, new: &NewIdempotencyRecord) -> Result<CreateOutcome>;

    /// Claims the record if its `version` is unchanged and it is `pending`,
    /// or `processing` with a lock that has lapsed by the store's clock.
    /// Bumps `version` and sets `locked_until`.
    async fn start_processing(
        &self,
        record: &IdempotencyRecord,
        lock_timeout: Duration,
    ) -> Result<ClaimOutcome>;

    /// Settles a held record with a response payload.
    async fn complete(
        &self,
        record: &IdempotencyRecord,
        response: serde_json::Value,
    ) -> Result<IdempotencyRecord>;

    /// Settles a held record with an error payload.
    async fn fail(
        &self,
        record: &IdempotencyRecord,
        error: serde_json::Value,
    ) -> Result<IdempotencyRecord>;

    /// Returns a held record to `pending`. A no-op that returns the live
    /// record when the caller's claim has been superseded.
    async fn release(&self, record: &IdempotencyRecord) -> Result<IdempotencyRecord>;

    /// Resets every `processing` record whose lock has lapsed.
    async fn recover_stale(&self) -> Result<u64>;

    /// Deletes every record past `expires_at`, whatever its state.
    async fn cleanup_expired(&self) -> Result<u64>;

    async fn count_by_state(&self, state: RecordState) -> Result<i64>;
}
