use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::idempotency::store::{ClaimOutcome, CreateOutcome, IdempotencyStore};
use crate::models::{IdempotencyRecord, NewIdempotencyRecord, RecordState, RecordStateMachine};

/// `(key, scope)` slot; `None` scope maps to the reserved empty string.
type Slot = (String, String);

fn slot(key: &str, scope: Option<&str>) -> Slot {
    (key.to_string(), scope.unwrap_or_default().to_string())
}

/// In-process store with the same claim semantics as the Postgres store.
///
/// Every operation runs under one mutex, which stands in for the row-level
/// atomicity of the conditional update.
#[derive(Clone, Default)]
pub struct InMemoryIdempotencyStore {
    data: Arc<Mutex<HashMap<Slot, IdempotencyRecord>>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.data.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.lock().await.is_empty()
    }

    fn held<'a>(
        map: &'a mut HashMap<Slot, IdempotencyRecord>,
        record: &IdempotencyRecord,
    ) -> Result<&'a mut IdempotencyRecord> {
        map.get_mut(&slot(&record.key, record.scope.as_deref()))
            .filter(|live| live.id == record.id)
            .ok_or_else(|| AppError::NotFound(format!("idempotency record {}", record.id)))
    }

    fn settle(
        &self,
        map: &mut HashMap<Slot, IdempotencyRecord>,
        record: &IdempotencyRecord,
        to: RecordState,
        payload: serde_json::Value,
    ) -> Result<IdempotencyRecord> {
        let live = Self::held(map, record)?;
        RecordStateMachine::transition(live.state, to)?;

        let now = Utc::now();
        live.state = to;
        match to {
            RecordState::Completed => live.response = Some(payload),
            _ => live.error = Some(payload),
        }
        live.completed_at = Some(now);
        live.locked_until = None;
        live.updated_at = now;
        Ok(live.clone())
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, key: &str, scope: Option<&str>) -> Result<Option<IdempotencyRecord>> {
        let map = self.data.lock().await;
        Ok(map.get(&slot(key, scope)).cloned())
    }

    async fn create(&self, new: &NewIdempotencyRecord) -> Result<CreateOutcome> {
        new.ensure_valid()?;
        let mut map = self.data.lock().await;

        let slot = slot(&new.key, new.scope.as_deref());
        if map.contains_key(&slot) {
            return Ok(CreateOutcome::AlreadyExists);
        }

        let record = IdempotencyRecord::pending(new, Utc::now())?;
        map.insert(slot, record.clone());
        Ok(CreateOutcome::Created(record))
    }

    async fn start_processing(
        &self,
        record: &IdempotencyRecord,
        lock_timeout: Duration,
    ) -> Result<ClaimOutcome> {
        let lock_timeout = chrono::Duration::from_std(lock_timeout)
            .map_err(|e| AppError::Validation(format!("lock timeout out of range: {}", e)))?;
        let mut map = self.data.lock().await;

        let Some(live) = map.get_mut(&slot(&record.key, record.scope.as_deref())) else {
            return Ok(ClaimOutcome::Stale);
        };

        let now = Utc::now();
        if live.id == record.id && live.version == record.version && live.is_claimable_at(now) {
            live.state = RecordStateMachine::transition(live.state, RecordState::Processing)?;
            live.version += 1;
            live.started_at = Some(now);
            live.locked_until = Some(now + lock_timeout);
            live.updated_at = now;
            return Ok(ClaimOutcome::Claimed(live.clone()));
        }

        if live.state == RecordState::Processing {
            Ok(ClaimOutcome::AlreadyProcessing(live.clone()))
        } else {
            Ok(ClaimOutcome::Stale)
        }
    }

    async fn complete(
        &self,
        record: &IdempotencyRecord,
        response: serde_json::Value,
    ) -> Result<IdempotencyRecord> {
        let mut map = self.data.lock().await;
        self.settle(&mut map, record, RecordState::Completed, response)
    }

    async fn fail(
        &self,
        record: &IdempotencyRecord,
        error: serde_json::Value,
    ) -> Result<IdempotencyRecord> {
        let mut map = self.data.lock().await;
        self.settle(&mut map, record, RecordState::Failed, error)
    }

    async fn release(&self, record: &IdempotencyRecord) -> Result<IdempotencyRecord> {
        let mut map = self.data.lock().await;
        let live = Self::held(&mut map, record)?;

        if live.version == record.version && live.state == RecordState::Processing {
            live.state = RecordState::Pending;
            live.locked_until = None;
            live.started_at = None;
            live.updated_at = Utc::now();
        }
        Ok(live.clone())
    }

    async fn recover_stale(&self) -> Result<u64> {
        let mut map = self.data.lock().await;
        let now = Utc::now();
        let mut count = 0;

        for record in map.values_mut() {
            if record.state == RecordState::Processing && record.locked_until.map_or(false, |until| until < now) {
                record.state = RecordState::Pending;
                record.locked_until = None;
                record.started_at = None;
                record.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        let mut map = self.data.lock().await;
        let now = Utc::now();
        let before = map.len();
        map.retain(|_, record| !record.is_expired_at(now));
        Ok((before - map.len()) as u64)
    }

    async fn count_by_state(&self, state: RecordState) -> Result<i64> {
        let map = self.data.lock().await;
        Ok(map.values().filter(|r| r.state == state).count() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(key: &str) -> NewIdempotencyRecord {
        NewIdempotencyRecord::new(key, Duration::from_secs(60))
    }

    async fn created(store: &InMemoryIdempotencyStore, key: &str) -> IdempotencyRecord {
        match store.create(&request(key)).await.unwrap() {
            CreateOutcome::Created(record) => record,
            CreateOutcome::AlreadyExists => panic!("expected a fresh record"),
        }
    }

    #[tokio::test]
    async fn test_create_and_duplicate() {
        let store = InMemoryIdempotencyStore::new();
        let record = created(&store, "k1").await;
        assert_eq!(record.state, RecordState::Pending);

        let again = store.create(&request("k1")).await.unwrap();
        assert_eq!(again, CreateOutcome::AlreadyExists);

        // Same key, different scope is a different slot.
        let scoped = store
            .create(&request("k1").with_scope(Some("stripe".into())))
            .await
            .unwrap();
        assert!(matches!(scoped, CreateOutcome::Created(_)));
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_request() {
        let store = InMemoryIdempotencyStore::new();
        let result = store.create(&request("")).await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn test_claim_is_single_winner() {
        let store = InMemoryIdempotencyStore::new();
        let record = created(&store, "k1").await;

        let first = store.start_processing(&record, Duration::from_secs(30)).await.unwrap();
        let claimed = match first {
            ClaimOutcome::Claimed(claimed) => claimed,
            other => panic!("expected claim, got {:?}", other),
        };
        assert_eq!(claimed.version, 1);
        assert!(claimed.locked_until.is_some());
        assert!(claimed.check_invariants().is_ok());

        // A second caller holding the old version loses.
        let second = store.start_processing(&record, Duration::from_secs(30)).await.unwrap();
        assert!(matches!(second, ClaimOutcome::AlreadyProcessing(live) if live.version == 1));
    }

    #[tokio::test]
    async fn test_live_lock_is_not_taken_over() {
        let store = InMemoryIdempotencyStore::new();
        let record = created(&store, "k1").await;
        let ClaimOutcome::Claimed(claimed) = store.start_processing(&record, Duration::from_secs(60)).await.unwrap() else {
            panic!("expected claim");
        };

        // Even the current version cannot claim while the lock is held.
        let outcome = store.start_processing(&claimed, Duration::from_secs(60)).await.unwrap();
        assert!(matches!(outcome, ClaimOutcome::AlreadyProcessing(live) if live.version == claimed.version));
    }

    #[tokio::test]
    async fn test_claim_after_settlement_is_stale() {
        let store = InMemoryIdempotencyStore::new();
        let record = created(&store, "k1").await;
        let ClaimOutcome::Claimed(claimed) = store.start_processing(&record, Duration::from_secs(30)).await.unwrap() else {
            panic!("expected claim");
        };
        store.complete(&claimed, json!({"ok": 1})).await.unwrap();

        let outcome = store.start_processing(&claimed, Duration::from_secs(30)).await.unwrap();
        assert_eq!(outcome, ClaimOutcome::Stale);
    }

    #[tokio::test]
    async fn test_settled_record_cannot_be_overwritten() {
        let store = InMemoryIdempotencyStore::new();
        let record = created(&store, "k1").await;
        let ClaimOutcome::Claimed(claimed) = store.start_processing(&record, Duration::from_secs(30)).await.unwrap() else {
            panic!("expected claim");
        };

        let done = store.complete(&claimed, json!("first")).await.unwrap();
        assert_eq!(done.state, RecordState::Completed);
        assert!(done.locked_until.is_none());
        assert!(done.check_invariants().is_ok());

        assert!(store.fail(&claimed, json!("second")).await.is_err());
    }

    #[tokio::test]
    async fn test_release_respects_version() {
        let store = InMemoryIdempotencyStore::new();
        let record = created(&store, "k1").await;
        let ClaimOutcome::Claimed(claimed) = store.start_processing(&record, Duration::ZERO).await.unwrap() else {
            panic!("expected claim");
        };

        // The lapsed claim is taken over by a newer holder.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let ClaimOutcome::Claimed(takeover) = store.start_processing(&claimed, Duration::from_secs(30)).await.unwrap() else {
            panic!("expected takeover");
        };
        assert_eq!(takeover.version, 2);

        // The superseded holder cannot release the newer claim.
        let live = store.release(&claimed).await.unwrap();
        assert_eq!(live.state, RecordState::Processing);
        assert_eq!(live.version, 2);

        let released = store.release(&takeover).await.unwrap();
        assert_eq!(released.state, RecordState::Pending);
        assert!(released.locked_until.is_none());
        assert!(released.started_at.is_none());
    }

    #[tokio::test]
    async fn test_recover_stale_and_cleanup() {
        let store = InMemoryIdempotencyStore::new();
        let stale = created(&store, "stale").await;
        let fresh = created(&store, "fresh").await;
        store.start_processing(&stale, Duration::ZERO).await.unwrap();
        store.start_processing(&fresh, Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(store.recover_stale().await.unwrap(), 1);
        assert_eq!(store.count_by_state(RecordState::Pending).await.unwrap(), 1);
        assert_eq!(store.count_by_state(RecordState::Processing).await.unwrap(), 1);

        store
            .create(&NewIdempotencyRecord::new("short", Duration::from_millis(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.cleanup_expired().await.unwrap(), 1);
        assert_eq!(store.len().await, 2);
    }
}
