mod common;

use idempotency_engine::idempotency::{
    ClaimOutcome, CoordinatorConfig, CreateOutcome, ExecuteError, ExecuteOptions,
    IdempotencyCoordinator, IdempotencyStore, OnDuplicate, Recoverable,
};
use idempotency_engine::models::{IdempotencyRecord, NewIdempotencyRecord, RecordState};
use idempotency_engine::repositories::PostgresIdempotencyStore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
struct Unavailable;

impl Recoverable for Unavailable {}

fn unique_key(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

async fn create(store: &PostgresIdempotencyStore, new: &NewIdempotencyRecord) -> IdempotencyRecord {
    match store.create(new).await.expect("Failed to create record") {
        CreateOutcome::Created(record) => record,
        CreateOutcome::AlreadyExists => panic!("Expected a fresh record for {}", new.key),
    }
}

async fn claim(store: &PostgresIdempotencyStore, record: &IdempotencyRecord, lock: Duration) -> IdempotencyRecord {
    match store.start_processing(record, lock).await.expect("Failed to claim") {
        ClaimOutcome::Claimed(claimed) => claimed,
        other => panic!("Expected a claim, got {:?}", other),
    }
}

#[tokio::test]
async fn test_postgres_create_and_get() {
    let Some(pool) = common::setup_test_db().await else { return };
    let store = PostgresIdempotencyStore::new(pool.clone());
    let key = unique_key("pg-create");

    let new = NewIdempotencyRecord::new(&key, Duration::from_secs(60))
        .with_scope(Some("stripe".to_string()))
        .with_metadata(json!({ "tenant": "acme" }));
    let record = create(&store, &new).await;

    assert_eq!(record.state, RecordState::Pending);
    assert_eq!(record.version, 0);
    assert!(record.expires_at > record.inserted_at);
    assert!(record.check_invariants().is_ok());

    let found = store.get(&key, Some("stripe")).await.unwrap().expect("record not found");
    assert_eq!(found.id, record.id);
    assert_eq!(found.metadata, json!({ "tenant": "acme" }));
    assert!(store.get(&key, None).await.unwrap().is_none());

    assert_eq!(store.create(&new).await.unwrap(), CreateOutcome::AlreadyExists);

    common::cleanup_records(&pool, "pg-create").await;
}

#[tokio::test]
async fn test_postgres_null_scope_is_unique() {
    let Some(pool) = common::setup_test_db().await else { return };
    let store = PostgresIdempotencyStore::new(pool.clone());
    let key = unique_key("pg-null-scope");

    let new = NewIdempotencyRecord::new(&key, Duration::from_secs(60));
    create(&store, &new).await;
    assert_eq!(store.create(&new).await.unwrap(), CreateOutcome::AlreadyExists);

    common::cleanup_records(&pool, "pg-null-scope").await;
}

#[tokio::test]
async fn test_postgres_claim_is_single_winner() {
    let Some(pool) = common::setup_test_db().await else { return };
    let store = PostgresIdempotencyStore::new(pool.clone());
    let key = unique_key("pg-claim");

    let record = create(&store, &NewIdempotencyRecord::new(&key, Duration::from_secs(60))).await;
    let claimed = claim(&store, &record, Duration::from_secs(30)).await;

    assert_eq!(claimed.state, RecordState::Processing);
    assert_eq!(claimed.version, record.version + 1);
    assert!(claimed.locked_until.is_some());
    assert!(claimed.started_at.is_some());

    // Same stale snapshot loses.
    match store.start_processing(&record, Duration::from_secs(30)).await.unwrap() {
        ClaimOutcome::AlreadyProcessing(live) => assert_eq!(live.version, claimed.version),
        other => panic!("Expected AlreadyProcessing, got {:?}", other),
    }

    let completed = store.complete(&claimed, json!({ "v": 1, "kind": "response", "body": 1 })).await.unwrap();
    assert_eq!(completed.state, RecordState::Completed);
    assert!(completed.locked_until.is_none());
    assert!(completed.check_invariants().is_ok());

    assert_eq!(
        store.start_processing(&claimed, Duration::from_secs(30)).await.unwrap(),
        ClaimOutcome::Stale
    );

    common::cleanup_records(&pool, "pg-claim").await;
}

#[tokio::test]
async fn test_postgres_live_lock_is_not_taken_over() {
    let Some(pool) = common::setup_test_db().await else { return };
    let store = PostgresIdempotencyStore::new(pool.clone());
    let key = unique_key("pg-live-lock");

    let record = create(&store, &NewIdempotencyRecord::new(&key, Duration::from_secs(60))).await;
    let claimed = claim(&store, &record, Duration::from_secs(60)).await;

    // The current version still loses while the lock is live by the database clock.
    match store.start_processing(&claimed, Duration::from_secs(60)).await.unwrap() {
        ClaimOutcome::AlreadyProcessing(live) => assert_eq!(live.version, claimed.version),
        other => panic!("Expected AlreadyProcessing, got {:?}", other),
    }

    common::cleanup_records(&pool, "pg-live-lock").await;
}

#[tokio::test]
async fn test_postgres_settled_record_is_not_overwritten() {
    let Some(pool) = common::setup_test_db().await else { return };
    let store = PostgresIdempotencyStore::new(pool.clone());
    let key = unique_key("pg-settled");

    let record = create(&store, &NewIdempotencyRecord::new(&key, Duration::from_secs(60))).await;
    let claimed = claim(&store, &record, Duration::from_secs(30)).await;
    store.fail(&claimed, json!({ "v": 1, "kind": "error", "body": "declined" })).await.unwrap();

    assert!(store.complete(&claimed, json!({ "v": 1, "kind": "response", "body": 1 })).await.is_err());
    let live = store.get(&key, None).await.unwrap().unwrap();
    assert_eq!(live.state, RecordState::Failed);
    assert!(live.response.is_none());

    common::cleanup_records(&pool, "pg-settled").await;
}

#[tokio::test]
async fn test_postgres_release_respects_version() {
    let Some(pool) = common::setup_test_db().await else { return };
    let store = PostgresIdempotencyStore::new(pool.clone());
    let key = unique_key("pg-release");

    let record = create(&store, &NewIdempotencyRecord::new(&key, Duration::from_secs(60))).await;
    let first = claim(&store, &record, Duration::ZERO).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    // A second holder takes over the lapsed claim.
    let second = claim(&store, &first, Duration::from_secs(30)).await;

    let after_stale_release = store.release(&first).await.unwrap();
    assert_eq!(after_stale_release.state, RecordState::Processing);
    assert_eq!(after_stale_release.version, second.version);

    let released = store.release(&second).await.unwrap();
    assert_eq!(released.state, RecordState::Pending);
    assert!(released.locked_until.is_none());
    assert!(released.check_invariants().is_ok());

    common::cleanup_records(&pool, "pg-release").await;
}

#[tokio::test]
async fn test_postgres_recover_stale() {
    let Some(pool) = common::setup_test_db().await else { return };
    let store = PostgresIdempotencyStore::new(pool.clone());

    let lapsed_key = unique_key("pg-stale");
    let live_key = unique_key("pg-stale");
    let lapsed = create(&store, &NewIdempotencyRecord::new(&lapsed_key, Duration::from_secs(60))).await;
    let live = create(&store, &NewIdempotencyRecord::new(&live_key, Duration::from_secs(60))).await;
    claim(&store, &lapsed, Duration::ZERO).await;
    claim(&store, &live, Duration::from_secs(60)).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(store.recover_stale().await.unwrap() >= 1);
    assert_eq!(store.get(&lapsed_key, None).await.unwrap().unwrap().state, RecordState::Pending);
    assert_eq!(store.get(&live_key, None).await.unwrap().unwrap().state, RecordState::Processing);

    common::cleanup_records(&pool, "pg-stale").await;
}

#[tokio::test]
async fn test_postgres_cleanup_expired() {
    let Some(pool) = common::setup_test_db().await else { return };
    let store = PostgresIdempotencyStore::new(pool.clone());

    let expired_key = unique_key("pg-expiry");
    let completed_key = unique_key("pg-expiry");
    let fresh_key = unique_key("pg-expiry");

    create(&store, &NewIdempotencyRecord::new(&expired_key, Duration::from_millis(1))).await;
    let done = create(&store, &NewIdempotencyRecord::new(&completed_key, Duration::from_millis(1))).await;
    let done = claim(&store, &done, Duration::from_secs(30)).await;
    store.complete(&done, json!({ "v": 1, "kind": "response", "body": null })).await.unwrap();
    create(&store, &NewIdempotencyRecord::new(&fresh_key, Duration::from_secs(60))).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(store.cleanup_expired().await.unwrap() >= 2);
    assert!(store.get(&expired_key, None).await.unwrap().is_none());
    assert!(store.get(&completed_key, None).await.unwrap().is_none());
    assert!(store.get(&fresh_key, None).await.unwrap().is_some());

    common::cleanup_records(&pool, "pg-expiry").await;
}

#[tokio::test]
async fn test_postgres_count_by_state() {
    let Some(pool) = common::setup_test_db().await else { return };
    let store = PostgresIdempotencyStore::new(pool.clone());

    let before = store.count_by_state(RecordState::Pending).await.unwrap();
    create(&store, &NewIdempotencyRecord::new(unique_key("pg-count"), Duration::from_secs(60))).await;
    let after = store.count_by_state(RecordState::Pending).await.unwrap();
    assert!(after >= before + 1);

    common::cleanup_records(&pool, "pg-count").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_postgres_coordinators_execute_once() {
    let Some(pool) = common::setup_test_db().await else { return };
    let key = unique_key("pg-coord");
    let calls = Arc::new(AtomicUsize::new(0));

    let config = CoordinatorConfig {
        poll_interval: Duration::from_millis(20),
        ..CoordinatorConfig::default()
    };

    let mut handles = Vec::new();
    for _ in 0..8 {
        // Separate store and coordinator per task, sharing only the database.
        let store: Arc<dyn IdempotencyStore> = Arc::new(PostgresIdempotencyStore::new(pool.clone()));
        let coordinator = IdempotencyCoordinator::new(store, config.clone());
        let calls = calls.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            coordinator
                .execute(
                    &key,
                    move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, Unavailable>(json!({ "id": "ch_pg" }))
                    },
                    ExecuteOptions::new().on_duplicate(OnDuplicate::Wait),
                )
                .await
        }));
    }

    for handle in handles {
        let result: Result<serde_json::Value, ExecuteError<Unavailable>> = handle.await.unwrap();
        assert_eq!(result.unwrap(), json!({ "id": "ch_pg" }));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    common::cleanup_records(&pool, "pg-coord").await;
}
