use crate::error::{AppError, Result, UNIQUE_VIOLATION};
use crate::idempotency::store::{ClaimOutcome, CreateOutcome, IdempotencyStore};
use crate::models::{IdempotencyRecord, NewIdempotencyRecord, RecordState, RecordStateMachine};
use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

/// PostgreSQL-backed idempotency store.
///
/// Lock deadlines and expiry use the database clock (`NOW()`), so every
/// coordinating process compares against the same time source.
#[derive(Clone)]
pub struct PostgresIdempotencyStore {
    pool: PgPool,
}

impl PostgresIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Finds a record by its primary key.
    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<IdempotencyRecord>> {
        let record = sqlx::query_as::<_, IdempotencyRecord>(
            r#"
            SELECT id, key, scope, state, version, response, error, metadata, started_at, completed_at, locked_until, expires_at, inserted_at, updated_at
            FROM idempotency_records
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(record)
    }

    async fn settle(
        &self,
        record: &IdempotencyRecord,
        to: RecordState,
        payload: serde_json::Value,
    ) -> Result<IdempotencyRecord> {
        let (response, error) = match to {
            RecordState::Completed => (Some(payload), None),
            _ => (None, Some(payload)),
        };

        let settled = sqlx::query_as::<_, IdempotencyRecord>(
            r#"
            UPDATE idempotency_records
            SET state = $2, response = $3, error = $4, completed_at = NOW(), locked_until = NULL, updated_at = NOW()
            WHERE id = $1 AND state IN ('pending', 'processing')
            RETURNING id, key, scope, state, version, response, error, metadata, started_at, completed_at, locked_until, expires_at, inserted_at, updated_at
            "#,
        )
        .bind(record.id)
        .bind(to)
        .bind(response)
        .bind(error)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        match settled {
            Some(settled) => Ok(settled),
            None => match self.find_by_id(record.id).await? {
                // Already settled: report the illegal transition.
                Some(live) => {
                    RecordStateMachine::transition(live.state, to)?;
                    Ok(live)
                }
                None => Err(AppError::NotFound(format!("idempotency record {}", record.id))),
            },
        }
    }
}

fn millis(duration: Duration, what: &str) -> Result<i64> {
    i64::try_from(duration.as_millis())
        .map_err(|_| AppError::Validation(format!("{} out of range", what)))
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    async fn get(&self, key: &str, scope: Option<&str>) -> Result<Option<IdempotencyRecord>> {
        // Matches the (key, COALESCE(scope, '')) unique index.
        let record = sqlx::query_as::<_, IdempotencyRecord>(
            r#"
            SELECT id, key, scope, state, version, response, error, metadata, started_at, completed_at, locked_until, expires_at, inserted_at, updated_at
            FROM idempotency_records
            WHERE key = $1 AND COALESCE(scope, '') = COALESCE($2::VARCHAR, '')
            "#,
        )
        .bind(key)
        .bind(scope)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(record)
    }

    async fn create(&self, new: &NewIdempotencyRecord) -> Result<CreateOutcome> {
        new.ensure_valid()?;
        let ttl_ms = millis(new.ttl, "ttl")?;

        let inserted = sqlx::query_as::<_, IdempotencyRecord>(
            r#"
            INSERT INTO idempotency_records (id, key, scope, state, version, metadata, expires_at, inserted_at, updated_at)
            VALUES ($1, $2, $3, 'pending', 0, $4, NOW() + ($5::BIGINT * INTERVAL '1 millisecond'), NOW(), NOW())
            RETURNING id, key, scope, state, version, response, error, metadata, started_at, completed_at, locked_until, expires_at, inserted_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.key)
        .bind(&new.scope)
        .bind(&new.metadata)
        .bind(ttl_ms)
        .fetch_one(&self.pool)
        .await;

        match inserted {
            Ok(record) => Ok(CreateOutcome::Created(record)),
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                Ok(CreateOutcome::AlreadyExists)
            }
            Err(e) => Err(AppError::Database(e)),
        }
    }

    async fn start_processing(
        &self,
        record: &IdempotencyRecord,
        lock_timeout: Duration,
    ) -> Result<ClaimOutcome> {
        let lock_ms = millis(lock_timeout, "lock timeout")?;

        // A live lock is only taken over once it has lapsed by the database clock.
        let claimed = sqlx::query_as::<_, IdempotencyRecord>(
            r#"
            UPDATE idempotency_records
            SET state = 'processing',
                version = version + 1,
                started_at = NOW(),
                locked_until = NOW() + ($3::BIGINT * INTERVAL '1 millisecond'),
                updated_at = NOW()
            WHERE id = $1 AND version = $2
              AND (state = 'pending' OR (state = 'processing' AND (locked_until IS NULL OR locked_until < NOW())))
            RETURNING id, key, scope, state, version, response, error, metadata, started_at, completed_at, locked_until, expires_at, inserted_at, updated_at
            "#,
        )
        .bind(record.id)
        .bind(record.version)
        .bind(lock_ms)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        if let Some(claimed) = claimed {
            return Ok(ClaimOutcome::Claimed(claimed));
        }

        match self.find_by_id(record.id).await? {
            Some(live) if live.state == RecordState::Processing => Ok(ClaimOutcome::AlreadyProcessing(live)),
            _ => Ok(ClaimOutcome::Stale),
        }
    }

    async fn complete(
        &self,
        record: &IdempotencyRecord,
        response: serde_json::Value,
    ) -> Result<IdempotencyRecord> {
        self.settle(record, RecordState::Completed, response).await
    }

    async fn fail(
        &self,
        record: &IdempotencyRecord,
        error: serde_json::Value,
    ) -> Result<IdempotencyRecord> {
        self.settle(record, RecordState::Failed, error).await
    }

    async fn release(&self, record: &IdempotencyRecord) -> Result<IdempotencyRecord> {
        let released = sqlx::query_as::<_, IdempotencyRecord>(
            r#"
            UPDATE idempotency_records
            SET state = 'pending', locked_until = NULL, started_at = NULL, updated_at = NOW()
            WHERE id = $1 AND version = $2 AND state = 'processing'
            RETURNING id, key, scope, state, version, response, error, metadata, started_at, completed_at, locked_until, expires_at, inserted_at, updated_at
            "#,
        )
        .bind(record.id)
        .bind(record.version)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        match released {
            Some(released) => Ok(released),
            None => self
                .find_by_id(record.id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("idempotency record {}", record.id))),
        }
    }

    async fn recover_stale(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE idempotency_records
            SET state = 'pending', locked_until = NULL, started_at = NULL, updated_at = NOW()
            WHERE state = 'processing' AND locked_until < NOW()
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM idempotency_records
            WHERE expires_at < NOW()
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }

    async fn count_by_state(&self, state: RecordState) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM idempotency_records WHERE state = $1
            "#,
        )
        .bind(state)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row.0)
    }
}
