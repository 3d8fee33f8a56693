use crate::config::IdempotencySettings;
use crate::error::AppError;
use crate::idempotency::codec;
use crate::idempotency::recoverable::Recoverable;
use crate::idempotency::store::{ClaimOutcome, CreateOutcome, IdempotencyStore};
use crate::idempotency::telemetry::{MetricsTelemetry, TelemetryEvent, TelemetrySink};
use crate::models::{IdempotencyRecord, NewIdempotencyRecord, RecordState};
use crate::observability::{get_metrics, mask_sensitive, LatencyTimer};
use chrono::Utc;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Counters for coordinator activity.
#[derive(Debug, Default)]
pub struct IdempotencyMetrics {
    pub executions: AtomicU64,
    pub cache_hits: AtomicU64,
    pub claims: AtomicU64,
    pub contended: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub released: AtomicU64,
    pub wait_timeouts: AtomicU64,
}

impl IdempotencyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            executions: self.executions.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            claims: self.claims.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub executions: u64,
    pub cache_hits: u64,
    pub claims: u64,
    pub contended: u64,
    pub completed: u64,
    pub failed: u64,
    pub released: u64,
    pub wait_timeouts: u64,
}

impl MetricsSnapshot {
    pub fn cache_hit_rate(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.executions as f64
        }
    }
}

/// What to do when another caller holds the claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDuplicate {
    /// Return `InProgress` carrying the live record.
    #[default]
    Return,
    /// Poll until the record settles or the wait times out.
    Wait,
    /// Return `InProgress` without the record.
    Error,
}

/// Per-call options for [`IdempotencyCoordinator::execute`].
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub scope: Option<String>,
    pub ttl: Option<Duration>,
    pub on_duplicate: OnDuplicate,
    pub metadata: serde_json::Value,
    pub lock_timeout: Option<Duration>,
    pub wait_timeout: Option<Duration>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            scope: None,
            ttl: None,
            on_duplicate: OnDuplicate::default(),
            metadata: serde_json::Value::Object(Default::default()),
            lock_timeout: None,
            wait_timeout: None,
        }
    }
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn on_duplicate(mut self, policy: OnDuplicate) -> Self {
        self.on_duplicate = policy;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = Some(lock_timeout);
        self
    }

    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = Some(wait_timeout);
        self
    }
}

/// Caller-visible failures of [`IdempotencyCoordinator::execute`].
#[derive(Debug, Error)]
pub enum ExecuteError<E> {
    /// The operation's own error, fresh or replayed from the cache.
    #[error("operation failed: {0}")]
    Operation(E),

    /// Another caller holds the claim. The record is present for
    /// [`OnDuplicate::Return`] and absent for [`OnDuplicate::Error`].
    #[error("idempotent operation is already in progress")]
    InProgress { record: Option<Box<IdempotencyRecord>> },

    #[error("timed out waiting for idempotency key {key} (scope {scope:?}) to settle")]
    WaitTimeout { key: String, scope: Option<String> },

    /// The record vanished between a rejected insert and the re-read, or the
    /// dispatch loop kept losing races.
    #[error("idempotency conflict on key {key} (scope {scope:?})")]
    Conflict { key: String, scope: Option<String> },

    #[error(transparent)]
    Store(#[from] AppError),
}

impl<E> ExecuteError<E> {
    pub fn is_in_progress(&self) -> bool {
        matches!(self, ExecuteError::InProgress { .. })
    }

    /// Returns the operation's error, if that is what this is.
    pub fn into_operation(self) -> Option<E> {
        match self {
            ExecuteError::Operation(e) => Some(e),
            _ => None,
        }
    }
}

/// Coordinator tuning, usually built from [`IdempotencySettings`].
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub default_ttl: Duration,
    pub lock_timeout: Duration,
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
    pub max_dispatch_rounds: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from(&IdempotencySettings::default())
    }
}

impl From<&IdempotencySettings> for CoordinatorConfig {
    fn from(settings: &IdempotencySettings) -> Self {
        Self {
            default_ttl: Duration::from_secs(settings.default_ttl_secs),
            lock_timeout: Duration::from_secs(settings.lock_timeout_secs),
            wait_timeout: Duration::from_millis(settings.wait_timeout_ms),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            max_dispatch_rounds: settings.max_dispatch_rounds.max(1),
        }
    }
}

/// Runs side-effecting operations at most once per idempotency key.
///
/// The coordinator holds no in-process lock between calls; all exclusion
/// comes from the store's conditional claim update, so any number of
/// coordinators in any number of processes may share one store.
pub struct IdempotencyCoordinator {
    store: Arc<dyn IdempotencyStore>,
    config: CoordinatorConfig,
    telemetry: Arc<dyn TelemetrySink>,
    metrics: Arc<IdempotencyMetrics>,
}

/// Per-call state threaded through the dispatch loop.
struct Call<'a> {
    key: &'a str,
    scope: Option<&'a str>,
    opts: &'a ExecuteOptions,
    lock_timeout: Duration,
    wait_deadline: Option<Instant>,
}

impl IdempotencyCoordinator {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: CoordinatorConfig) -> Self {
        Self {
            store,
            config,
            telemetry: Arc::new(MetricsTelemetry),
            metrics: Arc::new(IdempotencyMetrics::new()),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn store(&self) -> Arc<dyn IdempotencyStore> {
        Arc::clone(&self.store)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<IdempotencyMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Runs `operation` at most once for `(key, opts.scope)`.
    ///
    /// A settled key replays its cached response or permanent error without
    /// invoking `operation`. A key held by another caller is handled per
    /// [`OnDuplicate`]. Transient errors (see [`Recoverable`]) release the
    /// claim so a later call runs `operation` again.
    pub async fn execute<T, E, F, Fut>(
        &self,
        key: &str,
        operation: F,
        opts: ExecuteOptions,
    ) -> Result<T, ExecuteError<E>>
    where
        T: Serialize + DeserializeOwned,
        E: Serialize + DeserializeOwned + Recoverable,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let timer = LatencyTimer::new();
        let mut call = Call {
            key,
            scope: opts.scope.as_deref(),
            opts: &opts,
            lock_timeout: opts.lock_timeout.unwrap_or(self.config.lock_timeout),
            wait_deadline: None,
        };

        IdempotencyMetrics::bump(&self.metrics.executions);
        self.emit(TelemetryEvent::ExecuteStart, &call);

        let result = self.dispatch(&mut call, operation).await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(ExecuteError::Operation(_)) => "error",
            Err(ExecuteError::InProgress { .. }) => "in_progress",
            Err(ExecuteError::WaitTimeout { .. }) => "wait_timeout",
            Err(ExecuteError::Conflict { .. }) => "conflict",
            Err(ExecuteError::Store(_)) => "store_error",
        };
        get_metrics().record_execute_latency(timer.elapsed_ms(), outcome);

        result
    }

    async fn dispatch<T, E, F, Fut>(&self, call: &mut Call<'_>, operation: F) -> Result<T, ExecuteError<E>>
    where
        T: Serialize + DeserializeOwned,
        E: Serialize + DeserializeOwned + Recoverable,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut operation = Some(operation);
        let mut current = self.store.get(call.key, call.scope).await?;

        for round in 0..self.config.max_dispatch_rounds {
            let record = match current.take() {
                Some(record) => record,
                None => match self.store.create(&self.new_record(call)).await? {
                    CreateOutcome::Created(record) => record,
                    CreateOutcome::AlreadyExists => {
                        // Lost the insert race; dispatch on whatever won.
                        match self.store.get(call.key, call.scope).await? {
                            Some(winner) => {
                                current = Some(winner);
                                continue;
                            }
                            None => return Err(self.conflict(call)),
                        }
                    }
                },
            };

            tracing::debug!(
                key = %mask_sensitive(call.key, 4),
                state = record.state.as_str(),
                version = record.version,
                round,
                "dispatching idempotency record"
            );

            match record.state {
                RecordState::Completed => return self.replay_response(call, &record),
                RecordState::Failed => return self.replay_error(call, &record),
                RecordState::Processing if !record.is_lock_expired_at(Utc::now()) => {
                    current = self.on_duplicate::<E>(call, record).await?;
                }
                // Pending, or processing with a lapsed lock by the local clock. The
                // store re-checks the lock against its own clock.
                _ => match self.store.start_processing(&record, call.lock_timeout).await? {
                    ClaimOutcome::Claimed(claimed) => {
                        let Some(operation) = operation.take() else {
                            return Err(ExecuteError::Store(AppError::Internal(anyhow::anyhow!(
                                "operation already consumed for record {}",
                                claimed.id
                            ))));
                        };
                        return self.run(call, claimed, operation).await;
                    }
                    ClaimOutcome::AlreadyProcessing(live) => {
                        current = self.on_duplicate::<E>(call, live).await?;
                    }
                    ClaimOutcome::Stale => {
                        current = self.store.get(call.key, call.scope).await?;
                    }
                },
            }
        }

        tracing::warn!(
            key = %mask_sensitive(call.key, 4),
            rounds = self.config.max_dispatch_rounds,
            "idempotency dispatch did not converge"
        );
        Err(self.conflict(call))
    }

    /// Applies the duplicate policy to a record held by someone else.
    /// `Ok(next)` means re-dispatch on `next` (`None`: the record is gone).
    async fn on_duplicate<E>(
        &self,
        call: &mut Call<'_>,
        live: IdempotencyRecord,
    ) -> Result<Option<IdempotencyRecord>, ExecuteError<E>> {
        IdempotencyMetrics::bump(&self.metrics.contended);
        self.emit(TelemetryEvent::InProgress, call);

        match call.opts.on_duplicate {
            OnDuplicate::Return => Err(ExecuteError::InProgress { record: Some(Box::new(live)) }),
            OnDuplicate::Error => Err(ExecuteError::InProgress { record: None }),
            OnDuplicate::Wait => self.await_settlement(call).await,
        }
    }

    /// Polls until the record settles, becomes claimable, or disappears.
    async fn await_settlement<E>(&self, call: &mut Call<'_>) -> Result<Option<IdempotencyRecord>, ExecuteError<E>> {
        let wait_timeout = call.opts.wait_timeout.unwrap_or(self.config.wait_timeout);
        let deadline = *call.wait_deadline.get_or_insert_with(|| Instant::now() + wait_timeout);

        loop {
            let now = Instant::now();
            if now >= deadline {
                IdempotencyMetrics::bump(&self.metrics.wait_timeouts);
                self.emit(TelemetryEvent::WaitTimeout, call);
                tracing::warn!(key = %mask_sensitive(call.key, 4), "gave up waiting for idempotency key");
                return Err(ExecuteError::WaitTimeout {
                    key: call.key.to_string(),
                    scope: call.scope.map(str::to_string),
                });
            }

            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;

            match self.store.get(call.key, call.scope).await? {
                None => return Ok(None),
                Some(record) if record.is_terminal() || record.is_claimable_at(Utc::now()) => {
                    return Ok(Some(record));
                }
                Some(_) => continue,
            }
        }
    }

    /// Invokes the operation under a held claim and settles the record.
    async fn run<T, E, F, Fut>(
        &self,
        call: &Call<'_>,
        claimed: IdempotencyRecord,
        operation: F,
    ) -> Result<T, ExecuteError<E>>
    where
        T: Serialize + DeserializeOwned,
        E: Serialize + DeserializeOwned + Recoverable,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        IdempotencyMetrics::bump(&self.metrics.claims);
        self.emit(TelemetryEvent::Claimed, call);

        let outcome = AssertUnwindSafe(async move { operation().await })
            .catch_unwind()
            .await;

        match outcome {
            Err(panic) => {
                self.release(call, &claimed).await;
                std::panic::resume_unwind(panic)
            }
            Ok(Ok(value)) => {
                match codec::encode_response(&value) {
                    Ok(payload) => match self.store.complete(&claimed, payload).await {
                        Ok(_) => {
                            IdempotencyMetrics::bump(&self.metrics.completed);
                            self.emit(TelemetryEvent::Completed, call);
                        }
                        Err(e) => {
                            tracing::error!(key = %mask_sensitive(call.key, 4), "Failed to mark idempotency record as completed: {}", e);
                        }
                    },
                    Err(e) => {
                        // Nothing replayable was produced; free the key like an uncacheable error.
                        tracing::error!(key = %mask_sensitive(call.key, 4), "Failed to encode idempotent response: {}", e);
                        self.release(call, &claimed).await;
                    }
                }
                Ok(value)
            }
            Ok(Err(err)) => {
                if err.is_retryable() {
                    self.release(call, &claimed).await;
                    return Err(ExecuteError::Operation(err));
                }

                match codec::encode_error(&err) {
                    Ok(payload) => match self.store.fail(&claimed, payload).await {
                        Ok(_) => {
                            IdempotencyMetrics::bump(&self.metrics.failed);
                            self.emit(TelemetryEvent::Failed, call);
                        }
                        Err(e) => {
                            tracing::error!(key = %mask_sensitive(call.key, 4), "Failed to mark idempotency record as failed: {}", e);
                        }
                    },
                    Err(e) => {
                        // An error we cannot cache must stay retryable.
                        tracing::error!(key = %mask_sensitive(call.key, 4), "Failed to encode idempotent error: {}", e);
                        self.release(call, &claimed).await;
                    }
                }
                Err(ExecuteError::Operation(err))
            }
        }
    }

    async fn release(&self, call: &Call<'_>, claimed: &IdempotencyRecord) {
        match self.store.release(claimed).await {
            Ok(_) => {
                IdempotencyMetrics::bump(&self.metrics.released);
                self.emit(TelemetryEvent::Released, call);
            }
            Err(e) => {
                tracing::error!(key = %mask_sensitive(call.key, 4), "Failed to release idempotency record: {}", e);
            }
        }
    }

    fn replay_response<T: DeserializeOwned, E>(
        &self,
        call: &Call<'_>,
        record: &IdempotencyRecord,
    ) -> Result<T, ExecuteError<E>> {
        let stored = record.response.as_ref().ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!("Completed idempotency record {} has no response", record.id))
        })?;
        let value = codec::decode_response(stored)?;
        self.cache_hit(call);
        Ok(value)
    }

    fn replay_error<T, E: DeserializeOwned>(
        &self,
        call: &Call<'_>,
        record: &IdempotencyRecord,
    ) -> Result<T, ExecuteError<E>> {
        let stored = record.error.as_ref().ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!("Failed idempotency record {} has no error", record.id))
        })?;
        let err = codec::decode_error(stored)?;
        self.cache_hit(call);
        Err(ExecuteError::Operation(err))
    }

    fn cache_hit(&self, call: &Call<'_>) {
        IdempotencyMetrics::bump(&self.metrics.cache_hits);
        self.emit(TelemetryEvent::CacheHit, call);
    }

    fn new_record(&self, call: &Call<'_>) -> NewIdempotencyRecord {
        NewIdempotencyRecord::new(call.key, call.opts.ttl.unwrap_or(self.config.default_ttl))
            .with_scope(call.opts.scope.clone())
            .with_metadata(call.opts.metadata.clone())
    }

    fn conflict<E>(&self, call: &Call<'_>) -> ExecuteError<E> {
        ExecuteError::Conflict {
            key: call.key.to_string(),
            scope: call.scope.map(str::to_string),
        }
    }

    fn emit(&self, event: TelemetryEvent, call: &Call<'_>) {
        self.telemetry.emit(event, call.key, call.scope);
    }
}
