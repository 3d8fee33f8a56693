use crate::error::Result;
use crate::idempotency::store::IdempotencyStore;
use crate::models::RecordState;
use crate::observability::{get_metrics, LatencyTimer};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Counts from one maintenance sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    /// Abandoned claims reset to `pending`.
    pub recovered: u64,
    /// Expired records deleted.
    pub deleted: u64,
}

/// Periodic sweep that recovers abandoned claims and deletes expired records.
pub struct MaintenanceJob {
    store: Arc<dyn IdempotencyStore>,
    interval: Duration,
}

impl MaintenanceJob {
    pub fn new(store: Arc<dyn IdempotencyStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs one sweep. Recovery runs before cleanup so an expired abandoned
    /// claim is counted once, as deleted.
    pub async fn run_once(&self) -> Result<MaintenanceReport> {
        let timer = LatencyTimer::new();
        let metrics = get_metrics();

        let recovered = self.store.recover_stale().await?;
        let deleted = self.store.cleanup_expired().await?;

        metrics.record_stale_recovered(recovered);
        metrics.record_expired_deleted(deleted);

        for state in [
            RecordState::Pending,
            RecordState::Processing,
            RecordState::Completed,
            RecordState::Failed,
        ] {
            let count = self.store.count_by_state(state).await?;
            metrics.set_records_by_state(state.as_str(), count);
        }

        metrics.record_maintenance_latency(timer.elapsed_ms());

        if recovered > 0 {
            tracing::info!("Recovered {} abandoned idempotency claims", recovered);
        }
        if deleted > 0 {
            tracing::info!("Cleaned up {} expired idempotency records", deleted);
        }

        Ok(MaintenanceReport { recovered, deleted })
    }

    /// Starts the sweep in a background task.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;

                if let Err(e) = self.run_once().await {
                    tracing::error!("Idempotency maintenance sweep failed: {}", e);
                }
            }
        })
    }
}
