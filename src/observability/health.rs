use crate::idempotency::IdempotencyStore;
use crate::models::RecordState;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

/// Health status of a service or dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, HealthStatus::Degraded)
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy)
    }
}

/// Health status of a single dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyHealth {
    pub name: String,
    pub status: HealthStatus,
    pub latency_ms: Option<f64>,
    pub message: Option<String>,
}

impl DependencyHealth {
    pub fn healthy(name: impl Into<String>, latency_ms: f64) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            latency_ms: Some(latency_ms),
            message: None,
        }
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            latency_ms: None,
            message: Some(message.into()),
        }
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            latency_ms: None,
            message: Some(message.into()),
        }
    }
}

/// Aggregated health check result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedHealth {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: Vec<DependencyHealth>,
}

impl AggregatedHealth {
    pub fn new(version: String, uptime_seconds: u64, dependencies: Vec<DependencyHealth>) -> Self {
        let status = Self::aggregate_status(&dependencies);
        Self {
            status,
            version,
            uptime_seconds,
            dependencies,
        }
    }

    fn aggregate_status(dependencies: &[DependencyHealth]) -> HealthStatus {
        if dependencies.iter().any(|d| d.status.is_unhealthy()) {
            HealthStatus::Unhealthy
        } else if dependencies.iter().any(|d| d.status.is_degraded()) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Health checker for the sweeper's dependencies.
pub struct HealthChecker {
    pool: PgPool,
    store: Arc<dyn IdempotencyStore>,
    /// Processing records above this count mark the service degraded.
    processing_backlog_threshold: i64,
    start_time: std::time::Instant,
}

impl HealthChecker {
    pub fn new(pool: PgPool, store: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            pool,
            store,
            processing_backlog_threshold: 10_000,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn with_processing_backlog_threshold(mut self, threshold: i64) -> Self {
        self.processing_backlog_threshold = threshold;
        self
    }

    /// Performs a full health check of all dependencies.
    pub async fn check_all(&self) -> AggregatedHealth {
        let dependencies = vec![self.check_database().await, self.check_claims().await];

        AggregatedHealth::new(
            env!("CARGO_PKG_VERSION").to_string(),
            self.start_time.elapsed().as_secs(),
            dependencies,
        )
    }

    /// Checks database connectivity.
    pub async fn check_database(&self) -> DependencyHealth {
        let start = std::time::Instant::now();

        match tokio::time::timeout(
            Duration::from_secs(5),
            sqlx::query("SELECT 1").fetch_one(&self.pool),
        )
        .await
        {
            Ok(Ok(_)) => {
                let latency = start.elapsed().as_secs_f64() * 1000.0;
                if latency > 100.0 {
                    DependencyHealth {
                        name: "database".to_string(),
                        status: HealthStatus::Degraded,
                        latency_ms: Some(latency),
                        message: Some("High latency detected".to_string()),
                    }
                } else {
                    DependencyHealth::healthy("database", latency)
                }
            }
            Ok(Err(e)) => DependencyHealth::unhealthy("database", format!("Query failed: {}", e)),
            Err(_) => DependencyHealth::unhealthy("database", "Connection timeout"),
        }
    }

    /// Reports a degraded state when claims pile up faster than they settle.
    pub async fn check_claims(&self) -> DependencyHealth {
        let start = std::time::Instant::now();

        match self.store.count_by_state(RecordState::Processing).await {
            Ok(count) if count > self.processing_backlog_threshold => DependencyHealth::degraded(
                "claims",
                format!("{} records processing (threshold {})", count, self.processing_backlog_threshold),
            ),
            Ok(_) => DependencyHealth::healthy("claims", start.elapsed().as_secs_f64() * 1000.0),
            Err(e) => DependencyHealth::unhealthy("claims", format!("Count failed: {}", e)),
        }
    }

    /// Readiness check - returns true if the service is ready to accept traffic.
    pub async fn is_ready(&self) -> bool {
        !self.check_database().await.status.is_unhealthy()
    }

    /// Returns uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
