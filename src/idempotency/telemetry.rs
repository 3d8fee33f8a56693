use crate::observability::{get_metrics, mask_sensitive};
use serde::{Deserialize, Serialize};

/// Named events emitted by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TelemetryEvent {
    ExecuteStart,
    CacheHit,
    Claimed,
    InProgress,
    Completed,
    Failed,
    Released,
    WaitTimeout,
}

impl TelemetryEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryEvent::ExecuteStart => "execute.start",
            TelemetryEvent::CacheHit => "cache_hit",
            TelemetryEvent::Claimed => "claimed",
            TelemetryEvent::InProgress => "in_progress",
            TelemetryEvent::Completed => "completed",
            TelemetryEvent::Failed => "failed",
            TelemetryEvent::Released => "released",
            TelemetryEvent::WaitTimeout => "wait_timeout",
        }
    }
}

/// Receiver of coordinator events. Implementations must not block.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent, key: &str, scope: Option<&str>);
}

/// Default sink: a Prometheus counter plus a debug-level trace event.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsTelemetry;

impl TelemetrySink for MetricsTelemetry {
    fn emit(&self, event: TelemetryEvent, key: &str, scope: Option<&str>) {
        get_metrics().record_idempotency_event(event.as_str(), scope);
        tracing::debug!(
            event = event.as_str(),
            key = %mask_sensitive(key, 4),
            scope = scope.unwrap_or("-"),
            "idempotency event"
        );
    }
}
