use metrics::{counter, gauge, histogram, describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Global metrics instance.
pub static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Metrics collector for the idempotency engine.
#[derive(Debug, Clone)]
pub struct Metrics {
    initialized: bool,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self { initialized: true }
    }

    pub fn record_idempotency_event(&self, event: &'static str, scope: Option<&str>) {
        counter!("idempotency_events_total", "event" => event, "scope" => scope.unwrap_or("none").to_string()).increment(1);
    }

    pub fn record_execute_latency(&self, duration_ms: f64, outcome: &'static str) {
        histogram!("idempotency_execute_duration_ms", "outcome" => outcome).record(duration_ms);
    }

    pub fn record_stale_recovered(&self, count: u64) {
        counter!("idempotency_stale_recovered_total").increment(count);
    }

    pub fn record_expired_deleted(&self, count: u64) {
        counter!("idempotency_expired_deleted_total").increment(count);
    }

    pub fn record_maintenance_latency(&self, duration_ms: f64) {
        histogram!("idempotency_maintenance_duration_ms").record(duration_ms);
    }

    pub fn set_records_by_state(&self, state: &'static str, count: i64) {
        gauge!("idempotency_records", "state" => state).set(count as f64);
    }

    pub fn record_outbound_request(&self, method: &str, scope: Option<&str>, status: u16, duration_ms: f64) {
        counter!("idempotency_outbound_requests_total", "method" => method.to_string(), "scope" => scope.unwrap_or("none").to_string(), "status" => status.to_string()).increment(1);
        histogram!("idempotency_outbound_request_duration_ms", "method" => method.to_string()).record(duration_ms);
    }
}

/// Timer for measuring operation latency.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for LatencyTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Initializes the metrics system and returns the Prometheus handle.
pub fn init_metrics() -> PrometheusHandle {
    let handle = METRICS_HANDLE.get_or_init(|| {
        let builder = PrometheusBuilder::new();
        let handle = builder
            .install_recorder()
            .expect("Failed to install Prometheus recorder");

        describe_metrics();
        handle
    });

    METRICS.get_or_init(Metrics::new);

    handle.clone()
}

/// Describes all metrics for Prometheus.
fn describe_metrics() {
    describe_counter!("idempotency_events_total", Unit::Count, "Coordinator events by name and scope");
    describe_histogram!("idempotency_execute_duration_ms", Unit::Milliseconds, "End-to-end execute latency in milliseconds");

    describe_counter!("idempotency_stale_recovered_total", Unit::Count, "Abandoned claims reset to pending");
    describe_counter!("idempotency_expired_deleted_total", Unit::Count, "Expired records deleted");
    describe_histogram!("idempotency_maintenance_duration_ms", Unit::Milliseconds, "Maintenance sweep latency in milliseconds");
    describe_gauge!("idempotency_records", Unit::Count, "Records by state after the last sweep");

    describe_counter!("idempotency_outbound_requests_total", Unit::Count, "Outbound requests sent through the middleware");
    describe_histogram!("idempotency_outbound_request_duration_ms", Unit::Milliseconds, "Outbound request latency in milliseconds");
}

/// Returns the global metrics instance.
pub fn get_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}
