//! Exactly-once coordination of side-effecting operations keyed by an
//! idempotency key.

pub mod codec;
pub mod coordinator;
pub mod key_generator;
pub mod maintenance;
pub mod memory;
pub mod recoverable;
pub mod store;
pub mod telemetry;

pub use coordinator::{
    CoordinatorConfig, ExecuteError, ExecuteOptions, IdempotencyCoordinator, IdempotencyMetrics,
    MetricsSnapshot, OnDuplicate,
};
pub use key_generator::{derive_key, digest, generate_key, hash_key};
pub use maintenance::{MaintenanceJob, MaintenanceReport};
pub use memory::InMemoryIdempotencyStore;
pub use recoverable::{Recoverable, RecoveryKind};
pub use store::{ClaimOutcome, CreateOutcome, IdempotencyStore};
pub use telemetry::{MetricsTelemetry, TelemetryEvent, TelemetrySink};
