#![allow(dead_code)]

use idempotency_engine::idempotency::{TelemetryEvent, TelemetrySink};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Mutex;
use std::time::Duration;

/// Connects to `DATABASE_URL` and runs migrations, or returns `None` when
/// no database is configured so Postgres-backed tests can skip.
pub async fn setup_test_db() -> Option<PgPool> {
    dotenvy::dotenv().ok();

    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set; skipping Postgres-backed test");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await
        .expect("Failed to connect to test database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    Some(pool)
}

pub async fn cleanup_records(pool: &PgPool, key_prefix: &str) {
    sqlx::query("DELETE FROM idempotency_records WHERE key LIKE $1")
        .bind(format!("{}%", key_prefix))
        .execute(pool)
        .await
        .ok();
}

/// Telemetry sink that keeps every event in order.
#[derive(Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<(TelemetryEvent, String, Option<String>)>>,
}

impl RecordingTelemetry {
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().unwrap().iter().map(|(e, _, _)| *e).collect()
    }

    pub fn count(&self, event: TelemetryEvent) -> usize {
        self.events.lock().unwrap().iter().filter(|(e, _, _)| *e == event).count()
    }

    pub fn scopes(&self) -> Vec<Option<String>> {
        self.events.lock().unwrap().iter().map(|(_, _, s)| s.clone()).collect()
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn emit(&self, event: TelemetryEvent, key: &str, scope: Option<&str>) {
        self.events
            .lock()
            .unwrap()
            .push((event, key.to_string(), scope.map(str::to_string)));
    }
}
