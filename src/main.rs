use idempotency_engine::api::{create_router, AppState};
use idempotency_engine::config::Settings;
use idempotency_engine::idempotency::{IdempotencyStore, MaintenanceJob};
use idempotency_engine::observability::{init_logging, init_metrics, HealthChecker, LogConfig};
use idempotency_engine::repositories::PostgresIdempotencyStore;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = Settings::new()?;

    // Initialize logging
    init_logging(&LogConfig::from(&settings.application));
    info!("Configuration loaded");

    let metrics_handle = init_metrics();

    // Connect to PostgreSQL
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(settings.database.pool_size)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&settings.database.url)
        .await?;

    info!("Database connection established");

    // Run migrations
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations applied successfully");

    let store: Arc<dyn IdempotencyStore> = Arc::new(PostgresIdempotencyStore::new(pool.clone()));

    // Start the maintenance sweep
    let maintenance = Arc::new(MaintenanceJob::new(
        Arc::clone(&store),
        Duration::from_secs(settings.maintenance.interval_secs.max(1)),
    ));
    let sweeper = Arc::clone(&maintenance).start();
    info!(
        "Maintenance sweep running every {}s",
        settings.maintenance.interval_secs
    );

    let health_checker = Arc::new(HealthChecker::new(pool.clone(), Arc::clone(&store)));
    let state = AppState::new(pool, store, maintenance)
        .with_metrics(metrics_handle)
        .with_health_checker(health_checker);

    let addr = format!("0.0.0.0:{}", settings.application.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
        })
        .await?;

    sweeper.abort();
    Ok(())
}
