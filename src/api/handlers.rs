use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};

use crate::api::requests::RecordLookupQuery;
use crate::api::responses::{
    ApiResponse, ErrorResponse, HealthResponse, RecordCountsResponse, RecordResponse,
    ValidationErrorDetail,
};
use crate::error::AppError;
use crate::idempotency::MaintenanceReport;
use crate::models::RecordState;
use crate::observability::AggregatedHealth;

use super::routes::AppState;

type ApiError = (StatusCode, Json<ApiResponse<()>>);

fn internal_error(context: &str, e: AppError) -> ApiError {
    tracing::error!("{}: {}", context, e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiResponse::<()>::error(ErrorResponse::new(
            "INTERNAL_ERROR",
            "An internal error occurred",
        ))),
    )
}

/// Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<HealthResponse>> {
    let db_healthy = sqlx::query("SELECT 1")
        .fetch_one(&state.pool)
        .await
        .is_ok();

    let response = HealthResponse {
        status: if db_healthy { "healthy".to_string() } else { "unhealthy".to_string() },
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now(),
        uptime_seconds: state.health_checker.as_ref().map_or(0, |c| c.uptime_seconds()),
    };

    Json(ApiResponse::success(response))
}

/// Detailed health check with per-dependency status.
pub async fn detailed_health_check(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<ApiResponse<AggregatedHealth>>), ApiError> {
    let Some(checker) = state.health_checker.as_ref() else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse::<()>::error(ErrorResponse::new(
                "NOT_CONFIGURED",
                "Health checker is not configured",
            ))),
        ));
    };

    let health = checker.check_all().await;
    let status = if health.status.is_unhealthy() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    Ok((status, Json(ApiResponse::success(health))))
}

/// Readiness check endpoint.
pub async fn readiness_check(State(state): State<AppState>) -> StatusCode {
    let ready = match state.health_checker.as_ref() {
        Some(checker) => checker.is_ready().await,
        None => sqlx::query("SELECT 1").fetch_one(&state.pool).await.is_ok(),
    };

    if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Liveness check endpoint.
pub async fn liveness_check() -> StatusCode {
    StatusCode::OK
}

/// Prometheus scrape endpoint.
pub async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics_handle.as_ref() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            "metrics recorder not installed".to_string(),
        ),
    }
}

/// Look up a record by key and scope.
pub async fn get_record(
    State(state): State<AppState>,
    Query(query): Query<RecordLookupQuery>,
) -> Result<Json<ApiResponse<RecordResponse>>, ApiError> {
    if let Err(errors) = query.validate() {
        let details: Vec<ValidationErrorDetail> = errors.into_iter().map(ValidationErrorDetail::from).collect();
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::<()>::error(
                ErrorResponse::new("VALIDATION_ERROR", "Invalid record lookup").with_details(details),
            )),
        ));
    }

    match state.store.get(&query.key, query.scope.as_deref()).await {
        Ok(Some(record)) => Ok(Json(ApiResponse::success(RecordResponse::from(record)))),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(ApiResponse::<()>::error(ErrorResponse::new(
                "NOT_FOUND",
                "Idempotency record not found",
            ))),
        )),
        Err(e) => Err(internal_error("Failed to get idempotency record", e)),
    }
}

/// Record counts by state.
pub async fn get_record_counts(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<RecordCountsResponse>>, ApiError> {
    let mut counts = RecordCountsResponse::default();
    for (state_value, slot) in [
        (RecordState::Pending, &mut counts.pending),
        (RecordState::Processing, &mut counts.processing),
        (RecordState::Completed, &mut counts.completed),
        (RecordState::Failed, &mut counts.failed),
    ] {
        *slot = state
            .store
            .count_by_state(state_value)
            .await
            .map_err(|e| internal_error("Failed to count idempotency records", e))?;
    }

    Ok(Json(ApiResponse::success(counts)))
}

/// Runs one maintenance sweep immediately.
pub async fn run_maintenance(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<MaintenanceReport>>, ApiError> {
    match state.maintenance.run_once().await {
        Ok(report) => {
            tracing::info!(recovered = report.recovered, deleted = report.deleted, "Manual maintenance sweep finished");
            Ok(Json(ApiResponse::success(report)))
        }
        Err(e) => Err(internal_error("Manual maintenance sweep failed", e)),
    }
}
