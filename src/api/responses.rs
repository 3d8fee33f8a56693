use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{IdempotencyRecord, RecordState, ValidationError};

/// Standard API response wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ErrorResponse>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(error: ErrorResponse) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Error response structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub details: Option<Vec<ValidationErrorDetail>>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Vec<ValidationErrorDetail>) -> Self {
        self.details = Some(details);
        self
    }
}

/// Validation error detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationErrorDetail {
    pub field: String,
    pub message: String,
}

impl From<ValidationError> for ValidationErrorDetail {
    fn from(error: ValidationError) -> Self {
        Self {
            field: error.field,
            message: error.message,
        }
    }
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
}

/// Record summary. Cached payloads are reported by presence only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordResponse {
    pub id: Uuid,
    pub key: String,
    pub scope: Option<String>,
    pub state: RecordState,
    pub version: i64,
    pub has_response: bool,
    pub has_error: bool,
    pub metadata: serde_json::Value,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub inserted_at: DateTime<Utc>,
}

impl From<IdempotencyRecord> for RecordResponse {
    fn from(record: IdempotencyRecord) -> Self {
        Self {
            id: record.id,
            key: record.key,
            scope: record.scope,
            state: record.state,
            version: record.version,
            has_response: record.response.is_some(),
            has_error: record.error.is_some(),
            metadata: record.metadata,
            started_at: record.started_at,
            completed_at: record.completed_at,
            locked_until: record.locked_until,
            expires_at: record.expires_at,
            inserted_at: record.inserted_at,
        }
    }
}

/// Record counts by state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordCountsResponse {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}
