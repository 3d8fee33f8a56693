use crate::error::{AppError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::time::Duration;
use uuid::Uuid;

pub const MAX_KEY_LENGTH: usize = 255;
pub const MAX_SCOPE_LENGTH: usize = 64;

/// Lifecycle state of an idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    /// Created or released; the next caller may claim it.
    Pending,
    /// Claimed by exactly one caller until `locked_until`.
    Processing,
    /// Settled with a cached response.
    Completed,
    /// Settled with a cached permanent error.
    Failed,
}

impl RecordState {
    /// Returns true if the record holds a settled outcome.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecordState::Completed | RecordState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Pending => "pending",
            RecordState::Processing => "processing",
            RecordState::Completed => "completed",
            RecordState::Failed => "failed",
        }
    }
}

/// Legal state transitions of an idempotency record.
#[derive(Debug, Clone)]
pub struct RecordStateMachine;

impl RecordStateMachine {
    /// Returns valid next states from the current state.
    pub fn valid_transitions(current: RecordState) -> Vec<RecordState> {
        match current {
            // Pending -> Completed/Failed is a late settlement by a holder
            // whose lapsed claim was swept back to pending.
            RecordState::Pending => vec![
                RecordState::Processing,
                RecordState::Completed,
                RecordState::Failed,
            ],
            // Processing -> Processing is the takeover of a lapsed claim.
            RecordState::Processing => vec![
                RecordState::Processing,
                RecordState::Completed,
                RecordState::Failed,
                RecordState::Pending,
            ],
            RecordState::Completed => vec![],
            RecordState::Failed => vec![],
        }
    }

    pub fn can_transition(from: RecordState, to: RecordState) -> bool {
        Self::valid_transitions(from).contains(&to)
    }

    pub fn transition(from: RecordState, to: RecordState) -> Result<RecordState> {
        if Self::can_transition(from, to) {
            Ok(to)
        } else {
            Err(AppError::Validation(format!(
                "Invalid idempotency record transition from {} to {}",
                from.as_str(),
                to.as_str()
            )))
        }
    }
}

/// Persisted idempotency record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct IdempotencyRecord {
    pub id: Uuid,
    pub key: String,
    pub scope: Option<String>,
    pub state: RecordState,
    /// Optimistic-lock counter, bumped on every claim.
    pub version: i64,
    pub response: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub metadata: serde_json::Value,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub locked_until: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Builds a fresh `pending` record from a validated request.
    pub fn pending(new: &NewIdempotencyRecord, now: DateTime<Utc>) -> Result<Self> {
        let ttl = chrono::Duration::from_std(new.ttl)
            .map_err(|e| AppError::Validation(format!("ttl out of range: {}", e)))?;

        Ok(Self {
            id: Uuid::new_v4(),
            key: new.key.clone(),
            scope: new.scope.clone(),
            state: RecordState::Pending,
            version: 0,
            response: None,
            error: None,
            metadata: new.metadata.clone(),
            started_at: None,
            completed_at: None,
            locked_until: None,
            expires_at: now + ttl,
            inserted_at: now,
            updated_at: now,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Returns true if the record is `processing` but its claim has lapsed.
    pub fn is_lock_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.state == RecordState::Processing
            && self.locked_until.map_or(true, |until| until < now)
    }

    /// Returns true if a caller may attempt to claim the record right now.
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        self.state == RecordState::Pending || self.is_lock_expired_at(now)
    }

    /// Checks the payload/lock invariants that hold for every persisted record.
    pub fn check_invariants(&self) -> Result<()> {
        let ok = (self.state == RecordState::Completed) == self.response.is_some()
            && (self.state == RecordState::Failed) == self.error.is_some()
            && (self.state == RecordState::Processing) == self.locked_until.is_some()
            && self.version >= 0;

        if ok {
            Ok(())
        } else {
            Err(AppError::Internal(anyhow::anyhow!(
                "idempotency record {} violates state invariants (state = {})",
                self.id,
                self.state.as_str()
            )))
        }
    }
}

/// Validation failure for a single field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

/// Request to insert a new `pending` record.
#[derive(Debug, Clone, PartialEq)]
pub struct NewIdempotencyRecord {
    pub key: String,
    pub scope: Option<String>,
    pub ttl: Duration,
    pub metadata: serde_json::Value,
}

impl NewIdempotencyRecord {
    pub fn new(key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            scope: None,
            ttl,
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn with_scope(mut self, scope: Option<String>) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn validate(&self) -> std::result::Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        if self.key.trim().is_empty() {
            errors.push(ValidationError { field: "key".to_string(), message: "key cannot be empty".to_string() });
        }
        if self.key.len() > MAX_KEY_LENGTH {
            errors.push(ValidationError {
                field: "key".to_string(),
                message: format!("key cannot exceed {} bytes", MAX_KEY_LENGTH),
            });
        }
        if let Some(scope) = &self.scope {
            // The empty string is the reserved slot for "no scope".
            if scope.is_empty() {
                errors.push(ValidationError { field: "scope".to_string(), message: "scope cannot be empty; use None".to_string() });
            }
            if scope.len() > MAX_SCOPE_LENGTH {
                errors.push(ValidationError {
                    field: "scope".to_string(),
                    message: format!("scope cannot exceed {} bytes", MAX_SCOPE_LENGTH),
                });
            }
        }
        if self.ttl.is_zero() {
            errors.push(ValidationError { field: "ttl".to_string(), message: "ttl must be positive".to_string() });
        }
        if !self.metadata.is_object() {
            errors.push(ValidationError { field: "metadata".to_string(), message: "metadata must be a JSON object".to_string() });
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Validates and folds field errors into a single `AppError::Validation`.
    pub fn ensure_valid(&self) -> Result<()> {
        self.validate().map_err(|errors| {
            AppError::Validation(
                errors
                    .iter()
                    .map(|e| format!("{}: {}", e.field, e.message))
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_request() -> NewIdempotencyRecord {
        NewIdempotencyRecord::new("ord-1", Duration::from_secs(60)).with_scope(Some("stripe".into()))
    }

    #[test]
    fn test_state_helpers() {
        assert!(RecordState::Completed.is_terminal());
        assert!(RecordState::Failed.is_terminal());
        assert!(!RecordState::Pending.is_terminal());
    }

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&RecordState::Processing).unwrap(), "\"processing\"");
    }

    #[test]
    fn test_state_machine_transitions() {
        assert!(RecordStateMachine::can_transition(RecordState::Pending, RecordState::Processing));
        assert!(RecordStateMachine::can_transition(RecordState::Processing, RecordState::Pending));
        assert!(RecordStateMachine::can_transition(RecordState::Pending, RecordState::Completed));
        assert!(!RecordStateMachine::can_transition(RecordState::Pending, RecordState::Pending));
        assert!(!RecordStateMachine::can_transition(RecordState::Completed, RecordState::Pending));
        assert!(RecordStateMachine::transition(RecordState::Failed, RecordState::Processing).is_err());
    }

    #[test]
    fn test_pending_record() {
        let now = Utc::now();
        let record = IdempotencyRecord::pending(&new_request(), now).unwrap();
        assert_eq!(record.state, RecordState::Pending);
        assert_eq!(record.version, 0);
        assert_eq!(record.expires_at, now + chrono::Duration::seconds(60));
        assert!(record.check_invariants().is_ok());
        assert!(record.is_claimable_at(now));
    }

    #[test]
    fn test_lock_expiry() {
        let now = Utc::now();
        let mut record = IdempotencyRecord::pending(&new_request(), now).unwrap();
        record.state = RecordState::Processing;
        record.locked_until = Some(now + chrono::Duration::seconds(5));
        assert!(!record.is_lock_expired_at(now));
        assert!(record.is_lock_expired_at(now + chrono::Duration::seconds(6)));
        assert!(record.is_claimable_at(now + chrono::Duration::seconds(6)));
    }

    #[test]
    fn test_invariant_violation_detected() {
        let mut record = IdempotencyRecord::pending(&new_request(), Utc::now()).unwrap();
        record.response = Some(json!({"id": "ch1"}));
        assert!(record.check_invariants().is_err());
    }

    #[test]
    fn test_validation() {
        assert!(new_request().validate().is_ok());

        let bad = NewIdempotencyRecord::new(" ", Duration::ZERO)
            .with_scope(Some(String::new()))
            .with_metadata(json!([1, 2]));
        let errors = bad.validate().unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, vec!["key", "scope", "ttl", "metadata"]);
        assert!(matches!(bad.ensure_valid(), Err(AppError::Validation(_))));
    }
}
