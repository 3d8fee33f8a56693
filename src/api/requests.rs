use serde::{Deserialize, Serialize};

use crate::models::{ValidationError, MAX_KEY_LENGTH, MAX_SCOPE_LENGTH};

/// Query for looking up a single record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordLookupQuery {
    pub key: String,
    pub scope: Option<String>,
}

impl RecordLookupQuery {
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        if self.key.trim().is_empty() {
            errors.push(ValidationError { field: "key".to_string(), message: "key cannot be empty".to_string() });
        }
        if self.key.len() > MAX_KEY_LENGTH {
            errors.push(ValidationError { field: "key".to_string(), message: format!("key cannot exceed {} bytes", MAX_KEY_LENGTH) });
        }
        if let Some(scope) = &self.scope {
            if scope.len() > MAX_SCOPE_LENGTH {
                errors.push(ValidationError { field: "scope".to_string(), message: format!("scope cannot exceed {} bytes", MAX_SCOPE_LENGTH) });
            }
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_validation() {
        let ok = RecordLookupQuery { key: "order-1".to_string(), scope: Some("stripe".to_string()) };
        assert!(ok.validate().is_ok());

        let bad = RecordLookupQuery { key: " ".to_string(), scope: Some("s".repeat(MAX_SCOPE_LENGTH + 1)) };
        let errors = bad.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].field, "key");
        assert_eq!(errors[1].field, "scope");
    }
}
