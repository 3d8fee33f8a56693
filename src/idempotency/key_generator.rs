use crate::error::{AppError, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt::Display;
use uuid::Uuid;

/// Hex characters kept from the SHA-256 digest in hashed keys (128 bits).
pub const DIGEST_HEX_LEN: usize = 32;

const SEPARATOR: char = ':';

/// Generates a random, time-ordered key (UUIDv7).
pub fn generate_key() -> String {
    Uuid::now_v7().simple().to_string()
}

/// Builds a readable key from an operation name and its parameters.
///
/// Parameters are sorted by name, so `[user_id: 1, cart_id: 2]` and
/// `[cart_id: 2, user_id: 1]` produce the same key. Values are embedded
/// verbatim; use [`hash_key`] for large or sensitive parameters.
pub fn derive_key<I, K, V>(operation: &str, params: I, scope: Option<&str>) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Display,
{
    let mut pairs: Vec<(String, String)> = params
        .into_iter()
        .map(|(k, v)| (k.into(), v.to_string()))
        .collect();
    pairs.sort();

    let body = pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",");

    with_scope(scope, format!("{}{}{}", operation, SEPARATOR, body))
}

/// Builds a key embedding a truncated SHA-256 digest of `(operation, params)`.
///
/// `params` is serialized to canonical JSON first; object keys are ordered,
/// so maps and structs hash identically regardless of insertion order.
pub fn hash_key<P>(operation: &str, params: &P, scope: Option<&str>) -> Result<String>
where
    P: Serialize + ?Sized,
{
    let canonical = serde_json::to_value(params).map_err(AppError::Serialization)?;
    let payload = serde_json::to_string(&(operation, canonical)).map_err(AppError::Serialization)?;

    Ok(with_scope(
        scope,
        format!("{}{}{}", operation, SEPARATOR, digest(payload.as_bytes())),
    ))
}

/// Returns the truncated hex digest used by hashed keys.
pub fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let mut hex = hex::encode(hasher.finalize());
    hex.truncate(DIGEST_HEX_LEN);
    hex
}

fn with_scope(scope: Option<&str>, key: String) -> String {
    match scope {
        Some(scope) => format!("{}{}{}", scope, SEPARATOR, key),
        None => key,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn test_generate_key_unique() {
        let keys: HashSet<String> = (0..1000).map(|_| generate_key()).collect();
        assert_eq!(keys.len(), 1000);
    }

    #[test]
    fn test_generate_key_time_ordered() {
        let first = generate_key();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = generate_key();
        assert!(first < second);
    }

    #[test]
    fn test_derive_key_order_independent() {
        let key1 = derive_key("create_order", [("user_id", 1), ("cart_id", 2)], None);
        let key2 = derive_key("create_order", [("cart_id", 2), ("user_id", 1)], None);
        let key3 = derive_key("create_order", [("user_id", 1), ("cart_id", 3)], None);

        assert_eq!(key1, key2);
        assert_ne!(key1, key3);
        assert_eq!(key1, "create_order:cart_id=2,user_id=1");
    }

    #[test]
    fn test_derive_key_scope_prefix() {
        let key = derive_key("charge", [("order", "o-1")], Some("stripe"));
        assert_eq!(key, "stripe:charge:order=o-1");
    }

    #[test]
    fn test_hash_key_deterministic() {
        let params = json!({"amount": 1000, "currency": "usd", "card": {"last4": "4242"}});
        let key1 = hash_key("charge", &params, Some("stripe")).unwrap();
        let key2 = hash_key(
            "charge",
            &json!({"card": {"last4": "4242"}, "currency": "usd", "amount": 1000}),
            Some("stripe"),
        )
        .unwrap();

        assert_eq!(key1, key2);
        assert!(key1.starts_with("stripe:charge:"));
        assert_eq!(key1.len(), "stripe:charge:".len() + DIGEST_HEX_LEN);
    }

    #[test]
    fn test_hash_key_hides_values() {
        let key = hash_key("charge", &json!({"card_number": "4242424242424242"}), None).unwrap();
        assert!(!key.contains("4242424242424242"));
    }

    #[test]
    fn test_hash_key_differs_by_operation_and_params() {
        let params = json!({"amount": 1000});
        let charge = hash_key("charge", &params, None).unwrap();
        let refund = hash_key("refund", &params, None).unwrap();
        let other = hash_key("charge", &json!({"amount": 1001}), None).unwrap();

        assert_ne!(charge, refund);
        assert_ne!(charge, other);
    }
}
