//! Versioned JSON envelope for cached responses and errors.
//!
//! Stored form: `{"v": 1, "kind": "response" | "error", "body": <json>}`.

use crate::error::{AppError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub const CODEC_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Response,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub v: u16,
    pub kind: PayloadKind,
    pub body: serde_json::Value,
}

pub fn encode<T: Serialize + ?Sized>(kind: PayloadKind, value: &T) -> Result<serde_json::Value> {
    let envelope = Envelope {
        v: CODEC_VERSION,
        kind,
        body: serde_json::to_value(value)?,
    };
    Ok(serde_json::to_value(envelope)?)
}

pub fn decode<T: DeserializeOwned>(kind: PayloadKind, stored: &serde_json::Value) -> Result<T> {
    let envelope: Envelope = serde_json::from_value(stored.clone())
        .map_err(|e| AppError::Codec(format!("malformed payload envelope: {}", e)))?;

    if envelope.v != CODEC_VERSION {
        return Err(AppError::Codec(format!(
            "unsupported payload version {} (expected {})",
            envelope.v, CODEC_VERSION
        )));
    }
    if envelope.kind != kind {
        return Err(AppError::Codec(format!(
            "expected {:?} payload, found {:?}",
            kind, envelope.kind
        )));
    }

    serde_json::from_value(envelope.body)
        .map_err(|e| AppError::Codec(format!("failed to decode cached payload: {}", e)))
}

pub fn encode_response<T: Serialize + ?Sized>(value: &T) -> Result<serde_json::Value> {
    encode(PayloadKind::Response, value)
}

pub fn encode_error<E: Serialize + ?Sized>(error: &E) -> Result<serde_json::Value> {
    encode(PayloadKind::Error, error)
}

pub fn decode_response<T: DeserializeOwned>(stored: &serde_json::Value) -> Result<T> {
    decode(PayloadKind::Response, stored)
}

pub fn decode_error<E: DeserializeOwned>(stored: &serde_json::Value) -> Result<E> {
    decode(PayloadKind::Error, stored)
}
