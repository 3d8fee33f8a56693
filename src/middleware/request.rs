use crate::idempotency::{Recoverable, RecoveryKind};
use http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// An outbound HTTP request as seen by the middleware.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl OutboundRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: http::HeaderName, value: http::HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// POST, PUT and PATCH. Everything else is safe or idempotent by nature.
    pub fn is_mutating(&self) -> bool {
        matches!(self.method, Method::POST | Method::PUT | Method::PATCH)
    }

    /// Path plus query, or the raw URL if it does not parse.
    pub fn path_and_query(&self) -> String {
        match reqwest::Url::parse(&self.url) {
            Ok(url) => match url.query() {
                Some(query) => format!("{}?{}", url.path(), query),
                None => url.path().to_string(),
            },
            Err(_) => self.url.clone(),
        }
    }

    pub fn host(&self) -> Option<String> {
        reqwest::Url::parse(&self.url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
    }
}

/// A response in the shape that is cached and replayed.
///
/// Only text bodies are supported. The executor decodes the body as UTF-8
/// before the response is returned or cached, replacing invalid sequences
/// with U+FFFD, so a live call and its replay carry the same text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl OutboundResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Failure of a wrapped request, classified for the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HttpFailure {
    #[error("upstream returned status {}", .response.status)]
    Status { response: OutboundResponse },

    #[error("transport error: {message}")]
    Transport { message: String },
}

impl Recoverable for HttpFailure {
    fn recovery(&self) -> RecoveryKind {
        match self {
            HttpFailure::Transport { .. } => RecoveryKind::Retry,
            HttpFailure::Status { response } => match response.status {
                408 | 409 | 425 | 429 => RecoveryKind::Retry,
                500..=599 => RecoveryKind::Retry,
                _ => RecoveryKind::Never,
            },
        }
    }
}
