//! Idempotent execution of outbound HTTP requests.

pub mod executor;
pub mod request;

pub use executor::{ReqwestExecutor, RequestExecutor};
pub use request::{HttpFailure, OutboundRequest, OutboundResponse};

use crate::config::MiddlewareSettings;
use crate::error::{AppError, Result};
use crate::idempotency::{
    digest, hash_key, ExecuteError, ExecuteOptions, IdempotencyCoordinator, OnDuplicate,
};
use crate::models::MAX_SCOPE_LENGTH;
use crate::observability::{get_metrics, mask_sensitive, LatencyTimer};
use http::{HeaderName, HeaderValue};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct MiddlewareConfig {
    pub header_name: HeaderName,
    /// Derive a key for mutating requests that carry none.
    pub derive_missing_keys: bool,
    /// Use the target host as the scope when `scope` is unset.
    pub scope_from_host: bool,
    pub scope: Option<String>,
    pub on_duplicate: OnDuplicate,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            header_name: HeaderName::from_static("idempotency-key"),
            derive_missing_keys: true,
            scope_from_host: true,
            scope: None,
            on_duplicate: OnDuplicate::Return,
        }
    }
}

impl MiddlewareConfig {
    pub fn from_settings(settings: &MiddlewareSettings) -> Result<Self> {
        let header_name = HeaderName::from_bytes(settings.header_name.as_bytes()).map_err(|e| {
            AppError::Validation(format!("Invalid idempotency header '{}': {}", settings.header_name, e))
        })?;

        Ok(Self {
            header_name,
            derive_missing_keys: settings.derive_missing_keys,
            scope_from_host: settings.scope_from_host,
            ..Self::default()
        })
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn on_duplicate(mut self, policy: OnDuplicate) -> Self {
        self.on_duplicate = policy;
        self
    }
}

/// Wraps a [`RequestExecutor`] so mutating requests run at most once per
/// idempotency key.
///
/// Non-2xx responses are classified through [`HttpFailure`] so permanent
/// rejections are cached, but the caller always receives the response
/// itself, live or replayed.
pub struct IdempotencyMiddleware<X> {
    executor: X,
    coordinator: Arc<IdempotencyCoordinator>,
    config: MiddlewareConfig,
}

impl<X: RequestExecutor> IdempotencyMiddleware<X> {
    pub fn new(executor: X, coordinator: Arc<IdempotencyCoordinator>, config: MiddlewareConfig) -> Self {
        Self {
            executor,
            coordinator,
            config,
        }
    }

    pub fn config(&self) -> &MiddlewareConfig {
        &self.config
    }

    /// Hosts longer than a scope may be are replaced by their digest.
    fn scope_for(&self, request: &OutboundRequest) -> Option<String> {
        if let Some(scope) = &self.config.scope {
            return Some(scope.clone());
        }
        if !self.config.scope_from_host {
            return None;
        }
        request.host().map(|host| {
            if host.len() > MAX_SCOPE_LENGTH {
                digest(host.as_bytes())
            } else {
                host
            }
        })
    }

    /// Returns the key to use, injecting a derived one into the request's
    /// headers when needed. `None` means the request passes through.
    pub fn resolve_key(&self, request: &mut OutboundRequest, scope: Option<&str>) -> Result<Option<String>> {
        if !request.is_mutating() {
            return Ok(None);
        }

        if let Some(value) = request.headers.get(&self.config.header_name) {
            let key = value
                .to_str()
                .map_err(|_| AppError::Validation("Idempotency header is not valid ASCII".to_string()))?;
            return Ok(Some(key.to_string()));
        }

        if !self.config.derive_missing_keys {
            return Ok(None);
        }

        let key = hash_key(
            request.method.as_str(),
            &(request.path_and_query(), digest(&request.body)),
            scope,
        )?;
        let value = HeaderValue::from_str(&key)
            .map_err(|e| AppError::Validation(format!("Derived key is not a valid header value: {}", e)))?;
        request.headers.insert(self.config.header_name.clone(), value);

        Ok(Some(key))
    }

    pub async fn send(&self, mut request: OutboundRequest) -> std::result::Result<OutboundResponse, ExecuteError<HttpFailure>> {
        let timer = LatencyTimer::new();
        let method = request.method.clone();
        let scope = self.scope_for(&request);

        let Some(key) = self.resolve_key(&mut request, scope.as_deref())? else {
            tracing::debug!(method = %method, "passing request through without idempotency");
            let response = self.executor.execute(request).await.map_err(|e| {
                ExecuteError::Operation(HttpFailure::Transport { message: e.to_string() })
            })?;
            get_metrics().record_outbound_request(method.as_str(), scope.as_deref(), response.status, timer.elapsed_ms());
            return Ok(response);
        };

        tracing::debug!(method = %method, key = %mask_sensitive(&key, 4), "sending idempotent request");

        let mut opts = ExecuteOptions::new().on_duplicate(self.config.on_duplicate);
        if let Some(scope) = scope.clone() {
            opts = opts.with_scope(scope);
        }

        let executor = &self.executor;
        let outcome = self
            .coordinator
            .execute(
                &key,
                move || async move {
                    match executor.execute(request).await {
                        Ok(response) if response.is_success() => Ok(response),
                        Ok(response) => Err(HttpFailure::Status { response }),
                        Err(e) => Err(HttpFailure::Transport { message: e.to_string() }),
                    }
                },
                opts,
            )
            .await;

        let result = match outcome {
            Ok(response) => Ok(response),
            Err(ExecuteError::Operation(HttpFailure::Status { response })) => Ok(response),
            Err(e) => Err(e),
        };

        let status = result.as_ref().map(|r| r.status).unwrap_or(0);
        get_metrics().record_outbound_request(method.as_str(), scope.as_deref(), status, timer.elapsed_ms());

        result
    }
}
