use crate::error::{AppError, Result};
use crate::middleware::request::{OutboundRequest, OutboundResponse};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

/// Sends a request and returns whatever response the server produced.
///
/// Non-2xx statuses are successful executions; only transport failures are
/// errors.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    async fn execute(&self, request: OutboundRequest) -> Result<OutboundResponse>;
}

/// [`RequestExecutor`] backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestExecutor {
    client: reqwest::Client,
}

impl ReqwestExecutor {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Http(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RequestExecutor for ReqwestExecutor {
    async fn execute(&self, request: OutboundRequest) -> Result<OutboundResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|e| AppError::Validation(format!("Invalid method: {}", e)))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in request.headers.iter() {
            builder = builder.header(name.as_str(), value.as_bytes());
        }

        let response = builder
            .body(request.body)
            .send()
            .await
            .map_err(|e| AppError::Http(e.to_string()))?;

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        // Lossy UTF-8; binary bodies are not preserved.
        let body = response
            .text()
            .await
            .map_err(|e| AppError::Http(e.to_string()))?;

        Ok(OutboundResponse { status, headers, body })
    }
}
