use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::Value;
use shared::protocol::NONCE_HEADER_NAME;
use tracing::debug;

use crate::error::BackendError;

/// Issues requests against the monitor backend.
#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn call(&self, method: Method, path: &str) -> Result<Value, BackendError>;
}

/// `BackendClient` over HTTP. Paths are appended to the base url verbatim.
#[derive(Clone)]
pub struct HttpBackendClient {
    http: Client,
    base_url: String,
    nonce: Option<String>,
}

impl HttpBackendClient {
    pub fn new(
        base_url: impl Into<String>,
        nonce: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let http = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            nonce,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn call(&self, method: Method, path: &str) -> Result<Value, BackendError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%method, %url, "backend request");

        let mut request = self.http.request(method, &url);
        if let Some(nonce) = &self.nonce {
            request = request.header(NONCE_HEADER_NAME, nonce);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(BackendError::status(status.as_u16(), body));
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&body).map_err(|err| BackendError::Decode(err.to_string()))
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
