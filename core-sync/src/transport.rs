//! # Network Transport
//!
//! [`Transport`] performs one request and reports either a decoded JSON
//! response or an error. Interactive reads are never retried here: a failed
//! refresh surfaces immediately so the caller can keep showing cached data.

use crate::request::RequestDescriptor;
use crate::{Result, SyncError};
use async_trait::async_trait;
use bridge_traits::{HttpClient, HttpRequest, RetryPolicy};
use core_runtime::logging::redact_url;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

#[cfg(test)]
use mockall::automock;

/// Longest error body kept in [`SyncError::Http`] messages.
const MAX_ERROR_BODY: usize = 512;

/// A successful response with its body decoded as JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Value,
}

impl TransportResponse {
    pub fn new(body: Value) -> Self {
        Self {
            status: 200,
            headers: HashMap::new(),
            body,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &RequestDescriptor) -> Result<TransportResponse>;
}

/// [`Transport`] over the host's [`HttpClient`].
pub struct HttpTransport {
    client: Arc<dyn HttpClient>,
    base_url: String,
    access_token: Option<String>,
    timeout: Option<Duration>,
}

impl HttpTransport {
    pub fn new(client: Arc<dyn HttpClient>, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            access_token: None,
            timeout: None,
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build(&self, request: &RequestDescriptor) -> Result<HttpRequest> {
        let mut http = HttpRequest::new(request.method(), request.url(&self.base_url))
            .header("Accept", "application/json");

        if let Some(token) = &self.access_token {
            http = http.bearer_token(token.clone());
        }
        if let Some(timeout) = self.timeout {
            http = http.timeout(timeout);
        }
        if let Some(body) = request.body() {
            http = http
                .json(&body)
                .map_err(|e| SyncError::InvalidRequest(e.to_string()))?;
        }
        Ok(http)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip(self, request), fields(request = %redact_url(&request.describe())))]
    async fn send(&self, request: &RequestDescriptor) -> Result<TransportResponse> {
        let http = self.build(request)?;
        let url = http.url.clone();

        let response = self
            .client
            .execute_with_retry(http, RetryPolicy::no_retry())
            .await?;

        if !response.is_success() {
            let mut message = response.text().unwrap_or_default();
            if message.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !message.is_char_boundary(cut) {
                    cut -= 1;
                }
                message.truncate(cut);
            }
            warn!(status = response.status, "Request rejected");
            return Err(SyncError::Http {
                status: response.status,
                url,
                message,
            });
        }

        let body = if response.body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&response.body)?
        };
        debug!(status = response.status, "Request succeeded");

        Ok(TransportResponse {
            status: response.status,
            headers: response.headers,
            body,
        })
    }
}
