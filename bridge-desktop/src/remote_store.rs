//! Remote Store over HTTP
//!
//! Talks to a content-storage API exposing the tree under two routes:
//! `GET {base}/list{path}` for folder listings and `{base}/source{path}`
//! for reading, writing and deleting blobs and documents.

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    http::{HttpClient, HttpMethod, HttpRequest, HttpResponse, RetryPolicy},
    storage::{RemoteEntry, RemoteStore},
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// `RemoteStore` backed by an [`HttpClient`]
///
/// Every call goes through `execute_with_retry` with the configured
/// [`RetryPolicy`]. The default issues each request once so a retrying
/// caller is the only retry layer; a 429 then surfaces as
/// [`BridgeError::RateLimited`] with the server's `retry-after` hint.
pub struct HttpRemoteStore {
    http_client: Arc<dyn HttpClient>,
    base_url: String,
    token: Option<String>,
    retry_policy: RetryPolicy,
}

impl HttpRemoteStore {
    pub fn new(http_client: Arc<dyn HttpClient>, base_url: impl Into<String>) -> Self {
        Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            retry_policy: RetryPolicy::single_attempt(),
        }
    }

    /// Authenticate every request with a bearer token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    fn url(&self, route: &str, path: &str) -> String {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };
        format!("{}/{}{}", self.base_url, route, path)
    }

    fn request(&self, method: HttpMethod, url: String) -> HttpRequest {
        let request = HttpRequest::new(method, url);
        match &self.token {
            Some(token) => request.bearer_token(token.clone()),
            None => request,
        }
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.http_client
            .execute_with_retry(request, self.retry_policy.clone())
            .await
    }

    fn unexpected(operation: &str, path: &str, response: &HttpResponse) -> BridgeError {
        warn!(operation, path, status = response.status, "Remote store call failed");
        BridgeError::OperationFailed(format!(
            "{} {} failed with HTTP {}",
            operation, path, response.status
        ))
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let response = self
            .send(self.request(HttpMethod::Get, self.url("list", path)))
            .await?;

        if response.is_not_found() {
            return Ok(Vec::new());
        }
        if !response.is_success() {
            return Err(Self::unexpected("list", path, &response));
        }

        let entries: Vec<RemoteEntry> = response.json()?;
        debug!(path, count = entries.len(), "Listed remote folder");
        Ok(entries)
    }

    async fn read_blob(&self, path: &str) -> Result<Option<Value>> {
        let response = self
            .send(self.request(HttpMethod::Get, self.url("source", path)))
            .await?;

        if response.is_not_found() {
            return Ok(None);
        }
        if !response.is_success() {
            return Err(Self::unexpected("read", path, &response));
        }

        // A body that is not JSON is handed back as a string so the caller
        // can classify it as a malformed record instead of a transport failure.
        match response.json::<Value>() {
            Ok(value) => Ok(Some(value)),
            Err(_) => Ok(Some(Value::String(response.text()?))),
        }
    }

    async fn write_blob(&self, path: &str, value: &Value) -> Result<()> {
        let request = self
            .request(HttpMethod::Put, self.url("source", path))
            .json(value)?;
        let response = self.send(request).await?;

        if !response.is_success() {
            return Err(Self::unexpected("write", path, &response));
        }

        debug!(path, "Wrote remote blob");
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let response = self
            .send(self.request(HttpMethod::Delete, self.url("source", path)))
            .await?;

        if response.is_success() || response.is_not_found() {
            Ok(())
        } else {
            Err(Self::unexpected("delete", path, &response))
        }
    }

    async fn read_document(&self, path: &str) -> Result<Option<String>> {
        let response = self
            .send(self.request(HttpMethod::Get, self.url("source", path)))
            .await?;

        if response.is_not_found() {
            return Ok(None);
        }
        if !response.is_success() {
            return Err(Self::unexpected("read", path, &response));
        }

        response.text().map(Some)
    }
}
