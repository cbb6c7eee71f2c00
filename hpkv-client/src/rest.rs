//! HTTP client for the HPKV REST endpoints.

use crate::error::ClientError;
use hpkv_protocol::message::{
    ApiErrorBody, AtomicIncrementParams, AtomicResult, RangeParams, RangeResult, RecordBody,
    RecordPayload, TokenParams, TokenResult,
};
use hpkv_protocol::RecordValue;
use reqwest::{RequestBuilder, StatusCode};
use std::time::Duration;
use url::Url;

const API_KEY_HEADER: &str = "x-api-key";

/// Default request timeout.
pub const DEFAULT_REST_TIMEOUT: Duration = Duration::from_secs(30);

/// REST client authenticated with an API key.
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: String,
}

impl RestClient {
    /// Creates a client with the default timeout.
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self, ClientError> {
        Self::with_timeout(base_url, api_key, DEFAULT_REST_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: &str,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Self::with_http_client(http, base_url, api_key)
    }

    /// Creates a client around an existing `reqwest::Client`.
    pub fn with_http_client(
        http: reqwest::Client,
        base_url: &str,
        api_key: impl Into<String>,
    ) -> Result<Self, ClientError> {
        Ok(Self {
            http,
            base_url: rest_base_url(base_url)?,
            api_key: api_key.into(),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    // =========================================================================
    // Helper methods
    // =========================================================================

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.header(API_KEY_HEADER, &self.api_key)
    }

    /// Converts a non-success response into an error carrying the server message.
    async fn status_error(response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorBody>(&body)
            .ok()
            .and_then(|b| b.describe().map(str::to_string))
            .unwrap_or(body);
        ClientError::HttpStatus { status, message }
    }

    async fn post_record(&self, payload: &RecordPayload) -> Result<(), ClientError> {
        let url = self.endpoint(&["record"])?;
        let response = self
            .authorized(self.http.post(url))
            .json(payload)
            .send()
            .await?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(()),
            _ => Err(Self::status_error(response).await),
        }
    }

    // =========================================================================
    // Record operations
    // =========================================================================

    /// Creates or replaces a record.
    pub async fn create(&self, key: &str, value: impl Into<RecordValue>) -> bool {
        let payload = RecordPayload {
            key: key.to_string(),
            value: value.into().encode(),
            partial_update: None,
        };
        match self.post_record(&payload).await {
            Ok(()) => {
                tracing::debug!("Record {} created", key);
                true
            }
            Err(e) => {
                tracing::warn!("create {} failed: {}", key, e);
                false
            }
        }
    }

    /// Reads a record. Missing keys and failures both yield `None`.
    pub async fn read(&self, key: &str) -> Option<RecordValue> {
        match self.try_read(key).await {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("read {} failed: {}", key, e);
                None
            }
        }
    }

    /// Reads a record, distinguishing a missing key (`Ok(None)`) from failures.
    pub async fn try_read(&self, key: &str) -> Result<Option<RecordValue>, ClientError> {
        let url = self.endpoint(&["record", key])?;
        let response = self.authorized(self.http.get(url)).send().await?;

        match response.status() {
            StatusCode::OK => {
                let body: RecordBody = response.json().await?;
                Ok(body.value.map(|raw| RecordValue::decode(&raw)))
            }
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(Self::status_error(response).await),
        }
    }

    /// Updates a record. With `partial`, the service merges the supplied fields.
    pub async fn update(&self, key: &str, value: impl Into<RecordValue>, partial: bool) -> bool {
        let payload = RecordPayload {
            key: key.to_string(),
            value: value.into().encode(),
            partial_update: Some(partial),
        };
        match self.post_record(&payload).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("update {} failed: {}", key, e);
                false
            }
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        match self.try_delete(key).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("delete {} failed: {}", key, e);
                false
            }
        }
    }

    async fn try_delete(&self, key: &str) -> Result<(), ClientError> {
        let url = self.endpoint(&["record", key])?;
        let response = self.authorized(self.http.delete(url)).send().await?;
        match response.status() {
            StatusCode::OK => Ok(()),
            _ => Err(Self::status_error(response).await),
        }
    }

    /// Atomically adds `amount` (may be negative) to a numeric record.
    ///
    /// A missing key is created with value `"0"` and the increment is retried
    /// exactly once.
    pub async fn atomic_increment(
        &self,
        key: &str,
        amount: i64,
    ) -> Result<AtomicResult, ClientError> {
        match self.post_increment(key, amount).await {
            Err(e) if e.is_not_found() => {
                tracing::info!("Key {} does not exist, creating it with value 0", key);
                if !self.create(key, "0").await {
                    return Err(ClientError::Remote(format!(
                        "failed to create {} with initial value",
                        key
                    )));
                }
                tracing::debug!("Retrying increment of {}", key);
                self.post_increment(key, amount).await
            }
            other => other,
        }
    }

    async fn post_increment(&self, key: &str, amount: i64) -> Result<AtomicResult, ClientError> {
        let url = self.endpoint(&["record", "atomic"])?;
        let params = AtomicIncrementParams {
            key: key.to_string(),
            increment: amount,
        };
        let response = self
            .authorized(self.http.post(url))
            .json(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }

        let result: AtomicResult = response.json().await?;
        if !result.success {
            return Err(ClientError::Remote(
                result
                    .message
                    .unwrap_or_else(|| "increment rejected".to_string()),
            ));
        }
        Ok(result)
    }

    /// Scans records with keys in `[start_key, end_key]`.
    pub async fn range(
        &self,
        start_key: &str,
        end_key: &str,
        limit: Option<u32>,
    ) -> Result<RangeResult, ClientError> {
        let params = RangeParams {
            start_key: start_key.to_string(),
            end_key: end_key.to_string(),
            limit,
        };
        let url = self.endpoint(&["records"])?;
        let response = self
            .authorized(self.http.get(url))
            .query(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        Ok(response.json().await?)
    }

    /// Issues a notification token for the given keys.
    pub async fn websocket_token(&self, subscribe_keys: &[String]) -> Result<String, ClientError> {
        let url = self.endpoint(&["token", "websocket"])?;
        let params = TokenParams {
            subscribe_keys: subscribe_keys.to_vec(),
        };
        let response = self
            .authorized(self.http.post(url))
            .json(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::status_error(response).await);
        }
        let result: TokenResult = response.json().await?;
        Ok(result.token)
    }
}

/// Normalizes a REST base URL; a bare host gets `https://`.
fn rest_base_url(base_url: &str) -> Result<Url, ClientError> {
    let base = base_url.trim().trim_end_matches('/');
    if base.is_empty() {
        return Err(ClientError::InvalidUrl("empty base URL".to_string()));
    }
    let full = if base.contains("://") {
        base.to_string()
    } else {
        format!("https://{}", base)
    };

    let url = Url::parse(&full).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ClientError::InvalidUrl(format!(
            "unsupported scheme {}",
            other
        ))),
    }
}
