//! External inference service contract and its HTTP implementation.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use inferlink_core::{ExternalJobId, TenantId};
use inferlink_jobs::JobKind;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    /// The service refused the request (4xx). Repeating it will not help.
    #[error("rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    /// The job exists remotely but has no result yet.
    #[error("result not ready")]
    NotReady,

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ClientError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Timeout(_) | ClientError::Transport(_) | ClientError::Server { .. } => true,
            ClientError::Rejected { status, .. } => matches!(status, 408 | 429),
            ClientError::NotReady | ClientError::InvalidResponse(_) => false,
        }
    }
}

/// The two calls this system makes against the inference service.
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn submit_job(
        &self,
        tenant_id: TenantId,
        kind: &JobKind,
        payload: &JsonValue,
    ) -> Result<ExternalJobId, ClientError>;

    async fn fetch_job_result(
        &self,
        tenant_id: TenantId,
        external_job_id: &ExternalJobId,
    ) -> Result<JsonValue, ClientError>;
}

/// Bound `fut` by `limit`; elapsing is a [`ClientError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, ClientError>
where
    F: Future<Output = Result<T, ClientError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| ClientError::Timeout(limit))?
}

#[derive(Clone)]
pub struct InferenceClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
}

impl InferenceClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl core::fmt::Debug for InferenceClientConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InferenceClientConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitRequest<'a> {
    tenant_id: TenantId,
    kind: &'a str,
    payload: &'a JsonValue,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    #[serde(alias = "id", alias = "taskId")]
    external_job_id: String,
}

/// `reqwest`-backed client.
///
/// `POST {base}/jobs` submits, `GET {base}/jobs/{id}/result` fetches. A
/// `202 Accepted` on fetch means the result is not ready yet.
pub struct HttpInferenceClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpInferenceClient {
    pub fn new(config: InferenceClientConfig) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
            client,
        })
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(ClientError::Rejected { status: status.as_u16(), message })
        } else {
            Err(ClientError::Server { status: status.as_u16(), message })
        }
    }
}

fn transport(e: reqwest::Error) -> ClientError {
    if e.is_timeout() {
        ClientError::Timeout(Duration::ZERO)
    } else {
        ClientError::Transport(e.to_string())
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn submit_job(
        &self,
        tenant_id: TenantId,
        kind: &JobKind,
        payload: &JsonValue,
    ) -> Result<ExternalJobId, ClientError> {
        let request = SubmitRequest {
            tenant_id,
            kind: kind.type_name(),
            payload,
        };

        let response = self
            .authorized(self.client.post(format!("{}/jobs", self.base_url)))
            .json(&request)
            .send()
            .await
            .map_err(transport)?;
        let body: SubmitResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;

        ExternalJobId::parse(body.external_job_id).map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    async fn fetch_job_result(
        &self,
        tenant_id: TenantId,
        external_job_id: &ExternalJobId,
    ) -> Result<JsonValue, ClientError> {
        let response = self
            .authorized(
                self.client
                    .get(format!("{}/jobs/{}/result", self.base_url, external_job_id))
                    .query(&[("tenantId", tenant_id.to_string())]),
            )
            .send()
            .await
            .map_err(transport)?;

        if response.status() == reqwest::StatusCode::ACCEPTED {
            return Err(ClientError::NotReady);
        }
        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }
}
