//! Inbound webhook handling.
//!
//! Order matters: authenticate the raw bytes, then parse, then look the job
//! up, then check ownership, and only then let the payload move state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{error, info, warn};

use inferlink_auth::{WebhookAuthError, WebhookAuthenticator};
use inferlink_core::{ExternalJobId, JobId, TenantId};
use inferlink_events::{EventBus, EventEnvelope, JobEvent};
use inferlink_jobs::{FailureKind, Job, JobStatus, JobStore, LifecycleError};
use inferlink_observability::{AUDIT_TARGET, Counter, SECURITY_TARGET};

use crate::client::{ClientError, InferenceClient, with_timeout};
use crate::processor::{ProcessOutcome, ResultProcessor};

/// Raw callback as received; nothing in here has been trusted yet.
#[derive(Debug, Clone, Copy)]
pub struct WebhookRequest<'a> {
    pub body: &'a [u8],
    pub signature: Option<&'a str>,
    pub timestamp: Option<&'a str>,
    pub task_id: Option<&'a str>,
}

/// Callback body.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    #[serde(default)]
    pub external_job_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub result: Option<JsonValue>,
    #[serde(default)]
    pub error: Option<JsonValue>,
    /// Sender's hint on failure callbacks; defaults to retryable.
    #[serde(default)]
    pub retryable: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackStatus {
    Succeeded,
    Failed,
    Other(String),
}

impl CallbackStatus {
    pub fn classify(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "completed" | "succeeded" | "success" => CallbackStatus::Succeeded,
            "failed" | "error" => CallbackStatus::Failed,
            other => CallbackStatus::Other(other.to_string()),
        }
    }
}

/// A validated callback.
#[derive(Debug, Clone, PartialEq)]
struct Callback {
    external_job_id: ExternalJobId,
    tenant_id: TenantId,
    status: CallbackStatus,
    result: Option<JsonValue>,
    error: Option<JsonValue>,
    retryable: bool,
}

impl WebhookPayload {
    fn into_callback(self, task_id: Option<&str>) -> Result<Callback, WebhookError> {
        let header = task_id.map(str::trim).filter(|s| !s.is_empty());
        let raw_id = match (self.external_job_id, header) {
            (Some(body), Some(header)) if body.trim() != header => {
                return Err(WebhookError::MalformedPayload(
                    "externalJobId does not match Task-Id header".into(),
                ));
            }
            (Some(body), _) => body,
            (None, Some(header)) => header.to_string(),
            (None, None) => return Err(WebhookError::MalformedPayload("missing externalJobId".into())),
        };
        let external_job_id =
            ExternalJobId::parse(raw_id).map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;

        let tenant_id = self
            .tenant_id
            .ok_or_else(|| WebhookError::MalformedPayload("missing tenantId".into()))?
            .parse::<TenantId>()
            .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;

        Ok(Callback {
            external_job_id,
            tenant_id,
            status: CallbackStatus::classify(self.status.as_deref().unwrap_or_default()),
            result: self.result,
            error: self.error,
            retryable: self.retryable.unwrap_or(true),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IgnoreReason {
    UnknownJob,
    UnknownStatus { status: String },
    AlreadyTerminal { status: JobStatus },
    /// The failure of the current attempt is already on record; a retry is scheduled.
    AlreadyRecorded { job_id: JobId, next_retry_at: Option<DateTime<Utc>> },
}

/// What a callback did. Every variant answers 200.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Disposition {
    Applied { job_id: JobId },
    Duplicate { job_id: JobId },
    RetryScheduled { job_id: JobId, next_retry_at: Option<DateTime<Utc>> },
    Failed { job_id: JobId },
    Ignored { reason: IgnoreReason },
}

impl Disposition {
    fn from_outcome(outcome: ProcessOutcome) -> Self {
        match outcome {
            ProcessOutcome::Applied(j) => Disposition::Applied { job_id: j.id },
            ProcessOutcome::Duplicate(j) => Disposition::Duplicate { job_id: j.id },
            ProcessOutcome::RetryScheduled(j) => Disposition::RetryScheduled {
                job_id: j.id,
                next_retry_at: j.next_retry_at,
            },
            ProcessOutcome::Failed(j) => Disposition::Failed { job_id: j.id },
        }
    }
}

/// Rejections. Anything else is a [`Disposition`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WebhookError {
    #[error("authentication failed: {0}")]
    Authentication(#[from] WebhookAuthError),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("job does not belong to the claimed tenant")]
    TenantMismatch { external_job_id: ExternalJobId },

    #[error("internal error: {0}")]
    Internal(String),
}

impl WebhookError {
    pub fn status_code(&self) -> u16 {
        match self {
            WebhookError::Authentication(_) => 401,
            WebhookError::MalformedPayload(_) => 400,
            WebhookError::TenantMismatch { .. } => 403,
            WebhookError::Internal(_) => 500,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            WebhookError::Authentication(_) => "unauthorized",
            WebhookError::MalformedPayload(_) => "bad_request",
            WebhookError::TenantMismatch { .. } => "forbidden",
            WebhookError::Internal(_) => "internal_error",
        }
    }

    /// Only server-side faults are worth a redelivery.
    pub fn is_retryable_by_sender(&self) -> bool {
        matches!(self, WebhookError::Internal(_))
    }
}

pub struct WebhookDispatcher<S, B> {
    authenticator: WebhookAuthenticator,
    processor: Arc<ResultProcessor<S, B>>,
    client: Arc<dyn InferenceClient>,
    fetch_timeout: Duration,
}

impl<S, B> WebhookDispatcher<S, B>
where
    S: JobStore,
    B: EventBus<EventEnvelope<JobEvent>>,
{
    pub fn new(
        authenticator: WebhookAuthenticator,
        processor: Arc<ResultProcessor<S, B>>,
        client: Arc<dyn InferenceClient>,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            authenticator,
            processor,
            client,
            fetch_timeout,
        }
    }

    pub async fn dispatch(&self, request: WebhookRequest<'_>) -> Result<Disposition, WebhookError> {
        let metrics = self.processor.metrics();
        metrics.incr(Counter::WebhooksReceived);

        let result = self.dispatch_inner(request).await;
        match &result {
            Ok(Disposition::Ignored { .. }) => metrics.incr(Counter::WebhooksIgnored),
            Err(e) if !e.is_retryable_by_sender() => metrics.incr(Counter::WebhooksRejected),
            _ => {}
        }
        result
    }

    async fn dispatch_inner(&self, request: WebhookRequest<'_>) -> Result<Disposition, WebhookError> {
        self.authenticator
            .verify(request.body, request.signature, request.timestamp, Utc::now())
            .map_err(|e| {
                warn!(target: SECURITY_TARGET, error = %e, "webhook authentication failed");
                WebhookError::Authentication(e)
            })?;

        let payload: WebhookPayload = serde_json::from_slice(request.body)
            .map_err(|e| WebhookError::MalformedPayload(e.to_string()))?;
        let callback = payload.into_callback(request.task_id)?;

        let candidates = self
            .processor
            .lifecycle()
            .store()
            .find_by_external_id(&callback.external_job_id)
            .map_err(|e| WebhookError::Internal(e.to_string()))?;

        if candidates.is_empty() {
            info!(
                target: AUDIT_TARGET,
                tenant = %callback.tenant_id,
                external_job_id = %callback.external_job_id,
                status = ?callback.status,
                "authenticated callback for unknown external job id; ignored"
            );
            return Ok(Disposition::Ignored {
                reason: IgnoreReason::UnknownJob,
            });
        }

        let owners: Vec<TenantId> = candidates.iter().map(|j| j.tenant_id).collect();
        let Some(job) = candidates.into_iter().find(|j| j.tenant_id == callback.tenant_id) else {
            warn!(
                target: SECURITY_TARGET,
                claimed_tenant = %callback.tenant_id,
                owner_tenants = ?owners,
                external_job_id = %callback.external_job_id,
                "callback claims a tenant that does not own the job"
            );
            return Err(WebhookError::TenantMismatch {
                external_job_id: callback.external_job_id,
            });
        };

        match job.status {
            JobStatus::Succeeded => {
                self.processor.metrics().incr(Counter::DuplicateDeliveries);
                info!(tenant = %job.tenant_id, job_id = %job.id, "job already succeeded; delivery acknowledged");
                return Ok(Disposition::Duplicate { job_id: job.id });
            }
            JobStatus::Failed | JobStatus::Timeout => {
                info!(
                    target: AUDIT_TARGET,
                    tenant = %job.tenant_id,
                    job_id = %job.id,
                    status = %job.status,
                    "late callback for terminal job ignored"
                );
                return Ok(Disposition::Ignored {
                    reason: IgnoreReason::AlreadyTerminal { status: job.status },
                });
            }
            JobStatus::Pending if callback.status == CallbackStatus::Failed => {
                return Ok(self.already_recorded(&job));
            }
            JobStatus::Pending | JobStatus::Running => {}
        }

        let outcome = match callback.status {
            CallbackStatus::Succeeded => match self.obtain_result(&job, callback.result).await {
                Ok(raw) => self.processor.apply_result(&job, raw),
                Err(e) => {
                    warn!(tenant = %job.tenant_id, job_id = %job.id, error = %e, "result fetch failed");
                    let kind = if e.is_transient() || e == ClientError::NotReady {
                        FailureKind::Transient
                    } else {
                        FailureKind::Permanent
                    };
                    self.processor
                        .record_failure(&job, format!("result fetch failed: {e}"), None, kind)
                }
            },
            CallbackStatus::Failed => {
                let (message, details) = failure_message(callback.error);
                let kind = if callback.retryable {
                    FailureKind::Transient
                } else {
                    FailureKind::Permanent
                };
                self.processor.record_failure(&job, message, details, kind)
            }
            CallbackStatus::Other(status) => {
                info!(
                    tenant = %job.tenant_id,
                    job_id = %job.id,
                    status = %status,
                    "callback with unrecognised status ignored"
                );
                return Ok(Disposition::Ignored {
                    reason: IgnoreReason::UnknownStatus { status },
                });
            }
        };

        match outcome {
            Ok(outcome) => Ok(Disposition::from_outcome(outcome)),
            Err(LifecycleError::InvalidTransition {
                from: JobStatus::Pending,
                ..
            }) => Ok(self.already_recorded(&job)),
            Err(LifecycleError::InvalidTransition { from, .. }) => {
                info!(
                    target: AUDIT_TARGET,
                    tenant = %job.tenant_id,
                    job_id = %job.id,
                    status = %from,
                    "callback lost a race with another transition; ignored"
                );
                Ok(Disposition::Ignored {
                    reason: IgnoreReason::AlreadyTerminal { status: from },
                })
            }
            Err(e) => {
                error!(tenant = %job.tenant_id, job_id = %job.id, error = %e, "callback processing failed");
                Err(WebhookError::Internal(e.to_string()))
            }
        }
    }

    fn already_recorded(&self, job: &Job) -> Disposition {
        self.processor.metrics().incr(Counter::DuplicateDeliveries);
        info!(
            target: AUDIT_TARGET,
            tenant = %job.tenant_id,
            job_id = %job.id,
            attempt = job.attempt,
            next_retry_at = ?job.next_retry_at,
            "failure already recorded for this attempt; callback ignored"
        );
        Disposition::Ignored {
            reason: IgnoreReason::AlreadyRecorded {
                job_id: job.id,
                next_retry_at: job.next_retry_at,
            },
        }
    }

    async fn obtain_result(&self, job: &Job, inline: Option<JsonValue>) -> Result<JsonValue, ClientError> {
        if let Some(result) = inline {
            return Ok(result);
        }
        let Some(external_job_id) = job.external_job_id.as_ref() else {
            return Err(ClientError::InvalidResponse("job has no external id".into()));
        };
        with_timeout(
            self.fetch_timeout,
            self.client.fetch_job_result(job.tenant_id, external_job_id),
        )
        .await
    }
}

fn failure_message(error: Option<JsonValue>) -> (String, Option<JsonValue>) {
    const DEFAULT: &str = "remote job failed";
    match error {
        Some(JsonValue::String(s)) if !s.trim().is_empty() => (s, None),
        Some(JsonValue::Object(map)) => {
            let message = map
                .get("message")
                .and_then(JsonValue::as_str)
                .unwrap_or(DEFAULT)
                .to_string();
            (message, Some(JsonValue::Object(map)))
        }
        _ => (DEFAULT.to_string(), None),
    }
}
