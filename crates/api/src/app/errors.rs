use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::error;

use inferlink_infra::WebhookError;
use inferlink_jobs::{JobStatus, JobStoreError, LifecycleError};

pub fn webhook_error_to_response(err: &WebhookError) -> axum::response::Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    match err {
        // internal detail stays in the log
        WebhookError::Internal(_) => json_error(status, err.code(), "internal error"),
        _ => json_error(status, err.code(), err.to_string()),
    }
}

pub fn lifecycle_error_to_response(err: LifecycleError) -> axum::response::Response {
    match err {
        LifecycleError::NotFound(_) | LifecycleError::Store(JobStoreError::NotFound(_)) => {
            json_error(StatusCode::NOT_FOUND, "not_found", "not found")
        }
        LifecycleError::Store(JobStoreError::TenantIsolation) => {
            json_error(StatusCode::FORBIDDEN, "tenant_isolation", "tenant isolation violation")
        }
        LifecycleError::InvalidTransition { .. } | LifecycleError::ExternalIdConflict { .. } => {
            json_error(StatusCode::CONFLICT, "conflict", err.to_string())
        }
        LifecycleError::Hash(e) => json_error(StatusCode::BAD_REQUEST, "invalid_input", e.to_string()),
        other => {
            error!(error = %other, "job operation failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal error")
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn parse_status(s: &str) -> Result<JobStatus, axum::response::Response> {
    JobStatus::parse(s).ok_or_else(|| {
        json_error(
            StatusCode::BAD_REQUEST,
            "invalid_status",
            "status must be one of: pending, running, succeeded, failed, timeout",
        )
    })
}
