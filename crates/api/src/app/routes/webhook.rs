use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};

use inferlink_infra::WebhookRequest;

use crate::app::{errors, services::AppServices};

pub const SIGNATURE_HEADER: &str = "signature";
pub const TIMESTAMP_HEADER: &str = "timestamp";
pub const TASK_ID_HEADER: &str = "task-id";

/// Inference service callback. The body is taken as raw bytes so the
/// signature is checked over exactly what was sent.
pub async fn receive(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    body: Bytes,
) -> axum::response::Response {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let request = WebhookRequest {
        body: &body,
        signature: header(SIGNATURE_HEADER),
        timestamp: header(TIMESTAMP_HEADER),
        task_id: header(TASK_ID_HEADER),
    };

    match services.dispatcher.dispatch(request).await {
        Ok(disposition) => (StatusCode::OK, Json(disposition)).into_response(),
        Err(e) => errors::webhook_error_to_response(&e),
    }
}
