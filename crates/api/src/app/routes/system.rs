use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, Json};

use inferlink_observability::MetricsSnapshot;

use crate::app::services::AppServices;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn metrics(Extension(services): Extension<Arc<AppServices>>) -> Json<MetricsSnapshot> {
    Json(services.metrics.snapshot())
}
