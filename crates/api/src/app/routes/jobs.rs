use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tracing::{info, warn};

use inferlink_core::JobId;
use inferlink_jobs::{CreateOutcome, JobKind};

use crate::app::{dto, errors, services::AppServices};
use crate::context::TenantContext;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_job).get(list_jobs))
        .route("/stats", get(job_stats))
        .route("/:id", get(get_job))
}

/// Create a job and hand its first submission to the task supervisor.
///
/// An equivalent live job (same kind, targets and input) is returned as-is
/// with 200 instead of 202.
pub async fn create_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Json(body): Json<dto::CreateJobRequest>,
) -> axum::response::Response {
    if body.kind.trim().is_empty() {
        return errors::json_error(StatusCode::BAD_REQUEST, "invalid_input", "kind must not be empty");
    }

    let outcome = match services.lifecycle.create(
        tenant.tenant_id(),
        JobKind::from(body.kind.as_str()),
        body.input,
        body.target_refs,
    ) {
        Ok(o) => o,
        Err(e) => return errors::lifecycle_error_to_response(e),
    };

    let job = match outcome {
        CreateOutcome::Existing(job) => {
            return (StatusCode::OK, Json(dto::JobResponse::from(&job))).into_response();
        }
        CreateOutcome::Created(job) => job,
    };

    let submission = services.submission.clone();
    let pending = job.clone();
    let spawned = services
        .supervisor
        .spawn(format!("submit:{}", job.id), async move {
            submission.submit(&pending).await.map(|_| ())
        })
        .await;
    match spawned {
        Ok(_) => info!(tenant = %job.tenant_id, job_id = %job.id, kind = %job.kind, "job accepted"),
        // left pending; the retry loop submits it once the grace period passes
        Err(e) => warn!(tenant = %job.tenant_id, job_id = %job.id, error = %e, "could not schedule submission"),
    }

    (StatusCode::ACCEPTED, Json(dto::JobResponse::from(&job))).into_response()
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    let status = match query.status.as_deref().map(errors::parse_status).transpose() {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);

    match services.lifecycle.list(tenant.tenant_id(), status, limit) {
        Ok(jobs) => Json(jobs.iter().map(dto::JobResponse::from).collect::<Vec<_>>()).into_response(),
        Err(e) => errors::lifecycle_error_to_response(e),
    }
}

pub async fn job_stats(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
) -> axum::response::Response {
    match services.lifecycle.stats(tenant.tenant_id()) {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => errors::lifecycle_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id: JobId = match id.parse() {
        Ok(id) => id,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job id"),
    };

    match services.lifecycle.get(tenant.tenant_id(), job_id) {
        Ok(Some(job)) => Json(dto::JobResponse::from(&job)).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "not found"),
        Err(e) => errors::lifecycle_error_to_response(e),
    }
}
