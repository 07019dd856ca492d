use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use inferlink_core::{ExternalJobId, JobId, TenantId};
use inferlink_jobs::{Job, JobStatus, TargetRef};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub kind: String,
    pub input: JsonValue,
    #[serde(default)]
    pub target_refs: Vec<TargetRef>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

// -------------------------
// Response DTOs
// -------------------------

/// Job as returned to API callers. Input and error details stay internal.
#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub kind: String,
    pub status: JobStatus,
    pub external_job_id: Option<ExternalJobId>,
    pub target_refs: Vec<TargetRef>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub output: Option<JsonValue>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobResponse {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            tenant_id: job.tenant_id,
            kind: job.kind.type_name().to_string(),
            status: job.status,
            external_job_id: job.external_job_id.clone(),
            target_refs: job.target_refs.clone(),
            attempt: job.attempt,
            max_attempts: job.max_attempts,
            output: job.output.clone(),
            error_message: job.error_message.clone(),
            created_at: job.created_at,
            updated_at: job.updated_at,
            next_retry_at: job.next_retry_at,
            completed_at: job.completed_at,
        }
    }
}
