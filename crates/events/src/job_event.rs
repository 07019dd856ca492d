use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use inferlink_core::{ContentHash, ExternalJobId};

/// Outcome of a job, published once per transition into a terminal state.
///
/// Scheduled retries are not announced; only the final word is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Succeeded {
        kind: String,
        external_job_id: Option<ExternalJobId>,
        output_hash: ContentHash,
        result: JsonValue,
    },
    FailedTerminally {
        kind: String,
        external_job_id: Option<ExternalJobId>,
        error: String,
        attempts: u32,
    },
    TimedOut {
        kind: String,
        external_job_id: Option<ExternalJobId>,
        attempts: u32,
    },
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Succeeded { .. } => "job.succeeded",
            JobEvent::FailedTerminally { .. } => "job.failed",
            JobEvent::TimedOut { .. } => "job.timed_out",
        }
    }
}
