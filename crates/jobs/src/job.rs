//! Job record and its pure state transitions.
//!
//! Nothing here touches storage or the clock; the lifecycle manager wraps
//! these in a store transaction and supplies `now`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use inferlink_core::{ContentHash, ExternalJobId, HashError, JobId, TenantId, compute_unique_key};

use crate::error::LifecycleError;

/// Job category. Decides which downstream entities a result touches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Analysis,
    Classification,
    Extraction,
    Summarization,
    Custom { kind: String },
}

impl JobKind {
    pub fn custom(kind: impl Into<String>) -> Self {
        Self::Custom { kind: kind.into() }
    }

    pub fn type_name(&self) -> &str {
        match self {
            JobKind::Analysis => "analysis",
            JobKind::Classification => "classification",
            JobKind::Extraction => "extraction",
            JobKind::Summarization => "summarization",
            JobKind::Custom { kind } => kind,
        }
    }
}

impl From<&str> for JobKind {
    fn from(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "analysis" => JobKind::Analysis,
            "classification" => JobKind::Classification,
            "extraction" => JobKind::Extraction,
            "summarization" => JobKind::Summarization,
            _ => JobKind::custom(name.trim()),
        }
    }
}

impl core::fmt::Display for JobKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.type_name())
    }
}

/// A downstream entity a job's result will be written to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetRef {
    pub entity_type: String,
    pub entity_id: String,
}

impl TargetRef {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, or waiting for a scheduled retry.
    Pending,
    /// Accepted by the external service; awaiting its result.
    Running,
    Succeeded,
    /// Retries exhausted or failure was permanent.
    Failed,
    /// Exceeded the absolute age limit without a terminal result.
    Timeout,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed | JobStatus::Timeout)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Timeout => "timeout",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(JobStatus::Pending),
            "running" => Some(JobStatus::Running),
            "succeeded" => Some(JobStatus::Succeeded),
            "failed" => Some(JobStatus::Failed),
            "timeout" => Some(JobStatus::Timeout),
            _ => None,
        }
    }

    /// Position in the partial order `pending < running < terminal`.
    pub fn rank(self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Running => 1,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Timeout => 2,
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a failure is worth another attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Permanent,
}

impl FailureKind {
    pub fn should_retry(self) -> bool {
        matches!(self, FailureKind::Transient)
    }
}

/// Record of one finished attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAttemptRecord {
    pub attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
}

/// Outcome of applying a result to a job record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SuccessTransition {
    /// Output stored; side effects must now be applied.
    Applied,
    /// Same output already applied; side effects must not run again.
    AlreadyApplied,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub kind: JobKind,
    pub target_refs: Vec<TargetRef>,
    /// `hash(kind, target_refs, input)`; duplicate submissions share it.
    pub unique_key: ContentHash,
    /// Set once, when the external service accepts the job.
    pub external_job_id: Option<ExternalJobId>,
    pub status: JobStatus,
    pub input: JsonValue,
    pub output: Option<JsonValue>,
    /// Hash of the output whose side effects were durably applied.
    pub processed_output_hash: Option<ContentHash>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub error_details: Option<JsonValue>,
    pub history: Vec<JobAttemptRecord>,
}

impl Job {
    /// Build a fresh `pending` job with no attempts.
    pub fn new(
        tenant_id: TenantId,
        kind: JobKind,
        input: JsonValue,
        target_refs: Vec<TargetRef>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Self, HashError> {
        let unique_key = compute_unique_key(kind.type_name(), &target_refs, &input)?;
        Ok(Self {
            id: JobId::new(),
            tenant_id,
            kind,
            target_refs,
            unique_key,
            external_job_id: None,
            status: JobStatus::Pending,
            input,
            output: None,
            processed_output_hash: None,
            attempt: 0,
            max_attempts,
            created_at: now,
            updated_at: now,
            last_attempt_at: None,
            next_retry_at: None,
            completed_at: None,
            error_message: None,
            error_details: None,
            history: Vec::new(),
        })
    }

    /// Pending and past its scheduled retry time (or never scheduled).
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.next_retry_at.is_none_or(|at| at <= now)
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }

    fn invalid(&self, operation: &'static str) -> LifecycleError {
        LifecycleError::InvalidTransition {
            job_id: self.id,
            from: self.status,
            operation,
        }
    }

    /// pending → running. Counts an attempt and pins the external id.
    pub fn start_attempt(
        &mut self,
        external_job_id: Option<ExternalJobId>,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        if self.status != JobStatus::Pending {
            return Err(self.invalid("mark running"));
        }
        self.pin_external_id(external_job_id)?;

        self.status = JobStatus::Running;
        self.attempt += 1;
        self.last_attempt_at = Some(now);
        self.next_retry_at = None;
        self.updated_at = now;
        Ok(())
    }

    fn pin_external_id(&mut self, external_job_id: Option<ExternalJobId>) -> Result<(), LifecycleError> {
        match (&self.external_job_id, external_job_id) {
            (Some(current), Some(new)) if *current != new => {
                Err(LifecycleError::ExternalIdConflict { job_id: self.id })
            }
            (None, Some(new)) => {
                self.external_job_id = Some(new);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Store a result. A byte-identical repeat is reported, not re-applied.
    ///
    /// Accepted from `running`, or from `pending` when the external service
    /// already knows the job (a late result racing a scheduled retry).
    pub fn record_success(
        &mut self,
        output: JsonValue,
        output_hash: ContentHash,
        now: DateTime<Utc>,
    ) -> Result<SuccessTransition, LifecycleError> {
        match self.status {
            JobStatus::Succeeded if self.processed_output_hash.as_ref() == Some(&output_hash) => {
                return Ok(SuccessTransition::AlreadyApplied);
            }
            JobStatus::Running => {}
            JobStatus::Pending if self.external_job_id.is_some() => {}
            _ => return Err(self.invalid("mark succeeded")),
        }

        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at: self.last_attempt_at,
            finished_at: now,
            success: true,
            error: None,
        });
        self.status = JobStatus::Succeeded;
        self.output = Some(output);
        self.processed_output_hash = Some(output_hash);
        self.completed_at = Some(now);
        self.next_retry_at = None;
        self.error_message = None;
        self.error_details = None;
        self.updated_at = now;
        Ok(SuccessTransition::Applied)
    }

    /// Guard for a failure reported while the external service holds the job.
    ///
    /// Only `running` qualifies; a `pending` job has already had this
    /// attempt's failure recorded.
    pub fn begin_failure(&self) -> Result<(), LifecycleError> {
        if self.status != JobStatus::Running {
            return Err(self.invalid("mark failed"));
        }
        Ok(())
    }

    /// Guard for a failed submission or result poll made from `pending`.
    /// That call was itself an attempt, so it is counted here.
    pub fn begin_pending_failure(&mut self, now: DateTime<Utc>) -> Result<(), LifecycleError> {
        if self.status != JobStatus::Pending {
            return Err(self.invalid("mark submission failed"));
        }
        self.attempt += 1;
        self.last_attempt_at = Some(now);
        Ok(())
    }

    /// pending → running without a new attempt: the external service still
    /// has the job and a callback is expected.
    pub fn resume_waiting(&mut self, now: DateTime<Utc>) -> Result<(), LifecycleError> {
        if self.status != JobStatus::Pending || self.external_job_id.is_none() {
            return Err(self.invalid("resume waiting"));
        }
        self.status = JobStatus::Running;
        self.next_retry_at = None;
        self.updated_at = now;
        Ok(())
    }

    fn record_attempt_error(&mut self, message: &str, now: DateTime<Utc>) {
        self.history.push(JobAttemptRecord {
            attempt: self.attempt,
            started_at: self.last_attempt_at,
            finished_at: now,
            success: false,
            error: Some(message.to_string()),
        });
    }

    /// Back to `pending`, to be picked up again at `retry_at`.
    pub fn schedule_retry(
        &mut self,
        message: String,
        details: Option<JsonValue>,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        self.record_attempt_error(&message, now);
        self.status = JobStatus::Pending;
        self.next_retry_at = Some(retry_at);
        self.error_message = Some(message);
        self.error_details = details;
        self.updated_at = now;
    }

    /// Terminal `failed`.
    pub fn fail(&mut self, message: String, details: Option<JsonValue>, now: DateTime<Utc>) {
        self.record_attempt_error(&message, now);
        self.status = JobStatus::Failed;
        self.next_retry_at = None;
        self.completed_at = Some(now);
        self.error_message = Some(message);
        self.error_details = details;
        self.updated_at = now;
    }

    /// Terminal `timeout`. Callers check the age window.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Result<(), LifecycleError> {
        if self.status.is_terminal() {
            return Err(self.invalid("mark timeout"));
        }
        self.status = JobStatus::Timeout;
        self.next_retry_at = None;
        self.completed_at = Some(now);
        self.error_message = Some("no terminal result before the absolute timeout".to_string());
        self.updated_at = now;
        Ok(())
    }
}
