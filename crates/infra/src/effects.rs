//! Downstream writes a successful result triggers.
//!
//! A sink runs inside the job's critical section (see
//! `JobLifecycle::mark_succeeded_with`); an error aborts the whole success
//! transition, so a sink must either apply everything or nothing.
//!
//! Sink writes are not rolled back when a later step of the transition
//! fails (the outcome event cannot be published, for instance). The result
//! is then applied again on redelivery, so a sink must be idempotent per
//! `(job id, output hash)`: repeating a write it already holds is a no-op.

use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use inferlink_core::{ContentHash, JobId, TenantId};
use inferlink_jobs::{Job, TargetRef};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("sink unavailable: {0}")]
    Unavailable(String),

    #[error("sink rejected result: {0}")]
    Rejected(String),
}

pub trait ResultSink: Send + Sync {
    /// Write `result` to every target of `job`. `job.processed_output_hash`
    /// identifies the output; a repeat with the same hash must not write twice.
    fn apply(&self, job: &Job, result: &JsonValue) -> Result<(), SinkError>;
}

/// One downstream entity update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedResult {
    pub tenant_id: TenantId,
    pub job_id: JobId,
    pub target: TargetRef,
    pub output_hash: Option<ContentHash>,
    pub result: JsonValue,
}

/// In-memory sink for tests/dev: keeps the latest write per job and target.
#[derive(Debug, Default)]
pub struct InMemoryResultSink {
    writes: Mutex<Vec<AppliedResult>>,
    failure: Mutex<Option<SinkError>>,
}

impl InMemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `apply` fail with `error` (or succeed again with `None`).
    pub fn set_failure(&self, error: Option<SinkError>) {
        if let Ok(mut slot) = self.failure.lock() {
            *slot = error;
        }
    }

    pub fn all(&self) -> Vec<AppliedResult> {
        self.writes.lock().map(|w| w.clone()).unwrap_or_default()
    }

    pub fn for_job(&self, job_id: JobId) -> Vec<AppliedResult> {
        self.all().into_iter().filter(|w| w.job_id == job_id).collect()
    }
}

impl ResultSink for InMemoryResultSink {
    fn apply(&self, job: &Job, result: &JsonValue) -> Result<(), SinkError> {
        let injected = self
            .failure
            .lock()
            .map_err(|_| SinkError::Unavailable("lock poisoned".into()))?
            .clone();
        if let Some(err) = injected {
            return Err(err);
        }

        let mut writes = self
            .writes
            .lock()
            .map_err(|_| SinkError::Unavailable("lock poisoned".into()))?;
        for target in &job.target_refs {
            let write = AppliedResult {
                tenant_id: job.tenant_id,
                job_id: job.id,
                target: target.clone(),
                output_hash: job.processed_output_hash.clone(),
                result: result.clone(),
            };
            match writes.iter_mut().find(|w| w.job_id == job.id && w.target == *target) {
                Some(existing) if existing.output_hash == write.output_hash => {}
                Some(existing) => *existing = write,
                None => writes.push(write),
            }
        }
        Ok(())
    }
}
