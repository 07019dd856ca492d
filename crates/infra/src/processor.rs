//! Applying results and failures to jobs.
//!
//! Shared by the webhook dispatcher (push) and the retry worker (poll), so a
//! result has the same effect whichever way it arrives.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::warn;

use inferlink_events::{EventBus, EventEnvelope, JobEvent};
use inferlink_jobs::{
    FailureKind, FailureOutcome, Job, JobLifecycle, JobStatus, JobStore, LifecycleError, SuccessOutcome,
};
use inferlink_observability::{Counter, Metrics};

use crate::effects::ResultSink;
use crate::normalize::ResultNormalizer;

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// First application of this result; side effects ran once.
    Applied(Job),
    /// Identical result already applied; nothing ran.
    Duplicate(Job),
    RetryScheduled(Job),
    Failed(Job),
}

impl ProcessOutcome {
    pub fn job(&self) -> &Job {
        match self {
            ProcessOutcome::Applied(j)
            | ProcessOutcome::Duplicate(j)
            | ProcessOutcome::RetryScheduled(j)
            | ProcessOutcome::Failed(j) => j,
        }
    }
}

pub struct ResultProcessor<S, B> {
    lifecycle: Arc<JobLifecycle<S, B>>,
    normalizer: Arc<dyn ResultNormalizer>,
    sink: Arc<dyn ResultSink>,
    metrics: Arc<Metrics>,
}

impl<S, B> ResultProcessor<S, B>
where
    S: JobStore,
    B: EventBus<EventEnvelope<JobEvent>>,
{
    pub fn new(
        lifecycle: Arc<JobLifecycle<S, B>>,
        normalizer: Arc<dyn ResultNormalizer>,
        sink: Arc<dyn ResultSink>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            lifecycle,
            normalizer,
            sink,
            metrics,
        }
    }

    pub fn lifecycle(&self) -> &Arc<JobLifecycle<S, B>> {
        &self.lifecycle
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Normalize `raw` and mark the job succeeded, writing to the sink in the
    /// same unit of work. An unusable result is a permanent failure.
    pub fn apply_result(&self, job: &Job, raw: JsonValue) -> Result<ProcessOutcome, LifecycleError> {
        let normalized = match self.normalizer.normalize(job, raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(tenant = %job.tenant_id, job_id = %job.id, error = %e, "result could not be normalized");
                let message = format!("normalization failed: {e}");
                return match job.status {
                    JobStatus::Pending => self.record_submission_failure(job, message, None, FailureKind::Permanent),
                    _ => self.record_failure(job, message, None, FailureKind::Permanent),
                };
            }
        };

        let sink = &self.sink;
        let null = JsonValue::Null;
        let outcome = self.lifecycle.mark_succeeded_with(job, normalized, |j| {
            sink.apply(j, j.output.as_ref().unwrap_or(&null))
                .map_err(|e| LifecycleError::SideEffect(e.to_string()))
        })?;

        Ok(match outcome {
            SuccessOutcome::Applied(j) => {
                self.metrics.incr(Counter::JobsSucceeded);
                ProcessOutcome::Applied(j)
            }
            SuccessOutcome::AlreadyApplied(j) => {
                self.metrics.incr(Counter::DuplicateDeliveries);
                ProcessOutcome::Duplicate(j)
            }
        })
    }

    /// Record a failure reported for a `running` job.
    pub fn record_failure(
        &self,
        job: &Job,
        message: impl Into<String>,
        details: Option<JsonValue>,
        kind: FailureKind,
    ) -> Result<ProcessOutcome, LifecycleError> {
        let outcome = self.lifecycle.mark_failed(job, message, details, kind.should_retry())?;
        Ok(self.count_failure(outcome))
    }

    /// Record a failed submission or poll made from `pending`; counts an attempt.
    pub fn record_submission_failure(
        &self,
        job: &Job,
        message: impl Into<String>,
        details: Option<JsonValue>,
        kind: FailureKind,
    ) -> Result<ProcessOutcome, LifecycleError> {
        let outcome = self.lifecycle.mark_submission_failed(job, message, details, kind.should_retry())?;
        Ok(self.count_failure(outcome))
    }

    fn count_failure(&self, outcome: FailureOutcome) -> ProcessOutcome {
        match outcome {
            FailureOutcome::RetryScheduled(j) => {
                self.metrics.incr(Counter::JobsRetried);
                ProcessOutcome::RetryScheduled(j)
            }
            FailureOutcome::Failed(j) => {
                self.metrics.incr(Counter::JobsFailed);
                ProcessOutcome::Failed(j)
            }
        }
    }
}
