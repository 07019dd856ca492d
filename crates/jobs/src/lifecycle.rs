//! The job state machine.
//!
//! Every transition re-reads the job inside [`JobStore::update_atomic`], so
//! the caller's copy may be stale without harm: decisions are made on the
//! row as it is under the lock. Outcome events are published from inside the
//! same critical section, which makes "status written" and "event published"
//! one unit: if publishing fails, the status is not written.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use inferlink_core::{ExternalJobId, JobId, TenantId, compute_content_hash};
use inferlink_events::{EventBus, EventEnvelope, JobEvent};

use crate::error::LifecycleError;
use crate::job::{Job, JobKind, JobStatus, SuccessTransition, TargetRef};
use crate::retry::RetryPolicy;
use crate::store::{InsertOutcome, JobStats, JobStore};

#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(Job),
    /// An equivalent submission is already live; nothing was inserted.
    Existing(Job),
}

impl CreateOutcome {
    pub fn job(&self) -> &Job {
        match self {
            CreateOutcome::Created(j) | CreateOutcome::Existing(j) => j,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            CreateOutcome::Created(j) | CreateOutcome::Existing(j) => j,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SuccessOutcome {
    /// Output stored, side effects applied, success event published.
    Applied(Job),
    /// Identical output was applied earlier; nothing happened this time.
    AlreadyApplied(Job),
}

impl SuccessOutcome {
    pub fn job(&self) -> &Job {
        match self {
            SuccessOutcome::Applied(j) | SuccessOutcome::AlreadyApplied(j) => j,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, SuccessOutcome::Applied(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Back to `pending` with `next_retry_at` set.
    RetryScheduled(Job),
    /// Terminal `failed`; failure event published.
    Failed(Job),
}

impl FailureOutcome {
    pub fn job(&self) -> &Job {
        match self {
            FailureOutcome::RetryScheduled(j) | FailureOutcome::Failed(j) => j,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FailureOutcome::Failed(_))
    }
}

/// Lifecycle manager: the only writer of job state.
pub struct JobLifecycle<S, B> {
    store: S,
    bus: B,
    policy: RetryPolicy,
}

impl<S, B> JobLifecycle<S, B>
where
    S: JobStore,
    B: EventBus<EventEnvelope<JobEvent>>,
{
    pub fn new(store: S, bus: B, policy: RetryPolicy) -> Self {
        Self { store, bus, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn publish(&self, job: &Job, now: DateTime<Utc>, event: JobEvent) -> Result<(), LifecycleError> {
        let name = event.name();
        self.bus
            .publish(EventEnvelope::new(job.tenant_id, job.id, now, event))
            .map_err(|e| LifecycleError::Publish(e.to_string()))?;
        debug!(tenant = %job.tenant_id, job_id = %job.id, event = name, "job event published");
        Ok(())
    }

    /// Insert a `pending` job, or return the live job with the same unique key.
    pub fn create(
        &self,
        tenant_id: TenantId,
        kind: JobKind,
        input: JsonValue,
        target_refs: Vec<TargetRef>,
    ) -> Result<CreateOutcome, LifecycleError> {
        let job = Job::new(tenant_id, kind, input, target_refs, self.policy.max_attempts, Utc::now())?;

        match self.store.insert_unique(job)? {
            InsertOutcome::Inserted(job) => {
                info!(tenant = %tenant_id, job_id = %job.id, kind = %job.kind, "job created");
                Ok(CreateOutcome::Created(job))
            }
            InsertOutcome::Existing(job) => {
                info!(
                    tenant = %tenant_id,
                    job_id = %job.id,
                    unique_key = %job.unique_key,
                    status = %job.status,
                    "duplicate submission; reusing existing job"
                );
                Ok(CreateOutcome::Existing(job))
            }
        }
    }

    /// pending → running.
    pub fn mark_running(&self, job: &Job, external_job_id: Option<ExternalJobId>) -> Result<Job, LifecycleError> {
        let now = Utc::now();
        let updated = self
            .store
            .update_atomic(job.tenant_id, job.id, |j| -> Result<Job, LifecycleError> {
                j.start_attempt(external_job_id, now)?;
                Ok(j.clone())
            })?;

        info!(
            tenant = %updated.tenant_id,
            job_id = %updated.id,
            external_job_id = ?updated.external_job_id.as_ref().map(ExternalJobId::as_str),
            attempt = updated.attempt,
            "job running"
        );
        Ok(updated)
    }

    /// Store a result and publish the success event.
    pub fn mark_succeeded(&self, job: &Job, output: JsonValue) -> Result<SuccessOutcome, LifecycleError> {
        self.mark_succeeded_with(job, output, |_| Ok(()))
    }

    /// Like [`mark_succeeded`](Self::mark_succeeded), running `apply` (the
    /// downstream writes) inside the same unit of work.
    ///
    /// `apply` runs only when the output is new. If it fails, or the event
    /// cannot be published, the job keeps its previous state.
    pub fn mark_succeeded_with<F>(
        &self,
        job: &Job,
        output: JsonValue,
        apply: F,
    ) -> Result<SuccessOutcome, LifecycleError>
    where
        F: FnOnce(&Job) -> Result<(), LifecycleError>,
    {
        let hash = compute_content_hash(&output)?;
        let now = Utc::now();

        let outcome = self.store.update_atomic(job.tenant_id, job.id, |j| -> Result<_, LifecycleError> {
            match j.record_success(output, hash.clone(), now)? {
                SuccessTransition::AlreadyApplied => Ok(SuccessOutcome::AlreadyApplied(j.clone())),
                SuccessTransition::Applied => {
                    apply(j)?;
                    let event = JobEvent::Succeeded {
                        kind: j.kind.type_name().to_string(),
                        external_job_id: j.external_job_id.clone(),
                        output_hash: hash.clone(),
                        result: j.output.clone().unwrap_or(JsonValue::Null),
                    };
                    self.publish(j, now, event)?;
                    Ok(SuccessOutcome::Applied(j.clone()))
                }
            }
        })?;

        match &outcome {
            SuccessOutcome::Applied(j) => {
                info!(tenant = %j.tenant_id, job_id = %j.id, output_hash = %hash, "job succeeded");
            }
            SuccessOutcome::AlreadyApplied(j) => {
                info!(tenant = %j.tenant_id, job_id = %j.id, output_hash = %hash, "duplicate result ignored");
            }
        }
        Ok(outcome)
    }

    /// Record a failure reported for a `running` job; schedule a retry if
    /// asked for and the policy allows.
    ///
    /// A `pending` job is rejected with `InvalidTransition`: its current
    /// attempt already failed, so a repeated report must not count again.
    pub fn mark_failed(
        &self,
        job: &Job,
        error_message: impl Into<String>,
        error_details: Option<JsonValue>,
        should_retry: bool,
    ) -> Result<FailureOutcome, LifecycleError> {
        self.record_failure(job, error_message.into(), error_details, should_retry, |j, _| j.begin_failure())
    }

    /// Record a failed submission (or result poll) made from `pending`.
    /// The failed call counts as an attempt.
    pub fn mark_submission_failed(
        &self,
        job: &Job,
        error_message: impl Into<String>,
        error_details: Option<JsonValue>,
        should_retry: bool,
    ) -> Result<FailureOutcome, LifecycleError> {
        self.record_failure(job, error_message.into(), error_details, should_retry, Job::begin_pending_failure)
    }

    /// pending → running for a job the external service still holds.
    /// Does not count an attempt.
    pub fn mark_waiting(&self, job: &Job) -> Result<Job, LifecycleError> {
        let now = Utc::now();
        let updated = self
            .store
            .update_atomic(job.tenant_id, job.id, |j| -> Result<Job, LifecycleError> {
                j.resume_waiting(now)?;
                Ok(j.clone())
            })?;

        info!(
            tenant = %updated.tenant_id,
            job_id = %updated.id,
            attempt = updated.attempt,
            "result not ready; waiting for callback"
        );
        Ok(updated)
    }

    fn record_failure<G>(
        &self,
        job: &Job,
        message: String,
        error_details: Option<JsonValue>,
        should_retry: bool,
        guard: G,
    ) -> Result<FailureOutcome, LifecycleError>
    where
        G: FnOnce(&mut Job, DateTime<Utc>) -> Result<(), LifecycleError>,
    {
        let now = Utc::now();

        let outcome = self.store.update_atomic(job.tenant_id, job.id, |j| -> Result<_, LifecycleError> {
            guard(j, now)?;

            if should_retry && self.policy.should_retry(j, now) {
                let retry_at = self.policy.next_retry_at(j.attempt, now);
                j.schedule_retry(message, error_details, retry_at, now);
                return Ok(FailureOutcome::RetryScheduled(j.clone()));
            }

            j.fail(message, error_details, now);
            let event = JobEvent::FailedTerminally {
                kind: j.kind.type_name().to_string(),
                external_job_id: j.external_job_id.clone(),
                error: j.error_message.clone().unwrap_or_default(),
                attempts: j.attempt,
            };
            self.publish(j, now, event)?;
            Ok(FailureOutcome::Failed(j.clone()))
        })?;

        match &outcome {
            FailureOutcome::RetryScheduled(j) => info!(
                tenant = %j.tenant_id,
                job_id = %j.id,
                attempt = j.attempt,
                next_retry_at = ?j.next_retry_at,
                error = j.error_message.as_deref().unwrap_or_default(),
                "job attempt failed; retry scheduled"
            ),
            FailureOutcome::Failed(j) => warn!(
                tenant = %j.tenant_id,
                job_id = %j.id,
                attempts = j.attempt,
                error = j.error_message.as_deref().unwrap_or_default(),
                "job failed terminally"
            ),
        }
        Ok(outcome)
    }

    /// Force a job past the absolute age window into `timeout`.
    pub fn mark_timeout(&self, job: &Job, now: DateTime<Utc>) -> Result<Job, LifecycleError> {
        let updated = self.store.update_atomic(job.tenant_id, job.id, |j| -> Result<Job, LifecycleError> {
            if !j.status.is_terminal() && !self.policy.is_expired(j, now) {
                return Err(LifecycleError::NotExpired(j.id));
            }
            j.expire(now)?;
            let event = JobEvent::TimedOut {
                kind: j.kind.type_name().to_string(),
                external_job_id: j.external_job_id.clone(),
                attempts: j.attempt,
            };
            self.publish(j, now, event)?;
            Ok(j.clone())
        })?;

        warn!(
            tenant = %updated.tenant_id,
            job_id = %updated.id,
            attempts = updated.attempt,
            created_at = %updated.created_at,
            "job timed out"
        );
        Ok(updated)
    }

    /// Move up to `batch` stale non-terminal jobs to `timeout`.
    ///
    /// Jobs that reach a terminal state between the scan and the lock are
    /// skipped.
    pub fn sweep_timeouts(&self, now: DateTime<Utc>, batch: usize) -> Result<Vec<Job>, LifecycleError> {
        let max_age = chrono::Duration::from_std(self.policy.max_age).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(max_age).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut timed_out = Vec::new();
        for job in self.store.list_stale(cutoff, batch)? {
            match self.mark_timeout(&job, now) {
                Ok(j) => timed_out.push(j),
                Err(e) if e.is_invalid_transition() => {
                    debug!(job_id = %job.id, "job settled before sweep reached it");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(timed_out)
    }

    pub fn get(&self, tenant_id: TenantId, job_id: JobId) -> Result<Option<Job>, LifecycleError> {
        Ok(self.store.get(tenant_id, job_id)?)
    }

    pub fn list(&self, tenant_id: TenantId, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>, LifecycleError> {
        Ok(self.store.list_by_status(tenant_id, status, limit)?)
    }

    pub fn due_for_retry(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, LifecycleError> {
        Ok(self.store.list_due(now, limit)?)
    }

    pub fn stats(&self, tenant_id: TenantId) -> Result<JobStats, LifecycleError> {
        Ok(self.store.stats(tenant_id)?)
    }
}
