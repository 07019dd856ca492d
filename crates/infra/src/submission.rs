//! Outbound side: submitting jobs and retrying the ones that are due.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

use inferlink_core::TenantId;
use inferlink_events::{EventBus, EventEnvelope, JobEvent};
use inferlink_jobs::{CreateOutcome, FailureKind, Job, JobKind, JobStore, LifecycleError, TargetRef};

use crate::client::{ClientError, InferenceClient, with_timeout};
use crate::processor::{ProcessOutcome, ResultProcessor};
use crate::workers::{WorkerHandle, spawn_periodic};

#[derive(Debug, Clone)]
pub struct SubmissionConfig {
    pub submit_timeout: Duration,
    pub fetch_timeout: Duration,
    /// Max due jobs handled per retry pass.
    pub batch: usize,
    /// A never-scheduled `pending` job younger than this is assumed to have a
    /// first submission in flight and is left alone by the retry pass.
    pub orphan_grace: Duration,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            submit_timeout: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(30),
            batch: 100,
            orphan_grace: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Accepted remotely; waiting for the callback.
    Running(Job),
    /// Duplicate of a live job; nothing was sent.
    Existing(Job),
    /// A result or failure was recorded.
    Recorded(ProcessOutcome),
}

impl SubmitOutcome {
    pub fn job(&self) -> &Job {
        match self {
            SubmitOutcome::Running(j) | SubmitOutcome::Existing(j) => j,
            SubmitOutcome::Recorded(o) => o.job(),
        }
    }
}

/// Counts from one retry pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    pub resubmitted: usize,
    pub polled: usize,
    pub skipped: usize,
    pub errors: usize,
}

pub struct SubmissionService<S, B> {
    processor: Arc<ResultProcessor<S, B>>,
    client: Arc<dyn InferenceClient>,
    config: SubmissionConfig,
}

fn failure_kind(e: &ClientError) -> FailureKind {
    if e.is_transient() {
        FailureKind::Transient
    } else {
        FailureKind::Permanent
    }
}

impl<S, B> SubmissionService<S, B>
where
    S: JobStore + 'static,
    B: EventBus<EventEnvelope<JobEvent>> + 'static,
{
    pub fn new(processor: Arc<ResultProcessor<S, B>>, client: Arc<dyn InferenceClient>, config: SubmissionConfig) -> Self {
        Self {
            processor,
            client,
            config,
        }
    }

    /// Create a job and submit it, unless an equivalent job already exists.
    pub async fn submit_new(
        &self,
        tenant_id: TenantId,
        kind: JobKind,
        input: JsonValue,
        target_refs: Vec<TargetRef>,
    ) -> Result<SubmitOutcome, LifecycleError> {
        match self.processor.lifecycle().create(tenant_id, kind, input, target_refs)? {
            CreateOutcome::Created(job) => self.submit(&job).await,
            CreateOutcome::Existing(job) => Ok(SubmitOutcome::Existing(job)),
        }
    }

    /// Send a `pending` job to the inference service.
    pub async fn submit(&self, job: &Job) -> Result<SubmitOutcome, LifecycleError> {
        let submitted = with_timeout(
            self.config.submit_timeout,
            self.client.submit_job(job.tenant_id, &job.kind, &job.input),
        )
        .await;

        match submitted {
            Ok(external_job_id) => {
                let job = self.processor.lifecycle().mark_running(job, Some(external_job_id))?;
                Ok(SubmitOutcome::Running(job))
            }
            Err(e) => {
                warn!(tenant = %job.tenant_id, job_id = %job.id, error = %e, "job submission failed");
                let outcome = self.processor.record_submission_failure(
                    job,
                    format!("submission failed: {e}"),
                    None,
                    failure_kind(&e),
                )?;
                Ok(SubmitOutcome::Recorded(outcome))
            }
        }
    }

    /// Ask for the result of a job the service already accepted.
    pub async fn poll(&self, job: &Job) -> Result<SubmitOutcome, LifecycleError> {
        let Some(external_job_id) = job.external_job_id.as_ref() else {
            return self.submit(job).await;
        };

        let fetched = with_timeout(
            self.config.fetch_timeout,
            self.client.fetch_job_result(job.tenant_id, external_job_id),
        )
        .await;

        match fetched {
            Ok(raw) => Ok(SubmitOutcome::Recorded(self.processor.apply_result(job, raw)?)),
            Err(ClientError::NotReady) => {
                // still working remotely; go back to waiting for the callback
                let job = self.processor.lifecycle().mark_waiting(job)?;
                Ok(SubmitOutcome::Running(job))
            }
            Err(e) => {
                warn!(tenant = %job.tenant_id, job_id = %job.id, error = %e, "result fetch failed");
                let outcome = self.processor.record_submission_failure(
                    job,
                    format!("result fetch failed: {e}"),
                    None,
                    failure_kind(&e),
                )?;
                Ok(SubmitOutcome::Recorded(outcome))
            }
        }
    }

    /// Handle every `pending` job whose retry time has come.
    ///
    /// Jobs without an external id are resubmitted; jobs with one are
    /// re-polled, since the external id never changes.
    pub async fn run_due_retries(&self, now: DateTime<Utc>) -> Result<RetryReport, LifecycleError> {
        let grace = chrono::Duration::from_std(self.config.orphan_grace).unwrap_or(chrono::Duration::zero());
        let mut report = RetryReport::default();

        for job in self.processor.lifecycle().due_for_retry(now, self.config.batch)? {
            if job.next_retry_at.is_none() && job.age(now) < grace {
                report.skipped += 1;
                continue;
            }

            let result = if job.external_job_id.is_some() {
                report.polled += 1;
                self.poll(&job).await
            } else {
                report.resubmitted += 1;
                self.submit(&job).await
            };

            match result {
                Ok(outcome) => {
                    debug!(job_id = %job.id, status = %outcome.job().status, "retry handled");
                }
                Err(e) if e.is_invalid_transition() => {
                    debug!(job_id = %job.id, "job moved on before its retry ran");
                }
                Err(e) => {
                    report.errors += 1;
                    error!(tenant = %job.tenant_id, job_id = %job.id, error = %e, "retry failed");
                }
            }
        }

        if report != RetryReport::default() {
            info!(
                resubmitted = report.resubmitted,
                polled = report.polled,
                skipped = report.skipped,
                errors = report.errors,
                "retry pass finished"
            );
        }
        Ok(report)
    }

    pub fn spawn_retry_loop(self: Arc<Self>, interval: Duration) -> WorkerHandle {
        spawn_periodic("retry-worker", interval, move |now| {
            let service = self.clone();
            async move {
                if let Err(e) = service.run_due_retries(now).await {
                    error!(error = %e, "retry pass failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use inferlink_core::ExternalJobId;
    use inferlink_events::InMemoryEventBus;
    use inferlink_jobs::{InMemoryJobStore, JobLifecycle, JobStatus, RetryPolicy};
    use inferlink_observability::{Counter, Metrics};
    use serde_json::json;

    use crate::effects::InMemoryResultSink;
    use crate::normalize::PassthroughNormalizer;

    type Bus = Arc<InMemoryEventBus<EventEnvelope<JobEvent>>>;

    /// Replays queued responses; panics if a call was not scripted.
    #[derive(Default)]
    struct ScriptedClient {
        submits: Mutex<VecDeque<Result<ExternalJobId, ClientError>>>,
        fetches: Mutex<VecDeque<Result<JsonValue, ClientError>>>,
    }

    #[async_trait]
    impl InferenceClient for ScriptedClient {
        async fn submit_job(&self, _: TenantId, _: &JobKind, _: &JsonValue) -> Result<ExternalJobId, ClientError> {
            self.submits.lock().unwrap().pop_front().expect("unexpected submit")
        }

        async fn fetch_job_result(&self, _: TenantId, _: &ExternalJobId) -> Result<JsonValue, ClientError> {
            self.fetches.lock().unwrap().pop_front().expect("unexpected fetch")
        }
    }

    struct Fixture {
        service: SubmissionService<Arc<InMemoryJobStore>, Bus>,
        client: Arc<ScriptedClient>,
        sink: Arc<InMemoryResultSink>,
        metrics: Arc<Metrics>,
    }

    fn fixture() -> Fixture {
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let lifecycle = Arc::new(JobLifecycle::new(InMemoryJobStore::arc(), bus, RetryPolicy::default()));
        let sink = Arc::new(InMemoryResultSink::new());
        let metrics = Arc::new(Metrics::new());
        let processor = Arc::new(ResultProcessor::new(
            lifecycle,
            Arc::new(PassthroughNormalizer),
            sink.clone(),
            metrics.clone(),
        ));
        let client = Arc::new(ScriptedClient::default());
        let service = SubmissionService::new(processor, client.clone(), SubmissionConfig::default());
        Fixture {
            service,
            client,
            sink,
            metrics,
        }
    }

    fn ext(id: &str) -> ExternalJobId {
        ExternalJobId::parse(id).unwrap()
    }

    #[tokio::test]
    async fn accepted_submission_marks_running() {
        let f = fixture();
        f.client.submits.lock().unwrap().push_back(Ok(ext("remote-1")));

        let outcome = f
            .service
            .submit_new(TenantId::new(), JobKind::Analysis, json!({"t": 1}), vec![])
            .await
            .unwrap();

        let SubmitOutcome::Running(job) = outcome else {
            panic!("expected running, got {outcome:?}");
        };
        assert_eq!(job.external_job_id, Some(ext("remote-1")));
        assert_eq!(job.attempt, 1);
    }

    #[tokio::test]
    async fn duplicate_submission_is_not_sent_twice() {
        let f = fixture();
        f.client.submits.lock().unwrap().push_back(Ok(ext("remote-1")));
        let tenant = TenantId::new();

        let first = f.service.submit_new(tenant, JobKind::Analysis, json!({"t": 1}), vec![]).await.unwrap();
        let second = f.service.submit_new(tenant, JobKind::Analysis, json!({"t": 1}), vec![]).await.unwrap();

        assert!(matches!(second, SubmitOutcome::Existing(ref j) if j.id == first.job().id));
    }

    #[tokio::test]
    async fn transport_failure_schedules_retry() {
        let f = fixture();
        f.client
            .submits
            .lock()
            .unwrap()
            .push_back(Err(ClientError::Transport("connection reset".into())));

        let outcome = f
            .service
            .submit_new(TenantId::new(), JobKind::Analysis, json!({}), vec![])
            .await
            .unwrap();

        let job = outcome.job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt, 1);
        assert!(job.next_retry_at.is_some());
        assert_eq!(f.metrics.get(Counter::JobsRetried), 1);
    }

    #[tokio::test]
    async fn client_rejection_is_permanent() {
        let f = fixture();
        f.client.submits.lock().unwrap().push_back(Err(ClientError::Rejected {
            status: 422,
            message: "bad payload".into(),
        }));

        let outcome = f
            .service
            .submit_new(TenantId::new(), JobKind::Analysis, json!({}), vec![])
            .await
            .unwrap();

        assert_eq!(outcome.job().status, JobStatus::Failed);
        assert_eq!(f.metrics.get(Counter::JobsFailed), 1);
    }

    #[tokio::test]
    async fn due_retry_resubmits_or_polls() {
        let f = fixture();
        let tenant = TenantId::new();

        // a: submission failed, no external id -> resubmit
        f.client
            .submits
            .lock()
            .unwrap()
            .push_back(Err(ClientError::Timeout(Duration::from_secs(30))));
        let a = f.service.submit_new(tenant, JobKind::Analysis, json!({"a": 1}), vec![]).await.unwrap();

        // b: accepted, then a transient failure callback -> poll
        f.client.submits.lock().unwrap().push_back(Ok(ext("remote-b")));
        let b = f
            .service
            .submit_new(tenant, JobKind::Analysis, json!({"b": 1}), vec![TargetRef::new("doc", "b")])
            .await
            .unwrap();
        f.service
            .processor
            .record_failure(b.job(), "worker restarted", None, FailureKind::Transient)
            .unwrap();

        f.client.submits.lock().unwrap().push_back(Ok(ext("remote-a")));
        f.client.fetches.lock().unwrap().push_back(Ok(json!({"label": "x"})));

        let later = Utc::now() + chrono::Duration::seconds(10);
        let report = f.service.run_due_retries(later).await.unwrap();
        assert_eq!(report.resubmitted, 1);
        assert_eq!(report.polled, 1);
        assert_eq!(report.errors, 0);

        let lifecycle = f.service.processor.lifecycle();
        let a = lifecycle.get(tenant, a.job().id).unwrap().unwrap();
        assert_eq!(a.status, JobStatus::Running);
        assert_eq!(a.external_job_id, Some(ext("remote-a")));

        let b = lifecycle.get(tenant, b.job().id).unwrap().unwrap();
        assert_eq!(b.status, JobStatus::Succeeded);
        assert_eq!(b.external_job_id, Some(ext("remote-b")));
        assert_eq!(f.sink.for_job(b.id).len(), 1);
    }

    #[tokio::test]
    async fn fresh_unscheduled_jobs_are_left_to_their_submitter() {
        let f = fixture();
        f.service
            .processor
            .lifecycle()
            .create(TenantId::new(), JobKind::Analysis, json!({}), vec![])
            .unwrap();

        let report = f.service.run_due_retries(Utc::now()).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.resubmitted, 0);
    }

    #[tokio::test]
    async fn not_ready_result_waits_without_a_new_attempt() {
        let f = fixture();
        f.client.submits.lock().unwrap().push_back(Ok(ext("remote-1")));
        let job = f
            .service
            .submit_new(TenantId::new(), JobKind::Analysis, json!({}), vec![])
            .await
            .unwrap()
            .job()
            .clone();
        let pending = f
            .service
            .processor
            .record_failure(&job, "callback lost", None, FailureKind::Transient)
            .unwrap();

        f.client.fetches.lock().unwrap().push_back(Err(ClientError::NotReady));
        let outcome = f.service.poll(pending.job()).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Running(ref j) if j.attempt == 1));
    }

    #[tokio::test]
    async fn failed_poll_counts_as_an_attempt() {
        let f = fixture();
        f.client.submits.lock().unwrap().push_back(Ok(ext("remote-1")));
        let job = f
            .service
            .submit_new(TenantId::new(), JobKind::Analysis, json!({}), vec![])
            .await
            .unwrap()
            .job()
            .clone();
        let pending = f
            .service
            .processor
            .record_failure(&job, "callback lost", None, FailureKind::Transient)
            .unwrap();

        f.client
            .fetches
            .lock()
            .unwrap()
            .push_back(Err(ClientError::Transport("connection reset".into())));
        let outcome = f.service.poll(pending.job()).await.unwrap();

        let SubmitOutcome::Recorded(ProcessOutcome::RetryScheduled(job)) = outcome else {
            panic!("expected a scheduled retry, got {outcome:?}");
        };
        assert_eq!(job.attempt, 2);
        assert_eq!(f.metrics.get(Counter::JobsRetried), 2);
    }
}
