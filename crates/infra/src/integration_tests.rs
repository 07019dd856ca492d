//! End-to-end webhook scenarios.
//!
//! Tests: signed callback → Authenticator → Dispatcher → Lifecycle → Store/Sink/EventBus
//!
//! Verifies:
//! - Results are applied effectively once under duplicate and concurrent delivery
//! - Tenant isolation holds regardless of signature validity
//! - Rejections never touch job state

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::{Value as JsonValue, json};

    use inferlink_auth::{AuthenticatorConfig, WebhookAuthError, WebhookAuthenticator, sign};
    use inferlink_core::{ExternalJobId, TenantId};
    use inferlink_events::{EventBus, EventEnvelope, InMemoryEventBus, JobEvent, Subscription};
    use inferlink_jobs::{InMemoryJobStore, Job, JobKind, JobLifecycle, JobStatus, RetryPolicy, TargetRef};
    use inferlink_observability::{Counter, Metrics};

    use crate::client::{ClientError, InferenceClient};
    use crate::dispatcher::{Disposition, IgnoreReason, WebhookDispatcher, WebhookError, WebhookRequest};
    use crate::effects::{InMemoryResultSink, SinkError};
    use crate::normalize::PassthroughNormalizer;
    use crate::processor::ResultProcessor;

    const SECRET: &str = "whsec_integration";

    type Bus = Arc<InMemoryEventBus<EventEnvelope<JobEvent>>>;
    type Dispatcher = WebhookDispatcher<Arc<InMemoryJobStore>, Bus>;

    #[derive(Default)]
    struct FetchOnlyClient {
        results: Mutex<VecDeque<Result<JsonValue, ClientError>>>,
    }

    #[async_trait]
    impl InferenceClient for FetchOnlyClient {
        async fn submit_job(&self, _: TenantId, _: &JobKind, _: &JsonValue) -> Result<ExternalJobId, ClientError> {
            Err(ClientError::Transport("not used here".into()))
        }

        async fn fetch_job_result(&self, _: TenantId, _: &ExternalJobId) -> Result<JsonValue, ClientError> {
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(ClientError::NotReady))
        }
    }

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        lifecycle: Arc<JobLifecycle<Arc<InMemoryJobStore>, Bus>>,
        events: Subscription<EventEnvelope<JobEvent>>,
        sink: Arc<InMemoryResultSink>,
        client: Arc<FetchOnlyClient>,
        metrics: Arc<Metrics>,
    }

    fn harness_with(auth: AuthenticatorConfig) -> Harness {
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let events = bus.subscribe();
        let lifecycle = Arc::new(JobLifecycle::new(InMemoryJobStore::arc(), bus, RetryPolicy::default()));
        let sink = Arc::new(InMemoryResultSink::new());
        let metrics = Arc::new(Metrics::new());
        let client = Arc::new(FetchOnlyClient::default());
        let processor = Arc::new(ResultProcessor::new(
            lifecycle.clone(),
            Arc::new(PassthroughNormalizer),
            sink.clone(),
            metrics.clone(),
        ));
        let dispatcher = Arc::new(WebhookDispatcher::new(
            WebhookAuthenticator::new(auth).unwrap(),
            processor,
            client.clone(),
            std::time::Duration::from_secs(1),
        ));
        Harness {
            dispatcher,
            lifecycle,
            events,
            sink,
            client,
            metrics,
        }
    }

    fn harness() -> Harness {
        harness_with(AuthenticatorConfig::with_secret(SECRET))
    }

    fn ext(id: &str) -> ExternalJobId {
        ExternalJobId::parse(id).unwrap()
    }

    impl Harness {
        fn running_job(&self, tenant: TenantId, external_id: &str) -> Job {
            let job = self
                .lifecycle
                .create(
                    tenant,
                    JobKind::Analysis,
                    json!({"text": external_id}),
                    vec![TargetRef::new("document", external_id)],
                )
                .unwrap()
                .into_job();
            self.lifecycle.mark_running(&job, Some(ext(external_id))).unwrap()
        }

        fn stored(&self, job: &Job) -> Job {
            self.lifecycle.get(job.tenant_id, job.id).unwrap().unwrap()
        }

        async fn deliver_at(&self, body: &JsonValue, skew_secs: i64) -> Result<Disposition, WebhookError> {
            signed_delivery(&self.dispatcher, body, skew_secs).await
        }

        async fn deliver(&self, body: &JsonValue) -> Result<Disposition, WebhookError> {
            self.deliver_at(body, 0).await
        }
    }

    async fn signed_delivery(
        dispatcher: &Dispatcher,
        body: &JsonValue,
        skew_secs: i64,
    ) -> Result<Disposition, WebhookError> {
        let raw = serde_json::to_vec(body).unwrap();
        let ts = (Utc::now().timestamp() + skew_secs).to_string();
        let sig = sign(SECRET.as_bytes(), &ts, &raw).unwrap();
        dispatcher
            .dispatch(WebhookRequest {
                body: &raw,
                signature: Some(&sig),
                timestamp: Some(&ts),
                task_id: None,
            })
            .await
    }

    fn completed(tenant: TenantId, external_id: &str, result: JsonValue) -> JsonValue {
        json!({
            "externalJobId": external_id,
            "tenantId": tenant.to_string(),
            "status": "completed",
            "result": result,
        })
    }

    fn failed(tenant: TenantId, external_id: &str, message: &str) -> JsonValue {
        json!({
            "externalJobId": external_id,
            "tenantId": tenant.to_string(),
            "status": "failed",
            "error": {"message": message},
        })
    }

    #[tokio::test]
    async fn completed_callback_applies_result_once() {
        let h = harness();
        let tenant = TenantId::new();
        let job = h.running_job(tenant, "ext-1");

        let d = h.deliver(&completed(tenant, "ext-1", json!({"label": "invoice"}))).await.unwrap();
        assert_eq!(d, Disposition::Applied { job_id: job.id });

        let stored = h.stored(&job);
        assert_eq!(stored.status, JobStatus::Succeeded);
        assert_eq!(stored.output, Some(json!({"label": "invoice"})));
        assert!(stored.processed_output_hash.is_some());
        assert_eq!(h.sink.for_job(job.id).len(), 1);

        let events = h.events.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tenant_id(), tenant);
        assert!(matches!(events[0].payload(), JobEvent::Succeeded { .. }));
    }

    #[tokio::test]
    async fn duplicate_delivery_is_acknowledged_without_side_effects() {
        let h = harness();
        let tenant = TenantId::new();
        let job = h.running_job(tenant, "ext-1");
        let body = completed(tenant, "ext-1", json!({"label": "invoice"}));

        h.deliver(&body).await.unwrap();
        let snapshot = h.stored(&job);
        let again = h.deliver(&body).await.unwrap();

        assert_eq!(again, Disposition::Duplicate { job_id: job.id });
        assert_eq!(h.stored(&job), snapshot);
        assert_eq!(h.sink.for_job(job.id).len(), 1);
        assert_eq!(h.events.drain().len(), 1);
        assert_eq!(h.metrics.get(Counter::DuplicateDeliveries), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_deliveries_apply_exactly_once() {
        let h = harness();
        let tenant = TenantId::new();
        let job = h.running_job(tenant, "ext-1");
        let body = Arc::new(completed(tenant, "ext-1", json!({"score": 0.5})));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let dispatcher = h.dispatcher.clone();
                let body = body.clone();
                tokio::spawn(async move { signed_delivery(&dispatcher, &body, 0).await.unwrap() })
            })
            .collect();

        let mut applied = 0;
        for t in tasks {
            if matches!(t.await.unwrap(), Disposition::Applied { .. }) {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
        assert_eq!(h.sink.for_job(job.id).len(), 1);
        assert_eq!(h.events.drain().len(), 1);
    }

    #[tokio::test]
    async fn stale_timestamp_is_rejected_before_parsing() {
        let h = harness();
        let tenant = TenantId::new();
        let job = h.running_job(tenant, "ext-1");

        let err = h
            .deliver_at(&completed(tenant, "ext-1", json!({"x": 1})), -600)
            .await
            .unwrap_err();

        assert_eq!(err, WebhookError::Authentication(WebhookAuthError::StaleRequest));
        assert_eq!(err.status_code(), 401);
        assert_eq!(h.stored(&job).status, JobStatus::Running);
        assert_eq!(h.metrics.get(Counter::WebhooksRejected), 1);
    }

    #[tokio::test]
    async fn bad_or_missing_signature_is_rejected() {
        let h = harness();
        let raw = br#"{"externalJobId":"ext-1"}"#;
        let ts = Utc::now().timestamp().to_string();

        let forged = h
            .dispatcher
            .dispatch(WebhookRequest {
                body: raw,
                signature: Some(&"0".repeat(64)),
                timestamp: Some(&ts),
                task_id: None,
            })
            .await;
        assert_eq!(forged, Err(WebhookError::Authentication(WebhookAuthError::InvalidSignature)));

        let unsigned = h
            .dispatcher
            .dispatch(WebhookRequest {
                body: raw,
                signature: None,
                timestamp: Some(&ts),
                task_id: None,
            })
            .await;
        assert_eq!(unsigned, Err(WebhookError::Authentication(WebhookAuthError::MissingCredentials)));
    }

    #[tokio::test]
    async fn foreign_tenant_claim_is_forbidden() {
        let h = harness();
        let tenant_a = TenantId::new();
        let tenant_b = TenantId::new();
        let job = h.running_job(tenant_a, "ext-1");

        let err = h
            .deliver(&completed(tenant_b, "ext-1", json!({"x": 1})))
            .await
            .unwrap_err();

        assert_eq!(err.status_code(), 403);
        assert!(matches!(err, WebhookError::TenantMismatch { .. }));
        assert_eq!(h.stored(&job).status, JobStatus::Running);
        assert!(h.sink.all().is_empty());
        assert!(h.events.drain().is_empty());
    }

    #[tokio::test]
    async fn shared_external_id_resolves_to_claimed_tenant() {
        let h = harness();
        let tenant_a = TenantId::new();
        let tenant_b = TenantId::new();
        let job_a = h.running_job(tenant_a, "shared");
        let job_b = h.running_job(tenant_b, "shared");

        let d = h.deliver(&completed(tenant_b, "shared", json!({"x": 1}))).await.unwrap();
        assert_eq!(d, Disposition::Applied { job_id: job_b.id });
        assert_eq!(h.stored(&job_a).status, JobStatus::Running);
    }

    #[tokio::test]
    async fn unknown_external_id_is_ignored() {
        let h = harness();
        let d = h
            .deliver(&completed(TenantId::new(), "never-seen", json!({"x": 1})))
            .await
            .unwrap();

        assert_eq!(
            d,
            Disposition::Ignored {
                reason: IgnoreReason::UnknownJob
            }
        );
        assert_eq!(h.metrics.get(Counter::WebhooksIgnored), 1);
    }

    #[tokio::test]
    async fn unrecognised_status_is_ignored() {
        let h = harness();
        let tenant = TenantId::new();
        let job = h.running_job(tenant, "ext-1");
        let body = json!({"externalJobId": "ext-1", "tenantId": tenant.to_string(), "status": "processing"});

        let d = h.deliver(&body).await.unwrap();
        assert!(matches!(d, Disposition::Ignored { reason: IgnoreReason::UnknownStatus { .. } }));
        assert_eq!(h.stored(&job).status, JobStatus::Running);
    }

    #[tokio::test]
    async fn malformed_body_is_a_bad_request() {
        let h = harness();
        let err = h.deliver(&json!({"status": "completed"})).await.unwrap_err();
        assert_eq!(err.status_code(), 400);

        let raw = b"not json";
        let ts = Utc::now().timestamp().to_string();
        let sig = sign(SECRET.as_bytes(), &ts, raw).unwrap();
        let err = h
            .dispatcher
            .dispatch(WebhookRequest {
                body: raw,
                signature: Some(&sig),
                timestamp: Some(&ts),
                task_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::MalformedPayload(_)));
    }

    #[tokio::test]
    async fn failure_callbacks_retry_then_fail_terminally() {
        let h = harness();
        let tenant = TenantId::new();
        let mut job = h.running_job(tenant, "ext-1");

        for attempt in 1..=5u32 {
            let d = h.deliver(&failed(tenant, "ext-1", "gpu evicted")).await.unwrap();
            job = h.stored(&job);
            assert_eq!(job.attempt, attempt);
            if attempt < 5 {
                assert!(matches!(d, Disposition::RetryScheduled { next_retry_at: Some(_), .. }));
                assert_eq!(job.status, JobStatus::Pending);
                job = h.lifecycle.mark_running(&job, None).unwrap();
            } else {
                assert_eq!(d, Disposition::Failed { job_id: job.id });
            }
        }

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("gpu evicted"));
        let events = h.events.drain();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].payload(), JobEvent::FailedTerminally { attempts: 5, .. }));
    }

    #[tokio::test]
    async fn redelivered_failure_callback_is_recorded_once() {
        let h = harness();
        let tenant = TenantId::new();
        let job = h.running_job(tenant, "ext-1");
        let body = failed(tenant, "ext-1", "gpu evicted");

        let first = h.deliver(&body).await.unwrap();
        let Disposition::RetryScheduled { next_retry_at, .. } = first else {
            panic!("expected a scheduled retry, got {first:?}");
        };

        for _ in 0..4 {
            let d = h.deliver(&body).await.unwrap();
            assert_eq!(
                d,
                Disposition::Ignored {
                    reason: IgnoreReason::AlreadyRecorded {
                        job_id: job.id,
                        next_retry_at,
                    }
                }
            );
        }

        let stored = h.stored(&job);
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.attempt, 1);
        assert_eq!(stored.history.len(), 1);
        assert_eq!(stored.next_retry_at, next_retry_at);
        assert_eq!(h.metrics.get(Counter::JobsRetried), 1);
        assert_eq!(h.metrics.get(Counter::JobsFailed), 0);
        assert!(h.events.drain().is_empty());
    }

    #[tokio::test]
    async fn late_success_still_lands_after_a_recorded_failure() {
        let h = harness();
        let tenant = TenantId::new();
        let job = h.running_job(tenant, "ext-1");

        h.deliver(&failed(tenant, "ext-1", "worker restarted")).await.unwrap();
        h.deliver(&failed(tenant, "ext-1", "worker restarted")).await.unwrap();

        let d = h.deliver(&completed(tenant, "ext-1", json!({"label": "ok"}))).await.unwrap();
        assert_eq!(d, Disposition::Applied { job_id: job.id });
        let stored = h.stored(&job);
        assert_eq!(stored.status, JobStatus::Succeeded);
        assert_eq!(stored.attempt, 1);
    }

    #[tokio::test]
    async fn non_retryable_failure_is_terminal_at_once() {
        let h = harness();
        let tenant = TenantId::new();
        let job = h.running_job(tenant, "ext-1");
        let mut body = failed(tenant, "ext-1", "unsupported language");
        body["retryable"] = json!(false);

        let d = h.deliver(&body).await.unwrap();
        assert_eq!(d, Disposition::Failed { job_id: job.id });
        assert_eq!(h.stored(&job).attempt, 1);
    }

    #[tokio::test]
    async fn missing_inline_result_is_fetched() {
        let h = harness();
        let tenant = TenantId::new();
        let job = h.running_job(tenant, "ext-1");
        h.client.results.lock().unwrap().push_back(Ok(json!({"result": {"label": "fetched"}})));
        let body = json!({"externalJobId": "ext-1", "tenantId": tenant.to_string(), "status": "succeeded"});

        let d = h.deliver(&body).await.unwrap();
        assert_eq!(d, Disposition::Applied { job_id: job.id });
        assert_eq!(h.stored(&job).output, Some(json!({"label": "fetched"})));
    }

    #[tokio::test]
    async fn fetch_failure_records_transient_failure() {
        let h = harness();
        let tenant = TenantId::new();
        let job = h.running_job(tenant, "ext-1");
        h.client
            .results
            .lock()
            .unwrap()
            .push_back(Err(ClientError::Server { status: 502, message: "bad gateway".into() }));
        let body = json!({"externalJobId": "ext-1", "tenantId": tenant.to_string(), "status": "completed"});

        let d = h.deliver(&body).await.unwrap();
        assert!(matches!(d, Disposition::RetryScheduled { .. }));
        let stored = h.stored(&job);
        assert_eq!(stored.status, JobStatus::Pending);
        assert!(stored.error_message.unwrap().contains("bad gateway"));
    }

    #[tokio::test]
    async fn sink_failure_leaves_job_unsucceeded_and_asks_for_redelivery() {
        let h = harness();
        let tenant = TenantId::new();
        let job = h.running_job(tenant, "ext-1");
        let body = completed(tenant, "ext-1", json!({"x": 1}));

        h.sink.set_failure(Some(SinkError::Unavailable("replica down".into())));
        let err = h.deliver(&body).await.unwrap_err();
        assert_eq!(err.status_code(), 500);
        assert!(err.is_retryable_by_sender());
        assert_eq!(h.stored(&job).status, JobStatus::Running);
        assert!(h.events.drain().is_empty());

        h.sink.set_failure(None);
        assert_eq!(h.deliver(&body).await.unwrap(), Disposition::Applied { job_id: job.id });
        assert_eq!(h.events.drain().len(), 1);
    }

    #[tokio::test]
    async fn late_callback_for_timed_out_job_is_a_noop() {
        let h = harness();
        let tenant = TenantId::new();
        let job = h.running_job(tenant, "ext-1");
        h.lifecycle
            .mark_timeout(&job, Utc::now() + chrono::Duration::hours(25))
            .unwrap();
        h.events.drain();

        let d = h.deliver(&completed(tenant, "ext-1", json!({"x": 1}))).await.unwrap();
        assert_eq!(
            d,
            Disposition::Ignored {
                reason: IgnoreReason::AlreadyTerminal {
                    status: JobStatus::Timeout
                }
            }
        );
        assert_eq!(h.stored(&job).status, JobStatus::Timeout);
        assert!(h.events.drain().is_empty());
    }

    #[tokio::test]
    async fn unauthenticated_mode_accepts_unsigned_callbacks() {
        let h = harness_with(AuthenticatorConfig::unauthenticated());
        let tenant = TenantId::new();
        let job = h.running_job(tenant, "ext-1");
        let raw = serde_json::to_vec(&completed(tenant, "ext-1", json!({"x": 1}))).unwrap();

        let d = h
            .dispatcher
            .dispatch(WebhookRequest {
                body: &raw,
                signature: None,
                timestamp: None,
                task_id: None,
            })
            .await
            .unwrap();
        assert_eq!(d, Disposition::Applied { job_id: job.id });
    }
}
