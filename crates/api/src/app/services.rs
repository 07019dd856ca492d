use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use inferlink_auth::WebhookAuthenticator;
use inferlink_events::{EventBus, EventEnvelope, InMemoryEventBus, JobEvent, Subscription};
use inferlink_infra::{
    HttpInferenceClient, InMemoryResultSink, InferenceClient, PassthroughNormalizer, ResultProcessor,
    SubmissionService, TaskSupervisor, TimeoutSweeper, WebhookDispatcher, WorkerHandle,
};
use inferlink_jobs::{InMemoryJobStore, JobLifecycle};
use inferlink_observability::Metrics;

use crate::config::AppConfig;

pub type Store = Arc<InMemoryJobStore>;
pub type Bus = Arc<InMemoryEventBus<EventEnvelope<JobEvent>>>;

pub type Lifecycle = JobLifecycle<Store, Bus>;
pub type Dispatcher = WebhookDispatcher<Store, Bus>;
pub type Submission = SubmissionService<Store, Bus>;
pub type Sweeper = TimeoutSweeper<Store, Bus>;

/// Everything the HTTP handlers and background workers share.
pub struct AppServices {
    pub lifecycle: Arc<Lifecycle>,
    pub dispatcher: Dispatcher,
    pub submission: Arc<Submission>,
    pub sweeper: Arc<Sweeper>,
    pub supervisor: TaskSupervisor,
    pub metrics: Arc<Metrics>,
    pub sink: Arc<InMemoryResultSink>,
    pub bus: Bus,
    retry_interval: Duration,
}

impl AppServices {
    /// Wire services against the HTTP inference client. Needs a Tokio runtime.
    pub fn build(config: &AppConfig) -> Result<Self> {
        let client = HttpInferenceClient::new(config.client_config()).context("failed to build inference client")?;
        Self::build_with_client(config, Arc::new(client))
    }

    pub fn build_with_client(config: &AppConfig, client: Arc<dyn InferenceClient>) -> Result<Self> {
        let authenticator =
            WebhookAuthenticator::new(config.authenticator_config()).context("invalid webhook authentication config")?;
        let policy = config.retry_policy();
        policy.validate().context("invalid retry policy")?;

        let store: Store = InMemoryJobStore::arc();
        let bus: Bus = Arc::new(InMemoryEventBus::new());
        let metrics = Arc::new(Metrics::new());
        let sink = Arc::new(InMemoryResultSink::new());

        let lifecycle = Arc::new(JobLifecycle::new(store, bus.clone(), policy));
        let processor = Arc::new(ResultProcessor::new(
            lifecycle.clone(),
            Arc::new(PassthroughNormalizer),
            sink.clone(),
            metrics.clone(),
        ));

        let submission_config = config.submission_config();
        let dispatcher = WebhookDispatcher::new(
            authenticator,
            processor.clone(),
            client.clone(),
            submission_config.fetch_timeout,
        );
        let submission = Arc::new(SubmissionService::new(processor, client, submission_config));
        let sweeper = Arc::new(TimeoutSweeper::new(
            lifecycle.clone(),
            metrics.clone(),
            config.sweeper_config(),
        ));
        let supervisor = TaskSupervisor::new(config.supervisor_config(), metrics.clone());

        Ok(Self {
            lifecycle,
            dispatcher,
            submission,
            sweeper,
            supervisor,
            metrics,
            sink,
            bus,
            retry_interval: config.retry_interval,
        })
    }

    /// Start the timeout sweep and the retry loop.
    pub fn spawn_workers(&self) -> Vec<WorkerHandle> {
        vec![
            self.sweeper.clone().spawn(),
            self.submission.clone().spawn_retry_loop(self.retry_interval),
        ]
    }

    /// Log every job outcome event on a dedicated thread.
    ///
    /// The thread exits once the bus is dropped.
    pub fn spawn_event_logger(&self) -> Result<std::thread::JoinHandle<()>> {
        let subscription: Subscription<EventEnvelope<JobEvent>> = self.bus.subscribe();
        std::thread::Builder::new()
            .name("job-event-log".to_string())
            .spawn(move || {
                while let Ok(envelope) = subscription.recv() {
                    let event = envelope.payload();
                    info!(
                        event = event.name(),
                        tenant = %envelope.tenant_id(),
                        job_id = %envelope.job_id(),
                        occurred_at = %envelope.occurred_at(),
                        "job outcome published"
                    );
                    debug!(payload = ?event, "job outcome payload");
                }
                warn!("job event stream closed");
            })
            .context("failed to spawn event logger thread")
    }
}
