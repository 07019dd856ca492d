//! Infrastructure layer: inference client, webhook dispatch, background workers.

pub mod client;
pub mod dispatcher;
pub mod effects;
pub mod normalize;
pub mod processor;
pub mod submission;
pub mod supervisor;
pub mod sweeper;
pub mod workers;

mod integration_tests;

pub use client::{ClientError, HttpInferenceClient, InferenceClient, InferenceClientConfig, with_timeout};
pub use dispatcher::{CallbackStatus, Disposition, IgnoreReason, WebhookDispatcher, WebhookError, WebhookPayload, WebhookRequest};
pub use effects::{AppliedResult, InMemoryResultSink, ResultSink, SinkError};
pub use normalize::{NormalizeError, PassthroughNormalizer, ResultNormalizer};
pub use processor::{ProcessOutcome, ResultProcessor};
pub use submission::{RetryReport, SubmissionConfig, SubmissionService, SubmitOutcome};
pub use supervisor::{SupervisorConfig, SupervisorError, TaskFailure, TaskSupervisor};
pub use sweeper::{SweeperConfig, TimeoutSweeper};
pub use workers::{WorkerHandle, spawn_periodic};
