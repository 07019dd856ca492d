//! Job lifecycle for externally executed inference jobs.
//!
//! ## Components
//!
//! - `Job`: persisted record + pure state transitions
//! - `RetryPolicy`: attempt/age limits and backoff schedule
//! - `JobStore`: keyed record store with per-job atomic updates
//! - `JobLifecycle`: the state machine everyone else goes through
//!
//! ## States
//!
//! ```text
//! pending ──► running ──► succeeded
//!    ▲           │ ├────► failed
//!    └─(retry)───┘ └────► timeout
//! ```
//!
//! `succeeded`, `failed` and `timeout` are terminal. A failure with retries
//! left goes straight back to `pending` with `next_retry_at` set.

pub mod error;
pub mod job;
pub mod lifecycle;
pub mod retry;
pub mod store;

pub use error::LifecycleError;
pub use job::{FailureKind, Job, JobAttemptRecord, JobKind, JobStatus, SuccessTransition, TargetRef};
pub use lifecycle::{CreateOutcome, FailureOutcome, JobLifecycle, SuccessOutcome};
pub use retry::{BackoffStrategy, RetryPolicy, RetryPolicyError};
pub use store::{InMemoryJobStore, InsertOutcome, JobStats, JobStore, JobStoreError};
