//! Bounded-concurrency task supervisor.
//!
//! Background work is never fire-and-forget: every task holds a permit from
//! a fixed pool, and every failure (an `Err` or a panic) is sent to one
//! failure channel that a drain loop logs and counts.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use inferlink_observability::{Counter, Metrics};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub max_concurrent: usize,
    /// Name for logging
    pub name: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 16,
            name: "task-supervisor".to_string(),
        }
    }
}

impl SupervisorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("supervisor at capacity ({0} tasks running)")]
    AtCapacity(usize),

    #[error("supervisor is shut down")]
    Closed,
}

/// A task that did not finish cleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub task: String,
    pub error: String,
}

pub struct TaskSupervisor {
    name: String,
    max_concurrent: usize,
    permits: Arc<Semaphore>,
    failures: mpsc::UnboundedSender<TaskFailure>,
    drain: JoinHandle<()>,
}

impl TaskSupervisor {
    /// Must be called inside a Tokio runtime.
    pub fn new(config: SupervisorConfig, metrics: Arc<Metrics>) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        let (failures, mut rx) = mpsc::unbounded_channel::<TaskFailure>();

        let name = config.name.clone();
        let drain = tokio::spawn(async move {
            while let Some(failure) = rx.recv().await {
                metrics.incr(Counter::TasksFailed);
                error!(
                    supervisor = %name,
                    task = %failure.task,
                    error = %failure.error,
                    "supervised task failed"
                );
            }
        });

        Self {
            name: config.name,
            max_concurrent,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            failures,
            drain,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.permits.available_permits()
    }

    /// Spawn `fut`, waiting for a free slot first.
    pub async fn spawn<F, E>(&self, task: impl Into<String>, fut: F) -> Result<JoinHandle<()>, SupervisorError>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SupervisorError::Closed)?;
        Ok(self.launch(task.into(), permit, fut))
    }

    /// Spawn `fut` only if a slot is free right now.
    pub fn try_spawn<F, E>(&self, task: impl Into<String>, fut: F) -> Result<JoinHandle<()>, SupervisorError>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let permit = self.permits.clone().try_acquire_owned().map_err(|e| match e {
            tokio::sync::TryAcquireError::NoPermits => SupervisorError::AtCapacity(self.max_concurrent),
            tokio::sync::TryAcquireError::Closed => SupervisorError::Closed,
        })?;
        Ok(self.launch(task.into(), permit, fut))
    }

    fn launch<F, E>(&self, task: String, permit: tokio::sync::OwnedSemaphorePermit, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let failures = self.failures.clone();
        let supervisor = self.name.clone();
        tokio::spawn(async move {
            let _permit = permit;
            // inner task so a panic surfaces as a JoinError instead of unwinding here
            let outcome = tokio::spawn(fut).await;
            let error = match outcome {
                Ok(Ok(())) => {
                    debug!(supervisor = %supervisor, task = %task, "supervised task finished");
                    return;
                }
                Ok(Err(e)) => e.to_string(),
                Err(join) if join.is_panic() => format!("panicked: {join}"),
                Err(join) => format!("aborted: {join}"),
            };
            let _ = failures.send(TaskFailure { task, error });
        })
    }

    /// Stop accepting work, wait for running tasks, then flush the failure log.
    pub async fn shutdown(self) {
        let _ = self.permits.acquire_many(self.max_concurrent as u32).await;
        self.permits.close();
        drop(self.failures);
        let _ = self.drain.await;
    }
}
