//! Periodic timeout sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info};

use inferlink_events::{EventBus, EventEnvelope, JobEvent};
use inferlink_jobs::{JobLifecycle, JobStore, LifecycleError};
use inferlink_observability::{Counter, Metrics};

use crate::workers::{WorkerHandle, spawn_periodic};

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: Duration,
    /// Upper bound on jobs moved per sweep.
    pub batch: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch: 500,
        }
    }
}

/// Moves jobs stuck past the absolute age window to `timeout`.
///
/// Runs on a single task; each job is moved under the same row lock webhook
/// processing takes, so an in-flight delivery and the sweep never both win.
pub struct TimeoutSweeper<S, B> {
    lifecycle: Arc<JobLifecycle<S, B>>,
    metrics: Arc<Metrics>,
    config: SweeperConfig,
}

impl<S, B> TimeoutSweeper<S, B>
where
    S: JobStore + 'static,
    B: EventBus<EventEnvelope<JobEvent>> + 'static,
{
    pub fn new(lifecycle: Arc<JobLifecycle<S, B>>, metrics: Arc<Metrics>, config: SweeperConfig) -> Self {
        Self {
            lifecycle,
            metrics,
            config,
        }
    }

    /// One pass; returns how many jobs timed out.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<usize, LifecycleError> {
        let timed_out = self.lifecycle.sweep_timeouts(now, self.config.batch)?;
        let n = timed_out.len();
        if n > 0 {
            self.metrics.add(Counter::JobsTimedOut, n as u64);
            info!(count = n, "timeout sweep moved jobs to timeout");
        }
        Ok(n)
    }

    pub fn spawn(self: Arc<Self>) -> WorkerHandle {
        let interval = self.config.interval;
        spawn_periodic("timeout-sweeper", interval, move |now| {
            let sweeper = self.clone();
            async move {
                if let Err(e) = sweeper.sweep(now) {
                    error!(error = %e, "timeout sweep failed");
                }
            }
        })
    }
}
