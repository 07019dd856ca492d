//! Periodic background workers with explicit shutdown.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::info;

/// Handle to a running worker. Dropping it also stops the worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stop after the current tick and wait for the task to exit.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

/// Run `tick` every `interval`, one tick at a time.
///
/// A slow tick delays the next one instead of letting ticks pile up.
pub fn spawn_periodic<F, Fut>(name: &'static str, interval: Duration, mut tick: F) -> WorkerHandle
where
    F: FnMut(DateTime<Utc>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let interval = interval.max(Duration::from_millis(1));
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    let join = tokio::spawn(async move {
        info!(worker = name, interval_ms = interval.as_millis() as u64, "worker started");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = ticker.tick() => tick(Utc::now()).await,
            }
        }

        info!(worker = name, "worker stopped");
    });

    WorkerHandle {
        name,
        shutdown: Some(shutdown_tx),
        join: Some(join),
    }
}
