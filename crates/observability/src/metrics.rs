//! Lock-free counters shared by the webhook path and background workers.
//!
//! Constructed once and passed around behind an `Arc`; there is no global
//! registry.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Everything we count.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Counter {
    WebhooksReceived,
    WebhooksRejected,
    WebhooksIgnored,
    DuplicateDeliveries,
    JobsSucceeded,
    JobsRetried,
    JobsFailed,
    JobsTimedOut,
    TasksFailed,
}

#[derive(Debug, Default)]
pub struct Metrics {
    webhooks_received: AtomicU64,
    webhooks_rejected: AtomicU64,
    webhooks_ignored: AtomicU64,
    duplicate_deliveries: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_retried: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_timed_out: AtomicU64,
    tasks_failed: AtomicU64,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub webhooks_received: u64,
    pub webhooks_rejected: u64,
    pub webhooks_ignored: u64,
    pub duplicate_deliveries: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub jobs_timed_out: u64,
    pub tasks_failed: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        self.cell(counter).fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.cell(counter).load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            webhooks_received: self.get(Counter::WebhooksReceived),
            webhooks_rejected: self.get(Counter::WebhooksRejected),
            webhooks_ignored: self.get(Counter::WebhooksIgnored),
            duplicate_deliveries: self.get(Counter::DuplicateDeliveries),
            jobs_succeeded: self.get(Counter::JobsSucceeded),
            jobs_retried: self.get(Counter::JobsRetried),
            jobs_failed: self.get(Counter::JobsFailed),
            jobs_timed_out: self.get(Counter::JobsTimedOut),
            tasks_failed: self.get(Counter::TasksFailed),
        }
    }

    fn cell(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::WebhooksReceived => &self.webhooks_received,
            Counter::WebhooksRejected => &self.webhooks_rejected,
            Counter::WebhooksIgnored => &self.webhooks_ignored,
            Counter::DuplicateDeliveries => &self.duplicate_deliveries,
            Counter::JobsSucceeded => &self.jobs_succeeded,
            Counter::JobsRetried => &self.jobs_retried,
            Counter::JobsFailed => &self.jobs_failed,
            Counter::JobsTimedOut => &self.jobs_timed_out,
            Counter::TasksFailed => &self.tasks_failed,
        }
    }
}
