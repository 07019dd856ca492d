//! Retry policy: how many attempts, how old, how long to wait.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::Job;

/// Backoff strategy for retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt-1)
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
    /// Explicit schedule; attempts past the end reuse the last step
    Stepped { steps: Vec<Duration> },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Stepped {
            steps: [5, 10, 30, 60, 300].into_iter().map(Duration::from_secs).collect(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RetryPolicyError {
    #[error("max_attempts must be at least 1")]
    NoAttempts,

    #[error("stepped backoff needs at least one step")]
    EmptySchedule,
}

/// Retry policy configuration.
///
/// Delays are deterministic and non-decreasing in the attempt number, and
/// never exceed `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, the first one included.
    pub max_attempts: u32,
    /// Absolute age after which a job is neither retried nor kept waiting.
    pub max_age: Duration,
    /// Base delay for `Fixed` / `Linear` / `Exponential`
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            max_age: Duration::from_secs(24 * 60 * 60),
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::default(),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            ..Default::default()
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn validate(&self) -> Result<(), RetryPolicyError> {
        if self.max_attempts == 0 {
            return Err(RetryPolicyError::NoAttempts);
        }
        if let BackoffStrategy::Stepped { steps } = &self.strategy {
            if steps.is_empty() {
                return Err(RetryPolicyError::EmptySchedule);
            }
        }
        Ok(())
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match &self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Exponential => {
                let exp = (attempt - 1).min(31);
                self.base_delay.saturating_mul(1u32 << exp)
            }
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Stepped { steps } => {
                let idx = (attempt as usize - 1).min(steps.len().saturating_sub(1));
                // running max keeps a badly ordered schedule monotonic
                steps.iter().take(idx + 1).copied().max().unwrap_or(Duration::ZERO)
            }
        };

        delay.min(self.max_delay)
    }

    pub fn next_retry_at(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for_attempt(attempt)).unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether `job` has exceeded the absolute age window at `now`.
    pub fn is_expired(&self, job: &Job, now: DateTime<Utc>) -> bool {
        let max_age = chrono::Duration::from_std(self.max_age).unwrap_or(chrono::Duration::MAX);
        job.age(now) > max_age
    }

    /// Another attempt is allowed: not terminal, attempts left, not too old.
    pub fn should_retry(&self, job: &Job, now: DateTime<Utc>) -> bool {
        !job.status.is_terminal() && job.attempt < self.max_attempts && !self.is_expired(job, now)
    }
}
