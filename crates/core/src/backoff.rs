//! Retry policy and backoff schedule.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Escalating delays between attempts, indexed by failure count.
///
/// The k-th failure (1-indexed) waits `delays[k - 1]`; failures beyond the
/// end of the list reuse the last delay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Duration>", into = "Vec<Duration>")]
pub struct BackoffSchedule {
    delays: Vec<Duration>,
}

impl BackoffSchedule {
    /// Validate a schedule: non-empty, every delay > 0, non-decreasing.
    pub fn new(delays: Vec<Duration>) -> DomainResult<Self> {
        if delays.is_empty() {
            return Err(DomainError::validation("backoff schedule must not be empty"));
        }
        if let Some(idx) = delays.iter().position(|d| d.is_zero()) {
            return Err(DomainError::validation(format!(
                "backoff delay at index {idx} must be greater than zero"
            )));
        }
        if let Some(idx) = delays.windows(2).position(|w| w[1] < w[0]) {
            return Err(DomainError::validation(format!(
                "backoff schedule must be non-decreasing (index {} < index {})",
                idx + 1,
                idx
            )));
        }
        Ok(Self { delays })
    }

    /// Schedule from whole seconds.
    pub fn from_secs(secs: &[u64]) -> DomainResult<Self> {
        Self::new(secs.iter().copied().map(Duration::from_secs).collect())
    }

    /// `base * 2^(k-1)` for `steps` entries, each capped at `max`.
    pub fn exponential(base: Duration, max: Duration, steps: usize) -> DomainResult<Self> {
        let delays = (0..steps)
            .map(|k| {
                let factor = 2u32.saturating_pow(k as u32);
                base.checked_mul(factor).unwrap_or(max).min(max)
            })
            .collect();
        Self::new(delays)
    }

    /// Delay after the `failure_count`-th failure (1-indexed; 0 is treated as 1).
    pub fn delay_for(&self, failure_count: u32) -> Duration {
        let idx = (failure_count.max(1) as usize - 1).min(self.delays.len() - 1);
        self.delays[idx]
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            delays: [30, 120, 600, 1800]
                .into_iter()
                .map(Duration::from_secs)
                .collect(),
        }
    }
}

impl TryFrom<Vec<Duration>> for BackoffSchedule {
    type Error = DomainError;

    fn try_from(value: Vec<Duration>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BackoffSchedule> for Vec<Duration> {
    fn from(value: BackoffSchedule) -> Self {
        value.delays
    }
}

/// What happens to an item after a failed attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Become eligible again after the delay.
    RetryAfter(Duration),
    /// Stop retrying; a human has to intervene.
    Terminal,
}

/// Failure ceiling plus backoff schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RetryPolicyFields")]
pub struct RetryPolicy {
    max_failures: u32,
    schedule: BackoffSchedule,
}

/// Unvalidated wire form of [`RetryPolicy`].
#[derive(Deserialize)]
struct RetryPolicyFields {
    max_failures: u32,
    schedule: BackoffSchedule,
}

impl TryFrom<RetryPolicyFields> for RetryPolicy {
    type Error = DomainError;

    fn try_from(fields: RetryPolicyFields) -> Result<Self, Self::Error> {
        Self::new(fields.max_failures, fields.schedule)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_failures: 4,
            schedule: BackoffSchedule::default(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_failures: u32, schedule: BackoffSchedule) -> DomainResult<Self> {
        if max_failures == 0 {
            return Err(DomainError::validation("max_failures must be at least 1"));
        }
        Ok(Self {
            max_failures,
            schedule,
        })
    }

    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }

    pub fn schedule(&self) -> &BackoffSchedule {
        &self.schedule
    }

    /// Decide the next step given the failure count *after* incrementing.
    pub fn decide(&self, failure_count: u32) -> RetryDecision {
        if failure_count >= self.max_failures {
            RetryDecision::Terminal
        } else {
            RetryDecision::RetryAfter(self.schedule.delay_for(failure_count))
        }
    }
}
