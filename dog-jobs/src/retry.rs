use std::time::Duration;
use chrono::{DateTime, Utc};

use crate::{JobFailure, config::to_chrono};

/// Bounded exponential backoff applied by the coordinator's `fail`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed in total (the first run counts as attempt 1)
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubles for each further attempt
    pub base_delay: Duration,
    /// Upper bound on a single delay
    pub max_delay: Duration,
}

/// What to do after an attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run attempt `next_attempt` once `retry_at` has passed
    Retry {
        next_attempt: u32,
        retry_at: DateTime<Utc>,
    },
    /// Give up and fail the job
    GiveUp,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Self::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Backoff after `failed_attempt` (1-based): base, 2*base, 4*base, ...
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Pure transition: given the attempt that just failed and why, retry or give up
    pub fn decide(&self, failed_attempt: u32, failure: &JobFailure, now: DateTime<Utc>) -> RetryDecision {
        if !failure.is_retryable() || failed_attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }

        RetryDecision::Retry {
            next_attempt: failed_attempt + 1,
            retry_at: now + to_chrono(self.delay_for(failed_attempt)),
        }
    }
}
