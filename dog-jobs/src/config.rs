//! Engine configuration.
//!
//! `JobsConfig` carries defaults suited to archive-style downloads and can
//! be layered with environment overrides using the DogRS convention of a
//! prefix plus `__`-separated keys:
//!
//! ```bash
//! export DOG_JOBS__WORKERS=8
//! export DOG_JOBS__RETRY__BASE_DELAY_SECS=2
//! ```

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::{JobStatus, JobsError, JobsResult, retry::RetryPolicy};

/// Convert to a chrono duration, saturating far in the future on overflow
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

/// Configuration for the coordinator, queue, worker pool and publisher
#[derive(Debug, Clone)]
pub struct JobsConfig {
    /// Concurrent workers per process
    pub workers: usize,
    /// How long a dequeued item stays hidden from other workers
    pub visibility_timeout: Duration,
    /// Wall-clock budget of a job, counted from its first claim
    pub job_deadline: Duration,
    /// Worker sleep when the queue has nothing eligible
    pub poll_interval: Duration,
    /// Attempts and backoff
    pub retry: RetryPolicy,
    /// Maximum dispatches per second (0 disables the limit)
    pub dispatch_rate: u32,
    /// Dispatches allowed back to back
    pub dispatch_burst: u32,
    /// Lifetime of a published access URL
    pub url_ttl: Duration,
    /// Record lifetime of a job that has not reached a terminal state
    pub active_retention: Duration,
    /// Record lifetime after completion
    pub completed_retention: Duration,
    /// Record lifetime after failure or cancellation
    pub failed_retention: Duration,
    /// How often the retention sweep runs
    pub sweep_interval: Duration,
    /// Optimistic write attempts before a transition reports `Unavailable`
    pub cas_retry_limit: u32,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            visibility_timeout: Duration::from_secs(60),
            job_deadline: Duration::from_secs(600), // 10 minutes
            poll_interval: Duration::from_millis(100),
            retry: RetryPolicy::default(),
            dispatch_rate: 50,
            dispatch_burst: 10,
            url_ttl: Duration::from_secs(3600), // 1 hour
            active_retention: Duration::from_secs(24 * 3600),
            completed_retention: Duration::from_secs(24 * 3600),
            failed_retention: Duration::from_secs(48 * 3600),
            sweep_interval: Duration::from_secs(60),
            cas_retry_limit: 16,
        }
    }
}

impl JobsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_job_deadline(mut self, deadline: Duration) -> Self {
        self.job_deadline = deadline;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_dispatch_rate(mut self, rate: u32, burst: u32) -> Self {
        self.dispatch_rate = rate;
        self.dispatch_burst = burst;
        self
    }

    pub fn with_url_ttl(mut self, ttl: Duration) -> Self {
        self.url_ttl = ttl;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Record lifetime for a job entering `status`
    pub fn retention_for(&self, status: JobStatus) -> Duration {
        match status {
            JobStatus::Completed => self.completed_retention,
            JobStatus::Failed | JobStatus::Cancelled => self.failed_retention,
            JobStatus::Pending | JobStatus::Processing => self.active_retention,
        }
    }

    /// Defaults overridden by `{prefix}__*` environment variables
    pub fn from_env(prefix: &str) -> JobsResult<Self> {
        Self::default().apply_overrides(prefix, std::env::vars())
    }

    /// Apply `{prefix}__KEY=value` pairs; keys are case-insensitive and `__` nests
    pub fn apply_overrides<I>(mut self, prefix: &str, vars: I) -> JobsResult<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let marker = format!("{}__", prefix);
        let values: HashMap<String, String> = vars
            .into_iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(&marker)
                    .map(|stripped| (stripped.to_lowercase().replace("__", "."), value))
            })
            .collect();

        for (key, value) in &values {
            match key.as_str() {
                "workers" => self.workers = parse(key, value)?,
                "visibility_timeout_secs" => self.visibility_timeout = secs(key, value)?,
                "job_deadline_secs" => self.job_deadline = secs(key, value)?,
                "poll_interval_ms" => self.poll_interval = Duration::from_millis(parse(key, value)?),
                "retry.max_attempts" => self.retry.max_attempts = parse(key, value)?,
                "retry.base_delay_secs" => self.retry.base_delay = secs(key, value)?,
                "retry.max_delay_secs" => self.retry.max_delay = secs(key, value)?,
                "dispatch.rate" => self.dispatch_rate = parse(key, value)?,
                "dispatch.burst" => self.dispatch_burst = parse(key, value)?,
                "url_ttl_secs" => self.url_ttl = secs(key, value)?,
                "retention.active_secs" => self.active_retention = secs(key, value)?,
                "retention.completed_secs" => self.completed_retention = secs(key, value)?,
                "retention.failed_secs" => self.failed_retention = secs(key, value)?,
                "sweep_interval_secs" => self.sweep_interval = secs(key, value)?,
                "cas_retry_limit" => self.cas_retry_limit = parse(key, value)?,
                _ => tracing::debug!("Ignoring unknown config key {}", key),
            }
        }

        self.validate()?;
        Ok(self)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> JobsResult<()> {
        if self.workers == 0 {
            return Err(JobsError::invalid("workers must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(JobsError::invalid("retry.max_attempts must be at least 1"));
        }
        if self.visibility_timeout.is_zero() || self.job_deadline.is_zero() {
            return Err(JobsError::invalid("visibility timeout and job deadline must be positive"));
        }
        if self.cas_retry_limit == 0 {
            return Err(JobsError::invalid("cas_retry_limit must be at least 1"));
        }
        Ok(())
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> JobsResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| JobsError::invalid(format!("invalid value {:?} for {}", value, key)))
}

fn secs(key: &str, value: &str) -> JobsResult<Duration> {
    parse::<u64>(key, value).map(Duration::from_secs)
}
