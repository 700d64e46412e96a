use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use chrono::{DateTime, Utc};

/// Upper bounds (seconds) of the job-duration histogram buckets
const DURATION_BUCKETS_SECS: [u64; 10] = [1, 5, 15, 30, 60, 120, 300, 600, 1800, 3600];

/// Live counters, job-duration histogram and queue-depth gauge
///
/// Backend-neutral: exporters read a [`MetricsSnapshot`] and translate it
/// into whatever wire format they need.
#[derive(Debug, Default)]
pub struct JobMetrics {
    jobs_created: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_cancelled: AtomicU64,
    jobs_retried: AtomicU64,
    queue_depth: AtomicU64,
    durations: DurationHistogram,
}

impl JobMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_jobs_created(&self) {
        self.jobs_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a completion and observe how long the job took end to end
    pub fn record_completed(&self, duration: Duration) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        self.durations.observe(duration);
    }

    pub fn record_failed(&self, duration: Duration) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        self.durations.observe(duration);
    }

    pub fn increment_jobs_cancelled(&self) {
        self.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_jobs_retried(&self) {
        self.jobs_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth as u64, Ordering::Relaxed);
    }

    pub fn jobs_created(&self) -> u64 {
        self.jobs_created.load(Ordering::Relaxed)
    }

    pub fn jobs_completed(&self) -> u64 {
        self.jobs_completed.load(Ordering::Relaxed)
    }

    pub fn jobs_failed(&self) -> u64 {
        self.jobs_failed.load(Ordering::Relaxed)
    }

    pub fn jobs_cancelled(&self) -> u64 {
        self.jobs_cancelled.load(Ordering::Relaxed)
    }

    pub fn jobs_retried(&self) -> u64 {
        self.jobs_retried.load(Ordering::Relaxed)
    }

    pub fn queue_depth(&self) -> u64 {
        self.queue_depth.load(Ordering::Relaxed)
    }

    pub fn durations(&self) -> &DurationHistogram {
        &self.durations
    }

    /// Collect current snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            jobs_created: self.jobs_created(),
            jobs_completed: self.jobs_completed(),
            jobs_failed: self.jobs_failed(),
            jobs_cancelled: self.jobs_cancelled(),
            jobs_retried: self.jobs_retried(),
            queue_depth: self.queue_depth(),
            duration_buckets: self.durations.cumulative_counts(),
            duration_count: self.durations.count(),
            duration_sum: self.durations.sum(),
        }
    }
}

/// Fixed-bucket histogram of job durations
#[derive(Debug, Default)]
pub struct DurationHistogram {
    /// One slot per bucket plus an overflow slot
    buckets: [AtomicU64; DURATION_BUCKETS_SECS.len() + 1],
    count: AtomicU64,
    sum_millis: AtomicU64,
}

impl DurationHistogram {
    pub fn observe(&self, duration: Duration) {
        let secs = duration.as_secs_f64();
        let slot = DURATION_BUCKETS_SECS
            .iter()
            .position(|bound| secs <= *bound as f64)
            .unwrap_or(DURATION_BUCKETS_SECS.len());

        self.buckets[slot].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_millis.fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> Duration {
        Duration::from_millis(self.sum_millis.load(Ordering::Relaxed))
    }

    /// `(upper bound, observations <= bound)` pairs, Prometheus style; the last bound is `None` (+Inf)
    pub fn cumulative_counts(&self) -> Vec<(Option<Duration>, u64)> {
        let mut running = 0;
        self.buckets
            .iter()
            .enumerate()
            .map(|(slot, bucket)| {
                running += bucket.load(Ordering::Relaxed);
                let bound = DURATION_BUCKETS_SECS.get(slot).map(|secs| Duration::from_secs(*secs));
                (bound, running)
            })
            .collect()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub jobs_created: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub jobs_retried: u64,
    pub queue_depth: u64,
    pub duration_buckets: Vec<(Option<Duration>, u64)>,
    pub duration_count: u64,
    pub duration_sum: Duration,
}

impl MetricsSnapshot {
    /// Calculate overall success rate
    pub fn success_rate(&self) -> f64 {
        let total_processed = self.jobs_completed + self.jobs_failed;
        if total_processed == 0 {
            100.0
        } else {
            (self.jobs_completed as f64 / total_processed as f64) * 100.0
        }
    }

    /// Jobs created but not yet terminal
    pub fn jobs_in_progress(&self) -> u64 {
        self.jobs_created
            .saturating_sub(self.jobs_completed + self.jobs_failed + self.jobs_cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_snapshot() {
        let metrics = JobMetrics::new();
        for _ in 0..4 {
            metrics.increment_jobs_created();
        }
        metrics.record_completed(Duration::from_secs(3));
        metrics.record_completed(Duration::from_secs(40));
        metrics.record_failed(Duration::from_secs(7200));
        metrics.set_queue_depth(5);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.jobs_created, 4);
        assert_eq!(snapshot.jobs_in_progress(), 1);
        assert_eq!(snapshot.queue_depth, 5);
        assert!((snapshot.success_rate() - 66.666).abs() < 0.01);
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let histogram = DurationHistogram::default();
        histogram.observe(Duration::from_millis(500));
        histogram.observe(Duration::from_secs(5));
        histogram.observe(Duration::from_secs(4000));

        let buckets = histogram.cumulative_counts();
        assert_eq!(buckets[0], (Some(Duration::from_secs(1)), 1));
        assert_eq!(buckets[1], (Some(Duration::from_secs(5)), 2));
        assert_eq!(buckets.last(), Some(&(None, 3)));
        assert_eq!(histogram.count(), 3);
        assert_eq!(histogram.sum(), Duration::from_millis(4_005_500));
    }
}
