use std::pin::Pin;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::debug;

use crate::{Job, JobEvent, JobFailure, JobId};
use super::JobMetrics;

/// Boxed stream of events
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

const EVENT_CHANNEL_CAPACITY: usize = 10_000;

/// Lifecycle event fan-out plus the counters derived from it
#[derive(Clone)]
pub struct ObservabilityLayer {
    event_broadcaster: broadcast::Sender<JobEvent>,
    metrics: Arc<JobMetrics>,
}

impl ObservabilityLayer {
    pub fn new() -> Self {
        let (event_broadcaster, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            event_broadcaster,
            metrics: Arc::new(JobMetrics::new()),
        }
    }

    pub fn record_job_created(&self, job: &Job) {
        self.send(JobEvent::Created {
            job_id: job.id.clone(),
            owner_id: job.owner_id.clone(),
            priority: job.priority,
            total_units: job.progress.total,
            at: job.created_at,
        });
        self.metrics.increment_jobs_created();
    }

    pub fn record_job_claimed(&self, job: &Job) {
        self.send(JobEvent::Claimed {
            job_id: job.id.clone(),
            attempt: job.attempt,
            at: job.updated_at,
        });
    }

    pub fn record_job_progressed(&self, job: &Job) {
        self.send(JobEvent::Progressed {
            job_id: job.id.clone(),
            progress: job.progress,
            at: job.updated_at,
        });
    }

    pub fn record_job_retrying(&self, job: &Job, retry_at: DateTime<Utc>, failure: &JobFailure) {
        self.send(JobEvent::Retrying {
            job_id: job.id.clone(),
            attempt: job.attempt,
            retry_at,
            error: failure.to_string(),
            at: job.updated_at,
        });
        self.metrics.increment_jobs_retried();
    }

    pub fn record_job_completed(&self, job: &Job) {
        self.send(JobEvent::Completed {
            job_id: job.id.clone(),
            at: job.updated_at,
        });
        self.metrics.record_completed(elapsed(job));
    }

    pub fn record_job_failed(&self, job: &Job, failure: &JobFailure) {
        self.send(JobEvent::Failed {
            job_id: job.id.clone(),
            kind: failure.kind,
            error: failure.message.clone(),
            at: job.updated_at,
        });
        self.metrics.record_failed(elapsed(job));
    }

    pub fn record_job_cancelled(&self, job: &Job) {
        self.send(JobEvent::Cancelled {
            job_id: job.id.clone(),
            at: job.updated_at,
        });
        self.metrics.increment_jobs_cancelled();
    }

    pub fn record_job_expired(&self, job_id: &JobId, at: DateTime<Utc>) {
        self.send(JobEvent::Expired {
            job_id: job_id.clone(),
            at,
        });
    }

    /// Live stream of every event emitted after the call; lagging subscribers skip missed events
    pub fn subscribe(&self) -> BoxStream<JobEvent> {
        let stream = BroadcastStream::new(self.event_broadcaster.subscribe())
            .filter_map(|result| result.ok());

        Box::pin(stream)
    }

    pub fn metrics(&self) -> &JobMetrics {
        &self.metrics
    }

    fn send(&self, event: JobEvent) {
        debug!("Recorded {} for job {}", event.event_name(), event.job_id());
        // No subscribers is fine
        let _ = self.event_broadcaster.send(event);
    }
}

impl Default for ObservabilityLayer {
    fn default() -> Self {
        Self::new()
    }
}

fn elapsed(job: &Job) -> std::time::Duration {
    (job.updated_at - job.created_at).to_std().unwrap_or_default()
}
