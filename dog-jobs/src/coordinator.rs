use std::collections::HashSet;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    ErrorKind, Job, JobFailure, JobId, JobPriority, JobResult, JobStatus, JobsError, JobsResult,
    OwnerId, Progress, UnitId, WorkItem,
    config::{to_chrono, JobsConfig},
    observability::{BoxStream, JobMetrics, ObservabilityLayer},
    queue::WorkQueue,
    retry::RetryDecision,
    store::JobStore,
    JobEvent,
};

/// Result of reporting a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// The remaining units were requeued as `attempt`, eligible from `retry_at`
    Retrying {
        attempt: u32,
        retry_at: DateTime<Utc>,
    },
    /// The job is now terminally failed
    Failed,
}

/// What a transition closure decided to do with the record
enum Change<T> {
    /// Persist the mutated record
    Write(T),
    /// Leave the record as stored
    Keep(T),
}

/// The only writer of job status
///
/// Every mutation is a read-modify-write against the store, committed with a
/// compare-and-swap on `Job::version`, so two coordinators (or two workers
/// calling one coordinator) never both win the same transition.
pub struct JobCoordinator<S: JobStore, Q: WorkQueue> {
    store: Arc<S>,
    queue: Arc<Q>,
    config: JobsConfig,
    observability: ObservabilityLayer,
    tokens: DashMap<JobId, CancellationToken>,
}

impl<S: JobStore, Q: WorkQueue> JobCoordinator<S, Q> {
    pub fn new(store: Arc<S>, queue: Arc<Q>, config: JobsConfig) -> Self {
        Self {
            store,
            queue,
            config,
            observability: ObservabilityLayer::new(),
            tokens: DashMap::new(),
        }
    }

    /// Share an observability layer with other components
    pub fn with_observability(mut self, observability: ObservabilityLayer) -> Self {
        self.observability = observability;
        self
    }

    pub fn config(&self) -> &JobsConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<Q> {
        &self.queue
    }

    /// Register a new job and queue all of its units
    #[instrument(skip(self, unit_ids), fields(owner_id = %owner_id, units = unit_ids.len()))]
    pub async fn create(&self, owner_id: OwnerId, unit_ids: Vec<UnitId>, priority: JobPriority) -> JobsResult<JobId> {
        if unit_ids.is_empty() {
            return Err(JobsError::invalid("a job needs at least one unit"));
        }
        if unit_ids.iter().any(|unit| unit.as_str().is_empty()) {
            return Err(JobsError::invalid("unit ids must not be empty"));
        }
        let mut seen = HashSet::with_capacity(unit_ids.len());
        if let Some(duplicate) = unit_ids.iter().find(|unit| !seen.insert(*unit)) {
            return Err(JobsError::invalid(format!("duplicate unit id {}", duplicate)));
        }

        let now = Utc::now();
        let job = Job::new(
            owner_id,
            unit_ids,
            priority,
            now,
            now + to_chrono(self.config.retention_for(JobStatus::Pending)),
        );
        let job_id = job.id.clone();

        self.store.insert(job.clone()).await?;
        self.tokens.insert(job_id.clone(), CancellationToken::new());

        let item = WorkItem::new(job_id.clone(), job.unit_ids.clone(), job.attempt);
        if let Err(err) = self.queue.enqueue(item, priority).await {
            // Nothing will ever pick the job up, so do not leave it pending
            self.abandon(&job_id, &err).await;
            return Err(err);
        }

        self.observability.record_job_created(&job);
        info!("Created job {} with {} units at {} priority", job_id, job.progress.total, priority);
        Ok(job_id)
    }

    /// Move a pending job to processing and hand back the units still to do
    ///
    /// Claiming a job that is already processing is a no-op returning the
    /// current remaining units, which is how redelivered and retried items
    /// resume where the last attempt stopped.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn claim(&self, job_id: &JobId) -> JobsResult<WorkItem> {
        let (job, claimed) = self
            .update(job_id, |job, now| match job.status {
                JobStatus::Pending => {
                    job.mark_processing(now);
                    Ok(Change::Write(true))
                }
                JobStatus::Processing => Ok(Change::Keep(false)),
                status => Err(JobsError::conflict(format!("job {} is already {}", job.id, status))),
            })
            .await?;

        if claimed {
            self.observability.record_job_claimed(&job);
            info!("Job {} claimed (attempt {})", job.id, job.attempt);
        }

        Ok(WorkItem::new(job.id.clone(), job.remaining_units().to_vec(), job.attempt))
    }

    /// Record that the first `completed` units are done
    ///
    /// Progress never moves backwards: stale or duplicate reports are ignored.
    /// Reports for a job that already reached a terminal state are accepted
    /// and dropped so that a worker racing a cancellation does not error out.
    /// A report that finds the job cancelled, possibly by another coordinator
    /// on the same store, fires the job's local cancellation token.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn report_progress(&self, job_id: &JobId, completed: u32) -> JobsResult<Progress> {
        let (job, advanced) = self
            .update(job_id, |job, _now| {
                if completed > job.progress.total {
                    return Err(JobsError::invalid(format!(
                        "progress {} exceeds total {} for job {}",
                        completed, job.progress.total, job.id
                    )));
                }

                match job.status {
                    JobStatus::Pending => Err(JobsError::conflict(format!("job {} has not been claimed", job.id))),
                    status if status.is_terminal() => {
                        info!("Ignoring progress {} for job {} in terminal state {}", completed, job.id, status);
                        Ok(Change::Keep(false))
                    }
                    _ if completed <= job.progress.completed => {
                        debug!(
                            "Ignoring stale progress {} for job {} (stored {})",
                            completed, job.id, job.progress.completed
                        );
                        Ok(Change::Keep(false))
                    }
                    _ => {
                        job.progress.completed = completed;
                        Ok(Change::Write(true))
                    }
                }
            })
            .await?;

        if advanced {
            self.observability.record_job_progressed(&job);
            debug!("Job {} progress {}/{}", job.id, job.progress.completed, job.progress.total);
        } else if job.status == JobStatus::Cancelled {
            self.fire_token(&job.id);
        }

        Ok(job.progress)
    }

    /// Attach the published result and finish the job
    #[instrument(skip(self, result), fields(job_id = %job_id))]
    pub async fn complete(&self, job_id: &JobId, result: JobResult) -> JobsResult<Job> {
        let retention = to_chrono(self.config.retention_for(JobStatus::Completed));
        let (job, completed) = self
            .update(job_id, |job, now| match job.status {
                JobStatus::Processing if !job.progress.is_done() => Err(JobsError::conflict(format!(
                    "job {} has only {}/{} units done",
                    job.id, job.progress.completed, job.progress.total
                ))),
                JobStatus::Processing => {
                    job.mark_completed(result.clone(), now, now + retention);
                    Ok(Change::Write(true))
                }
                JobStatus::Completed if job.result.as_ref() == Some(&result) => Ok(Change::Keep(false)),
                JobStatus::Completed => Err(JobsError::conflict(format!(
                    "job {} already completed with a different result",
                    job.id
                ))),
                status => Err(JobsError::conflict(format!("cannot complete job {} in state {}", job.id, status))),
            })
            .await?;

        if completed {
            self.tokens.remove(&job.id);
            self.observability.record_job_completed(&job);
            info!("Job {} completed ({} bytes)", job.id, result.size_bytes);
        } else {
            debug!("Duplicate completion for job {} ignored", job.id);
        }

        Ok(job)
    }

    /// Record a failed attempt: requeue with backoff or fail for good
    ///
    /// The retry item is queued before the attempt bump is committed. If the
    /// queue refuses it the record is untouched and the failed delivery,
    /// left unacknowledged by the caller, resumes the same attempt.
    #[instrument(skip(self, failure), fields(job_id = %job_id, kind = %failure.kind))]
    pub async fn fail(&self, job_id: &JobId, failure: JobFailure) -> JobsResult<FailOutcome> {
        let current = self.get_status(job_id).await?;
        if current.status != JobStatus::Processing {
            return Err(JobsError::conflict(format!("cannot fail job {} in state {}", current.id, current.status)));
        }

        let failed_attempt = current.attempt;
        let decision = self.config.retry.decide(failed_attempt, &failure, Utc::now());
        if let RetryDecision::Retry { next_attempt, retry_at } = decision {
            let item = WorkItem::new(current.id.clone(), current.remaining_units().to_vec(), next_attempt)
                .with_not_before(retry_at);
            self.queue.enqueue(item, current.priority).await?;
        }

        let retention = to_chrono(self.config.retention_for(JobStatus::Failed));
        let (job, outcome) = self
            .update(job_id, |job, now| {
                if job.status != JobStatus::Processing {
                    return Err(JobsError::conflict(format!("cannot fail job {} in state {}", job.id, job.status)));
                }
                if job.attempt != failed_attempt {
                    return Err(JobsError::conflict(format!(
                        "attempt {} of job {} was already settled",
                        failed_attempt, job.id
                    )));
                }

                match decision {
                    RetryDecision::Retry { next_attempt, retry_at } => {
                        job.schedule_retry(failure.clone());
                        Ok(Change::Write(FailOutcome::Retrying { attempt: next_attempt, retry_at }))
                    }
                    RetryDecision::GiveUp => {
                        job.mark_failed(failure.clone(), now, now + retention);
                        Ok(Change::Write(FailOutcome::Failed))
                    }
                }
            })
            .await?;

        match outcome {
            FailOutcome::Retrying { attempt, retry_at } => {
                self.observability.record_job_retrying(&job, retry_at, &failure);
                warn!("Job {} attempt {} failed, retrying at {}: {}", job.id, attempt - 1, retry_at, failure);
            }
            FailOutcome::Failed => {
                self.tokens.remove(&job.id);
                self.observability.record_job_failed(&job, &failure);
                warn!("Job {} failed after {} attempt(s): {}", job.id, job.attempt, failure);
            }
        }

        Ok(outcome)
    }

    /// Cancel a job that has not reached a terminal state
    ///
    /// Workers holding the job's cancellation token stop at their next unit
    /// boundary.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn cancel(&self, job_id: &JobId) -> JobsResult<Job> {
        let retention = to_chrono(self.config.retention_for(JobStatus::Cancelled));
        let (job, previous) = self
            .update(job_id, |job, now| match job.status {
                JobStatus::Pending | JobStatus::Processing => {
                    let previous = job.status;
                    job.mark_cancelled(now, now + retention);
                    Ok(Change::Write(previous))
                }
                status => Err(JobsError::conflict(format!("cannot cancel job {} in state {}", job.id, status))),
            })
            .await?;

        self.fire_token(&job.id);
        self.observability.record_job_cancelled(&job);
        warn!(
            "Job {} cancelled by client request while {} ({}/{} units done)",
            job.id, previous, job.progress.completed, job.progress.total
        );

        Ok(job)
    }

    /// The record as stored; `NotFound` once it has expired
    pub async fn get_status(&self, job_id: &JobId) -> JobsResult<Job> {
        self.store
            .get(job_id)
            .await?
            .ok_or_else(|| JobsError::not_found(job_id.to_string()))
    }

    /// Token fired when the job is cancelled
    pub async fn cancellation_token(&self, job_id: &JobId) -> JobsResult<CancellationToken> {
        self.observe_cancellation(job_id).await?;
        Ok(self.token(job_id))
    }

    pub async fn is_cancelled(&self, job_id: &JobId) -> JobsResult<bool> {
        Ok(self.get_status(job_id).await?.status == JobStatus::Cancelled)
    }

    /// Read the stored status and fire the local token if the job was cancelled
    ///
    /// This is how a cancel issued through another coordinator on the same
    /// store reaches the workers of this one.
    pub async fn observe_cancellation(&self, job_id: &JobId) -> JobsResult<bool> {
        let cancelled = self.is_cancelled(job_id).await?;
        if cancelled {
            self.fire_token(job_id);
        }
        Ok(cancelled)
    }

    /// Stream of lifecycle events emitted after the call
    pub fn subscribe(&self) -> BoxStream<JobEvent> {
        self.observability.subscribe()
    }

    pub fn metrics(&self) -> &JobMetrics {
        self.observability.metrics()
    }

    pub fn observability(&self) -> &ObservabilityLayer {
        &self.observability
    }

    /// Drop records past their TTL and forget their cancellation tokens
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> JobsResult<Vec<JobId>> {
        let purged = self.store.purge_expired(now).await?;
        for job_id in &purged {
            self.tokens.remove(job_id);
            self.observability.record_job_expired(job_id, now);
        }

        if !purged.is_empty() {
            info!("Purged {} expired job record(s)", purged.len());
        }
        Ok(purged)
    }

    /// Refresh the queue-depth gauge
    pub async fn refresh_queue_depth(&self) -> JobsResult<usize> {
        let depth = self.queue.depth().await?.total();
        self.metrics().set_queue_depth(depth);
        Ok(depth)
    }

    fn token(&self, job_id: &JobId) -> CancellationToken {
        self.tokens
            .entry(job_id.clone())
            .or_insert_with(CancellationToken::new)
            .value()
            .clone()
    }

    fn fire_token(&self, job_id: &JobId) {
        let token = self.token(job_id);
        if !token.is_cancelled() {
            debug!("Firing cancellation token of job {}", job_id);
            token.cancel();
        }
    }

    /// Optimistic read-modify-write of one record
    async fn update<T, F>(&self, job_id: &JobId, mut apply: F) -> JobsResult<(Job, T)>
    where
        F: FnMut(&mut Job, DateTime<Utc>) -> JobsResult<Change<T>>,
    {
        for _ in 0..self.config.cas_retry_limit {
            let current = self.get_status(job_id).await?;
            let now = Utc::now();
            let mut next = current.clone();

            match apply(&mut next, now)? {
                Change::Keep(output) => return Ok((current, output)),
                Change::Write(output) => {
                    next.version = current.version + 1;
                    next.updated_at = now;
                    if self.store.compare_and_swap(current.version, next.clone()).await? {
                        return Ok((next, output));
                    }
                    debug!("Version conflict on job {} at version {}, retrying", job_id, current.version);
                }
            }
        }

        Err(JobsError::unavailable(format!(
            "job {} is contended: {} write attempts lost",
            job_id, self.config.cas_retry_limit
        )))
    }

    /// Fail a job that could not be queued
    async fn abandon(&self, job_id: &JobId, cause: &JobsError) {
        let failure = JobFailure::new(ErrorKind::Unavailable, format!("could not queue job: {}", cause));
        let retention = to_chrono(self.config.retention_for(JobStatus::Failed));
        let result = self
            .update(job_id, |job, now| {
                job.mark_failed(failure.clone(), now, now + retention);
                Ok(Change::Write(()))
            })
            .await;

        self.tokens.remove(job_id);
        match result {
            Ok((job, ())) => {
                self.observability.record_job_failed(&job, &failure);
                warn!("Job {} failed at creation: {}", job_id, failure);
            }
            Err(err) => warn!("Job {} could not be queued nor marked failed: {}", job_id, err),
        }
    }
}
