use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    Delivery, Job, JobFailure, JobId, JobResult, JobsError, UnitError, UnitId, WorkerId,
    config::{to_chrono, JobsConfig},
    coordinator::{FailOutcome, JobCoordinator},
    publisher::ResultPublisher,
    queue::WorkQueue,
    store::JobStore,
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Back-off after a store or queue error before dequeuing again
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

/// Everything a processor needs to handle one unit
#[derive(Debug, Clone)]
pub struct UnitContext {
    pub job_id: JobId,
    pub unit_id: UnitId,

    /// Position of the unit in the job (0-based)
    pub index: u32,

    /// Attempt the unit runs under
    pub attempt: u32,

    /// Fired when the job is cancelled; long units should poll it
    pub cancel: CancellationToken,
}

/// The work behind a job, supplied by the application
#[async_trait]
pub trait UnitProcessor: Send + Sync + 'static {
    /// Process one unit; must be safe to run again for the same unit
    async fn process_unit(&self, ctx: UnitContext) -> Result<(), UnitError>;

    /// Produce the final artifact once every unit is done and return its storage location
    async fn finish(&self, job: &Job, cancel: CancellationToken) -> Result<String, UnitError>;
}

/// What a worker did with a delivery
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Completed {
        worker_id: WorkerId,
        job_id: JobId,
        result: JobResult,
    },
    Retrying {
        worker_id: WorkerId,
        job_id: JobId,
        attempt: u32,
        retry_at: DateTime<Utc>,
    },
    Failed {
        worker_id: WorkerId,
        job_id: JobId,
        failure: JobFailure,
    },
    /// Stopped at a unit boundary because the job was cancelled
    Cancelled {
        worker_id: WorkerId,
        job_id: JobId,
    },
    /// Stopped for shutdown; the delivery is left for redelivery
    Interrupted {
        worker_id: WorkerId,
        job_id: JobId,
    },
    /// Acknowledged without processing (job terminal, gone, or the item superseded)
    Dropped {
        worker_id: WorkerId,
        job_id: JobId,
        reason: String,
    },
    /// Store or queue trouble; any delivery is left for redelivery
    Error {
        worker_id: WorkerId,
        job_id: Option<JobId>,
        error: JobsError,
    },
}

impl WorkerEvent {
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            Self::Completed { job_id, .. }
            | Self::Retrying { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Cancelled { job_id, .. }
            | Self::Interrupted { job_id, .. }
            | Self::Dropped { job_id, .. } => Some(job_id),
            Self::Error { job_id, .. } => job_id.as_ref(),
        }
    }
}

/// Handle for controlling a running pool
pub struct PoolHandle {
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    events: mpsc::Receiver<WorkerEvent>,
}

impl PoolHandle {
    /// Outcomes reported by the workers
    pub fn events(&mut self) -> &mut mpsc::Receiver<WorkerEvent> {
        &mut self.events
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stop dequeuing, let in-flight units finish and wait for every worker
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for worker in self.workers {
            if let Err(err) = worker.await {
                error!("Worker task ended abnormally: {}", err);
            }
        }
        info!("Worker pool stopped");
    }
}

/// Spawns the workers that drive jobs from the queue to completion
pub struct WorkerPool;

impl WorkerPool {
    #[instrument(skip_all, fields(workers = config.workers))]
    pub fn start<S, Q, P>(
        coordinator: Arc<JobCoordinator<S, Q>>,
        queue: Arc<Q>,
        processor: Arc<P>,
        publisher: Arc<ResultPublisher>,
        config: &JobsConfig,
    ) -> PoolHandle
    where
        S: JobStore + 'static,
        Q: WorkQueue + 'static,
        P: UnitProcessor,
    {
        let shutdown = CancellationToken::new();
        let (events_tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let workers = (0..config.workers.max(1))
            .map(|index| {
                let worker = Worker {
                    id: WorkerId::indexed(index),
                    coordinator: coordinator.clone(),
                    queue: queue.clone(),
                    processor: processor.clone(),
                    publisher: publisher.clone(),
                    config: config.clone(),
                    shutdown: shutdown.clone(),
                    events: events_tx.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect::<Vec<_>>();

        info!("Started {} workers", workers.len());
        PoolHandle {
            shutdown,
            workers,
            events,
        }
    }
}

/// Why processing of a delivery stopped early
enum Interrupt {
    Cancelled,
    Shutdown,
    LeaseLost(JobsError),
    Unit(UnitError),
    Publish(JobsError),
    Engine(JobsError),
}

struct Worker<S: JobStore, Q: WorkQueue, P: UnitProcessor> {
    id: WorkerId,
    coordinator: Arc<JobCoordinator<S, Q>>,
    queue: Arc<Q>,
    processor: Arc<P>,
    publisher: Arc<ResultPublisher>,
    config: JobsConfig,
    shutdown: CancellationToken,
    events: mpsc::Sender<WorkerEvent>,
}

impl<S: JobStore + 'static, Q: WorkQueue + 'static, P: UnitProcessor> Worker<S, Q, P> {
    async fn run(self) {
        info!("{} started", self.id);

        loop {
            let dequeued = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                dequeued = self.queue.dequeue(&self.id) => dequeued,
            };

            let pause = match dequeued {
                Ok(Some(delivery)) => {
                    self.handle(delivery).await;
                    continue;
                }
                Ok(None) => self.config.poll_interval,
                Err(err) => {
                    error!("{} could not dequeue: {}", self.id, err);
                    self.emit(WorkerEvent::Error {
                        worker_id: self.id.clone(),
                        job_id: None,
                        error: err,
                    });
                    ERROR_BACKOFF
                }
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!("{} stopped", self.id);
    }

    #[instrument(skip(self, delivery), fields(worker = %self.id, job_id = %delivery.job_id()))]
    async fn handle(&self, delivery: Delivery) {
        let job_id = delivery.job_id().clone();
        if delivery.is_redelivery() {
            warn!("Job {} redelivered (delivery {})", job_id, delivery.delivery_count);
        }

        let claimed = match self.coordinator.claim(&job_id).await {
            Ok(item) => item,
            Err(err @ (JobsError::Conflict(_) | JobsError::NotFound(_))) => {
                self.drop_delivery(&delivery, err.to_string()).await;
                return;
            }
            Err(err) => {
                self.report_error(&job_id, err);
                return;
            }
        };

        if delivery.item.attempt < claimed.attempt {
            let reason = format!("attempt {} superseded by attempt {}", delivery.item.attempt, claimed.attempt);
            self.drop_delivery(&delivery, reason).await;
            return;
        }

        let cancel = match self.coordinator.cancellation_token(&job_id).await {
            Ok(token) => token,
            Err(err) => {
                self.report_error(&job_id, err);
                return;
            }
        };
        let job = match self.coordinator.get_status(&job_id).await {
            Ok(job) => job,
            Err(err) => {
                self.report_error(&job_id, err);
                return;
            }
        };

        let Some(deadline) = self.deadline(&job) else {
            self.record_failure(&delivery, self.deadline_failure()).await;
            return;
        };
        let run = tokio::time::timeout_at(deadline, self.run_job(&delivery, job, claimed.attempt, &cancel)).await;

        match run {
            Ok(Ok(result)) => self.finish(&delivery, result).await,
            Ok(Err(interrupt)) => self.interrupted(&delivery, interrupt).await,
            Err(_) => self.record_failure(&delivery, self.deadline_failure()).await,
        }
    }

    /// When the job's wall-clock budget runs out, counted from its first claim
    ///
    /// `None` once the budget is spent, so a redelivery cannot restart it.
    fn deadline(&self, job: &Job) -> Option<Instant> {
        let started_at = job.started_at.unwrap_or(job.updated_at);
        let remaining = (started_at + to_chrono(self.config.job_deadline) - Utc::now())
            .to_std()
            .ok()?;
        (!remaining.is_zero()).then(|| Instant::now() + remaining)
    }

    fn deadline_failure(&self) -> JobFailure {
        JobFailure::timeout(format!(
            "job exceeded its {}s deadline",
            self.config.job_deadline.as_secs_f64()
        ))
    }

    /// Process the remaining units, then build and publish the artifact
    async fn run_job(&self, delivery: &Delivery, job: Job, attempt: u32, cancel: &CancellationToken) -> Result<JobResult, Interrupt> {
        let job_id = delivery.job_id();
        let first = job.progress.completed;

        for (offset, unit_id) in job.remaining_units().iter().enumerate() {
            self.checkpoint(cancel)?;

            let index = first + offset as u32;
            debug!("Processing unit {} ({}/{}) of job {}", unit_id, index + 1, job.progress.total, job_id);
            let unit = self.processor.process_unit(UnitContext {
                job_id: job_id.clone(),
                unit_id: unit_id.clone(),
                index,
                attempt,
                cancel: cancel.clone(),
            });
            self.with_heartbeat(delivery, unit).await?.map_err(Interrupt::Unit)?;

            self.coordinator
                .report_progress(job_id, index + 1)
                .await
                .map_err(Interrupt::Engine)?;
            self.keep_alive(delivery).await?;
        }

        self.checkpoint(cancel)?;
        let job = self.coordinator.get_status(job_id).await.map_err(Interrupt::Engine)?;
        let location = self
            .with_heartbeat(delivery, self.processor.finish(&job, cancel.clone()))
            .await?
            .map_err(Interrupt::Unit)?;

        // No credential for a job cancelled while its artifact was built
        if self.coordinator.observe_cancellation(job_id).await.map_err(Interrupt::Engine)? {
            return Err(Interrupt::Cancelled);
        }
        self.with_heartbeat(delivery, self.publisher.publish(job_id, &location))
            .await?
            .map_err(Interrupt::Publish)
    }

    /// Drive `work` while renewing the delivery's lease and watching the stored status
    async fn with_heartbeat<F: Future>(&self, delivery: &Delivery, work: F) -> Result<F::Output, Interrupt> {
        tokio::pin!(work);
        let period = self.heartbeat_period();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                output = &mut work => return Ok(output),
                _ = heartbeat.tick() => {
                    self.keep_alive(delivery).await?;
                    if let Err(err) = self.coordinator.observe_cancellation(delivery.job_id()).await {
                        warn!("{} could not check job {} for cancellation: {}", self.id, delivery.job_id(), err);
                    }
                }
            }
        }
    }

    fn heartbeat_period(&self) -> Duration {
        (self.config.visibility_timeout / 3).max(MIN_HEARTBEAT)
    }

    async fn keep_alive(&self, delivery: &Delivery) -> Result<(), Interrupt> {
        self.queue
            .extend_visibility(delivery, self.config.visibility_timeout)
            .await
            .map(|_| ())
            .map_err(|err| match err {
                JobsError::Conflict(_) => Interrupt::LeaseLost(err),
                err => Interrupt::Engine(err),
            })
    }

    fn checkpoint(&self, cancel: &CancellationToken) -> Result<(), Interrupt> {
        if cancel.is_cancelled() {
            Err(Interrupt::Cancelled)
        } else if self.shutdown.is_cancelled() {
            Err(Interrupt::Shutdown)
        } else {
            Ok(())
        }
    }

    async fn finish(&self, delivery: &Delivery, result: JobResult) {
        let job_id = delivery.job_id().clone();
        match self.coordinator.complete(&job_id, result.clone()).await {
            Ok(_) => {
                self.acknowledge(delivery).await;
                self.emit(WorkerEvent::Completed {
                    worker_id: self.id.clone(),
                    job_id,
                    result,
                });
            }
            Err(err @ JobsError::Conflict(_)) => self.drop_delivery(delivery, err.to_string()).await,
            Err(err) => self.report_error(&job_id, err),
        }
    }

    async fn interrupted(&self, delivery: &Delivery, interrupt: Interrupt) {
        let job_id = delivery.job_id().clone();
        match interrupt {
            Interrupt::Cancelled => {
                info!("{} stopped job {} after cancellation", self.id, job_id);
                self.acknowledge(delivery).await;
                self.emit(WorkerEvent::Cancelled {
                    worker_id: self.id.clone(),
                    job_id,
                });
            }
            Interrupt::Shutdown => {
                info!("{} leaving job {} for redelivery on shutdown", self.id, job_id);
                self.emit(WorkerEvent::Interrupted {
                    worker_id: self.id.clone(),
                    job_id,
                });
            }
            Interrupt::LeaseLost(err) => {
                warn!("{} lost the lease on job {}: {}", self.id, job_id, err);
                self.report_error(&job_id, err);
            }
            Interrupt::Unit(err) => self.record_failure(delivery, err.into()).await,
            Interrupt::Publish(err) => {
                let failure = JobFailure::new(err.kind(), format!("publishing result failed: {}", err));
                self.record_failure(delivery, failure).await;
            }
            Interrupt::Engine(err) => self.report_error(&job_id, err),
        }
    }

    async fn record_failure(&self, delivery: &Delivery, failure: JobFailure) {
        let job_id = delivery.job_id().clone();
        match self.coordinator.fail(&job_id, failure.clone()).await {
            Ok(FailOutcome::Retrying { attempt, retry_at }) => {
                self.acknowledge(delivery).await;
                self.emit(WorkerEvent::Retrying {
                    worker_id: self.id.clone(),
                    job_id,
                    attempt,
                    retry_at,
                });
            }
            Ok(FailOutcome::Failed) => {
                self.acknowledge(delivery).await;
                self.emit(WorkerEvent::Failed {
                    worker_id: self.id.clone(),
                    job_id,
                    failure,
                });
            }
            Err(err @ JobsError::Conflict(_)) => self.drop_delivery(delivery, err.to_string()).await,
            Err(err) => self.report_error(&job_id, err),
        }
    }

    async fn drop_delivery(&self, delivery: &Delivery, reason: String) {
        debug!("{} dropping delivery of job {}: {}", self.id, delivery.job_id(), reason);
        self.acknowledge(delivery).await;
        self.emit(WorkerEvent::Dropped {
            worker_id: self.id.clone(),
            job_id: delivery.job_id().clone(),
            reason,
        });
    }

    async fn acknowledge(&self, delivery: &Delivery) {
        if let Err(err) = self.queue.acknowledge(delivery).await {
            // Redelivery of a settled item is dropped at claim time
            warn!("{} could not acknowledge job {}: {}", self.id, delivery.job_id(), err);
        }
    }

    fn report_error(&self, job_id: &JobId, err: JobsError) {
        error!("{} failed handling job {}: {}", self.id, job_id, err);
        self.emit(WorkerEvent::Error {
            worker_id: self.id.clone(),
            job_id: Some(job_id.clone()),
            error: err,
        });
    }

    fn emit(&self, event: WorkerEvent) {
        if let Err(err) = self.events.try_send(event) {
            debug!("{} dropped worker event: {}", self.id, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use crate::{
        ErrorKind, JobPriority, JobStatus, JobsResult, MemoryJobStore, MemoryWorkQueue, OwnerId, RetryPolicy,
        publisher::{ArtifactSigner, PresignRequest, PresignedArtifact},
        queue::testing::FlakyQueue,
    };

    struct StubSigner;

    #[async_trait]
    impl ArtifactSigner for StubSigner {
        async fn presign(&self, request: &PresignRequest) -> JobsResult<PresignedArtifact> {
            Ok(PresignedArtifact {
                url: format!("https://files.local/{}?job={}", request.location, request.job_id),
                size_bytes: 2048,
            })
        }
    }

    /// Fails the first `failures` calls of `process_unit`, sleeps `delay` per unit
    struct ScriptedProcessor {
        failures: AtomicU32,
        failure: UnitError,
        delay: Duration,
        calls: AtomicU32,
    }

    impl ScriptedProcessor {
        fn ok() -> Self {
            Self::failing(0, UnitError::processing("unused"))
        }

        fn failing(failures: u32, failure: UnitError) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                failure,
                delay: Duration::ZERO,
                calls: AtomicU32::new(0),
            }
        }

        fn slow(delay: Duration) -> Self {
            Self { delay, ..Self::ok() }
        }
    }

    #[async_trait]
    impl UnitProcessor for ScriptedProcessor {
        async fn process_unit(&self, _ctx: UnitContext) -> Result<(), UnitError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(self.failure.clone());
            }
            Ok(())
        }

        async fn finish(&self, job: &Job, _cancel: CancellationToken) -> Result<String, UnitError> {
            Ok(format!("{}.zip", job.id))
        }
    }

    struct Harness {
        coordinator: Arc<JobCoordinator<MemoryJobStore, MemoryWorkQueue>>,
        handle: PoolHandle,
    }

    fn config() -> JobsConfig {
        JobsConfig::default()
            .with_workers(2)
            .with_poll_interval(Duration::from_millis(5))
            .with_dispatch_rate(0, 0)
            .with_retry(RetryPolicy::new(3, Duration::from_millis(20)))
    }

    fn start(processor: ScriptedProcessor, config: JobsConfig) -> (Harness, Arc<ScriptedProcessor>) {
        let queue = Arc::new(MemoryWorkQueue::from_config(&config));
        let coordinator = Arc::new(JobCoordinator::new(
            Arc::new(MemoryJobStore::new()),
            queue.clone(),
            config.clone(),
        ));
        let processor = Arc::new(processor);
        let (handle, _) = spawn_pool(&coordinator, &queue, &processor, &config);
        (Harness { coordinator, handle }, processor)
    }

    fn spawn_pool<Q: WorkQueue + 'static>(
        coordinator: &Arc<JobCoordinator<MemoryJobStore, Q>>,
        queue: &Arc<Q>,
        processor: &Arc<ScriptedProcessor>,
        config: &JobsConfig,
    ) -> (PoolHandle, Arc<ResultPublisher>) {
        let publisher = Arc::new(ResultPublisher::new(Arc::new(StubSigner), config.url_ttl));
        let handle = WorkerPool::start(
            coordinator.clone(),
            queue.clone(),
            processor.clone(),
            publisher.clone(),
            config,
        );
        (handle, publisher)
    }

    async fn next_event(handle: &mut PoolHandle) -> WorkerEvent {
        tokio::time::timeout(Duration::from_secs(5), handle.events().recv())
            .await
            .expect("worker event within 5s")
            .expect("event channel open")
    }

    async fn create<Q: WorkQueue>(coordinator: &JobCoordinator<MemoryJobStore, Q>, units: &[&str]) -> JobId {
        coordinator
            .create(
                OwnerId::from("owner-1"),
                units.iter().map(|unit| UnitId::from(*unit)).collect(),
                JobPriority::Normal,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn processes_every_unit_and_completes() {
        let (mut harness, processor) = start(ScriptedProcessor::ok(), config());
        let job_id = create(&harness.coordinator, &["a", "b", "c"]).await;

        let event = next_event(&mut harness.handle).await;
        let WorkerEvent::Completed { job_id: done, result, .. } = event else {
            panic!("expected completion, got {:?}", event);
        };
        assert_eq!(done, job_id);
        assert_eq!(result.size_bytes, 2048);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 3);

        let job = harness.coordinator.get_status(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress.completed, 3);
        assert_eq!(job.result, Some(result));
        assert_eq!(harness.coordinator.queue().depth().await.unwrap().total(), 0);

        harness.handle.shutdown().await;
    }

    #[tokio::test]
    async fn transient_failure_is_retried_and_resumes() {
        let (mut harness, processor) = start(ScriptedProcessor::failing(1, UnitError::unavailable("s3 down")), config());
        let job_id = create(&harness.coordinator, &["a", "b"]).await;

        let event = next_event(&mut harness.handle).await;
        assert!(matches!(event, WorkerEvent::Retrying { attempt: 2, .. }), "got {:?}", event);

        let event = next_event(&mut harness.handle).await;
        assert!(matches!(event, WorkerEvent::Completed { .. }), "got {:?}", event);

        let job = harness.coordinator.get_status(&job_id).await.unwrap();
        assert_eq!(job.attempt, 2);
        assert_eq!(job.last_error.map(|e| e.kind), Some(ErrorKind::Unavailable));
        assert_eq!(processor.calls.load(Ordering::SeqCst), 3);

        harness.handle.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_unit_fails_immediately() {
        let (mut harness, _) = start(ScriptedProcessor::failing(1, UnitError::invalid("not a file")), config());
        let job_id = create(&harness.coordinator, &["a"]).await;

        let event = next_event(&mut harness.handle).await;
        let WorkerEvent::Failed { failure, .. } = event else {
            panic!("expected failure, got {:?}", event);
        };
        assert_eq!(failure.kind, ErrorKind::InvalidArgument);

        let job = harness.coordinator.get_status(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt, 1);

        harness.handle.shutdown().await;
    }

    #[tokio::test]
    async fn deadline_fails_job_with_timeout() {
        let config = config().with_job_deadline(Duration::from_millis(50));
        let (mut harness, _) = start(ScriptedProcessor::slow(Duration::from_secs(2)), config);
        let job_id = create(&harness.coordinator, &["a"]).await;

        let event = next_event(&mut harness.handle).await;
        let WorkerEvent::Failed { failure, .. } = event else {
            panic!("expected failure, got {:?}", event);
        };
        assert_eq!(failure.kind, ErrorKind::Timeout);

        let job = harness.coordinator.get_status(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.map(|e| e.kind), Some(ErrorKind::Timeout));

        harness.handle.shutdown().await;
    }

    #[tokio::test]
    async fn cancellation_stops_at_unit_boundary() {
        let (mut harness, processor) = start(ScriptedProcessor::slow(Duration::from_millis(100)), config());
        let job_id = create(&harness.coordinator, &["a", "b", "c", "d", "e"]).await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        harness.coordinator.cancel(&job_id).await.unwrap();

        let event = next_event(&mut harness.handle).await;
        assert!(matches!(event, WorkerEvent::Cancelled { .. }), "got {:?}", event);
        assert!(processor.calls.load(Ordering::SeqCst) < 5);

        let job = harness.coordinator.get_status(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.result.is_none());

        harness.handle.shutdown().await;
    }

    #[tokio::test]
    async fn refused_retry_is_resumed_by_redelivery() {
        let config = config().with_visibility_timeout(Duration::from_millis(150));
        let queue = Arc::new(FlakyQueue::new(MemoryWorkQueue::from_config(&config)));
        let coordinator = Arc::new(JobCoordinator::new(
            Arc::new(MemoryJobStore::new()),
            queue.clone(),
            config.clone(),
        ));
        let job_id = create(&coordinator, &["a", "b"]).await;
        queue.refuse_enqueue(true);

        let processor = Arc::new(ScriptedProcessor::failing(1, UnitError::unavailable("s3 down")));
        let (mut handle, _) = spawn_pool(&coordinator, &queue, &processor, &config);

        let event = next_event(&mut handle).await;
        assert!(matches!(event, WorkerEvent::Error { error: JobsError::Unavailable(_), .. }), "got {:?}", event);
        queue.refuse_enqueue(false);

        let event = next_event(&mut handle).await;
        assert!(matches!(event, WorkerEvent::Completed { .. }), "got {:?}", event);

        let job = coordinator.get_status(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempt, 1);
        assert_eq!(queue.depth().await.unwrap().total(), 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_through_another_coordinator_stops_the_worker() {
        let config = config();
        let store = Arc::new(MemoryJobStore::new());
        let queue = Arc::new(MemoryWorkQueue::from_config(&config));
        let local = Arc::new(JobCoordinator::new(store.clone(), queue.clone(), config.clone()));
        let remote = JobCoordinator::new(store, queue.clone(), config.clone());

        let processor = Arc::new(ScriptedProcessor::slow(Duration::from_millis(100)));
        let (mut handle, publisher) = spawn_pool(&local, &queue, &processor, &config);
        let job_id = create(&local, &["a", "b", "c", "d", "e", "f"]).await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        remote.cancel(&job_id).await.unwrap();

        let event = next_event(&mut handle).await;
        assert!(matches!(event, WorkerEvent::Cancelled { .. }), "got {:?}", event);
        assert!(processor.calls.load(Ordering::SeqCst) < 6);
        assert_eq!(publisher.issued_count(), 0);
        assert_eq!(local.get_status(&job_id).await.unwrap().status, JobStatus::Cancelled);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn long_unit_keeps_its_lease() {
        let config = config().with_visibility_timeout(Duration::from_millis(100));
        let (mut harness, processor) = start(ScriptedProcessor::slow(Duration::from_millis(400)), config);
        let job_id = create(&harness.coordinator, &["a"]).await;

        let event = next_event(&mut harness.handle).await;
        assert!(matches!(event, WorkerEvent::Completed { .. }), "got {:?}", event);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(harness.coordinator.get_status(&job_id).await.unwrap().status, JobStatus::Completed);

        harness.handle.shutdown().await;
    }

    #[tokio::test]
    async fn deadline_runs_from_the_first_claim() {
        let config = config().with_job_deadline(Duration::from_millis(100));
        let queue = Arc::new(MemoryWorkQueue::from_config(&config));
        let coordinator = Arc::new(JobCoordinator::new(
            Arc::new(MemoryJobStore::new()),
            queue.clone(),
            config.clone(),
        ));
        let job_id = create(&coordinator, &["a"]).await;
        coordinator.claim(&job_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let processor = Arc::new(ScriptedProcessor::ok());
        let (mut handle, _) = spawn_pool(&coordinator, &queue, &processor, &config);

        let event = next_event(&mut handle).await;
        let WorkerEvent::Failed { failure, .. } = event else {
            panic!("expected failure, got {:?}", event);
        };
        assert_eq!(failure.kind, ErrorKind::Timeout);
        assert_eq!(processor.calls.load(Ordering::SeqCst), 0);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_joins_idle_workers() {
        let (harness, _) = start(ScriptedProcessor::ok(), config());
        assert_eq!(harness.handle.worker_count(), 2);
        tokio::time::timeout(Duration::from_secs(1), harness.handle.shutdown())
            .await
            .expect("idle pool stops promptly");
    }
}
