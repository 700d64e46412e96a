//! # dog-jobs: Resumable Job Lifecycle Engine
//!
//! **Polling-friendly job tracking and worker coordination for DogRS services**
//!
//! dog-jobs tracks long-running, multi-unit jobs (the canonical case is
//! "prepare an archive of these files, then hand back a signed download
//! URL") from creation to a terminal state, and coordinates the workers
//! that do the processing.
//!
//! ## Guarantees
//!
//! - **Linearizable transitions**: every status change is a compare-and-swap on the record version
//! - **Terminal means final**: completed, failed and cancelled records never change again
//! - **Monotonic progress**: stale or duplicate progress reports are ignored
//! - **At-least-once dispatch**: leased work items reappear after their visibility timeout
//! - **Bounded retries**: transient failures retry with exponential backoff, then fail
//! - **Cooperative cancellation**: workers stop at the next unit boundary
//! - **Scoped credentials**: each job gets its own expiring access URL
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dog_jobs::prelude::*;
//!
//! struct Archiver;
//!
//! #[async_trait]
//! impl UnitProcessor for Archiver {
//!     async fn process_unit(&self, ctx: UnitContext) -> Result<(), UnitError> {
//!         // copy ctx.unit_id into the archive
//!         Ok(())
//!     }
//!
//!     async fn finish(&self, job: &Job, _cancel: CancellationToken) -> Result<String, UnitError> {
//!         Ok(format!("{}.zip", job.id))
//!     }
//! }
//!
//! # async fn run() -> JobsResult<()> {
//! let config = JobsConfig::from_env("DOG_JOBS")?;
//! let queue = Arc::new(MemoryWorkQueue::from_config(&config));
//! let coordinator = Arc::new(JobCoordinator::new(
//!     Arc::new(MemoryJobStore::new()),
//!     queue.clone(),
//!     config.clone(),
//! ));
//! let signer = Arc::new(LocalArtifactSigner::new("/var/archives", "https://files.example.com", "secret"));
//! let publisher = Arc::new(ResultPublisher::new(signer, config.url_ttl));
//!
//! let pool = WorkerPool::start(coordinator.clone(), queue, Arc::new(Archiver), publisher, &config);
//!
//! let job_id = coordinator
//!     .create(OwnerId::from("user-42"), vec![UnitId::from("a.txt")], JobPriority::Normal)
//!     .await?;
//! let status = coordinator.get_status(&job_id).await?;
//! # pool.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod types;
pub mod error;
pub mod config;
pub mod retry;
pub mod store;
pub mod queue;
pub mod coordinator;
pub mod publisher;
pub mod worker;
pub mod sweeper;
pub mod observability;

pub use types::{
    Delivery, Job, JobEvent, JobFailure, JobId, JobPriority, JobResult, JobStatus, OwnerId,
    Progress, ReceiptHandle, UnitId, WorkItem, WorkerId,
};
pub use error::{ErrorKind, JobsError, JobsResult, UnitError};
pub use config::JobsConfig;
pub use retry::{RetryDecision, RetryPolicy};
pub use store::{JobStore, MemoryJobStore};
pub use queue::{LeakyBucket, MemoryWorkQueue, QueueDepth, WorkQueue};
pub use coordinator::{FailOutcome, JobCoordinator};
pub use publisher::{ArtifactSigner, LocalArtifactSigner, PresignRequest, PresignedArtifact, ResultPublisher};
pub use worker::{PoolHandle, UnitContext, UnitProcessor, WorkerEvent, WorkerPool};
pub use sweeper::RetentionSweeper;
pub use observability::{JobMetrics, MetricsSnapshot, ObservabilityLayer};

#[cfg(feature = "tracing-basic")]
pub use observability::init_tracing;

/// Everything needed to wire an engine and implement a processor
pub mod prelude {
    // Engine components
    pub use crate::{
        JobCoordinator, WorkerPool, PoolHandle, ResultPublisher, RetentionSweeper,
    };

    // Backends and signers
    pub use crate::{
        JobStore, MemoryJobStore, WorkQueue, MemoryWorkQueue, ArtifactSigner, LocalArtifactSigner,
    };

    // Essential types
    pub use crate::{
        Job, JobId, JobStatus, JobPriority, JobResult, OwnerId, UnitId, Progress, JobsConfig,
        JobsError, JobsResult, UnitError, FailOutcome, WorkerEvent, JobEvent,
    };

    // Processor contract
    pub use crate::{UnitContext, UnitProcessor};
    pub use tokio_util::sync::CancellationToken;

    // Essential traits
    pub use async_trait::async_trait;
}
