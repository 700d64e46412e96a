pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{Job, JobId, JobsResult};

pub use memory::MemoryJobStore;

/// Durable, TTL-bearing storage of job records
///
/// Implementations must make `compare_and_swap` atomic per job: the write
/// succeeds only when the stored version still equals `expected_version`.
/// Records whose `expires_at` has passed must read as absent even before a
/// purge removes them.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new record; `Conflict` if the id is taken
    async fn insert(&self, job: Job) -> JobsResult<()>;

    /// Read a record as stored
    async fn get(&self, job_id: &JobId) -> JobsResult<Option<Job>>;

    /// Replace the record if its version is still `expected_version`
    ///
    /// Returns `Ok(false)` when another writer got there first and
    /// `NotFound` when the record is gone.
    async fn compare_and_swap(&self, expected_version: u64, job: Job) -> JobsResult<bool>;

    /// Remove every record whose TTL has elapsed at `now`
    async fn purge_expired(&self, now: DateTime<Utc>) -> JobsResult<Vec<JobId>>;

    /// Number of live records
    async fn len(&self) -> JobsResult<usize>;
}
