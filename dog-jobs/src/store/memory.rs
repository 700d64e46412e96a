use std::collections::HashMap;
use std::sync::Arc;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::{Job, JobId, JobsError, JobsResult, store::JobStore};

/// In-memory job store for tests, development and single-process deployments
#[derive(Clone, Default)]
pub struct MemoryJobStore {
    /// Job records indexed by job_id
    pub(crate) jobs: Arc<RwLock<HashMap<JobId, Job>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force a record's TTL into the past (test helper)
    pub fn force_expiry(&self, job_id: &JobId) {
        if let Some(job) = self.jobs.write().get_mut(job_id) {
            job.expires_at = Utc::now() - chrono::Duration::seconds(1);
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: Job) -> JobsResult<()> {
        let mut jobs = self.jobs.write();
        if jobs.contains_key(&job.id) {
            return Err(JobsError::conflict(format!("job {} already exists", job.id)));
        }
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn get(&self, job_id: &JobId) -> JobsResult<Option<Job>> {
        let now = Utc::now();
        let jobs = self.jobs.read();
        Ok(jobs
            .get(job_id)
            .filter(|job| job.expires_at > now)
            .cloned())
    }

    async fn compare_and_swap(&self, expected_version: u64, job: Job) -> JobsResult<bool> {
        let mut jobs = self.jobs.write();
        let current = jobs
            .get_mut(&job.id)
            .ok_or_else(|| JobsError::not_found(job.id.to_string()))?;

        if current.version != expected_version {
            return Ok(false);
        }

        *current = job;
        Ok(true)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> JobsResult<Vec<JobId>> {
        let mut jobs = self.jobs.write();
        let expired: Vec<JobId> = jobs
            .values()
            .filter(|job| job.expires_at <= now)
            .map(|job| job.id.clone())
            .collect();

        for job_id in &expired {
            jobs.remove(job_id);
        }

        Ok(expired)
    }

    async fn len(&self) -> JobsResult<usize> {
        let now = Utc::now();
        Ok(self.jobs.read().values().filter(|job| job.expires_at > now).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{JobPriority, OwnerId, UnitId};

    fn new_job() -> Job {
        let now = Utc::now();
        Job::new(
            OwnerId::from("owner"),
            vec![UnitId::from("a")],
            JobPriority::Normal,
            now,
            now + chrono::Duration::hours(24),
        )
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_ids() {
        let store = MemoryJobStore::new();
        let job = new_job();
        store.insert(job.clone()).await.unwrap();
        let err = store.insert(job).await.unwrap_err();
        assert!(matches!(err, JobsError::Conflict(_)));
    }

    #[tokio::test]
    async fn compare_and_swap_rejects_stale_version() {
        let store = MemoryJobStore::new();
        let job = new_job();
        store.insert(job.clone()).await.unwrap();

        let mut first = job.clone();
        first.version = 1;
        assert!(store.compare_and_swap(0, first).await.unwrap());

        // A second writer still holding version 0 loses
        let mut stale = job.clone();
        stale.version = 1;
        stale.attempt = 9;
        assert!(!store.compare_and_swap(0, stale).await.unwrap());

        let stored = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.attempt, 1);
    }

    #[tokio::test]
    async fn compare_and_swap_on_missing_record_is_not_found() {
        let store = MemoryJobStore::new();
        let err = store.compare_and_swap(0, new_job()).await.unwrap_err();
        assert!(matches!(err, JobsError::NotFound(_)));
    }

    #[tokio::test]
    async fn expired_records_read_as_absent_and_are_purged() {
        let store = MemoryJobStore::new();
        let job = new_job();
        store.insert(job.clone()).await.unwrap();
        store.force_expiry(&job.id);

        assert!(store.get(&job.id).await.unwrap().is_none());
        assert_eq!(store.len().await.unwrap(), 0);

        let purged = store.purge_expired(Utc::now()).await.unwrap();
        assert_eq!(purged, vec![job.id.clone()]);
        assert!(store.jobs.read().is_empty());
    }
}
