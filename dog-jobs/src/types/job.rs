use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobId, JobPriority, OwnerId, UnitId};
use crate::error::{ErrorKind, UnitError};

/// Job status lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created and queued, no worker has claimed it yet
    Pending,

    /// Claimed by a worker (also while waiting out a retry backoff)
    Processing,

    /// All units finished and a result was published
    Completed,

    /// Failed permanently (attempts exhausted or non-retryable error)
    Failed,

    /// Cancelled by the client
    Cancelled,
}

impl JobStatus {
    /// Check if the job is in a terminal state (completed, failed, or cancelled)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Completed units out of total units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub completed: u32,
    pub total: u32,
}

impl Progress {
    pub fn new(total: u32) -> Self {
        Self { completed: 0, total }
    }

    pub fn is_done(&self) -> bool {
        self.completed == self.total
    }
}

/// Time-bounded access to the finished artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub access_url: String,
    pub size_bytes: u64,
    pub expires_at: DateTime<Utc>,
}

impl JobResult {
    /// The record outlives the credential; consumers must check this before handing out the URL
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Error payload recorded on a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<UnitError> for JobFailure {
    fn from(err: UnitError) -> Self {
        Self::new(err.kind(), err.message())
    }
}

/// Job record - the durable state returned by status queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub owner_id: OwnerId,

    /// Ordered units of work
    pub unit_ids: Vec<UnitId>,

    pub priority: JobPriority,
    pub status: JobStatus,
    pub progress: Progress,

    /// Set only when completed
    pub result: Option<JobResult>,

    /// Set only when failed
    pub error: Option<JobFailure>,

    /// Current attempt number (starts at 1)
    pub attempt: u32,

    /// Most recent retryable failure, kept while the job retries
    pub last_error: Option<JobFailure>,

    /// Bumped on every write; compare-and-swap token
    pub version: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// First claim; the job deadline runs from here across redeliveries and retries
    pub started_at: Option<DateTime<Utc>>,

    pub completed_at: Option<DateTime<Utc>>,

    /// Record is dropped by the store after this instant
    pub expires_at: DateTime<Utc>,
}

impl Job {
    /// Create a new pending job record
    pub fn new(
        owner_id: OwnerId,
        unit_ids: Vec<UnitId>,
        priority: JobPriority,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let total = unit_ids.len() as u32;
        Self {
            id: JobId::new(),
            owner_id,
            unit_ids,
            priority,
            status: JobStatus::Pending,
            progress: Progress::new(total),
            result: None,
            error: None,
            attempt: 1,
            last_error: None,
            version: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            expires_at,
        }
    }

    /// Units not yet reported as completed
    pub fn remaining_units(&self) -> &[UnitId] {
        let done = (self.progress.completed as usize).min(self.unit_ids.len());
        &self.unit_ids[done..]
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub(crate) fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.started_at.get_or_insert(now);
    }

    pub(crate) fn mark_completed(&mut self, result: JobResult, now: DateTime<Utc>, expires_at: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(now);
        self.expires_at = expires_at;
    }

    pub(crate) fn mark_failed(&mut self, failure: JobFailure, now: DateTime<Utc>, expires_at: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.result = None;
        self.error = Some(failure);
        self.completed_at = Some(now);
        self.expires_at = expires_at;
    }

    pub(crate) fn mark_cancelled(&mut self, now: DateTime<Utc>, expires_at: DateTime<Utc>) {
        self.status = JobStatus::Cancelled;
        self.result = None;
        self.completed_at = Some(now);
        self.expires_at = expires_at;
    }

    pub(crate) fn schedule_retry(&mut self, failure: JobFailure) {
        self.attempt += 1;
        self.last_error = Some(failure);
    }
}
