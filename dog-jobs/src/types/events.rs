use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobId, JobPriority, OwnerId, Progress};
use crate::error::ErrorKind;

/// Lifecycle events emitted by the coordinator and sweeper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
    Created {
        job_id: JobId,
        owner_id: OwnerId,
        priority: JobPriority,
        total_units: u32,
        at: DateTime<Utc>,
    },

    /// First claim moved the job to processing
    Claimed {
        job_id: JobId,
        attempt: u32,
        at: DateTime<Utc>,
    },

    Progressed {
        job_id: JobId,
        progress: Progress,
        at: DateTime<Utc>,
    },

    Retrying {
        job_id: JobId,
        attempt: u32,
        retry_at: DateTime<Utc>,
        error: String,
        at: DateTime<Utc>,
    },

    Completed {
        job_id: JobId,
        at: DateTime<Utc>,
    },

    Failed {
        job_id: JobId,
        kind: ErrorKind,
        error: String,
        at: DateTime<Utc>,
    },

    Cancelled {
        job_id: JobId,
        at: DateTime<Utc>,
    },

    /// Record removed by the retention sweep
    Expired {
        job_id: JobId,
        at: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::Claimed { .. } => "claimed",
            Self::Progressed { .. } => "progressed",
            Self::Retrying { .. } => "retrying",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Cancelled { .. } => "cancelled",
            Self::Expired { .. } => "expired",
        }
    }

    /// Get the job ID from any event
    pub fn job_id(&self) -> &JobId {
        match self {
            Self::Created { job_id, .. }
            | Self::Claimed { job_id, .. }
            | Self::Progressed { job_id, .. }
            | Self::Retrying { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Cancelled { job_id, .. }
            | Self::Expired { job_id, .. } => job_id,
        }
    }

    /// Get the timestamp from any event
    pub fn timestamp(&self) -> &DateTime<Utc> {
        match self {
            Self::Created { at, .. }
            | Self::Claimed { at, .. }
            | Self::Progressed { at, .. }
            | Self::Retrying { at, .. }
            | Self::Completed { at, .. }
            | Self::Failed { at, .. }
            | Self::Cancelled { at, .. }
            | Self::Expired { at, .. } => at,
        }
    }
}
