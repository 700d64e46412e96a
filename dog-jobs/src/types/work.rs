use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{JobId, ReceiptHandle, UnitId, WorkerId};

/// Units of one job that a worker must process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub job_id: JobId,

    /// Units still to process, in job order
    pub unit_ids: Vec<UnitId>,

    /// Attempt this item belongs to (starts at 1)
    pub attempt: u32,

    /// Not eligible for dispatch before this instant (retry backoff)
    pub not_before: DateTime<Utc>,

    /// Set while leased: no other worker may receive the item before this instant
    pub visible_until: Option<DateTime<Utc>>,
}

impl WorkItem {
    /// An item eligible for dispatch right away
    pub fn new(job_id: JobId, unit_ids: Vec<UnitId>, attempt: u32) -> Self {
        Self {
            job_id,
            unit_ids,
            attempt,
            not_before: Utc::now(),
            visible_until: None,
        }
    }

    /// Delay dispatch until `not_before`
    pub fn with_not_before(mut self, not_before: DateTime<Utc>) -> Self {
        self.not_before = not_before;
        self
    }

    /// Check if the item may be dispatched at `now`
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now
    }
}

/// A work item leased to one worker
#[derive(Debug, Clone)]
pub struct Delivery {
    pub item: WorkItem,

    /// Proof of the lease for acknowledge / extend
    pub receipt: ReceiptHandle,

    pub worker_id: WorkerId,

    /// How many times this item has been handed out (1 on first delivery)
    pub delivery_count: u32,
}

impl Delivery {
    pub fn job_id(&self) -> &JobId {
        &self.item.job_id
    }

    /// When the lease lapses and the item becomes redeliverable
    pub fn visible_until(&self) -> Option<DateTime<Utc>> {
        self.item.visible_until
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}
