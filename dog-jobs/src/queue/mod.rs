pub mod memory;
pub mod rate_limit;

use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Delivery, JobPriority, JobsResult, WorkItem, WorkerId};

pub use memory::MemoryWorkQueue;
pub use rate_limit::LeakyBucket;

/// Priority-aware, at-least-once distribution of work items to workers
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Add an item at the back of its priority tier
    async fn enqueue(&self, item: WorkItem, priority: JobPriority) -> JobsResult<()>;

    /// Lease the next eligible item, hiding it from other workers for the
    /// visibility window. Waits while the dispatch rate limit is exhausted.
    async fn dequeue(&self, worker_id: &WorkerId) -> JobsResult<Option<Delivery>>;

    /// Remove a leased item for good; `Conflict` if the lease was lost
    async fn acknowledge(&self, delivery: &Delivery) -> JobsResult<()>;

    /// Push the visibility deadline to `now + extra`; `Conflict` if the lease was lost
    async fn extend_visibility(&self, delivery: &Delivery, extra: Duration) -> JobsResult<DateTime<Utc>>;

    /// Snapshot of the queue's size
    async fn depth(&self) -> JobsResult<QueueDepth>;
}

/// Queue size broken down by item state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    /// Eligible for dispatch now
    pub ready: usize,

    /// Waiting out a retry backoff
    pub delayed: usize,

    /// Leased and not yet acknowledged
    pub in_flight: usize,
}

impl QueueDepth {
    /// Items not yet acknowledged
    pub fn total(&self) -> usize {
        self.ready + self.delayed + self.in_flight
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, Ordering};
    use super::*;
    use crate::JobsError;

    /// Memory queue whose `enqueue` can be switched off
    pub(crate) struct FlakyQueue {
        inner: MemoryWorkQueue,
        refuse_enqueue: AtomicBool,
    }

    impl FlakyQueue {
        pub(crate) fn new(inner: MemoryWorkQueue) -> Self {
            Self {
                inner,
                refuse_enqueue: AtomicBool::new(false),
            }
        }

        pub(crate) fn refuse_enqueue(&self, refuse: bool) {
            self.refuse_enqueue.store(refuse, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl WorkQueue for FlakyQueue {
        async fn enqueue(&self, item: WorkItem, priority: JobPriority) -> JobsResult<()> {
            if self.refuse_enqueue.load(Ordering::SeqCst) {
                return Err(JobsError::unavailable("queue down"));
            }
            self.inner.enqueue(item, priority).await
        }

        async fn dequeue(&self, worker_id: &WorkerId) -> JobsResult<Option<Delivery>> {
            self.inner.dequeue(worker_id).await
        }

        async fn acknowledge(&self, delivery: &Delivery) -> JobsResult<()> {
            self.inner.acknowledge(delivery).await
        }

        async fn extend_visibility(&self, delivery: &Delivery, extra: Duration) -> JobsResult<DateTime<Utc>> {
            self.inner.extend_visibility(delivery, extra).await
        }

        async fn depth(&self) -> JobsResult<QueueDepth> {
            self.inner.depth().await
        }
    }
}
