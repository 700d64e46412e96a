use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    Delivery, JobPriority, JobsError, JobsResult, ReceiptHandle, WorkItem, WorkerId,
    config::{to_chrono, JobsConfig},
    queue::{LeakyBucket, QueueDepth, WorkQueue},
};

const TIERS: usize = 3;

#[derive(Debug)]
struct Queued {
    item: WorkItem,
    priority: JobPriority,
    delivery_count: u32,
}

#[derive(Debug)]
struct InFlight {
    item: WorkItem,
    priority: JobPriority,
    worker_id: WorkerId,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    /// One FIFO per priority tier, high first
    tiers: [VecDeque<Queued>; TIERS],

    /// Leased items keyed by their current receipt
    in_flight: HashMap<ReceiptHandle, InFlight>,
}

impl QueueState {
    /// Return lapsed leases to the front of their tier
    fn reclaim_expired(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<ReceiptHandle> = self
            .in_flight
            .iter()
            .filter(|(_, lease)| lease.item.visible_until.is_some_and(|until| until <= now))
            .map(|(receipt, _)| receipt.clone())
            .collect();

        for receipt in &expired {
            if let Some(mut lease) = self.in_flight.remove(receipt) {
                warn!(
                    "Visibility timeout elapsed for job {} (held by {}), making it redeliverable",
                    lease.item.job_id, lease.worker_id
                );
                lease.item.visible_until = None;
                self.tiers[lease.priority.tier_index()].push_front(Queued {
                    item: lease.item,
                    priority: lease.priority,
                    delivery_count: lease.delivery_count,
                });
            }
        }

        expired.len()
    }

    /// Position of the first eligible item, scanning tiers in priority order
    fn next_eligible(&self, now: DateTime<Utc>) -> Option<(usize, usize)> {
        self.tiers.iter().enumerate().find_map(|(tier, queue)| {
            queue
                .iter()
                .position(|queued| queued.item.is_eligible(now))
                .map(|index| (tier, index))
        })
    }
}

/// In-memory work queue with visibility timeouts and a dispatch rate limit
#[derive(Clone)]
pub struct MemoryWorkQueue {
    state: Arc<Mutex<QueueState>>,
    visibility_timeout: Duration,
    limiter: Option<Arc<LeakyBucket>>,
}

impl MemoryWorkQueue {
    /// Unlimited dispatch rate
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            visibility_timeout,
            limiter: None,
        }
    }

    /// Build from configuration (visibility window and dispatch rate)
    pub fn from_config(config: &JobsConfig) -> Self {
        let queue = Self::new(config.visibility_timeout);
        if config.dispatch_rate == 0 {
            queue
        } else {
            queue.with_rate_limit(config.dispatch_rate, config.dispatch_burst)
        }
    }

    /// Limit dispatch to `rate` items per second with `burst` tolerance
    pub fn with_rate_limit(mut self, rate: u32, burst: u32) -> Self {
        self.limiter = Some(Arc::new(LeakyBucket::new(rate, burst)));
        self
    }

    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    /// Force a lease to lapse (test helper for simulating a crashed worker)
    pub fn force_visibility_expiry(&self, delivery: &Delivery) {
        let mut state = self.state.lock();
        if let Some(lease) = state.in_flight.get_mut(&delivery.receipt) {
            lease.item.visible_until = Some(Utc::now() - chrono::Duration::seconds(1));
        }
    }

    fn lease(&self, state: &mut QueueState, tier: usize, index: usize, worker_id: &WorkerId, now: DateTime<Utc>) -> Option<Delivery> {
        let queued = state.tiers[tier].remove(index)?;
        let receipt = ReceiptHandle::new();
        let visible_until = now + to_chrono(self.visibility_timeout);

        let mut item = queued.item;
        item.visible_until = Some(visible_until);
        let delivery_count = queued.delivery_count + 1;

        state.in_flight.insert(
            receipt.clone(),
            InFlight {
                item: item.clone(),
                priority: queued.priority,
                worker_id: worker_id.clone(),
                delivery_count,
            },
        );

        debug!("Leased job {} to {} until {}", item.job_id, worker_id, visible_until);

        Some(Delivery {
            item,
            receipt,
            worker_id: worker_id.clone(),
            delivery_count,
        })
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn enqueue(&self, mut item: WorkItem, priority: JobPriority) -> JobsResult<()> {
        item.visible_until = None;
        debug!("Enqueued job {} (attempt {}) at {} priority", item.job_id, item.attempt, priority);
        self.state.lock().tiers[priority.tier_index()].push_back(Queued {
            item,
            priority,
            delivery_count: 0,
        });
        Ok(())
    }

    async fn dequeue(&self, worker_id: &WorkerId) -> JobsResult<Option<Delivery>> {
        loop {
            let wait = {
                let mut state = self.state.lock();
                let now = Utc::now();
                state.reclaim_expired(now);

                let Some((tier, index)) = state.next_eligible(now) else {
                    return Ok(None);
                };

                match self.limiter.as_ref().map(|limiter| limiter.try_acquire()) {
                    Some(Err(wait)) => wait,
                    _ => return Ok(self.lease(&mut state, tier, index, worker_id, now)),
                }
            };

            debug!("Dispatch budget exhausted, {} waits {:?}", worker_id, wait);
            tokio::time::sleep(wait).await;
        }
    }

    async fn acknowledge(&self, delivery: &Delivery) -> JobsResult<()> {
        let mut state = self.state.lock();
        match state.in_flight.remove(&delivery.receipt) {
            Some(_) => Ok(()),
            None => Err(JobsError::conflict(format!(
                "receipt for job {} is no longer valid",
                delivery.job_id()
            ))),
        }
    }

    async fn extend_visibility(&self, delivery: &Delivery, extra: Duration) -> JobsResult<DateTime<Utc>> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let lease = state
            .in_flight
            .get_mut(&delivery.receipt)
            .filter(|lease| lease.item.visible_until.is_some_and(|until| until > now))
            .ok_or_else(|| {
                JobsError::conflict(format!("lease for job {} has lapsed", delivery.job_id()))
            })?;

        let until = now + to_chrono(extra);
        lease.item.visible_until = Some(until);
        Ok(until)
    }

    async fn depth(&self) -> JobsResult<QueueDepth> {
        let now = Utc::now();
        let state = self.state.lock();
        let (ready, delayed) = state
            .tiers
            .iter()
            .flatten()
            .fold((0, 0), |(ready, delayed), queued| {
                if queued.item.is_eligible(now) {
                    (ready + 1, delayed)
                } else {
                    (ready, delayed + 1)
                }
            });

        Ok(QueueDepth {
            ready,
            delayed,
            in_flight: state.in_flight.len(),
        })
    }
}
