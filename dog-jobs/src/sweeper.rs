use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    JobsResult,
    coordinator::JobCoordinator,
    publisher::ResultPublisher,
    queue::WorkQueue,
    store::JobStore,
};

/// Periodically removes job records whose retention window has passed
pub struct RetentionSweeper<S: JobStore, Q: WorkQueue> {
    coordinator: Arc<JobCoordinator<S, Q>>,
    publisher: Option<Arc<ResultPublisher>>,
    interval: Duration,
}

impl<S: JobStore + 'static, Q: WorkQueue + 'static> RetentionSweeper<S, Q> {
    /// Sweep at the coordinator's configured interval
    pub fn new(coordinator: Arc<JobCoordinator<S, Q>>) -> Self {
        let interval = coordinator.config().sweep_interval;
        Self::with_interval(coordinator, interval)
    }

    pub fn with_interval(coordinator: Arc<JobCoordinator<S, Q>>, interval: Duration) -> Self {
        Self {
            coordinator,
            publisher: None,
            interval,
        }
    }

    /// Also forget expired credentials on every pass
    pub fn with_publisher(mut self, publisher: Arc<ResultPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Run in a background task until `shutdown` fires
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Starting retention sweeper with interval: {:?}", self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.run_once().await {
                Ok(0) => debug!("No expired job records found"),
                Ok(purged) => info!("Swept {} expired job records", purged),
                Err(e) => warn!("Error during retention sweep: {}", e),
            }
        }

        info!("Retention sweeper stopped");
    }

    /// Run one sweep cycle and return how many records were removed
    pub async fn run_once(&self) -> JobsResult<usize> {
        let now = Utc::now();
        let purged = self.coordinator.purge_expired(now).await?;

        if let Some(publisher) = &self.publisher {
            let pruned = publisher.prune(now);
            if pruned > 0 {
                debug!("Forgot {} expired credentials", pruned);
            }
        }

        self.coordinator.refresh_queue_depth().await?;
        Ok(purged.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;
    use crate::{
        JobEvent, JobPriority, JobsConfig, MemoryJobStore, MemoryWorkQueue, OwnerId, UnitId,
    };

    fn coordinator() -> Arc<JobCoordinator<MemoryJobStore, MemoryWorkQueue>> {
        let config = JobsConfig::default();
        Arc::new(JobCoordinator::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(MemoryWorkQueue::new(config.visibility_timeout)),
            config,
        ))
    }

    #[tokio::test]
    async fn run_once_purges_only_expired_records() {
        let coordinator = coordinator();
        let owner = OwnerId::from("owner-1");
        let stale = coordinator
            .create(owner.clone(), vec![UnitId::from("a")], JobPriority::Normal)
            .await
            .unwrap();
        let fresh = coordinator
            .create(owner, vec![UnitId::from("b")], JobPriority::Normal)
            .await
            .unwrap();
        coordinator.store().force_expiry(&stale);

        let mut events = coordinator.subscribe();
        let sweeper = RetentionSweeper::new(coordinator.clone());
        assert_eq!(sweeper.run_once().await.unwrap(), 1);
        assert_eq!(sweeper.run_once().await.unwrap(), 0);

        assert!(coordinator.get_status(&fresh).await.is_ok());
        assert!(coordinator.get_status(&stale).await.is_err());
        assert_eq!(coordinator.metrics().queue_depth(), 2);

        let event = events.next().await.unwrap();
        assert!(matches!(event, JobEvent::Expired { ref job_id, .. } if *job_id == stale));
    }

    #[tokio::test(start_paused = true)]
    async fn background_task_stops_on_shutdown() {
        let sweeper = RetentionSweeper::with_interval(coordinator(), Duration::from_millis(10));
        let shutdown = CancellationToken::new();
        let task = sweeper.spawn(shutdown.clone());

        tokio::time::sleep(Duration::from_millis(35)).await;
        shutdown.cancel();
        task.await.unwrap();
    }
}
