use std::time::Duration;
use parking_lot::Mutex;
use tokio::time::Instant;

/// Leaky-bucket dispatch limiter (GCRA form)
///
/// Admits one dispatch every `1 / rate` seconds on average and lets up to
/// `burst` dispatches through back to back.
#[derive(Debug)]
pub struct LeakyBucket {
    emission_interval: Duration,
    tolerance: Duration,
    /// Theoretical arrival time of the next conforming dispatch
    tat: Mutex<Option<Instant>>,
}

impl LeakyBucket {
    /// `rate` dispatches per second, `burst` >= 1
    pub fn new(rate: u32, burst: u32) -> Self {
        let emission_interval = Duration::from_secs(1) / rate.max(1);
        let tolerance = emission_interval * burst.max(1).saturating_sub(1);
        Self {
            emission_interval,
            tolerance,
            tat: Mutex::new(None),
        }
    }

    pub fn emission_interval(&self) -> Duration {
        self.emission_interval
    }

    /// Take one unit of budget, or report how long until one is available
    pub fn try_acquire(&self) -> Result<(), Duration> {
        let now = Instant::now();
        let mut tat = self.tat.lock();
        let current = tat.map_or(now, |t| t.max(now));

        let ahead = current.saturating_duration_since(now);
        if ahead > self.tolerance {
            return Err(ahead - self.tolerance);
        }

        *tat = Some(current + self.emission_interval);
        Ok(())
    }

    /// Wait until budget is available, then take it
    pub async fn acquire(&self) {
        while let Err(wait) = self.try_acquire() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_then_steady_rate() {
        let bucket = LeakyBucket::new(10, 3);

        // Burst of three passes immediately
        for _ in 0..3 {
            assert!(bucket.try_acquire().is_ok());
        }

        // Fourth has to wait one emission interval
        let wait = bucket.try_acquire().unwrap_err();
        assert_eq!(wait, Duration::from_millis(100));

        let start = Instant::now();
        bucket.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn budget_refills_with_time() {
        let bucket = LeakyBucket::new(2, 1);
        assert!(bucket.try_acquire().is_ok());
        assert!(bucket.try_acquire().is_err());

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(bucket.try_acquire().is_ok());
    }
}
