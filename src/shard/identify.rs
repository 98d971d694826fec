//! Cluster-wide Identify window
//!
//! The service accepts at most one Identify per concurrency bucket per
//! window. Shards map to bucket `shard_id % max_concurrency`, and every shard
//! in a cluster shares one limiter. This is independent of the REST limiter.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

#[derive(Debug)]
pub struct IdentifyLimiter {
    interval: Duration,
    buckets: Vec<Mutex<Option<Instant>>>,
}

impl IdentifyLimiter {
    pub fn new(interval: Duration, max_concurrency: u32) -> Self {
        let buckets = (0..max_concurrency.max(1)).map(|_| Mutex::new(None)).collect();
        Self { interval, buckets }
    }

    /// Wait for this shard's Identify slot.
    ///
    /// Cancel-safe: dropping the future before it resolves does not consume
    /// the slot.
    pub async fn acquire(&self, shard_id: u32) {
        let bucket = &self.buckets[shard_id as usize % self.buckets.len()];
        let mut last = bucket.lock().await;

        if let Some(previous) = *last {
            let ready_at = previous + self.interval;
            if ready_at > Instant::now() {
                debug!(shard_id, wait = ?(ready_at - Instant::now()), "Waiting for identify window");
                sleep_until(ready_at).await;
            }
        }

        *last = Some(Instant::now());
    }
}
