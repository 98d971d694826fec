//! Heartbeat timer
//!
//! A dedicated task ticks every interval and signals the shard loop through a
//! channel; the loop owns the socket and sends the actual frame. The loop
//! keeps the ack bookkeeping here so one place decides whether the
//! connection is zombied.
//!
//! ```text
//! ┌──────────────────┐   tick    ┌──────────────┐  heartbeat  ┌────────┐
//! │ heartbeat task   │ ────────> │  shard loop  │ ──────────> │ socket │
//! └──────────────────┘  (mpsc)   └──────────────┘             └────────┘
//! ```
//!
//! Dropping the timer aborts the task, so a timer never outlives the socket
//! it was created for.

use rand::Rng;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::trace;

pub struct HeartbeatTimer {
    ack_timeout: Duration,
    last_sent_at: Option<Instant>,
    last_ack_received_at: Option<Instant>,
    awaiting_ack: bool,
    ticks: mpsc::Receiver<()>,
    task: JoinHandle<()>,
}

impl HeartbeatTimer {
    /// Start ticking. The first tick lands at a random point within the
    /// first interval so a fleet of shards does not heartbeat in lockstep.
    pub fn spawn(interval: Duration, ack_timeout: Option<Duration>) -> Self {
        let jitter = rand::thread_rng().gen_range(0.0..1.0);
        Self::spawn_with_first_tick(interval, ack_timeout, interval.mul_f64(jitter))
    }

    pub fn spawn_with_first_tick(
        interval: Duration,
        ack_timeout: Option<Duration>,
        first_tick: Duration,
    ) -> Self {
        let (tx, ticks) = mpsc::channel(1);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + first_tick, interval);
            // A slow loop should not receive a burst of catch-up ticks
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                trace!("Heartbeat tick");
                match tx.try_send(()) {
                    Ok(()) | Err(mpsc::error::TrySendError::Full(())) => {}
                    Err(mpsc::error::TrySendError::Closed(())) => break,
                }
            }
        });

        Self {
            ack_timeout: ack_timeout.unwrap_or(interval),
            last_sent_at: None,
            last_ack_received_at: None,
            awaiting_ack: false,
            ticks,
            task,
        }
    }

    /// Next tick; cancel-safe
    pub async fn next_tick(&mut self) {
        if self.ticks.recv().await.is_none() {
            // The task only stops when aborted; never resolve afterwards
            std::future::pending::<()>().await;
        }
    }

    pub fn record_sent(&mut self) {
        self.last_sent_at = Some(Instant::now());
        self.awaiting_ack = true;
    }

    /// Record an ack and return the round-trip latency
    pub fn record_ack(&mut self) -> Option<Duration> {
        let now = Instant::now();
        self.last_ack_received_at = Some(now);
        self.awaiting_ack = false;
        self.last_sent_at.map(|sent| now - sent)
    }

    pub fn is_awaiting_ack(&self) -> bool {
        self.awaiting_ack
    }

    /// Deadline for the outstanding ack, if one is outstanding
    pub fn ack_deadline(&self) -> Option<Instant> {
        if !self.awaiting_ack {
            return None;
        }
        self.last_sent_at.map(|sent| sent + self.ack_timeout)
    }

    pub fn last_ack_received_at(&self) -> Option<Instant> {
        self.last_ack_received_at
    }
}

impl Drop for HeartbeatTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
