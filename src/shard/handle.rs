//! Gateway shard handle
//!
//! Owns the lifecycle of one shard's runner task. The runner does the work;
//! the handle starts it, stops it and exposes a read-only session snapshot.

use super::identify::IdentifyLimiter;
use super::runner::ShardRunner;
use super::session::{ConnectionState, ShardSession};
use super::state::ShardRegistry;
use crate::config::ShardConfig;
use crate::error::GatewayError;
use crate::events::ShardEvent;
use crate::metrics::GatewayMetrics;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long `stop` waits for the runner to close its socket
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// One gateway connection
pub struct GatewayShard {
    config: Arc<ShardConfig>,
    identify: Arc<IdentifyLimiter>,
    events: mpsc::UnboundedSender<ShardEvent>,
    registry: ShardRegistry,
    metrics: GatewayMetrics,
    snapshot: watch::Receiver<ShardSession>,
    running: Option<Running>,
}

impl GatewayShard {
    pub fn new(
        config: ShardConfig,
        identify: Arc<IdentifyLimiter>,
        events: mpsc::UnboundedSender<ShardEvent>,
        registry: ShardRegistry,
        metrics: GatewayMetrics,
    ) -> Result<Self, GatewayError> {
        config.validate()?;
        let (_, snapshot) = watch::channel(ShardSession::new(config.shard_id, config.shard_count));

        Ok(Self {
            config: Arc::new(config),
            identify,
            events,
            registry,
            metrics,
            snapshot,
            running: None,
        })
    }

    pub fn id(&self) -> u32 {
        self.config.shard_id
    }

    /// Current session snapshot
    pub fn session(&self) -> ShardSession {
        self.snapshot.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    /// Connect and wait for the handshake.
    ///
    /// Resolves once Hello arrives; the shard then identifies or resumes in
    /// the background. Fails with `Connection` when the initial connect
    /// exhausts its retries, and with `AlreadyRunning` on a second call.
    pub async fn start(&mut self) -> Result<(), GatewayError> {
        if self.is_running() {
            return Err(GatewayError::AlreadyRunning {
                shard_id: self.id(),
            });
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (opened_tx, opened_rx) = oneshot::channel();
        let (snapshot_tx, snapshot_rx) =
            watch::channel(ShardSession::new(self.config.shard_id, self.config.shard_count));
        self.snapshot = snapshot_rx;

        let runner = ShardRunner::new(
            Arc::clone(&self.config),
            Arc::clone(&self.identify),
            self.events.clone(),
            snapshot_tx,
            shutdown_rx,
            opened_tx,
            self.registry.clone(),
            self.metrics.clone(),
        );

        self.running = Some(Running {
            shutdown: shutdown_tx,
            task: tokio::spawn(runner.run()),
        });

        match opened_rx.await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Shutdown),
        }
    }

    /// Close the connection and end the runner. Idempotent.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let shard_id = self.id();

        let _ = running.shutdown.send(true);
        let mut task = running.task;

        match tokio::time::timeout(STOP_TIMEOUT, &mut task).await {
            Ok(_) => debug!(shard_id, "Shard runner finished"),
            Err(_) => {
                warn!(shard_id, "Shard did not stop in time, aborting");
                task.abort();
            }
        }
    }
}

impl Drop for GatewayShard {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.task.abort();
        }
    }
}
