//! Gateway cluster
//!
//! Owns every shard of the process, shares one identify limiter between
//! them and merges their events into a single stream. Ordering holds per
//! shard only; shards interleave freely.

use super::handle::GatewayShard;
use super::identify::IdentifyLimiter;
use super::session::ShardSession;
use super::state::ShardRegistry;
use crate::config::ShardConfig;
use crate::error::GatewayError;
use crate::events::ShardEvent;
use crate::metrics::GatewayMetrics;

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Cluster construction options
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Template for every shard; `shard_id` is assigned by the cluster
    pub shard: ShardConfig,
    /// Minimum spacing between Identify sends in one concurrency bucket
    pub identify_interval: Duration,
    pub max_concurrency: u32,
}

impl ClusterConfig {
    pub fn new(shard: ShardConfig) -> Self {
        Self {
            shard,
            identify_interval: Duration::from_secs(5),
            max_concurrency: 1,
        }
    }
}

/// All shards of one process
pub struct Cluster {
    shards: Vec<GatewayShard>,
    registry: ShardRegistry,
    events: Option<mpsc::UnboundedReceiver<ShardEvent>>,
    metrics: GatewayMetrics,
}

impl Cluster {
    /// Create `shard_count` shards with ids `0..shard_count`
    pub fn new(config: ClusterConfig, metrics: GatewayMetrics) -> Result<Self, GatewayError> {
        let shard_count = config.shard.shard_count;
        if shard_count == 0 {
            return Err(GatewayError::Config(
                "shard_count must be at least 1".to_string(),
            ));
        }

        let identify = Arc::new(IdentifyLimiter::new(
            config.identify_interval,
            config.max_concurrency,
        ));
        let registry = ShardRegistry::new(0..shard_count, shard_count);
        let (tx, rx) = mpsc::unbounded_channel();

        let shards = (0..shard_count)
            .map(|shard_id| {
                let mut shard_config = config.shard.clone();
                shard_config.shard_id = shard_id;
                GatewayShard::new(
                    shard_config,
                    Arc::clone(&identify),
                    tx.clone(),
                    registry.clone(),
                    metrics.clone(),
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            shard_count,
            max_concurrency = config.max_concurrency,
            identify_interval_ms = config.identify_interval.as_millis() as u64,
            "Cluster created"
        );

        Ok(Self {
            shards,
            registry,
            events: Some(rx),
            metrics,
        })
    }

    /// The merged event stream. Yields `None` after the first call.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ShardEvent>> {
        self.events.take()
    }

    /// Shared health view (for health checks)
    pub fn registry(&self) -> ShardRegistry {
        self.registry.clone()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn shard_ids(&self) -> Vec<u32> {
        self.shards.iter().map(GatewayShard::id).collect()
    }

    pub fn sessions(&self) -> Vec<ShardSession> {
        self.shards.iter().map(GatewayShard::session).collect()
    }

    /// Start every shard.
    ///
    /// Shards connect concurrently; Identify sends are spaced by the shared
    /// limiter. A shard that fails to start is logged and reported through
    /// the registry while the rest keep running. Errors only if no shard
    /// started at all.
    pub async fn start(&mut self) -> Result<(), GatewayError> {
        let results = join_all(self.shards.iter_mut().map(|shard| async move {
            let shard_id = shard.id();
            (shard_id, shard.start().await)
        }))
        .await;

        let mut started = 0usize;
        let mut first_error = None;

        for (shard_id, result) in results {
            match result {
                Ok(()) => started += 1,
                Err(e @ GatewayError::AlreadyRunning { .. }) => return Err(e),
                Err(e) => {
                    error!(shard_id, error = %e, "Shard failed to start");
                    first_error.get_or_insert(e);
                }
            }
        }

        self.metrics.set_shards_ready(self.registry.ready_shards());

        match first_error {
            Some(e) if started == 0 => Err(e),
            _ => {
                info!(started, total = self.shards.len(), "Cluster started");
                Ok(())
            }
        }
    }

    /// Stop every shard. Idempotent.
    pub async fn stop(&mut self) {
        join_all(self.shards.iter_mut().map(|shard| shard.stop())).await;
        self.metrics.set_shards_ready(self.registry.ready_shards());
        info!("Cluster stopped");
    }
}
