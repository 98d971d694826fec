//! Shard health tracking
//!
//! Shared, lock-sharded view of every shard's health for the health endpoints
//! and the cluster. Written by each shard's own loop.

use super::ConnectionState;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Health status for a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardHealth {
    /// Shard is connecting or identifying
    Connecting,
    /// Shard is ready and receiving events
    Ready,
    /// Shard is resuming after disconnect
    Resuming,
    /// Shard is disconnected
    Disconnected,
    /// Shard stopped on an unrecoverable error
    Dead,
}

impl ShardHealth {
    /// Returns true if the shard is healthy
    pub fn is_healthy(&self) -> bool {
        matches!(self, ShardHealth::Ready | ShardHealth::Resuming)
    }

    /// Returns true if the shard is ready to receive events
    pub fn is_ready(&self) -> bool {
        matches!(self, ShardHealth::Ready)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShardHealth::Connecting => "connecting",
            ShardHealth::Ready => "ready",
            ShardHealth::Resuming => "resuming",
            ShardHealth::Disconnected => "disconnected",
            ShardHealth::Dead => "dead",
        }
    }
}

impl From<ConnectionState> for ShardHealth {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Connecting | ConnectionState::Identifying => ShardHealth::Connecting,
            ConnectionState::Connected => ShardHealth::Ready,
            ConnectionState::Resuming => ShardHealth::Resuming,
            ConnectionState::Disconnected => ShardHealth::Disconnected,
        }
    }
}

/// State for a single shard
#[derive(Debug)]
struct ShardStatusEntry {
    health: ShardHealth,
    events_received: AtomicU64,
    reconnects: AtomicU64,
    last_heartbeat_ack: Option<Instant>,
    latency: Option<Duration>,
    connected_at: Option<Instant>,
}

impl Default for ShardStatusEntry {
    fn default() -> Self {
        Self {
            health: ShardHealth::Disconnected,
            events_received: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            last_heartbeat_ack: None,
            latency: None,
            connected_at: None,
        }
    }
}

/// Point-in-time view of one shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardStatus {
    pub shard_id: u32,
    pub health: ShardHealth,
    pub latency: Option<Duration>,
    pub reconnects: u64,
    /// Time since the shard last became ready
    pub uptime: Option<Duration>,
    pub since_last_ack: Option<Duration>,
}

/// Shared state across all shards in a cluster
#[derive(Debug, Clone)]
pub struct ShardRegistry {
    inner: Arc<ShardRegistryInner>,
}

#[derive(Debug)]
struct ShardRegistryInner {
    shards: DashMap<u32, ShardStatusEntry>,
    total_shards: u32,
}

impl ShardRegistry {
    pub fn new(shard_ids: impl Iterator<Item = u32>, total_shards: u32) -> Self {
        let shards = DashMap::new();
        for shard_id in shard_ids {
            shards.insert(shard_id, ShardStatusEntry::default());
        }

        Self {
            inner: Arc::new(ShardRegistryInner {
                shards,
                total_shards,
            }),
        }
    }

    pub fn total_shards(&self) -> u32 {
        self.inner.total_shards
    }

    /// Update shard health. `Dead` is sticky.
    pub fn set_health(&self, shard_id: u32, health: ShardHealth) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            if entry.health == ShardHealth::Dead {
                return;
            }
            entry.health = health;
            if health == ShardHealth::Ready {
                entry.connected_at = Some(Instant::now());
            }
        }
    }

    pub fn record_event(&self, shard_id: u32) {
        if let Some(entry) = self.inner.shards.get(&shard_id) {
            entry.events_received.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_reconnect(&self, shard_id: u32) {
        if let Some(entry) = self.inner.shards.get(&shard_id) {
            entry.reconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_heartbeat(&self, shard_id: u32, latency: Option<Duration>) {
        if let Some(mut entry) = self.inner.shards.get_mut(&shard_id) {
            entry.last_heartbeat_ack = Some(Instant::now());
            if latency.is_some() {
                entry.latency = latency;
            }
        }
    }

    pub fn get_health(&self, shard_id: u32) -> Option<ShardHealth> {
        self.inner.shards.get(&shard_id).map(|e| e.health)
    }

    /// Every shard, ordered by id
    pub fn statuses(&self) -> Vec<ShardStatus> {
        let now = Instant::now();
        let mut statuses: Vec<_> = self
            .inner
            .shards
            .iter()
            .map(|e| ShardStatus {
                shard_id: *e.key(),
                health: e.health,
                latency: e.latency,
                reconnects: e.reconnects.load(Ordering::Relaxed),
                uptime: e
                    .connected_at
                    .filter(|_| e.health.is_ready())
                    .map(|at| now.saturating_duration_since(at)),
                since_last_ack: e
                    .last_heartbeat_ack
                    .map(|at| now.saturating_duration_since(at)),
            })
            .collect();
        statuses.sort_by_key(|s| s.shard_id);
        statuses
    }

    pub fn reconnects(&self, shard_id: u32) -> u64 {
        self.inner
            .shards
            .get(&shard_id)
            .map_or(0, |e| e.reconnects.load(Ordering::Relaxed))
    }

    pub fn total_events_received(&self) -> u64 {
        self.inner
            .shards
            .iter()
            .map(|e| e.events_received.load(Ordering::Relaxed))
            .sum()
    }

    pub fn ready_shards(&self) -> usize {
        self.inner
            .shards
            .iter()
            .filter(|e| e.health.is_ready())
            .count()
    }

    pub fn dead_shards(&self) -> usize {
        self.inner
            .shards
            .iter()
            .filter(|e| e.health == ShardHealth::Dead)
            .count()
    }

    pub fn healthy_shards(&self) -> usize {
        self.inner
            .shards
            .iter()
            .filter(|e| e.health.is_healthy())
            .count()
    }

    pub fn shard_count(&self) -> usize {
        self.inner.shards.len()
    }

    /// At least one shard ready
    pub fn is_ready(&self) -> bool {
        self.ready_shards() > 0
    }

    /// Every shard ready or resuming
    pub fn is_healthy(&self) -> bool {
        self.healthy_shards() == self.shard_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_follows_connection_state() {
        assert_eq!(ShardHealth::from(ConnectionState::Identifying), ShardHealth::Connecting);
        assert_eq!(ShardHealth::from(ConnectionState::Connected), ShardHealth::Ready);
        assert_eq!(ShardHealth::from(ConnectionState::Resuming), ShardHealth::Resuming);
    }

    #[test]
    fn counts_ready_and_dead_shards() {
        let registry = ShardRegistry::new(0..4, 4);
        registry.set_health(0, ShardHealth::Ready);
        registry.set_health(1, ShardHealth::Ready);
        registry.set_health(2, ShardHealth::Dead);

        assert_eq!(registry.shard_count(), 4);
        assert_eq!(registry.ready_shards(), 2);
        assert_eq!(registry.dead_shards(), 1);
        assert!(registry.is_ready());
        assert!(!registry.is_healthy());
    }

    #[test]
    fn dead_is_sticky() {
        let registry = ShardRegistry::new(0..1, 1);
        registry.set_health(0, ShardHealth::Dead);
        registry.set_health(0, ShardHealth::Disconnected);
        assert_eq!(registry.get_health(0), Some(ShardHealth::Dead));
    }

    #[test]
    fn statuses_are_ordered_and_carry_latency() {
        let registry = ShardRegistry::new([2, 0, 1].into_iter(), 3);
        registry.record_heartbeat(1, Some(Duration::from_millis(42)));
        registry.record_reconnect(2);

        let statuses = registry.statuses();
        assert_eq!(
            statuses.iter().map(|s| s.shard_id).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(statuses[1].latency, Some(Duration::from_millis(42)));
        assert_eq!(statuses[2].reconnects, 1);
        assert_eq!(statuses[0].health, ShardHealth::Disconnected);
        assert_eq!(statuses[0].uptime, None);
        assert!(statuses[1].since_last_ack.is_some());
    }

    #[test]
    fn unknown_shard_is_ignored() {
        let registry = ShardRegistry::new(0..1, 1);
        registry.record_event(7);
        registry.set_health(7, ShardHealth::Ready);
        assert_eq!(registry.get_health(7), None);
        assert_eq!(registry.total_events_received(), 0);
    }
}
