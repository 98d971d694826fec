//! Outward gateway events
//!
//! Every shard emits [`ShardEvent`]s on one channel. Within a shard they are
//! in transport order; across shards they interleave with no ordering.

use crate::shard::ConnectionState;
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// A Dispatch frame as forwarded to subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchEvent {
    /// Local id for log correlation across the bridge and the client
    pub event_id: Uuid,
    pub event_type: String,
    pub sequence: u64,
    pub payload: Value,
}

impl DispatchEvent {
    pub fn new(event_type: impl Into<String>, sequence: u64, payload: Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            sequence,
            payload,
        }
    }
}

/// Everything a shard reports outward
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    StateChanged(ConnectionState),
    Ready { session_id: String },
    Resumed,
    Dispatch(DispatchEvent),
    HeartbeatAck { latency: Duration },
    InvalidSession { resumable: bool },
    Reconnect,
    Close { code: Option<u16> },
    /// The shard stopped on an unrecoverable failure; other shards continue
    Degraded { reason: String },
}

impl GatewayEvent {
    /// Static label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayEvent::StateChanged(_) => "state_changed",
            GatewayEvent::Ready { .. } => "ready",
            GatewayEvent::Resumed => "resumed",
            GatewayEvent::Dispatch(_) => "dispatch",
            GatewayEvent::HeartbeatAck { .. } => "heartbeat_ack",
            GatewayEvent::InvalidSession { .. } => "invalid_session",
            GatewayEvent::Reconnect => "reconnect",
            GatewayEvent::Close { .. } => "close",
            GatewayEvent::Degraded { .. } => "degraded",
        }
    }

    pub fn as_dispatch(&self) -> Option<&DispatchEvent> {
        match self {
            GatewayEvent::Dispatch(dispatch) => Some(dispatch),
            _ => None,
        }
    }
}

/// Event tagged with the shard that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct ShardEvent {
    pub shard_id: u32,
    pub event: GatewayEvent,
}

impl ShardEvent {
    pub fn new(shard_id: u32, event: GatewayEvent) -> Self {
        Self { shard_id, event }
    }
}
