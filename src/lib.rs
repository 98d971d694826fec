//! Relay Gateway
//!
//! A sharded client for a real-time gateway service:
//! - Shards: one socket each, running the connect / identify / heartbeat /
//!   resume state machine
//! - Cluster: owns the shards, spaces their Identify sends, merges events
//! - Cache bridge: applies every dispatch to the entity cache before user
//!   code sees it
//! - REST client: per-route rate limiting over the same cache
//! - Client facade: typed event handlers over all of the above

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod metrics;
pub mod models;
pub mod protocol;
pub mod rest;
pub mod shard;
pub mod transport;

pub use cache::{CacheClient, CacheStage, InMemoryCache};
pub use client::{Client, Context};
pub use config::{GatewayConfig, ShardConfig, Token};
pub use error::GatewayError;
pub use events::{DispatchEvent, GatewayEvent, ShardEvent};
pub use rest::RestClient;
pub use shard::{Cluster, ClusterConfig, GatewayShard};
