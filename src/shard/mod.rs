//! Shard management module
//!
//! A shard is one socket to the gateway. Each runs its own state machine
//! task; the cluster owns all of them and merges their events.

mod backoff;
mod cluster;
mod handle;
mod heartbeat;
mod identify;
mod runner;
mod session;
mod state;

pub use backoff::Backoff;
pub use cluster::{Cluster, ClusterConfig};
pub use handle::GatewayShard;
pub use heartbeat::HeartbeatTimer;
pub use identify::IdentifyLimiter;
pub use runner::MAX_PROTOCOL_VIOLATIONS;
pub use session::{ConnectionState, ShardSession};
pub use state::{ShardHealth, ShardRegistry, ShardStatus};
