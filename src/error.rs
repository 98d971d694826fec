//! Domain error types for the relay gateway
//!
//! `main.rs` is the ONLY module allowed to use `anyhow::Result` (process boundary).
//! All library code returns `Result<T, GatewayError>`.

use crate::cache::CacheError;
use crate::transport::TransportError;
use std::time::Duration;
use thiserror::Error;

/// Gateway and REST domain errors
///
/// Every variant carries structured context fields for diagnostics, so
/// callers can pattern-match on the failure mode instead of parsing
/// message strings.
///
/// Example log output:
/// ```text
/// GatewayError::ShardCircuitBroken { shard_id: 3, count: 5, max: 5 }
/// → "shard 3 sent 5/5 Identify attempts without reaching Ready"
/// ```
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Transport could not be opened (or failed mid-request) after bounded retries
    #[error("connection failed after {attempts} attempt(s)")]
    Connection {
        attempts: u32,
        #[source]
        source: TransportError,
    },

    /// Malformed or unexpected frame from the gateway
    #[error("protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    /// Server invalidated the session; a fresh Identify is required
    #[error("session invalidated for shard {shard_id}")]
    SessionInvalidated { shard_id: u32 },

    /// Rate limit still violated after one local retry
    #[error("rate limited on route '{route}' (retry after {retry_after:?})")]
    RateLimited { route: String, retry_after: Duration },

    /// Non-retryable REST error
    #[error("request on route '{route}' rejected with status {status_code}: {message}")]
    RequestRejected {
        route: String,
        status_code: u16,
        message: String,
    },

    /// Credential rejected by the service
    #[error("credential rejected: {context}")]
    FatalAuth { context: String },

    /// Gateway closed with a code that forbids reconnecting
    #[error("shard {shard_id} closed with fatal code {code}")]
    FatalClose { shard_id: u32, code: u16 },

    /// Too many Identify attempts without a Ready in between
    #[error("shard {shard_id} sent {count}/{max} Identify attempts without reaching Ready")]
    ShardCircuitBroken { shard_id: u32, count: u32, max: u32 },

    /// `start()` called on a shard or cluster that is already running
    #[error("shard {shard_id} is already running")]
    AlreadyRunning { shard_id: u32 },

    /// An operation exceeded its configured deadline
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Payload (de)serialization failed
    #[error("serialization failed for {context}")]
    Serialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    /// Cache store failure
    #[error("cache error")]
    Cache(#[from] CacheError),

    /// Configuration error (environment variable missing or invalid)
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation abandoned because shutdown was requested
    #[error("shutdown in progress")]
    Shutdown,
}

impl GatewayError {
    /// Returns a static label string suitable for Prometheus metrics.
    ///
    /// Used as the `error_type` label on `gateway_errors_total`.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "connection",
            Self::ProtocolViolation { .. } => "protocol_violation",
            Self::SessionInvalidated { .. } => "session_invalidated",
            Self::RateLimited { .. } => "rate_limited",
            Self::RequestRejected { .. } => "request_rejected",
            Self::FatalAuth { .. } => "fatal_auth",
            Self::FatalClose { .. } => "fatal_close",
            Self::ShardCircuitBroken { .. } => "circuit_broken",
            Self::AlreadyRunning { .. } => "already_running",
            Self::Timeout { .. } => "timeout",
            Self::Serialization { .. } => "serialization",
            Self::Cache(_) => "cache",
            Self::Config(_) => "config",
            Self::Shutdown => "shutdown",
        }
    }

    /// Errors after which a shard stops instead of reconnecting
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::FatalAuth { .. }
                | Self::FatalClose { .. }
                | Self::ShardCircuitBroken { .. }
                | Self::Connection { .. }
        )
    }

    pub(crate) fn serialization(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            context: context.into(),
            source,
        }
    }
}
