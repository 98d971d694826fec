//! Gateway configuration module
//!
//! `GatewayConfig` is the process-level configuration loaded from the
//! environment. `ShardConfig` is the structural per-shard configuration the
//! cluster hands to every shard.

use crate::error::GatewayError;
use crate::protocol::ClosePolicy;
use crate::shard::Backoff;
use crate::transport::TransportFactory;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Guilds (1 << 0) | guild messages (1 << 9) | message content (1 << 15)
pub const DEFAULT_INTENTS: u64 = 1 | (1 << 9) | (1 << 15);

/// Credential token. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(Arc<str>);

impl Token {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Arc::from(token.into()))
    }

    /// Raw token, for the Identify payload and the REST auth header only
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(<redacted>)")
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Raw environment shape, as produced by the `config` crate
#[derive(Debug, Deserialize)]
struct EnvSettings {
    discord_token: Option<String>,
    discord_bot_token: Option<String>,
    shard_count: u32,
    gateway_url: String,
    api_base_url: String,
    compressed: bool,
    intents: u64,
    http_port: u16,
    log_level: String,
    connect_timeout_ms: u64,
    rest_timeout_ms: u64,
    identify_interval_ms: u64,
    max_concurrency: u32,
}

/// Process configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub token: Token,

    /// Total shards; 0 means "ask the service for its recommendation"
    pub shard_count: u32,

    pub gateway_url: String,

    pub api_base_url: String,

    /// Request zlib-stream transport compression
    pub compressed: bool,

    pub intents: u64,

    /// Health/metrics HTTP port
    pub http_port: u16,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    pub connect_timeout: Duration,

    pub rest_timeout: Duration,

    /// Minimum spacing between Identify sends in one concurrency bucket
    pub identify_interval: Duration,

    pub max_concurrency: u32,
}

impl GatewayConfig {
    /// Load configuration from `.env` and environment variables
    pub fn from_env() -> Result<Self, GatewayError> {
        dotenvy::dotenv().ok();

        let settings: EnvSettings = config::Config::builder()
            .set_default("shard_count", 1)
            .and_then(|b| b.set_default("gateway_url", "wss://gateway.discord.gg"))
            .and_then(|b| b.set_default("api_base_url", "https://discord.com/api/v10"))
            .and_then(|b| b.set_default("compressed", false))
            .and_then(|b| b.set_default("intents", DEFAULT_INTENTS as i64))
            .and_then(|b| b.set_default("http_port", 9090))
            .and_then(|b| b.set_default("log_level", "info"))
            .and_then(|b| b.set_default("connect_timeout_ms", 10_000))
            .and_then(|b| b.set_default("rest_timeout_ms", 15_000))
            .and_then(|b| b.set_default("identify_interval_ms", 5_000))
            .and_then(|b| b.set_default("max_concurrency", 1))
            .map_err(|e| GatewayError::Config(e.to_string()))?
            .add_source(config::Environment::default().try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        let token = settings
            .discord_token
            .or(settings.discord_bot_token)
            .map(Token::new)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                GatewayError::Config("DISCORD_TOKEN or DISCORD_BOT_TOKEN must be set".to_string())
            })?;

        if settings.max_concurrency == 0 {
            return Err(GatewayError::Config(
                "MAX_CONCURRENCY must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            token,
            shard_count: settings.shard_count,
            gateway_url: settings.gateway_url,
            api_base_url: settings.api_base_url,
            compressed: settings.compressed,
            intents: settings.intents,
            http_port: settings.http_port,
            log_level: settings.log_level,
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            rest_timeout: Duration::from_millis(settings.rest_timeout_ms),
            identify_interval: Duration::from_millis(settings.identify_interval_ms),
            max_concurrency: settings.max_concurrency,
        })
    }
}

/// Per-shard configuration
#[derive(Clone)]
pub struct ShardConfig {
    pub shard_id: u32,
    pub shard_count: u32,
    pub token: Token,
    pub transport_factory: Arc<dyn TransportFactory>,
    /// Decompress zlib-stream payloads before frame parsing
    pub compressed: bool,
    pub gateway_url: String,
    pub intents: u64,
    pub large_threshold: u16,
    /// Deadline for opening the socket and receiving Hello
    pub connect_timeout: Duration,
    /// Deadline for a HeartbeatAck; `None` means one heartbeat interval
    pub heartbeat_ack_timeout: Option<Duration>,
    pub backoff: Backoff,
    pub close_policy: ClosePolicy,
    /// Identify attempts without a Ready before the shard gives up
    pub max_identify_attempts: u32,
}

impl ShardConfig {
    pub fn new(
        shard_id: u32,
        shard_count: u32,
        token: Token,
        transport_factory: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            shard_id,
            shard_count,
            token,
            transport_factory,
            compressed: false,
            gateway_url: "wss://gateway.discord.gg".to_string(),
            intents: DEFAULT_INTENTS,
            large_threshold: 50,
            connect_timeout: Duration::from_secs(10),
            heartbeat_ack_timeout: None,
            backoff: Backoff::default(),
            close_policy: ClosePolicy::default(),
            max_identify_attempts: 5,
        }
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.shard_count == 0 {
            return Err(GatewayError::Config("shard_count must be at least 1".to_string()));
        }
        if self.shard_id >= self.shard_count {
            return Err(GatewayError::Config(format!(
                "shard_id {} out of range for shard_count {}",
                self.shard_id, self.shard_count
            )));
        }
        if self.token.is_empty() {
            return Err(GatewayError::Config("token must not be empty".to_string()));
        }
        if self.max_identify_attempts == 0 {
            return Err(GatewayError::Config(
                "max_identify_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Socket URL for a connect, honoring compression
    pub fn connect_url(&self, base: &str) -> String {
        let separator = if base.contains('?') { '&' } else { '?' };
        let mut url = format!("{base}{separator}v=10&encoding=json");
        if self.compressed {
            url.push_str("&compress=zlib-stream");
        }
        url
    }
}

impl fmt::Debug for ShardConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardConfig")
            .field("shard_id", &self.shard_id)
            .field("shard_count", &self.shard_count)
            .field("token", &self.token)
            .field("compressed", &self.compressed)
            .field("gateway_url", &self.gateway_url)
            .field("intents", &self.intents)
            .field("connect_timeout", &self.connect_timeout)
            .field("heartbeat_ack_timeout", &self.heartbeat_ack_timeout)
            .field("backoff", &self.backoff)
            .field("max_identify_attempts", &self.max_identify_attempts)
            .finish_non_exhaustive()
    }
}
