//! Health check endpoints
//!
//! `/health` answers while the process runs, `/ready` once any shard is
//! connected, `/metrics` renders Prometheus text.

use crate::cache::CacheClient;
use crate::metrics::GatewayMetrics;
use crate::shard::ShardRegistry;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tracing::warn;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub shards_total: u32,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub shards_total: usize,
    pub shards_ready: usize,
    pub shards_dead: usize,
    pub events_received: u64,
    pub shards: Vec<ShardReport>,
}

/// One shard in the readiness response
#[derive(Debug, Serialize)]
pub struct ShardReport {
    pub id: u32,
    pub health: &'static str,
    pub latency_ms: Option<u64>,
    pub reconnects: u64,
    pub uptime_secs: Option<u64>,
    pub last_ack_ms_ago: Option<u64>,
}

/// Application state for health endpoints
#[derive(Clone)]
pub struct AppState {
    pub registry: ShardRegistry,
    pub cache: CacheClient,
    pub metrics: GatewayMetrics,
}

/// Create the health check router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        shards_total: state.registry.total_shards(),
    })
}

/// 200 if at least one shard is connected, 503 otherwise
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let response = ready_response(&state.registry);

    if response.ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

fn ready_response(registry: &ShardRegistry) -> ReadyResponse {
    ReadyResponse {
        ready: registry.is_ready(),
        shards_total: registry.shard_count(),
        shards_ready: registry.ready_shards(),
        shards_dead: registry.dead_shards(),
        events_received: registry.total_events_received(),
        shards: registry
            .statuses()
            .into_iter()
            .map(|s| ShardReport {
                id: s.shard_id,
                health: s.health.as_str(),
                latency_ms: s.latency.map(|l| l.as_millis() as u64),
                reconnects: s.reconnects,
                uptime_secs: s.uptime.map(|u| u.as_secs()),
                last_ack_ms_ago: s.since_last_ack.map(|a| a.as_millis() as u64),
            })
            .collect(),
    }
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.set_shards_ready(state.registry.ready_shards());
    match state.cache.store().entry_count().await {
        Ok(count) => state.metrics.set_cache_entries(count),
        Err(e) => warn!(error = %e, "Failed to count cache entries"),
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.render(),
    )
}
