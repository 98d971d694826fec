//! Prometheus metrics module
//!
//! Recording goes through the global `metrics` facade, so a library user who
//! never installs the exporter pays only for no-op calls. The binary calls
//! [`GatewayMetrics::install`] once to get a renderable handle.

use crate::error::GatewayError;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Duration;

/// Gateway metrics collector
#[derive(Clone, Default)]
pub struct GatewayMetrics {
    handle: Option<Arc<PrometheusHandle>>,
}

impl GatewayMetrics {
    /// Install the Prometheus recorder and register descriptions
    pub fn install() -> Result<Self, GatewayError> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| GatewayError::Config(format!("failed to install metrics recorder: {e}")))?;

        Self::register_metrics();

        Ok(Self {
            handle: Some(Arc::new(handle)),
        })
    }

    /// Metrics sink without an exporter (library use and tests)
    pub fn detached() -> Self {
        Self::default()
    }

    fn register_metrics() {
        describe_counter!(
            "gateway_events_received_total",
            Unit::Count,
            "Total events emitted by shards"
        );
        describe_counter!(
            "gateway_reconnects_total",
            Unit::Count,
            "Shard reconnects by reason"
        );
        describe_counter!(
            "gateway_protocol_violations_total",
            Unit::Count,
            "Malformed frames dropped"
        );
        describe_counter!("gateway_errors_total", Unit::Count, "Total gateway errors");
        describe_counter!(
            "rest_requests_total",
            Unit::Count,
            "REST requests by route and status"
        );
        describe_counter!(
            "rest_ratelimit_waits_total",
            Unit::Count,
            "Requests held back by the local rate limiter"
        );
        describe_counter!(
            "cache_bridge_failures_total",
            Unit::Count,
            "Dispatch events the cache bridge could not apply"
        );

        describe_histogram!(
            "gateway_heartbeat_latency_seconds",
            Unit::Seconds,
            "Heartbeat round-trip latency"
        );
        describe_histogram!(
            "rest_ratelimit_wait_seconds",
            Unit::Seconds,
            "Time spent waiting for a rate-limit bucket to reset"
        );

        describe_gauge!("gateway_shards_ready", Unit::Count, "Number of shards in ready state");
        describe_gauge!("cache_entries", Unit::Count, "Live entries in the entity cache");
    }

    pub fn record_event(&self, shard_id: u32, kind: &'static str) {
        counter!(
            "gateway_events_received_total",
            "shard_id" => shard_id.to_string(),
            "event_type" => kind
        )
        .increment(1);
    }

    pub fn record_reconnect(&self, shard_id: u32, reason: &'static str) {
        counter!(
            "gateway_reconnects_total",
            "shard_id" => shard_id.to_string(),
            "reason" => reason
        )
        .increment(1);
    }

    pub fn record_protocol_violation(&self, shard_id: u32) {
        counter!(
            "gateway_protocol_violations_total",
            "shard_id" => shard_id.to_string()
        )
        .increment(1);
    }

    pub fn record_error(&self, shard_id: u32, error_type: &'static str) {
        counter!(
            "gateway_errors_total",
            "shard_id" => shard_id.to_string(),
            "error_type" => error_type
        )
        .increment(1);
    }

    pub fn record_heartbeat(&self, shard_id: u32, latency: Duration) {
        histogram!(
            "gateway_heartbeat_latency_seconds",
            "shard_id" => shard_id.to_string()
        )
        .record(latency.as_secs_f64());
    }

    pub fn record_rest_request(&self, route: &str, status: u16) {
        counter!(
            "rest_requests_total",
            "route" => route.to_string(),
            "status" => status.to_string()
        )
        .increment(1);
    }

    pub fn record_ratelimit_wait(&self, route: &str, waited: Duration) {
        counter!("rest_ratelimit_waits_total", "route" => route.to_string()).increment(1);
        histogram!("rest_ratelimit_wait_seconds", "route" => route.to_string())
            .record(waited.as_secs_f64());
    }

    pub fn record_bridge_failure(&self, event_type: &str) {
        counter!(
            "cache_bridge_failures_total",
            "event_type" => event_type.to_string()
        )
        .increment(1);
    }

    pub fn set_shards_ready(&self, count: usize) {
        gauge!("gateway_shards_ready").set(count as f64);
    }

    pub fn set_cache_entries(&self, count: usize) {
        gauge!("cache_entries").set(count as f64);
    }

    /// Render metrics in Prometheus format; empty when detached
    pub fn render(&self) -> String {
        self.handle.as_ref().map(|h| h.render()).unwrap_or_default()
    }
}
