//! Relay Gateway binary
//!
//! Runs a cluster of gateway shards with the entity cache and REST client,
//! answers `ping` with `pong!`, and serves health and metrics endpoints.

use anyhow::Result;
use relay_gateway::cache::CacheClient;
use relay_gateway::client::Client;
use relay_gateway::config::{GatewayConfig, ShardConfig};
use relay_gateway::health::{self, AppState};
use relay_gateway::metrics::GatewayMetrics;
use relay_gateway::rest::{ReqwestTransport, RestClient, RestConfig};
use relay_gateway::shard::{Cluster, ClusterConfig};
use relay_gateway::transport::WsTransportFactory;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first to get log level
    let gateway_config = GatewayConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("relay_gateway={}", gateway_config.log_level).parse()?)
                .add_directive("tokio_tungstenite=warn".parse()?)
                .add_directive("reqwest=warn".parse()?),
        )
        .json()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        shard_count = gateway_config.shard_count,
        compressed = gateway_config.compressed,
        "Starting Relay Gateway"
    );

    let metrics = GatewayMetrics::install()?;
    info!("Prometheus metrics initialized");

    let cache = CacheClient::in_memory();
    let http = Arc::new(ReqwestTransport::new(gateway_config.rest_timeout)?);
    let rest = RestClient::new(
        gateway_config.token.clone(),
        cache,
        http,
        RestConfig {
            base_url: gateway_config.api_base_url.clone(),
            timeout: gateway_config.rest_timeout,
            ..RestConfig::default()
        },
        metrics.clone(),
    );

    let mut shard_count = gateway_config.shard_count;
    let mut max_concurrency = gateway_config.max_concurrency;
    if shard_count == 0 {
        let recommended = rest.get_gateway_bot().await?;
        info!(
            shards = recommended.shards,
            max_concurrency = recommended.session_start_limit.max_concurrency,
            remaining_sessions = recommended.session_start_limit.remaining,
            "Using recommended shard count"
        );
        shard_count = recommended.shards.max(1);
        max_concurrency = recommended.session_start_limit.max_concurrency.max(1);
    }

    let mut shard = ShardConfig::new(
        0,
        shard_count,
        gateway_config.token.clone(),
        Arc::new(WsTransportFactory),
    );
    shard.compressed = gateway_config.compressed;
    shard.gateway_url = gateway_config.gateway_url.clone();
    shard.intents = gateway_config.intents;
    shard.connect_timeout = gateway_config.connect_timeout;

    let cluster = Cluster::new(
        ClusterConfig {
            shard,
            identify_interval: gateway_config.identify_interval,
            max_concurrency,
        },
        metrics.clone(),
    )?;
    let registry = cluster.registry();

    let mut client = Client::new(cluster, rest, metrics.clone());
    client
        .on_ready(|ctx, ready| async move {
            info!(
                shard_id = ctx.shard_id(),
                user = %ready.user.username,
                guilds = ready.guilds.len(),
                "Ready"
            );
            Ok(())
        })
        .on_message_create(|ctx, message| async move {
            if message.content != "ping" {
                return Ok(());
            }
            let channel = ctx.channel(message.channel_id).await?;
            ctx.send_message(channel.id, "pong!").await?;
            Ok(())
        })
        .on_shard_degraded(|_ctx, degraded| async move {
            warn!(shard_id = degraded.shard_id, reason = %degraded.reason, "Shard degraded");
            Ok(())
        });

    // Start health server
    let health_router = health::router(AppState {
        registry,
        cache: client.cache().clone(),
        metrics: metrics.clone(),
    });
    let addr: SocketAddr = ([0, 0, 0, 0], gateway_config.http_port).into();
    info!(port = gateway_config.http_port, "Starting HTTP server");
    let http_server = axum::serve(tokio::net::TcpListener::bind(addr).await?, health_router);

    client.start().await?;

    tokio::select! {
        result = http_server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
        }
    }

    info!("Shutting down gateway...");
    client.stop().await;
    info!("Gateway shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
