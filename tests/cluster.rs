//! Cluster startup against a scripted gateway

mod common;

use common::{next_event, shard_config, ScriptedFactory};
use relay_gateway::error::GatewayError;
use relay_gateway::events::GatewayEvent;
use relay_gateway::metrics::GatewayMetrics;
use relay_gateway::shard::{Cluster, ClusterConfig, ConnectionState, ShardHealth};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

fn cluster_config(shard_count: u32, factory: std::sync::Arc<ScriptedFactory>) -> ClusterConfig {
    ClusterConfig {
        shard: shard_config(0, shard_count, factory),
        identify_interval: Duration::from_secs(5),
        max_concurrency: 1,
    }
}

#[tokio::test(start_paused = true)]
async fn identifies_are_spaced_across_shards() {
    let (factory, mut conns) = ScriptedFactory::new();
    let mut cluster = Cluster::new(cluster_config(4, factory), GatewayMetrics::detached()).unwrap();
    assert_eq!(cluster.shard_ids(), vec![0, 1, 2, 3]);
    let mut events = cluster.take_events().unwrap();
    assert!(cluster.take_events().is_none());

    // Each accepted socket gets Hello, then reports its Identify
    let (identified, mut identifies) = mpsc::unbounded_channel();
    let server = tokio::spawn(async move {
        let mut sessions = 0;
        while let Some(mut conn) = conns.recv().await {
            conn.hello(45_000);
            let identified = identified.clone();
            sessions += 1;
            let session_id = format!("session-{sessions}");
            tokio::spawn(async move {
                let (at, identify) = conn.expect_op(2).await;
                let shard = identify["d"]["shard"].clone();
                let _ = identified.send((at, shard));
                conn.ready(&session_id, 1);
                conn.ack_until_closed().await;
            });
        }
    });

    cluster.start().await.unwrap();

    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(identifies.recv().await.unwrap());
    }
    seen.sort_by_key(|(at, _)| *at);

    let shards: HashSet<_> = seen
        .iter()
        .map(|(_, shard)| (shard[0].as_u64().unwrap(), shard[1].as_u64().unwrap()))
        .collect();
    assert_eq!(shards, (0..4).map(|id| (id, 4)).collect());

    for pair in seen.windows(2) {
        assert!(pair[1].0 - pair[0].0 >= Duration::from_secs(5));
    }

    let mut ready = HashSet::new();
    while ready.len() < 4 {
        let event = next_event(&mut events, |e| matches!(e, GatewayEvent::Ready { .. })).await;
        ready.insert(event.shard_id);
    }
    assert!(cluster
        .sessions()
        .iter()
        .all(|s| s.state == ConnectionState::Connected));
    assert_eq!(cluster.registry().ready_shards(), 4);

    cluster.stop().await;
    assert!(cluster
        .sessions()
        .iter()
        .all(|s| s.state == ConnectionState::Disconnected));
    cluster.stop().await;
    server.abort();
}

#[tokio::test(start_paused = true)]
async fn separate_concurrency_buckets_identify_together() {
    let (factory, mut conns) = ScriptedFactory::new();
    let mut config = cluster_config(2, factory);
    config.max_concurrency = 2;
    let mut cluster = Cluster::new(config, GatewayMetrics::detached()).unwrap();

    let (identified, mut identifies) = mpsc::unbounded_channel();
    let server = tokio::spawn(async move {
        while let Some(mut conn) = conns.recv().await {
            conn.hello(45_000);
            let identified = identified.clone();
            tokio::spawn(async move {
                let (at, _) = conn.expect_op(2).await;
                let _ = identified.send(at);
                conn.ack_until_closed().await;
            });
        }
    });

    let start = Instant::now();
    cluster.start().await.unwrap();
    let first = identifies.recv().await.unwrap();
    let second = identifies.recv().await.unwrap();
    assert!(first.max(second) - start < Duration::from_secs(5));

    cluster.stop().await;
    server.abort();
}

#[tokio::test(start_paused = true)]
async fn one_dead_shard_leaves_the_others_running() {
    let (factory, mut conns) = ScriptedFactory::new();
    let mut config = cluster_config(2, factory);
    config.max_concurrency = 2;
    let mut cluster = Cluster::new(config, GatewayMetrics::detached()).unwrap();
    let mut events = cluster.take_events().unwrap();

    let (identified, mut sockets) = mpsc::unbounded_channel();
    let server = tokio::spawn(async move {
        while let Some(mut conn) = conns.recv().await {
            conn.hello(45_000);
            let identified = identified.clone();
            tokio::spawn(async move {
                let (_, identify) = conn.expect_op(2).await;
                let shard_id = identify["d"]["shard"][0].as_u64().unwrap();
                conn.ready(&format!("session-{shard_id}"), 1);
                let _ = identified.send((shard_id, conn));
            });
        }
    });

    cluster.start().await.unwrap();
    let mut open = HashMap::new();
    for _ in 0..2 {
        let (shard_id, conn) = sockets.recv().await.unwrap();
        open.insert(shard_id, conn);
    }
    let mut ready = HashSet::new();
    while ready.len() < 2 {
        let event = next_event(&mut events, |e| matches!(e, GatewayEvent::Ready { .. })).await;
        ready.insert(event.shard_id);
    }

    open[&0].close(4004);
    let degraded =
        next_event(&mut events, |e| matches!(e, GatewayEvent::Degraded { .. })).await;
    assert_eq!(degraded.shard_id, 0);

    open[&1].dispatch("MESSAGE_CREATE", 2, json!({"id": "5", "content": "still here"}));
    let event = next_event(&mut events, |e| {
        e.as_dispatch().is_some_and(|d| d.event_type == "MESSAGE_CREATE")
    })
    .await;
    assert_eq!(event.shard_id, 1);

    let registry = cluster.registry();
    assert_eq!(registry.get_health(0), Some(ShardHealth::Dead));
    assert_eq!(registry.get_health(1), Some(ShardHealth::Ready));
    let survivor = cluster
        .sessions()
        .into_iter()
        .find(|session| session.shard_id == 1)
        .unwrap();
    assert_eq!(survivor.state, ConnectionState::Connected);

    cluster.stop().await;
    server.abort();
}

#[tokio::test(start_paused = true)]
async fn start_fails_when_no_shard_connects() {
    let (factory, _conns) = ScriptedFactory::failing(u32::MAX);
    let mut cluster = Cluster::new(cluster_config(2, factory), GatewayMetrics::detached()).unwrap();

    let err = cluster.start().await.unwrap_err();
    assert!(matches!(err, GatewayError::Connection { .. }));
    assert_eq!(cluster.registry().dead_shards(), 2);
}

#[tokio::test(start_paused = true)]
async fn second_start_is_rejected() {
    let (factory, mut conns) = ScriptedFactory::new();
    let mut cluster = Cluster::new(cluster_config(1, factory), GatewayMetrics::detached()).unwrap();

    let server = tokio::spawn(async move {
        let mut open = Vec::new();
        while let Some(conn) = conns.recv().await {
            conn.hello(45_000);
            open.push(conn);
        }
    });

    cluster.start().await.unwrap();
    assert!(matches!(
        cluster.start().await,
        Err(GatewayError::AlreadyRunning { shard_id: 0 })
    ));

    cluster.stop().await;
    server.abort();
}

#[test]
fn zero_shards_is_a_config_error() {
    let (factory, _conns) = ScriptedFactory::new();
    let mut config = cluster_config(1, factory);
    config.shard.shard_count = 0;
    assert!(matches!(
        Cluster::new(config, GatewayMetrics::detached()),
        Err(GatewayError::Config(_))
    ));
}
