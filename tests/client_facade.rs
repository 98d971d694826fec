//! Client facade end to end: scripted gateway in, scripted HTTP out

mod common;

use common::{json_response, shard_config, ScriptedFactory, ScriptedHttp, ServerConn, TOKEN};
use relay_gateway::cache::CacheClient;
use relay_gateway::client::{Client, ShardStateChange};
use relay_gateway::config::Token;
use relay_gateway::metrics::GatewayMetrics;
use relay_gateway::models::Id;
use relay_gateway::rest::{HttpRequest, HttpResponse, RestClient, RestConfig};
use relay_gateway::shard::{Cluster, ClusterConfig, ConnectionState};
use relay_gateway::transport::TransportError;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

fn api(req: &HttpRequest) -> Result<HttpResponse, TransportError> {
    if req.method == reqwest::Method::GET && req.url.ends_with("/channels/5") {
        return Ok(json_response(200, json!({"id": "5", "type": 0, "name": "general"})));
    }
    if req.method == reqwest::Method::POST && req.url.ends_with("/channels/5/messages") {
        let body: Value = serde_json::from_slice(req.body.as_deref().unwrap_or_default())
            .unwrap_or_default();
        return Ok(json_response(
            200,
            json!({
                "id": "901",
                "channel_id": "5",
                "author": {"id": "1000", "username": "relay"},
                "content": body["content"],
            }),
        ));
    }
    Ok(json_response(404, json!({"message": "Unknown"})))
}

fn ping(seq: u64) -> (&'static str, u64, Value) {
    (
        "MESSAGE_CREATE",
        seq,
        json!({
            "id": "800",
            "channel_id": "5",
            "author": {"id": "2000", "username": "someone"},
            "content": "ping",
        }),
    )
}

fn build_client(factory: Arc<ScriptedFactory>, http: Arc<ScriptedHttp>) -> Client {
    let metrics = GatewayMetrics::detached();
    let cluster = Cluster::new(
        ClusterConfig::new(shard_config(0, 1, factory)),
        metrics.clone(),
    )
    .unwrap();
    let rest = RestClient::new(
        Token::new(TOKEN),
        CacheClient::in_memory(),
        http,
        RestConfig {
            base_url: "https://api.example/v10".to_string(),
            ..RestConfig::default()
        },
        metrics.clone(),
    );

    let mut client = Client::new(cluster, rest, metrics);
    client.on_message_create(|ctx, message| async move {
        if message.content != "ping" {
            return Ok(());
        }
        let channel = ctx.channel(message.channel_id).await?;
        ctx.send_message(channel.id, "pong!").await?;
        Ok(())
    });
    client
}

/// Accept one socket, identify it and play `script` after Ready
fn serve(
    mut conns: mpsc::UnboundedReceiver<ServerConn>,
    script: Vec<(&'static str, u64, Value)>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Some(mut conn) = conns.recv().await else {
            return;
        };
        conn.hello(45_000);
        conn.expect_op(2).await;
        conn.ready("abc", 1);
        for (event_type, seq, payload) in script {
            conn.dispatch(event_type, seq, payload);
        }
        conn.ack_until_closed().await;
    })
}

async fn wait_for_requests(http: &ScriptedHttp, count: usize) {
    timeout(Duration::from_secs(60), async {
        while http.request_count() < count {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("requests never arrived");
}

#[tokio::test(start_paused = true)]
async fn ping_is_answered_with_pong() {
    let (factory, conns) = ScriptedFactory::new();
    let http = ScriptedHttp::new(api);
    let mut client = build_client(factory, Arc::clone(&http));
    let server = serve(conns, vec![ping(2)]);

    client.start().await.unwrap();
    wait_for_requests(&http, 2).await;

    let requests = http.requests();
    assert_eq!(requests[0].1.method, reqwest::Method::GET);
    assert_eq!(requests[1].1.method, reqwest::Method::POST);
    let body: Value = serde_json::from_slice(requests[1].1.body.as_deref().unwrap()).unwrap();
    assert_eq!(body["content"], "pong!");

    client.stop().await;
    server.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn cached_channel_skips_the_lookup() {
    let (factory, conns) = ScriptedFactory::new();
    let http = ScriptedHttp::new(api);
    let mut client = build_client(factory, Arc::clone(&http));
    let server = serve(
        conns,
        vec![
            (
                "GUILD_CREATE",
                2,
                json!({
                    "id": "10",
                    "name": "relay",
                    "channels": [{"id": "5", "type": 0, "name": "general"}],
                }),
            ),
            ping(3),
        ],
    );

    client.start().await.unwrap();
    wait_for_requests(&http, 1).await;
    // Give a stray lookup the chance to show up
    sleep(Duration::from_secs(1)).await;

    let requests = http.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].1.method, reqwest::Method::POST);

    let channel = client.rest().get_channel(Id(5)).await.unwrap();
    assert_eq!(channel.guild_id, Some(Id(10)));

    client.stop().await;
    server.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn typed_and_lifecycle_handlers_fire() {
    let (factory, conns) = ScriptedFactory::new();
    let http = ScriptedHttp::new(api);
    let mut client = build_client(factory, Arc::clone(&http));

    let (seen, mut seen_rx) = mpsc::unbounded_channel();
    let on_ready = seen.clone();
    let on_state = seen.clone();
    client
        .on_ready(move |ctx, ready| {
            let seen = on_ready.clone();
            async move {
                let _ = seen.send(format!("ready:{}:{}", ctx.shard_id(), ready.session_id));
                Ok(())
            }
        })
        .on_shard_state(move |_ctx, change: ShardStateChange| {
            let seen = on_state.clone();
            async move {
                if change.state == ConnectionState::Connected {
                    let _ = seen.send("connected".to_string());
                }
                Ok(())
            }
        })
        .on_raw(move |_ctx, dispatch| {
            let seen = seen.clone();
            async move {
                let _ = seen.send(format!("raw:{}", dispatch.event_type));
                Ok(())
            }
        });

    let server = serve(conns, vec![("TYPING_START", 2, json!({"channel_id": "5"}))]);
    client.start().await.unwrap();

    let mut received = Vec::new();
    while received.len() < 4 {
        let entry = timeout(Duration::from_secs(60), seen_rx.recv())
            .await
            .expect("handlers never fired")
            .unwrap();
        received.push(entry);
    }
    received.sort();
    assert_eq!(
        received,
        vec!["connected", "raw:READY", "raw:TYPING_START", "ready:0:abc"]
    );

    client.stop().await;
    server.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shards_and_cache_are_visible_through_the_client() {
    let (factory, conns) = ScriptedFactory::new();
    let http = ScriptedHttp::new(api);
    let mut client = build_client(factory, Arc::clone(&http));
    let server = serve(conns, vec![]);

    client.start().await.unwrap();
    timeout(Duration::from_secs(60), async {
        while !client.registry().is_ready() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(client.cluster().shard_count(), 1);
    let me = client
        .cache()
        .get_value(&relay_gateway::cache::CacheKey::current_user())
        .await
        .unwrap();
    assert_eq!(me.unwrap()["username"], "relay");

    client.stop().await;
    server.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn entity_handlers_receive_typed_payloads() {
    let (factory, conns) = ScriptedFactory::new();
    let http = ScriptedHttp::new(api);
    let mut client = build_client(factory, Arc::clone(&http));

    let (seen, mut seen_rx) = mpsc::unbounded_channel::<String>();
    macro_rules! record {
        ($register:ident, |$event:ident| $label:expr) => {{
            let seen = seen.clone();
            client.$register(move |_ctx, $event| {
                let _ = seen.send($label);
                async { Ok(()) }
            });
        }};
    }
    record!(on_resumed, |shard_id| format!("resumed:{shard_id}"));
    record!(on_guild_update, |guild| format!("guild_update:{}", guild.id));
    record!(on_channel_create, |channel| format!("channel_create:{}", channel.id));
    record!(on_channel_update, |channel| format!(
        "channel_update:{}",
        channel.name.unwrap_or_default()
    ));
    record!(on_channel_delete, |channel| format!("channel_delete:{}", channel.id));
    record!(on_member_add, |member| format!(
        "member_add:{}",
        member.user.map(|u| u.username).unwrap_or_default()
    ));
    record!(on_member_update, |member| format!(
        "member_update:{}",
        member.nick.unwrap_or_default()
    ));
    record!(on_member_remove, |removed| format!("member_remove:{}", removed.user.id));
    record!(on_message_update, |update| format!(
        "message_update:{}",
        update.content.unwrap_or_default()
    ));
    record!(on_message_delete, |deleted| format!("message_delete:{}", deleted.id));
    client.on_message_create(|ctx, message| async move {
        if message.content == "hello" {
            ctx.reply(&message, "hi").await?;
        }
        Ok(())
    });

    let server = serve(
        conns,
        vec![
            ("RESUMED", 2, json!({})),
            ("GUILD_UPDATE", 3, json!({"id": "10", "name": "renamed"})),
            ("CHANNEL_CREATE", 4, json!({"id": "6", "type": 0, "guild_id": "10"})),
            ("CHANNEL_UPDATE", 5, json!({"id": "6", "name": "lobby"})),
            ("CHANNEL_DELETE", 6, json!({"id": "6"})),
            (
                "GUILD_MEMBER_ADD",
                7,
                json!({"guild_id": "10", "user": {"id": "30", "username": "ada"}}),
            ),
            (
                "GUILD_MEMBER_UPDATE",
                8,
                json!({"guild_id": "10", "user": {"id": "30", "username": "ada"}, "nick": "a"}),
            ),
            (
                "GUILD_MEMBER_REMOVE",
                9,
                json!({"guild_id": "10", "user": {"id": "30", "username": "ada"}}),
            ),
            ("MESSAGE_UPDATE", 10, json!({"id": "800", "channel_id": "5", "content": "edited"})),
            ("MESSAGE_DELETE", 11, json!({"id": "800", "channel_id": "5"})),
            (
                "MESSAGE_CREATE",
                12,
                json!({
                    "id": "801",
                    "channel_id": "5",
                    "author": {"id": "2000", "username": "someone"},
                    "content": "hello",
                }),
            ),
        ],
    );
    client.start().await.unwrap();

    let mut received = Vec::new();
    while received.len() < 10 {
        let entry = timeout(Duration::from_secs(60), seen_rx.recv())
            .await
            .expect("handlers never fired")
            .unwrap();
        received.push(entry);
    }
    received.sort();
    assert_eq!(
        received,
        vec![
            "channel_create:6",
            "channel_delete:6",
            "channel_update:lobby",
            "guild_update:10",
            "member_add:ada",
            "member_remove:30",
            "member_update:a",
            "message_delete:800",
            "message_update:edited",
            "resumed:0",
        ]
    );

    wait_for_requests(&http, 1).await;
    let (_, reply) = http.requests().remove(0);
    assert_eq!(reply.method, reqwest::Method::POST);
    let body: Value = serde_json::from_slice(reply.body.as_deref().unwrap()).unwrap();
    assert_eq!(body["content"], "hi");
    assert_eq!(body["message_reference"]["message_id"], "801");

    client.stop().await;
    server.await.unwrap();
}
