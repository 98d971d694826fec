//! Scripted gateway and HTTP peers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use flate2::{Compress, Compression, FlushCompress};
use relay_gateway::config::{ShardConfig, Token};
use relay_gateway::events::{GatewayEvent, ShardEvent};
use relay_gateway::rest::{HttpRequest, HttpResponse, HttpTransport};
use relay_gateway::shard::Backoff;
use relay_gateway::transport::{
    GatewayTransport, TransportError, TransportFactory, TransportMessage,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

pub const TOKEN: &str = "test-token";

/// Generous deadline; paused-time tests advance the clock for free
const WAIT: Duration = Duration::from_secs(600);

/// What the client wrote on a scripted socket
#[derive(Debug, Clone)]
pub enum Sent {
    Frame { at: Instant, frame: Value },
    Close(u16),
}

/// Client half of a scripted socket
struct ScriptedTransport {
    inbound: mpsc::UnboundedReceiver<TransportMessage>,
    outbound: mpsc::UnboundedSender<Sent>,
}

#[async_trait]
impl GatewayTransport for ScriptedTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        let frame: Value =
            serde_json::from_str(&text).map_err(|e| TransportError::WebSocket(e.to_string()))?;
        self.outbound
            .send(Sent::Frame {
                at: Instant::now(),
                frame,
            })
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Option<Result<TransportMessage, TransportError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self, code: u16) -> Result<(), TransportError> {
        let _ = self.outbound.send(Sent::Close(code));
        Ok(())
    }
}

/// Server half of a scripted socket
pub struct ServerConn {
    pub url: String,
    to_client: mpsc::UnboundedSender<TransportMessage>,
    from_client: mpsc::UnboundedReceiver<Sent>,
}

impl ServerConn {
    pub fn send(&self, frame: Value) {
        let _ = self.to_client.send(TransportMessage::Text(frame.to_string()));
    }

    pub fn send_raw(&self, message: TransportMessage) {
        let _ = self.to_client.send(message);
    }

    pub fn hello(&self, interval_ms: u64) {
        self.send(json!({"op": 10, "d": {"heartbeat_interval": interval_ms}}));
    }

    pub fn dispatch(&self, event_type: &str, seq: u64, payload: Value) {
        self.send(json!({"op": 0, "t": event_type, "s": seq, "d": payload}));
    }

    pub fn ready(&self, session_id: &str, seq: u64) {
        self.dispatch(
            "READY",
            seq,
            json!({
                "v": 10,
                "user": {"id": "1000", "username": "relay"},
                "session_id": session_id,
                "resume_gateway_url": "wss://resume.example",
                "guilds": [],
            }),
        );
    }

    pub fn close(&self, code: u16) {
        let _ = self.to_client.send(TransportMessage::Close(Some(code)));
    }

    /// Next thing the client wrote
    pub async fn next_sent(&mut self) -> Sent {
        timeout(WAIT, self.from_client.recv())
            .await
            .expect("client went quiet")
            .expect("client dropped the socket")
    }

    /// Next frame with `op`, acking any heartbeats on the way
    pub async fn expect_op(&mut self, op: u64) -> (Instant, Value) {
        loop {
            match self.next_sent().await {
                Sent::Frame { at, frame } if frame["op"] == op => return (at, frame),
                Sent::Frame { frame, .. } if frame["op"] == 1 => {
                    self.send(json!({"op": 11}));
                }
                Sent::Frame { frame, .. } => panic!("unexpected frame {frame}"),
                Sent::Close(code) => panic!("unexpected close {code}"),
            }
        }
    }

    /// Ack heartbeats until the client closes or drops the socket
    pub async fn ack_until_closed(&mut self) {
        while let Some(sent) = self.from_client.recv().await {
            match sent {
                Sent::Frame { frame, .. } if frame["op"] == 1 => self.send(json!({"op": 11})),
                Sent::Frame { .. } => {}
                Sent::Close(_) => return,
            }
        }
    }

    /// Wait for the client to close the socket, skipping frames
    pub async fn expect_close(&mut self) -> u16 {
        loop {
            if let Sent::Close(code) = self.next_sent().await {
                return code;
            }
        }
    }
}

/// Hands every connect to the test as a [`ServerConn`]
pub struct ScriptedFactory {
    accepted: mpsc::UnboundedSender<ServerConn>,
    failures_left: AtomicU32,
    connects: AtomicU32,
}

impl ScriptedFactory {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerConn>) {
        Self::failing(0)
    }

    /// Refuse the first `failures` connects
    pub fn failing(failures: u32) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerConn>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let factory = Arc::new(Self {
            accepted,
            failures_left: AtomicU32::new(failures),
            connects: AtomicU32::new(0),
        });
        (factory, rx)
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Refuse the next `failures` connects
    pub fn refuse(&self, failures: u32) {
        self.failures_left.store(failures, Ordering::SeqCst);
    }
}

/// Server side of one zlib-stream socket
pub struct ZlibStream(Compress);

impl ZlibStream {
    pub fn new() -> Self {
        Self(Compress::new(Compression::default(), true))
    }

    /// Compress `frame` and sync-flush, ending with `00 00 FF FF`
    pub fn encode(&mut self, frame: &Value) -> Vec<u8> {
        let text = frame.to_string();
        let mut out = Vec::with_capacity(text.len() + 64);
        self.0
            .compress_vec(text.as_bytes(), &mut out, FlushCompress::Sync)
            .expect("compress frame");
        out
    }
}

#[async_trait]
impl TransportFactory for ScriptedFactory {
    async fn connect(&self, url: &str) -> Result<Box<dyn GatewayTransport>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Connect("connection refused".to_string()));
        }

        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        self.accepted
            .send(ServerConn {
                url: url.to_string(),
                to_client,
                from_client,
            })
            .map_err(|_| TransportError::Connect("test server gone".to_string()))?;

        Ok(Box::new(ScriptedTransport { inbound, outbound }))
    }
}

pub fn shard_config(
    shard_id: u32,
    shard_count: u32,
    factory: Arc<ScriptedFactory>,
) -> ShardConfig {
    let mut config = ShardConfig::new(shard_id, shard_count, Token::new(TOKEN), factory);
    config.gateway_url = "wss://gateway.example".to_string();
    config.backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 3);
    config
}

/// Receive events until one matches
pub async fn next_event<F>(
    events: &mut mpsc::UnboundedReceiver<ShardEvent>,
    mut matches: F,
) -> ShardEvent
where
    F: FnMut(&GatewayEvent) -> bool,
{
    loop {
        let event = timeout(WAIT, events.recv())
            .await
            .expect("no matching event")
            .expect("event stream closed");
        if matches(&event.event) {
            return event;
        }
    }
}

type Responder = dyn Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync;

/// HTTP peer answering through a closure and recording every request
pub struct ScriptedHttp {
    respond: Box<Responder>,
    requests: Mutex<Vec<(Instant, HttpRequest)>>,
}

impl ScriptedHttp {
    pub fn new<F>(respond: F) -> Arc<Self>
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            respond: Box::new(respond),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<(Instant, HttpRequest)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl HttpTransport for ScriptedHttp {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let response = (self.respond)(&request);
        self.requests.lock().unwrap().push((Instant::now(), request));
        response
    }
}

pub fn json_response(status: u16, body: Value) -> HttpResponse {
    HttpResponse::new(status).with_json(&body)
}
