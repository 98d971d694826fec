//! Shard connection state machine
//!
//! One runner task per shard owns the socket, the session and the heartbeat
//! timer. Nothing outside this task mutates the session; everything it learns
//! is published as [`ShardEvent`]s and as a [`ShardSession`] snapshot.

use super::heartbeat::HeartbeatTimer;
use super::identify::IdentifyLimiter;
use super::session::{ConnectionState, ShardSession};
use super::state::{ShardHealth, ShardRegistry};
use crate::config::ShardConfig;
use crate::error::GatewayError;
use crate::events::{DispatchEvent, GatewayEvent, ShardEvent};
use crate::metrics::GatewayMetrics;
use crate::protocol::{
    CloseAction, ConnectionProperties, Frame, IdentifyPayload, OutboundFrame, ResumePayload,
};
use crate::transport::{GatewayTransport, Inflater, TransportError, TransportMessage};

use rand::Rng;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, error, info, trace, warn};

/// Consecutive malformed frames tolerated before the socket is torn down
pub const MAX_PROTOCOL_VIOLATIONS: u32 = 5;

/// Client close code that keeps the session resumable
const RESUMABLE_CLOSE_CODE: u16 = 4000;
/// Client close code that ends the session
const NORMAL_CLOSE_CODE: u16 = 1000;

/// What the run loop does after a connection ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Resume,
    Reidentify { delay: Duration },
    Shutdown,
}

enum Handshake {
    Interval(Duration),
    Exit(Next),
}

pub(crate) struct ShardRunner {
    config: Arc<ShardConfig>,
    session: ShardSession,
    identify: Arc<IdentifyLimiter>,
    events: mpsc::UnboundedSender<ShardEvent>,
    snapshot: watch::Sender<ShardSession>,
    shutdown: watch::Receiver<bool>,
    opened: Option<oneshot::Sender<Result<(), GatewayError>>>,
    registry: ShardRegistry,
    metrics: GatewayMetrics,
    inflater: Inflater,
    identify_attempts: u32,
    protocol_violations: u32,
    failed_handshakes: u32,
}

/// Resolves once shutdown is requested or the handle is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn wait_slot<F: Future + Unpin>(slot: &mut Option<F>) -> F::Output {
    match slot {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

impl ShardRunner {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: Arc<ShardConfig>,
        identify: Arc<IdentifyLimiter>,
        events: mpsc::UnboundedSender<ShardEvent>,
        snapshot: watch::Sender<ShardSession>,
        shutdown: watch::Receiver<bool>,
        opened: oneshot::Sender<Result<(), GatewayError>>,
        registry: ShardRegistry,
        metrics: GatewayMetrics,
    ) -> Self {
        let session = ShardSession::new(config.shard_id, config.shard_count);
        Self {
            config,
            session,
            identify,
            events,
            snapshot,
            shutdown,
            opened: Some(opened),
            registry,
            metrics,
            inflater: Inflater::new(),
            identify_attempts: 0,
            protocol_violations: 0,
            failed_handshakes: 0,
        }
    }

    fn shard_id(&self) -> u32 {
        self.session.shard_id
    }

    pub(crate) async fn run(mut self) {
        let shard_id = self.shard_id();
        info!(shard_id, shard_count = self.session.shard_count, "Shard starting");

        let result = self.run_loop().await;
        self.set_state(ConnectionState::Disconnected);

        match result {
            Ok(()) => {
                info!(shard_id, "Shard stopped");
                if let Some(opened) = self.opened.take() {
                    let _ = opened.send(Err(GatewayError::Shutdown));
                }
            }
            Err(e) => {
                error!(shard_id, error = %e, "Shard stopped on unrecoverable error");
                self.session.invalidate();
                self.publish_snapshot();
                self.metrics.record_error(shard_id, e.error_type_label());
                self.emit(GatewayEvent::Degraded {
                    reason: e.to_string(),
                });
                self.registry.set_health(shard_id, ShardHealth::Dead);
                if let Some(opened) = self.opened.take() {
                    let _ = opened.send(Err(e));
                }
            }
        }
    }

    async fn run_loop(&mut self) -> Result<(), GatewayError> {
        let shard_id = self.shard_id();
        let mut reconnecting = false;

        loop {
            if *self.shutdown.borrow() {
                return Ok(());
            }

            if self.failed_handshakes > 0 {
                let delay = self.config.backoff.delay(self.failed_handshakes - 1);
                debug!(shard_id, ?delay, "Backing off before reconnect");
                if !self.sleep_or_shutdown(delay).await {
                    return Ok(());
                }
            }

            let mut transport = match self.connect().await {
                Ok(transport) => transport,
                Err(GatewayError::Shutdown) => return Ok(()),
                Err(e) => return Err(e),
            };

            if reconnecting {
                self.registry.record_reconnect(shard_id);
            }
            reconnecting = true;
            self.inflater.reset();

            let outcome = self.drive(transport.as_mut()).await;

            // The socket is released on every path out of `drive`
            let close_code = match outcome {
                Ok(Next::Resume) => RESUMABLE_CLOSE_CODE,
                _ => NORMAL_CLOSE_CODE,
            };
            match timeout(self.config.connect_timeout, transport.close(close_code)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(shard_id, error = %e, "Error closing socket"),
                Err(_) => debug!(shard_id, "Timed out closing socket"),
            }
            drop(transport);
            self.set_state(ConnectionState::Disconnected);

            let next = match outcome {
                Ok(next) => next,
                Err(e) if !e.is_fatal() => {
                    warn!(shard_id, error = %e, "Connection failed, reconnecting");
                    self.metrics.record_error(shard_id, e.error_type_label());
                    Next::Resume
                }
                Err(e) => return Err(e),
            };

            match next {
                Next::Shutdown => return Ok(()),
                Next::Resume => {
                    debug!(shard_id, resumable = self.session.can_resume(), "Reconnecting");
                }
                Next::Reidentify { delay } => {
                    self.session.invalidate();
                    self.publish_snapshot();
                    debug!(shard_id, ?delay, "Reconnecting with a fresh session");
                    if !self.sleep_or_shutdown(delay).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Sleep unless shutdown is requested first; false on shutdown
    async fn sleep_or_shutdown(&mut self, delay: Duration) -> bool {
        if delay.is_zero() {
            return !*self.shutdown.borrow();
        }
        tokio::select! {
            _ = sleep(delay) => true,
            _ = shutdown_requested(&mut self.shutdown) => false,
        }
    }

    /// Whether connect failures still count against the startup budget.
    ///
    /// Once `start()` has resolved the shard retries for as long as it runs.
    fn connect_bounded(&self) -> bool {
        self.opened.is_some()
    }

    /// Open the socket, retrying with backoff
    async fn connect(&mut self) -> Result<Box<dyn GatewayTransport>, GatewayError> {
        let shard_id = self.shard_id();
        self.set_state(ConnectionState::Connecting);

        let base = match &self.session.resume_url {
            Some(url) if self.session.can_resume() => url.clone(),
            _ => self.config.gateway_url.clone(),
        };
        let url = self.config.connect_url(&base);
        let factory = Arc::clone(&self.config.transport_factory);
        let connect_timeout = self.config.connect_timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let attempt = timeout(connect_timeout, factory.connect(&url));

            let result = tokio::select! {
                result = attempt => result,
                _ = shutdown_requested(&mut self.shutdown) => return Err(GatewayError::Shutdown),
            };

            let source = match result {
                Ok(Ok(transport)) => {
                    debug!(shard_id, attempt = attempts, "Gateway socket open");
                    return Ok(transport);
                }
                Ok(Err(e)) => e,
                Err(_) => TransportError::Timeout(connect_timeout),
            };

            if self.connect_bounded() && !self.config.backoff.allows(attempts) {
                return Err(GatewayError::Connection { attempts, source });
            }

            let delay = self.config.backoff.delay(attempts - 1);
            warn!(
                shard_id,
                attempt = attempts,
                ?delay,
                error = %source,
                "Gateway connect failed, backing off"
            );
            if !self.sleep_or_shutdown(delay).await {
                return Err(GatewayError::Shutdown);
            }
        }
    }

    /// Run one socket until it must be replaced
    async fn drive(&mut self, transport: &mut dyn GatewayTransport) -> Result<Next, GatewayError> {
        let shard_id = self.shard_id();

        let interval = match self.await_hello(transport).await? {
            Handshake::Interval(interval) => interval,
            Handshake::Exit(next) => return Ok(next),
        };
        self.failed_handshakes = 0;
        if let Some(opened) = self.opened.take() {
            let _ = opened.send(Ok(()));
        }
        debug!(shard_id, interval_ms = interval.as_millis() as u64, "Hello received");

        let mut heartbeat = HeartbeatTimer::spawn(interval, self.config.heartbeat_ack_timeout);
        let limiter = Arc::clone(&self.identify);
        let mut identify_slot = None;

        if self.session.can_resume() {
            if let Some(next) = self.send_resume(transport).await? {
                return Ok(next);
            }
        } else {
            if self.identify_attempts >= self.config.max_identify_attempts {
                return Err(GatewayError::ShardCircuitBroken {
                    shard_id,
                    count: self.identify_attempts,
                    max: self.config.max_identify_attempts,
                });
            }
            self.set_state(ConnectionState::Identifying);
            identify_slot = Some(Box::pin(limiter.acquire(shard_id)));
        }

        loop {
            let ack_deadline = heartbeat.ack_deadline();

            tokio::select! {
                _ = shutdown_requested(&mut self.shutdown) => return Ok(Next::Shutdown),
                _ = wait_slot(&mut identify_slot) => {
                    identify_slot = None;
                    if let Some(next) = self.send_identify(transport).await? {
                        return Ok(next);
                    }
                }
                _ = heartbeat.next_tick() => {
                    if heartbeat.is_awaiting_ack() {
                        return Ok(self.zombied());
                    }
                    if !self.send_heartbeat(transport, &mut heartbeat).await {
                        return Ok(Next::Resume);
                    }
                }
                _ = sleep_until_opt(ack_deadline) => return Ok(self.zombied()),
                message = transport.recv() => {
                    if let Some(next) = self.handle_message(message, transport, &mut heartbeat).await? {
                        return Ok(next);
                    }
                }
            }
        }
    }

    async fn await_hello(
        &mut self,
        transport: &mut dyn GatewayTransport,
    ) -> Result<Handshake, GatewayError> {
        let shard_id = self.shard_id();
        let deadline = Instant::now() + self.config.connect_timeout;

        loop {
            let message = tokio::select! {
                _ = shutdown_requested(&mut self.shutdown) => return Ok(Handshake::Exit(Next::Shutdown)),
                _ = sleep_until(deadline) => {
                    warn!(shard_id, "No Hello before connect timeout");
                    return self.handshake_failed(TransportError::Timeout(self.config.connect_timeout));
                }
                message = transport.recv() => message,
            };

            let text = match message {
                None => return self.handshake_failed(TransportError::Closed),
                Some(Err(e)) => return self.handshake_failed(e),
                Some(Ok(TransportMessage::Close(code))) => {
                    return self.on_close(code).map(Handshake::Exit)
                }
                Some(Ok(TransportMessage::Text(text))) => text,
                Some(Ok(TransportMessage::Binary(bytes))) => match self.decode_binary(&bytes) {
                    Ok(Some(text)) => text,
                    Ok(None) => continue,
                    Err(e) => return self.handshake_failed(e),
                },
            };

            match Frame::decode(&text) {
                Ok(Frame::Hello { heartbeat_interval }) => {
                    self.protocol_violations = 0;
                    return Ok(Handshake::Interval(heartbeat_interval));
                }
                Ok(frame) => {
                    debug!(shard_id, op = ?frame.opcode(), "Ignoring frame before Hello");
                }
                Err(e) => {
                    if let Some(next) = self.protocol_violation(e) {
                        return Ok(Handshake::Exit(next));
                    }
                }
            }
        }
    }

    fn handshake_failed(&mut self, source: TransportError) -> Result<Handshake, GatewayError> {
        self.failed_handshakes += 1;
        if self.connect_bounded() && !self.config.backoff.allows(self.failed_handshakes) {
            return Err(GatewayError::Connection {
                attempts: self.failed_handshakes,
                source,
            });
        }
        warn!(
            shard_id = self.shard_id(),
            attempt = self.failed_handshakes,
            error = %source,
            "Gateway handshake failed"
        );
        Ok(Handshake::Exit(Next::Resume))
    }

    fn decode_binary(&mut self, bytes: &[u8]) -> Result<Option<String>, TransportError> {
        if self.config.compressed {
            self.inflater.push(bytes)
        } else {
            String::from_utf8(bytes.to_vec())
                .map(Some)
                .map_err(|e| TransportError::WebSocket(format!("non-UTF-8 binary frame: {e}")))
        }
    }

    async fn handle_message(
        &mut self,
        message: Option<Result<TransportMessage, TransportError>>,
        transport: &mut dyn GatewayTransport,
        heartbeat: &mut HeartbeatTimer,
    ) -> Result<Option<Next>, GatewayError> {
        let shard_id = self.shard_id();

        let message = match message {
            None => {
                info!(shard_id, "Gateway stream ended");
                self.metrics.record_reconnect(shard_id, "stream_end");
                return Ok(Some(Next::Resume));
            }
            Some(Err(e)) => {
                warn!(shard_id, error = %e, "Gateway socket error");
                self.metrics.record_reconnect(shard_id, "transport_error");
                return Ok(Some(Next::Resume));
            }
            Some(Ok(message)) => message,
        };

        let text = match message {
            TransportMessage::Close(code) => return self.on_close(code).map(Some),
            TransportMessage::Text(text) => text,
            TransportMessage::Binary(bytes) => match self.decode_binary(&bytes) {
                Ok(Some(text)) => text,
                Ok(None) => return Ok(None),
                Err(e) => {
                    warn!(shard_id, error = %e, "Undecodable binary frame, reconnecting");
                    self.metrics.record_reconnect(shard_id, "decompress");
                    return Ok(Some(Next::Resume));
                }
            },
        };

        let frame = match Frame::decode(&text) {
            Ok(frame) => {
                self.protocol_violations = 0;
                frame
            }
            Err(e) => return Ok(self.protocol_violation(e)),
        };

        self.handle_frame(frame, transport, heartbeat).await
    }

    async fn handle_frame(
        &mut self,
        frame: Frame,
        transport: &mut dyn GatewayTransport,
        heartbeat: &mut HeartbeatTimer,
    ) -> Result<Option<Next>, GatewayError> {
        let shard_id = self.shard_id();

        match frame {
            Frame::Dispatch {
                sequence,
                event_type,
                payload,
            } => {
                self.session.observe_sequence(sequence);

                match event_type.as_str() {
                    "READY" => {
                        let Some(session_id) = payload.get("session_id").and_then(Value::as_str)
                        else {
                            return Ok(self.protocol_violation(GatewayError::ProtocolViolation {
                                reason: "READY without session_id".to_string(),
                            }));
                        };
                        let resume_url = payload
                            .get("resume_gateway_url")
                            .and_then(Value::as_str)
                            .map(str::to_string);

                        self.session.establish(session_id.to_string(), resume_url);
                        self.identify_attempts = 0;
                        self.set_state(ConnectionState::Connected);
                        info!(shard_id, session_id, seq = sequence, "Shard ready");
                        self.emit(GatewayEvent::Ready {
                            session_id: session_id.to_string(),
                        });
                    }
                    "RESUMED" => {
                        self.set_state(ConnectionState::Connected);
                        info!(shard_id, seq = sequence, "Shard resumed");
                        self.emit(GatewayEvent::Resumed);
                    }
                    _ => {}
                }

                self.publish_snapshot();
                trace!(shard_id, seq = sequence, event_type = %event_type, "Dispatch");
                self.emit(GatewayEvent::Dispatch(DispatchEvent::new(
                    event_type, sequence, payload,
                )));
                Ok(None)
            }
            Frame::Heartbeat => {
                debug!(shard_id, "Server requested heartbeat");
                if !self.send_heartbeat(transport, heartbeat).await {
                    return Ok(Some(Next::Resume));
                }
                Ok(None)
            }
            Frame::HeartbeatAck => {
                let latency = heartbeat.record_ack();
                self.registry.record_heartbeat(shard_id, latency);
                if let Some(latency) = latency {
                    trace!(shard_id, latency_ms = latency.as_millis() as u64, "Heartbeat acked");
                    self.metrics.record_heartbeat(shard_id, latency);
                    self.emit(GatewayEvent::HeartbeatAck { latency });
                }
                Ok(None)
            }
            Frame::Reconnect => {
                info!(shard_id, "Gateway requested reconnect");
                self.metrics.record_reconnect(shard_id, "requested");
                self.emit(GatewayEvent::Reconnect);
                Ok(Some(Next::Resume))
            }
            Frame::InvalidSession { resumable } => {
                self.emit(GatewayEvent::InvalidSession { resumable });
                if resumable && self.session.can_resume() {
                    warn!(shard_id, "Session invalidated, resuming");
                    return Ok(Some(Next::Resume));
                }

                let err = GatewayError::SessionInvalidated { shard_id };
                warn!(shard_id, error = %err, "Re-identifying");
                self.metrics.record_error(shard_id, err.error_type_label());
                self.session.invalidate();
                self.publish_snapshot();
                let delay = Duration::from_millis(rand::thread_rng().gen_range(1_000..=5_000));
                Ok(Some(Next::Reidentify { delay }))
            }
            Frame::Hello { .. } => {
                debug!(shard_id, "Ignoring repeated Hello");
                Ok(None)
            }
            Frame::Unknown { op, .. } => {
                debug!(shard_id, op, "Ignoring unknown opcode");
                Ok(None)
            }
        }
    }

    fn on_close(&mut self, code: Option<u16>) -> Result<Next, GatewayError> {
        let shard_id = self.shard_id();
        self.emit(GatewayEvent::Close { code });

        let action = self.config.close_policy.classify(code);
        info!(shard_id, close_code = ?code, ?action, "Gateway closed the connection");

        match action {
            CloseAction::Resume => {
                self.metrics.record_reconnect(shard_id, "close");
                Ok(Next::Resume)
            }
            CloseAction::Reidentify => {
                self.metrics.record_reconnect(shard_id, "close_reidentify");
                self.session.invalidate();
                self.publish_snapshot();
                Ok(Next::Reidentify {
                    delay: Duration::ZERO,
                })
            }
            CloseAction::FatalAuth => Err(GatewayError::FatalAuth {
                context: format!("gateway closed with code {}", code.unwrap_or_default()),
            }),
            CloseAction::Fatal => Err(GatewayError::FatalClose {
                shard_id,
                code: code.unwrap_or_default(),
            }),
        }
    }

    /// Count a malformed frame; tear down once violations repeat
    fn protocol_violation(&mut self, error: GatewayError) -> Option<Next> {
        let shard_id = self.shard_id();
        self.protocol_violations += 1;
        self.metrics.record_protocol_violation(shard_id);
        warn!(
            shard_id,
            error = %error,
            consecutive = self.protocol_violations,
            "Dropping malformed frame"
        );

        if self.protocol_violations >= MAX_PROTOCOL_VIOLATIONS {
            warn!(shard_id, "Too many malformed frames, reconnecting");
            self.protocol_violations = 0;
            self.metrics.record_reconnect(shard_id, "protocol_violation");
            return Some(Next::Resume);
        }
        None
    }

    fn zombied(&mut self) -> Next {
        let shard_id = self.shard_id();
        warn!(shard_id, "No heartbeat ack before deadline, connection zombied");
        self.metrics.record_reconnect(shard_id, "zombie");
        Next::Resume
    }

    async fn send_identify(
        &mut self,
        transport: &mut dyn GatewayTransport,
    ) -> Result<Option<Next>, GatewayError> {
        let shard_id = self.shard_id();
        self.identify_attempts += 1;

        let frame = OutboundFrame::Identify(IdentifyPayload {
            token: self.config.token.expose().to_string(),
            properties: ConnectionProperties::default(),
            compress: false,
            large_threshold: self.config.large_threshold,
            shard: [self.session.shard_id, self.session.shard_count],
            intents: self.config.intents,
        });

        if let Err(e) = transport.send(frame.encode()?).await {
            warn!(shard_id, error = %e, "Failed to send Identify");
            return Ok(Some(Next::Resume));
        }

        info!(shard_id, attempt = self.identify_attempts, "Identify sent");
        Ok(None)
    }

    async fn send_resume(
        &mut self,
        transport: &mut dyn GatewayTransport,
    ) -> Result<Option<Next>, GatewayError> {
        let shard_id = self.shard_id();
        let (Some(session_id), Some(seq)) = (self.session.session_id.clone(), self.session.sequence)
        else {
            return Ok(Some(Next::Reidentify {
                delay: Duration::ZERO,
            }));
        };

        self.set_state(ConnectionState::Resuming);

        let frame = OutboundFrame::Resume(ResumePayload {
            token: self.config.token.expose().to_string(),
            session_id,
            seq,
        });

        if let Err(e) = transport.send(frame.encode()?).await {
            warn!(shard_id, error = %e, "Failed to send Resume");
            return Ok(Some(Next::Resume));
        }

        info!(shard_id, seq, "Resume sent");
        Ok(None)
    }

    /// Send a heartbeat; false if the socket failed
    async fn send_heartbeat(
        &mut self,
        transport: &mut dyn GatewayTransport,
        heartbeat: &mut HeartbeatTimer,
    ) -> bool {
        let shard_id = self.shard_id();
        let frame = OutboundFrame::Heartbeat {
            last_sequence: self.session.sequence,
        };

        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                error!(shard_id, error = %e, "Failed to encode heartbeat");
                return false;
            }
        };

        match transport.send(text).await {
            Ok(()) => {
                heartbeat.record_sent();
                trace!(shard_id, seq = ?self.session.sequence, "Heartbeat sent");
                true
            }
            Err(e) => {
                warn!(shard_id, error = %e, "Failed to send heartbeat");
                self.metrics.record_reconnect(shard_id, "heartbeat_send");
                false
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.session.state == state {
            return;
        }
        let shard_id = self.shard_id();
        debug!(shard_id, from = %self.session.state, to = %state, "Shard state transition");

        self.session.state = state;
        self.registry.set_health(shard_id, state.into());
        self.publish_snapshot();
        self.emit(GatewayEvent::StateChanged(state));
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(self.session.clone());
    }

    fn emit(&self, event: GatewayEvent) {
        let shard_id = self.shard_id();
        self.registry.record_event(shard_id);
        self.metrics.record_event(shard_id, event.kind());
        // A dropped receiver only means nobody is listening any more
        let _ = self.events.send(ShardEvent::new(shard_id, event));
    }
}
