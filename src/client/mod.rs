//! Client facade
//!
//! Ties the cluster, the cache bridge and the REST client together behind
//! typed event handlers. Register handlers, then `start()`:
//!
//! ```text
//! cluster ──> CacheStage ──> dispatcher ──spawn──> handler(Context, event)
//!                 │                                      │
//!                 └───────────> cache <──── RestClient <─┘
//! ```
//!
//! Every handler invocation runs in its own task, so a slow handler never
//! holds up the event stream or the shards' heartbeats.

mod context;

pub use context::Context;

use crate::cache::{CacheClient, CacheStage};
use crate::error::GatewayError;
use crate::events::{DispatchEvent, GatewayEvent, ShardEvent};
use crate::metrics::GatewayMetrics;
use crate::models::{
    Channel, Guild, Member, MemberRemove, Message, MessageDelete, MessageUpdate, Ready,
    UnavailableGuild,
};
use crate::rest::RestClient;
use crate::shard::{Cluster, ConnectionState, ShardRegistry};

use serde::de::DeserializeOwned;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send>>;

type Handler<T> = Arc<dyn Fn(Context, T) -> HandlerFuture + Send + Sync>;

/// A shard changed connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardStateChange {
    pub shard_id: u32,
    pub state: ConnectionState,
}

/// A shard stopped for good; the rest of the cluster keeps running
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDegraded {
    pub shard_id: u32,
    pub reason: String,
}

#[derive(Default)]
struct Handlers {
    ready: Vec<Handler<Ready>>,
    resumed: Vec<Handler<u32>>,
    message_create: Vec<Handler<Message>>,
    message_update: Vec<Handler<MessageUpdate>>,
    message_delete: Vec<Handler<MessageDelete>>,
    guild_create: Vec<Handler<Guild>>,
    guild_update: Vec<Handler<Guild>>,
    guild_delete: Vec<Handler<UnavailableGuild>>,
    channel_create: Vec<Handler<Channel>>,
    channel_update: Vec<Handler<Channel>>,
    channel_delete: Vec<Handler<Channel>>,
    member_add: Vec<Handler<Member>>,
    member_update: Vec<Handler<Member>>,
    member_remove: Vec<Handler<MemberRemove>>,
    raw: Vec<Handler<DispatchEvent>>,
    shard_state: Vec<Handler<ShardStateChange>>,
    degraded: Vec<Handler<ShardDegraded>>,
}

fn wrap<T, F, Fut>(handler: F) -> Handler<T>
where
    T: 'static,
    F: Fn(Context, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), GatewayError>> + Send + 'static,
{
    Arc::new(move |ctx: Context, event: T| -> HandlerFuture { Box::pin(handler(ctx, event)) })
}

/// High-level client over a cluster
pub struct Client {
    cluster: Cluster,
    rest: RestClient,
    metrics: GatewayMetrics,
    handlers: Handlers,
    events: Option<mpsc::UnboundedReceiver<ShardEvent>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Client {
    /// The REST client's cache is the one the bridge keeps current
    pub fn new(mut cluster: Cluster, rest: RestClient, metrics: GatewayMetrics) -> Self {
        let events = cluster.take_events();
        Self {
            cluster,
            rest,
            metrics,
            handlers: Handlers::default(),
            events,
            tasks: Vec::new(),
        }
    }

    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    pub fn cache(&self) -> &CacheClient {
        self.rest.cache()
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn registry(&self) -> ShardRegistry {
        self.cluster.registry()
    }

    /// Start the bridge, the dispatcher and every shard.
    ///
    /// Handlers registered after the first `start` are not called.
    pub async fn start(&mut self) -> Result<(), GatewayError> {
        if let Some(events) = self.events.take() {
            let stage = CacheStage::new(self.rest.cache().clone(), self.metrics.clone());
            let (cached, bridge) = stage.spawn(events);
            let handlers = Arc::new(std::mem::take(&mut self.handlers));
            let dispatcher = tokio::spawn(dispatch_loop(cached, handlers, self.rest.clone()));
            self.tasks.extend([bridge, dispatcher]);
            debug!("Cache bridge and dispatcher started");
        }

        self.cluster.start().await
    }

    /// Stop every shard. Idempotent.
    pub async fn stop(&mut self) {
        self.cluster.stop().await;
        info!("Client stopped");
    }

    pub fn on_ready<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Context, Ready) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), GatewayError>> + Send + 'static,
    {
        self.handlers.ready.push(wrap(handler));
        self
    }

    /// Called with the shard id after a successful resume
    pub fn on_resumed<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Context, u32) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), GatewayError>> + Send + 'static,
    {
        self.handlers.resumed.push(wrap(handler));
        self
    }

    pub fn on_message_create<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Context, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), GatewayError>> + Send + 'static,
    {
        self.handlers.message_create.push(wrap(handler));
        self
    }

    pub fn on_message_update<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Context, MessageUpdate) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), GatewayError>> + Send + 'static,
    {
        self.handlers.message_update.push(wrap(handler));
        self
    }

    pub fn on_message_delete<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Context, MessageDelete) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), GatewayError>> + Send + 'static,
    {
        self.handlers.message_delete.push(wrap(handler));
        self
    }

    pub fn on_guild_create<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Context, Guild) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), GatewayError>> + Send + 'static,
    {
        self.handlers.guild_create.push(wrap(handler));
        self
    }

    pub fn on_guild_update<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Context, Guild) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), GatewayError>> + Send + 'static,
    {
        self.handlers.guild_update.push(wrap(handler));
        self
    }

    /// `unavailable` tells an outage from the bot leaving the guild
    pub fn on_guild_delete<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Context, UnavailableGuild) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), GatewayError>> + Send + 'static,
    {
        self.handlers.guild_delete.push(wrap(handler));
        self
    }

    pub fn on_channel_create<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Context, Channel) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), GatewayError>> + Send + 'static,
    {
        self.handlers.channel_create.push(wrap(handler));
        self
    }

    pub fn on_channel_update<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Context, Channel) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), GatewayError>> + Send + 'static,
    {
        self.handlers.channel_update.push(wrap(handler));
        self
    }

    pub fn on_channel_delete<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Context, Channel) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), GatewayError>> + Send + 'static,
    {
        self.handlers.channel_delete.push(wrap(handler));
        self
    }

    pub fn on_member_add<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Context, Member) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), GatewayError>> + Send + 'static,
    {
        self.handlers.member_add.push(wrap(handler));
        self
    }

    pub fn on_member_update<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Context, Member) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), GatewayError>> + Send + 'static,
    {
        self.handlers.member_update.push(wrap(handler));
        self
    }

    pub fn on_member_remove<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Context, MemberRemove) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), GatewayError>> + Send + 'static,
    {
        self.handlers.member_remove.push(wrap(handler));
        self
    }

    /// Every dispatch, including types without a typed handler
    pub fn on_raw<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Context, DispatchEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), GatewayError>> + Send + 'static,
    {
        self.handlers.raw.push(wrap(handler));
        self
    }

    pub fn on_shard_state<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Context, ShardStateChange) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), GatewayError>> + Send + 'static,
    {
        self.handlers.shard_state.push(wrap(handler));
        self
    }

    pub fn on_shard_degraded<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(Context, ShardDegraded) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), GatewayError>> + Send + 'static,
    {
        self.handlers.degraded.push(wrap(handler));
        self
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn dispatch_loop(
    mut events: mpsc::UnboundedReceiver<ShardEvent>,
    handlers: Arc<Handlers>,
    rest: RestClient,
) {
    while let Some(ShardEvent { shard_id, event }) = events.recv().await {
        let ctx = Context::new(rest.clone(), shard_id);

        match event {
            GatewayEvent::Dispatch(dispatch) => route_dispatch(&handlers, ctx, dispatch),
            GatewayEvent::StateChanged(state) => {
                fire(&handlers.shard_state, &ctx, ShardStateChange { shard_id, state })
            }
            GatewayEvent::Degraded { reason } => {
                fire(&handlers.degraded, &ctx, ShardDegraded { shard_id, reason })
            }
            _ => {}
        }
    }
    debug!("Dispatcher input closed");
}

fn route_dispatch(handlers: &Handlers, ctx: Context, dispatch: DispatchEvent) {
    let decoded = Decoded {
        ctx: &ctx,
        dispatch: &dispatch,
    };

    match dispatch.event_type.as_str() {
        "READY" => decoded.fire(&handlers.ready),
        "RESUMED" => fire(&handlers.resumed, &ctx, ctx.shard_id()),
        "MESSAGE_CREATE" => decoded.fire(&handlers.message_create),
        "MESSAGE_UPDATE" => decoded.fire(&handlers.message_update),
        "MESSAGE_DELETE" => decoded.fire(&handlers.message_delete),
        "GUILD_CREATE" => decoded.fire(&handlers.guild_create),
        "GUILD_UPDATE" => decoded.fire(&handlers.guild_update),
        "GUILD_DELETE" => decoded.fire(&handlers.guild_delete),
        "CHANNEL_CREATE" => decoded.fire(&handlers.channel_create),
        "CHANNEL_UPDATE" => decoded.fire(&handlers.channel_update),
        "CHANNEL_DELETE" => decoded.fire(&handlers.channel_delete),
        "GUILD_MEMBER_ADD" => decoded.fire(&handlers.member_add),
        "GUILD_MEMBER_UPDATE" => decoded.fire(&handlers.member_update),
        "GUILD_MEMBER_REMOVE" => decoded.fire(&handlers.member_remove),
        _ => {}
    }

    fire(&handlers.raw, &ctx, dispatch);
}

struct Decoded<'a> {
    ctx: &'a Context,
    dispatch: &'a DispatchEvent,
}

impl Decoded<'_> {
    fn fire<T>(&self, handlers: &[Handler<T>])
    where
        T: DeserializeOwned + Clone + Send + 'static,
    {
        if handlers.is_empty() {
            return;
        }
        match serde_json::from_value::<T>(self.dispatch.payload.clone()) {
            Ok(event) => fire(handlers, self.ctx, event),
            Err(e) => warn!(
                event_type = %self.dispatch.event_type,
                event_id = %self.dispatch.event_id,
                error = %e,
                "Dispatch payload did not match its type, handlers skipped"
            ),
        }
    }
}

fn fire<T: Clone + Send + 'static>(handlers: &[Handler<T>], ctx: &Context, event: T) {
    for handler in handlers {
        let fut = handler(ctx.clone(), event.clone());
        let shard_id = ctx.shard_id();
        tokio::spawn(async move {
            if let Err(e) = fut.await {
                warn!(shard_id, error = %e, "Event handler failed");
            }
        });
    }
}
