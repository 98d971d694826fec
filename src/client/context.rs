//! Handler context

use crate::cache::CacheClient;
use crate::error::GatewayError;
use crate::models::{Channel, CreateMessage, Id, Message};
use crate::rest::RestClient;

/// Passed to every event handler
#[derive(Debug, Clone)]
pub struct Context {
    rest: RestClient,
    shard_id: u32,
}

impl Context {
    pub fn new(rest: RestClient, shard_id: u32) -> Self {
        Self { rest, shard_id }
    }

    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    pub fn cache(&self) -> &CacheClient {
        self.rest.cache()
    }

    /// Shard the event arrived on
    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    /// Channel lookup, served from the cache when possible
    pub async fn channel(&self, channel_id: Id) -> Result<Channel, GatewayError> {
        self.rest.get_channel(channel_id).await
    }

    pub async fn send_message(
        &self,
        channel_id: Id,
        content: impl Into<String>,
    ) -> Result<Message, GatewayError> {
        self.rest
            .send_message(channel_id, &CreateMessage::text(content))
            .await
    }

    /// Reply in the message's channel, referencing it
    pub async fn reply(
        &self,
        message: &Message,
        content: impl Into<String>,
    ) -> Result<Message, GatewayError> {
        self.rest
            .send_message(
                message.channel_id,
                &CreateMessage::text(content).reply_to(message),
            )
            .await
    }
}
