//! Cache bridge
//!
//! A single consumer task sits between the cluster and the client facade.
//! Every dispatch is applied to the cache before it is forwarded, so a
//! handler reacting to an event already sees that event in the cache.
//!
//! ```text
//! ┌─────────┐  ShardEvent  ┌────────────┐  ShardEvent  ┌────────┐
//! │ cluster │ ───────────> │ CacheStage │ ───────────> │ client │
//! └─────────┘              └─────┬──────┘              └────────┘
//!                                │ upsert / delete
//!                                v
//!                          ┌────────────┐
//!                          │ CacheStore │
//!                          └────────────┘
//! ```

use super::{CacheClient, CacheKey, EntityKind};
use crate::error::GatewayError;
use crate::events::{DispatchEvent, GatewayEvent, ShardEvent};
use crate::metrics::GatewayMetrics;

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Guild fields that are cached under their own keys instead
const GUILD_COLLECTIONS: [&str; 6] = [
    "channels",
    "threads",
    "members",
    "roles",
    "presences",
    "voice_states",
];

#[derive(Clone)]
pub struct CacheStage {
    cache: CacheClient,
    metrics: GatewayMetrics,
}

impl CacheStage {
    pub fn new(cache: CacheClient, metrics: GatewayMetrics) -> Self {
        Self { cache, metrics }
    }

    pub fn cache(&self) -> &CacheClient {
        &self.cache
    }

    /// Consume `events`, apply each dispatch, forward everything in order
    pub fn spawn(
        self,
        mut events: mpsc::UnboundedReceiver<ShardEvent>,
    ) -> (mpsc::UnboundedReceiver<ShardEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let GatewayEvent::Dispatch(dispatch) = &event.event {
                    if let Err(e) = self.apply(dispatch).await {
                        warn!(
                            shard_id = event.shard_id,
                            event_type = %dispatch.event_type,
                            event_id = %dispatch.event_id,
                            error = %e,
                            "Cache bridge skipped event"
                        );
                        self.metrics.record_bridge_failure(&dispatch.event_type);
                    }
                }
                // Keep caching even when nobody downstream listens
                let _ = tx.send(event);
            }
            debug!("Cache bridge input closed");
        });

        (rx, task)
    }

    /// Apply one dispatch. Returns whether the event type is cached.
    ///
    /// Re-applying an event leaves the store unchanged; unknown event types
    /// are ignored.
    pub async fn apply(&self, dispatch: &DispatchEvent) -> Result<bool, GatewayError> {
        let event_type = dispatch.event_type.as_str();
        let d = &dispatch.payload;
        trace!(event_type, seq = dispatch.sequence, "Applying dispatch to cache");

        match event_type {
            "READY" => self.on_ready(d).await?,
            "GUILD_CREATE" => self.on_guild_create(d).await?,
            "GUILD_UPDATE" => self.upsert_guild(d).await?,
            "GUILD_DELETE" => self.on_guild_delete(d).await?,
            "CHANNEL_CREATE" | "CHANNEL_UPDATE" | "THREAD_CREATE" | "THREAD_UPDATE" => {
                self.upsert_channel(d, None).await?
            }
            "CHANNEL_DELETE" | "THREAD_DELETE" => {
                let id = require_id(event_type, d, "id")?;
                self.cache.remove(&CacheKey::channel(id)).await?;
            }
            "GUILD_MEMBER_ADD" | "GUILD_MEMBER_UPDATE" => {
                let guild_id = require_id(event_type, d, "guild_id")?;
                self.upsert_member(&guild_id, d).await?;
            }
            "GUILD_MEMBER_REMOVE" => {
                let guild_id = require_id(event_type, d, "guild_id")?;
                let user_id = d
                    .get("user")
                    .and_then(|user| id_of(user, "id"))
                    .ok_or_else(|| malformed(event_type, "user.id"))?;
                self.cache
                    .remove(&CacheKey::member(guild_id, user_id))
                    .await?;
            }
            "GUILD_ROLE_CREATE" | "GUILD_ROLE_UPDATE" => {
                let guild_id = require_id(event_type, d, "guild_id")?;
                let role = d.get("role").ok_or_else(|| malformed(event_type, "role"))?;
                self.upsert_role(&guild_id, role).await?;
            }
            "GUILD_ROLE_DELETE" => {
                let guild_id = require_id(event_type, d, "guild_id")?;
                let role_id = require_id(event_type, d, "role_id")?;
                self.cache.remove(&CacheKey::role(guild_id, role_id)).await?;
            }
            "USER_UPDATE" => {
                self.upsert_user(d).await?;
                self.cache.merge(&CacheKey::current_user(), d).await?;
            }
            "MESSAGE_CREATE" => self.on_message_create(d).await?,
            _ => return Ok(false),
        }

        Ok(true)
    }

    async fn on_ready(&self, d: &Value) -> Result<(), GatewayError> {
        let user = d.get("user").ok_or_else(|| malformed("READY", "user"))?;
        self.upsert_user(user).await?;
        self.cache.merge(&CacheKey::current_user(), user).await?;

        // Guilds arrive as unavailable stubs; GUILD_CREATE fills them in
        for guild in d.get("guilds").and_then(Value::as_array).into_iter().flatten() {
            skip_malformed("READY", self.upsert_guild(guild).await)?;
        }
        Ok(())
    }

    async fn on_guild_create(&self, d: &Value) -> Result<(), GatewayError> {
        let guild_id = require_id("GUILD_CREATE", d, "id")?;
        self.upsert_guild(d).await?;

        for field in ["channels", "threads"] {
            for channel in d.get(field).and_then(Value::as_array).into_iter().flatten() {
                skip_malformed(
                    "GUILD_CREATE",
                    self.upsert_channel(channel, Some(&guild_id)).await,
                )?;
            }
        }
        for member in d.get("members").and_then(Value::as_array).into_iter().flatten() {
            skip_malformed("GUILD_CREATE", self.upsert_member(&guild_id, member).await)?;
        }
        for role in d.get("roles").and_then(Value::as_array).into_iter().flatten() {
            skip_malformed("GUILD_CREATE", self.upsert_role(&guild_id, role).await)?;
        }
        Ok(())
    }

    async fn on_guild_delete(&self, d: &Value) -> Result<(), GatewayError> {
        let guild_id = require_id("GUILD_DELETE", d, "id")?;

        // An outage keeps the guild as an unavailable stub
        if d.get("unavailable").and_then(Value::as_bool) == Some(true) {
            return self.upsert_guild(d).await;
        }

        self.cache.remove(&CacheKey::guild(&guild_id)).await?;

        for key in self.cache.keys(EntityKind::Channel).await? {
            let belongs = self
                .cache
                .get_value(&key)
                .await?
                .and_then(|channel| id_of(&channel, "guild_id"))
                .is_some_and(|id| id == guild_id);
            if belongs {
                self.cache.remove(&key).await?;
            }
        }

        let prefix = format!("{guild_id}:");
        for kind in [EntityKind::Member, EntityKind::Role] {
            for key in self.cache.keys(kind).await? {
                if key.id.starts_with(&prefix) {
                    self.cache.remove(&key).await?;
                }
            }
        }

        debug!(guild_id, "Guild removed from cache");
        Ok(())
    }

    async fn on_message_create(&self, d: &Value) -> Result<(), GatewayError> {
        let Some(author) = d.get("author") else {
            return Ok(());
        };
        self.upsert_user(author).await?;

        // Guild messages carry a partial member without its user
        if let (Some(guild_id), Some(member)) = (id_of(d, "guild_id"), d.get("member")) {
            let mut member = member.clone();
            if let Value::Object(fields) = &mut member {
                fields.insert("user".to_string(), author.clone());
            }
            self.upsert_member(&guild_id, &member).await?;
        }
        Ok(())
    }

    async fn upsert_guild(&self, guild: &Value) -> Result<(), GatewayError> {
        let id = require_id("guild", guild, "id")?;
        let record = without_fields(guild, &GUILD_COLLECTIONS);
        self.cache.merge(&CacheKey::guild(id), &record).await?;
        Ok(())
    }

    async fn upsert_channel(
        &self,
        channel: &Value,
        guild_id: Option<&str>,
    ) -> Result<(), GatewayError> {
        let id = require_id("channel", channel, "id")?;
        let mut record = channel.clone();
        // Channels nested in GUILD_CREATE omit their guild_id
        if let (Some(guild_id), Value::Object(fields)) = (guild_id, &mut record) {
            fields
                .entry("guild_id")
                .or_insert_with(|| Value::String(guild_id.to_string()));
        }
        self.cache.merge(&CacheKey::channel(id), &record).await?;
        Ok(())
    }

    async fn upsert_member(&self, guild_id: &str, member: &Value) -> Result<(), GatewayError> {
        let user = member.get("user").ok_or_else(|| malformed("member", "user"))?;
        let user_id = require_id("member", user, "id")?;
        self.upsert_user(user).await?;

        let mut record = member.clone();
        if let Value::Object(fields) = &mut record {
            fields.insert("guild_id".to_string(), Value::String(guild_id.to_string()));
        }
        self.cache
            .merge(&CacheKey::member(guild_id, user_id), &record)
            .await?;
        Ok(())
    }

    async fn upsert_role(&self, guild_id: &str, role: &Value) -> Result<(), GatewayError> {
        let role_id = require_id("role", role, "id")?;
        let mut record = role.clone();
        if let Value::Object(fields) = &mut record {
            fields.insert("guild_id".to_string(), Value::String(guild_id.to_string()));
        }
        self.cache
            .merge(&CacheKey::role(guild_id, role_id), &record)
            .await?;
        Ok(())
    }

    async fn upsert_user(&self, user: &Value) -> Result<(), GatewayError> {
        let id = require_id("user", user, "id")?;
        self.cache.merge(&CacheKey::user(id), user).await?;
        Ok(())
    }
}

/// Snowflakes arrive as strings; accept numbers too
fn id_of(value: &Value, field: &str) -> Option<String> {
    match value.get(field)? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

fn require_id(context: &str, value: &Value, field: &str) -> Result<String, GatewayError> {
    id_of(value, field).ok_or_else(|| malformed(context, field))
}

fn malformed(context: &str, field: &str) -> GatewayError {
    GatewayError::ProtocolViolation {
        reason: format!("{context} payload missing '{field}'"),
    }
}

/// Drop one malformed nested entity so the rest of the event still applies.
/// Store failures are passed on.
fn skip_malformed(event_type: &str, result: Result<(), GatewayError>) -> Result<(), GatewayError> {
    match result {
        Err(GatewayError::ProtocolViolation { reason }) => {
            warn!(event_type, %reason, "Skipping malformed nested entity");
            Ok(())
        }
        other => other,
    }
}

fn without_fields(value: &Value, fields: &[&str]) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(field, _)| !fields.contains(&field.as_str()))
                .map(|(field, value)| (field.clone(), value.clone()))
                .collect::<Map<String, Value>>(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stage() -> CacheStage {
        CacheStage::new(CacheClient::in_memory(), GatewayMetrics::detached())
    }

    fn dispatch(event_type: &str, payload: Value) -> DispatchEvent {
        DispatchEvent::new(event_type, 1, payload)
    }

    #[tokio::test]
    async fn guild_create_splits_collections() {
        let stage = stage();
        let applied = stage
            .apply(&dispatch(
                "GUILD_CREATE",
                json!({
                    "id": "10",
                    "name": "guild",
                    "channels": [{"id": "20", "name": "general", "type": 0}],
                    "members": [{"user": {"id": "30", "username": "alice"}, "roles": []}],
                    "roles": [{"id": "40", "name": "mod"}]
                }),
            ))
            .await
            .unwrap();
        assert!(applied);

        let cache = stage.cache();
        let guild = cache.get_value(&CacheKey::guild(10)).await.unwrap().unwrap();
        assert_eq!(guild, json!({"id": "10", "name": "guild"}));

        let channel = cache.get_value(&CacheKey::channel(20)).await.unwrap().unwrap();
        assert_eq!(channel["guild_id"], "10");
        assert!(cache.get_value(&CacheKey::user(30)).await.unwrap().is_some());
        assert!(cache.get_value(&CacheKey::member(10, 30)).await.unwrap().is_some());
        assert_eq!(
            cache.get_value(&CacheKey::role(10, 40)).await.unwrap().unwrap()["name"],
            "mod"
        );
    }

    #[tokio::test]
    async fn malformed_nested_entities_are_skipped_individually() {
        let stage = stage();
        let applied = stage
            .apply(&dispatch(
                "GUILD_CREATE",
                json!({
                    "id": "10",
                    "name": "guild",
                    "channels": [
                        {"name": "no-id", "type": 0},
                        {"id": "21", "name": "general", "type": 0}
                    ],
                    "members": [
                        {"roles": []},
                        {"user": {"id": "31", "username": "bob"}, "roles": []}
                    ],
                    "roles": [{"name": "no-id"}, {"id": "41", "name": "mod"}]
                }),
            ))
            .await
            .unwrap();
        assert!(applied);

        let cache = stage.cache();
        assert!(cache.get_value(&CacheKey::guild(10)).await.unwrap().is_some());
        assert!(cache.get_value(&CacheKey::channel(21)).await.unwrap().is_some());
        assert!(cache.get_value(&CacheKey::member(10, 31)).await.unwrap().is_some());
        assert!(cache.get_value(&CacheKey::role(10, 41)).await.unwrap().is_some());
        assert_eq!(cache.keys(EntityKind::Channel).await.unwrap().len(), 1);
        assert_eq!(cache.keys(EntityKind::Role).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unavailable_guild_delete_keeps_stub() {
        let stage = stage();
        stage
            .apply(&dispatch("GUILD_CREATE", json!({"id": "10", "name": "guild"})))
            .await
            .unwrap();
        stage
            .apply(&dispatch("GUILD_DELETE", json!({"id": "10", "unavailable": true})))
            .await
            .unwrap();

        let guild = stage.cache().get_value(&CacheKey::guild(10)).await.unwrap().unwrap();
        assert_eq!(guild, json!({"id": "10", "name": "guild", "unavailable": true}));
    }

    #[tokio::test]
    async fn guild_delete_cascades() {
        let stage = stage();
        stage
            .apply(&dispatch(
                "GUILD_CREATE",
                json!({
                    "id": "10",
                    "channels": [{"id": "20"}],
                    "roles": [{"id": "40"}]
                }),
            ))
            .await
            .unwrap();
        stage
            .apply(&dispatch("CHANNEL_CREATE", json!({"id": "21", "guild_id": "11"})))
            .await
            .unwrap();
        stage
            .apply(&dispatch("GUILD_DELETE", json!({"id": "10"})))
            .await
            .unwrap();

        let cache = stage.cache();
        assert!(cache.get_value(&CacheKey::guild(10)).await.unwrap().is_none());
        assert!(cache.get_value(&CacheKey::channel(20)).await.unwrap().is_none());
        assert!(cache.get_value(&CacheKey::role(10, 40)).await.unwrap().is_none());
        assert!(cache.get_value(&CacheKey::channel(21)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn message_create_caches_author_and_member() {
        let stage = stage();
        stage
            .apply(&dispatch(
                "MESSAGE_CREATE",
                json!({
                    "id": "1",
                    "channel_id": "20",
                    "guild_id": "10",
                    "content": "ping",
                    "author": {"id": "30", "username": "alice"},
                    "member": {"nick": "al"}
                }),
            ))
            .await
            .unwrap();

        let cache = stage.cache();
        assert_eq!(
            cache.get_value(&CacheKey::user(30)).await.unwrap().unwrap()["username"],
            "alice"
        );
        let member = cache.get_value(&CacheKey::member(10, 30)).await.unwrap().unwrap();
        assert_eq!(member["nick"], "al");
        assert_eq!(member["user"]["id"], "30");
    }

    #[tokio::test]
    async fn unknown_events_pass_through() {
        let stage = stage();
        let applied = stage
            .apply(&dispatch("SOMETHING_NEW", json!({"shape": ["anything"]})))
            .await
            .unwrap();
        assert!(!applied);
    }

    #[tokio::test]
    async fn missing_id_is_rejected() {
        let stage = stage();
        let err = stage
            .apply(&dispatch("CHANNEL_UPDATE", json!({"name": "nameless"})))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ProtocolViolation { .. }));
    }

    #[test]
    fn numeric_ids_are_accepted() {
        assert_eq!(id_of(&json!({"id": 42}), "id"), Some("42".to_string()));
        assert_eq!(id_of(&json!({"id": ""}), "id"), None);
    }
}
