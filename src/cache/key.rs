//! Cache keys

use std::fmt;

/// Entity family a cache entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    User,
    /// The bot's own user, as reported by Ready
    CurrentUser,
    Guild,
    Channel,
    /// Keyed by `guild_id:user_id`
    Member,
    /// Keyed by `guild_id:role_id`
    Role,
    /// Keyed by REST route key
    RateLimit,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::CurrentUser => "current_user",
            EntityKind::Guild => "guild",
            EntityKind::Channel => "channel",
            EntityKind::Member => "member",
            EntityKind::Role => "role",
            EntityKind::RateLimit => "ratelimit",
        }
    }
}

/// Unique key in the cache store, rendered as `kind:id`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kind: EntityKind,
    pub id: String,
}

impl CacheKey {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn user(id: impl fmt::Display) -> Self {
        Self::new(EntityKind::User, id.to_string())
    }

    pub fn current_user() -> Self {
        Self::new(EntityKind::CurrentUser, "@me")
    }

    pub fn guild(id: impl fmt::Display) -> Self {
        Self::new(EntityKind::Guild, id.to_string())
    }

    pub fn channel(id: impl fmt::Display) -> Self {
        Self::new(EntityKind::Channel, id.to_string())
    }

    pub fn member(guild_id: impl fmt::Display, user_id: impl fmt::Display) -> Self {
        Self::new(EntityKind::Member, format!("{guild_id}:{user_id}"))
    }

    pub fn role(guild_id: impl fmt::Display, role_id: impl fmt::Display) -> Self {
        Self::new(EntityKind::Role, format!("{guild_id}:{role_id}"))
    }

    pub fn ratelimit(route_key: &str) -> Self {
        Self::new(EntityKind::RateLimit, route_key)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_kind_and_id() {
        assert_eq!(CacheKey::channel(42).to_string(), "channel:42");
        assert_eq!(CacheKey::member(1, 2).to_string(), "member:1:2");
        assert_eq!(
            CacheKey::ratelimit("POST /channels/{id}/messages").to_string(),
            "ratelimit:POST /channels/{id}/messages"
        );
    }

    #[test]
    fn kinds_do_not_collide() {
        assert_ne!(CacheKey::user(1), CacheKey::guild(1));
        assert_eq!(CacheKey::user(1), CacheKey::user("1"));
    }
}
