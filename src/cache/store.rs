//! Cache store backends
//!
//! The store holds serialized bytes and knows nothing about entity shapes.
//! Entries never expire unless written with a TTL (rate-limit buckets).

use super::key::{CacheKey, EntityKind};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("failed to (de)serialize cache entry {key}")]
    Serialization {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Atomic read-modify-write step. Returning `None` removes the entry.
pub type UpdateFn<'a> =
    Box<dyn FnOnce(Option<&[u8]>) -> Result<Option<Vec<u8>>, CacheError> + Send + 'a>;

/// Key/value store shared by the cache bridge and the REST client
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError>;

    /// Insert or overwrite; `ttl = None` keeps the entry until removed
    async fn put(
        &self,
        key: &CacheKey,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError>;

    /// Returns whether an entry was present
    async fn remove(&self, key: &CacheKey) -> Result<bool, CacheError>;

    /// Read-modify-write under the key's lock. A written entry keeps its
    /// previous expiry unless `ttl` is given.
    async fn update(
        &self,
        key: &CacheKey,
        ttl: Option<Duration>,
        apply: UpdateFn<'_>,
    ) -> Result<(), CacheError>;

    /// Remaining lifetime of an entry; `None` if absent or unbounded
    async fn ttl(&self, key: &CacheKey) -> Result<Option<Duration>, CacheError>;

    async fn keys(&self, kind: EntityKind) -> Result<Vec<CacheKey>, CacheError>;

    async fn entry_count(&self) -> Result<usize, CacheError>;
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn new(value: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Process-local store over a sharded map
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: DashMap<CacheKey, StoredEntry>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before - self.entries.len()
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        let now = Instant::now();
        match self.entries.get(key) {
            None => return Ok(None),
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => {}
        }
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        Ok(None)
    }

    async fn put(
        &self,
        key: &CacheKey,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        self.entries.insert(key.clone(), StoredEntry::new(value, ttl));
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired(now)))
    }

    async fn update(
        &self,
        key: &CacheKey,
        ttl: Option<Duration>,
        apply: UpdateFn<'_>,
    ) -> Result<(), CacheError> {
        let now = Instant::now();

        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let current = (!occupied.get().is_expired(now))
                    .then(|| occupied.get().value.as_slice());
                match apply(current)? {
                    Some(value) => {
                        let entry = occupied.get_mut();
                        if entry.is_expired(now) {
                            *entry = StoredEntry::new(value, ttl);
                        } else {
                            entry.value = value;
                            if let Some(ttl) = ttl {
                                entry.expires_at = Some(now + ttl);
                            }
                        }
                    }
                    None => {
                        occupied.remove();
                    }
                }
            }
            Entry::Vacant(vacant) => {
                if let Some(value) = apply(None)? {
                    vacant.insert(StoredEntry::new(value, ttl));
                }
            }
        }
        Ok(())
    }

    async fn ttl(&self, key: &CacheKey) -> Result<Option<Duration>, CacheError> {
        let now = Instant::now();
        Ok(self.entries.get(key).and_then(|entry| {
            entry
                .expires_at
                .filter(|at| *at > now)
                .map(|at| at - now)
        }))
    }

    async fn keys(&self, kind: EntityKind) -> Result<Vec<CacheKey>, CacheError> {
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().kind == kind && !entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn entry_count(&self) -> Result<usize, CacheError> {
        self.purge_expired();
        Ok(self.entries.len())
    }
}
