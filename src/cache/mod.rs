//! Entity cache
//!
//! [`CacheStore`] holds bytes; [`CacheClient`] layers JSON (de)serialization
//! and shallow merges on top; [`CacheStage`] keeps the store current from
//! the gateway's dispatch stream.

mod key;
mod stage;
mod store;

pub use key::{CacheKey, EntityKind};
pub use stage::CacheStage;
pub use store::{CacheError, CacheStore, InMemoryCache, UpdateFn};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Typed view over a [`CacheStore`]
#[derive(Clone)]
pub struct CacheClient {
    store: Arc<dyn CacheStore>,
}

impl CacheClient {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryCache::new()))
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<T>, CacheError> {
        match self.store.get(key).await? {
            Some(bytes) => decode(key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    pub async fn get_value(&self, key: &CacheKey) -> Result<Option<Value>, CacheError> {
        self.get(key).await
    }

    pub async fn put<T: Serialize + ?Sized + Sync>(
        &self,
        key: &CacheKey,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let bytes = encode(key, value)?;
        self.store.put(key, bytes, ttl).await
    }

    /// Shallow-merge `patch` into the stored object (insert if absent).
    ///
    /// Top-level fields in `patch` overwrite; fields it omits survive. A
    /// non-object on either side is replaced wholesale.
    pub async fn merge(&self, key: &CacheKey, patch: &Value) -> Result<(), CacheError> {
        let label = key.to_string();
        self.store
            .update(
                key,
                None,
                Box::new(move |current| {
                    let merged = match current {
                        Some(bytes) => {
                            let base: Value = serde_json::from_slice(bytes).map_err(|source| {
                                CacheError::Serialization {
                                    key: label.clone(),
                                    source,
                                }
                            })?;
                            shallow_merge(base, patch)
                        }
                        None => patch.clone(),
                    };
                    serde_json::to_vec(&merged)
                        .map(Some)
                        .map_err(|source| CacheError::Serialization { key: label, source })
                }),
            )
            .await
    }

    pub async fn remove(&self, key: &CacheKey) -> Result<bool, CacheError> {
        self.store.remove(key).await
    }

    pub async fn ttl(&self, key: &CacheKey) -> Result<Option<Duration>, CacheError> {
        self.store.ttl(key).await
    }

    pub async fn keys(&self, kind: EntityKind) -> Result<Vec<CacheKey>, CacheError> {
        self.store.keys(kind).await
    }
}

impl std::fmt::Debug for CacheClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheClient").finish_non_exhaustive()
    }
}

fn encode<T: Serialize + ?Sized>(key: &CacheKey, value: &T) -> Result<Vec<u8>, CacheError> {
    serde_json::to_vec(value).map_err(|source| CacheError::Serialization {
        key: key.to_string(),
        source,
    })
}

fn decode<T: DeserializeOwned>(key: &CacheKey, bytes: &[u8]) -> Result<T, CacheError> {
    serde_json::from_slice(bytes).map_err(|source| CacheError::Serialization {
        key: key.to_string(),
        source,
    })
}

fn shallow_merge(base: Value, patch: &Value) -> Value {
    match (base, patch) {
        (Value::Object(mut base), Value::Object(patch)) => {
            for (field, value) in patch {
                base.insert(field.clone(), value.clone());
            }
            Value::Object(base)
        }
        (_, patch) => patch.clone(),
    }
}
