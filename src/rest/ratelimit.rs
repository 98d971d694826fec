//! REST rate limiting
//!
//! Bucket state lives in the cache under `ratelimit:<route key>` with a TTL
//! equal to the time left until the bucket resets, so an expired entry means
//! a fresh bucket. Each route key has its own lock in an arena; a request
//! holds its route's lock from the pre-send check until the response
//! headers are recorded. Independent routes never contend.

use super::http::HttpResponse;
use crate::cache::{CacheClient, CacheKey};
use crate::error::GatewayError;
use crate::metrics::GatewayMetrics;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

/// Cache id of the bucket that blocks every route
pub const GLOBAL_BUCKET: &str = "global";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitBucket {
    pub route_key: String,
    pub remaining: u32,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub is_global: bool,
    /// Derived from the cache entry's TTL on read
    #[serde(skip)]
    pub reset_at: Option<Instant>,
}

impl RateLimitBucket {
    /// Time to wait before this bucket admits a request
    pub fn wait_time(&self, now: Instant) -> Option<Duration> {
        match self.reset_at {
            Some(reset_at) if self.remaining == 0 && reset_at > now => Some(reset_at - now),
            _ => None,
        }
    }
}

/// Rate-limit metadata from a response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitHeaders {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_after: Option<Duration>,
    pub is_global: bool,
}

impl RateLimitHeaders {
    pub fn from_response(response: &HttpResponse) -> Self {
        Self {
            limit: response
                .header("x-ratelimit-limit")
                .and_then(|v| v.parse().ok()),
            remaining: response
                .header("x-ratelimit-remaining")
                .and_then(|v| v.parse().ok()),
            reset_after: response
                .header("x-ratelimit-reset-after")
                .and_then(parse_seconds),
            is_global: response
                .header("x-ratelimit-global")
                .is_some_and(|v| v.eq_ignore_ascii_case("true")),
        }
    }
}

/// Seconds with optional fraction, as sent in rate-limit headers and bodies
pub(crate) fn parse_seconds(value: &str) -> Option<Duration> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Held while a request is in flight on its route
pub struct RateLimitPermit {
    route_key: String,
    _guard: OwnedMutexGuard<()>,
}

pub struct RateLimiter {
    cache: CacheClient,
    locks: DashMap<String, Arc<Mutex<()>>>,
    metrics: GatewayMetrics,
}

impl RateLimiter {
    pub fn new(cache: CacheClient, metrics: GatewayMetrics) -> Self {
        Self {
            cache,
            locks: DashMap::new(),
            metrics,
        }
    }

    fn lock_for(&self, route_key: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.get(route_key) {
            return Arc::clone(&lock);
        }
        Arc::clone(&self.locks.entry(route_key.to_string()).or_default())
    }

    /// Current bucket state, `None` when the route is unconstrained
    pub async fn bucket(&self, route_key: &str) -> Result<Option<RateLimitBucket>, GatewayError> {
        let key = CacheKey::ratelimit(route_key);
        let Some(mut bucket) = self.cache.get::<RateLimitBucket>(&key).await? else {
            return Ok(None);
        };
        bucket.reset_at = self.cache.ttl(&key).await?.map(|ttl| Instant::now() + ttl);
        Ok(Some(bucket))
    }

    /// Wait until `route_key` may send, then reserve one request.
    ///
    /// Suspends until the global bucket and the route bucket have reset
    /// when they are exhausted. Dropping the future abandons the wait.
    pub async fn acquire(&self, route_key: &str) -> Result<RateLimitPermit, GatewayError> {
        let guard = self.lock_for(route_key).lock_owned().await;

        loop {
            let now = Instant::now();
            let global = self.bucket(GLOBAL_BUCKET).await?;
            let route = self.bucket(route_key).await?;

            let wait = [&global, &route]
                .into_iter()
                .flatten()
                .filter_map(|bucket| bucket.wait_time(now))
                .max();

            if let Some(wait) = wait {
                debug!(route = route_key, wait_ms = wait.as_millis() as u64, "Waiting for rate limit reset");
                self.metrics.record_ratelimit_wait(route_key, wait);
                sleep_until(now + wait).await;
                continue;
            }

            if let Some(bucket) = route.filter(|b| b.remaining > 0) {
                self.store(RateLimitBucket {
                    remaining: bucket.remaining - 1,
                    ..bucket
                })
                .await?;
            }

            return Ok(RateLimitPermit {
                route_key: route_key.to_string(),
                _guard: guard,
            });
        }
    }

    /// Record the bucket state a response reported
    pub async fn update(
        &self,
        permit: &RateLimitPermit,
        headers: &RateLimitHeaders,
    ) -> Result<(), GatewayError> {
        let (Some(remaining), Some(reset_after)) = (headers.remaining, headers.reset_after) else {
            return Ok(());
        };

        self.store(RateLimitBucket {
            route_key: permit.route_key.clone(),
            remaining,
            limit: headers.limit,
            is_global: false,
            reset_at: Some(Instant::now() + reset_after),
        })
        .await
    }

    /// Close a bucket after the server rejected a request with 429
    pub async fn block(
        &self,
        route_key: &str,
        retry_after: Duration,
        global: bool,
    ) -> Result<(), GatewayError> {
        let route_key = if global { GLOBAL_BUCKET } else { route_key };
        warn!(
            route = route_key,
            retry_after_ms = retry_after.as_millis() as u64,
            global,
            "Server rate limit hit"
        );

        self.store(RateLimitBucket {
            route_key: route_key.to_string(),
            remaining: 0,
            limit: None,
            is_global: global,
            reset_at: Some(Instant::now() + retry_after),
        })
        .await
    }

    async fn store(&self, bucket: RateLimitBucket) -> Result<(), GatewayError> {
        let now = Instant::now();
        let ttl = bucket
            .reset_at
            .map(|reset_at| reset_at.saturating_duration_since(now))
            .filter(|ttl| !ttl.is_zero());

        let key = CacheKey::ratelimit(&bucket.route_key);
        match ttl {
            Some(ttl) => self.cache.put(&key, &bucket, Some(ttl)).await?,
            // Already reset: nothing to remember
            None => {
                self.cache.remove(&key).await?;
            }
        }
        Ok(())
    }
}
