//! REST client
//!
//! Every call is classified into a route key, admitted by the rate limiter,
//! sent, and classified again by status:
//!
//! - 2xx returns the body
//! - 429 closes the bucket and retries once; a second 429 is `RateLimited`
//! - 5xx, transport errors and timeouts retry with backoff up to a ceiling
//! - any other status, 401 included, is `RequestRejected` right away
//!
//! Getters consult the cache before the network and fill it on a miss.

use super::http::{HttpRequest, HttpResponse, HttpTransport};
use super::ratelimit::{parse_seconds, RateLimitHeaders, RateLimiter};
use super::route::Route;
use crate::cache::{CacheClient, CacheKey};
use crate::config::Token;
use crate::error::GatewayError;
use crate::metrics::GatewayMetrics;
use crate::models::{
    Channel, CreateMessage, EditMessage, GatewayBot, Guild, Id, Member, Message, User,
};
use crate::shard::Backoff;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};
use uuid::Uuid;

pub const DEFAULT_API_BASE_URL: &str = "https://discord.com/api/v10";

/// Body of a 429 response
#[derive(Debug, Deserialize)]
struct RateLimitedBody {
    #[serde(default)]
    retry_after: Option<f64>,
    #[serde(default)]
    global: bool,
}

/// Body of any other error response
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

struct RestInner {
    token: Token,
    base_url: String,
    http: Arc<dyn HttpTransport>,
    limiter: RateLimiter,
    cache: CacheClient,
    backoff: Backoff,
    timeout: Duration,
    metrics: GatewayMetrics,
}

/// Cheap to clone; clones share the rate limiter and cache
#[derive(Clone)]
pub struct RestClient {
    inner: Arc<RestInner>,
}

/// Construction options for [`RestClient`]
#[derive(Debug, Clone)]
pub struct RestConfig {
    pub base_url: String,
    /// Deadline per attempt
    pub timeout: Duration,
    /// Retry policy for transient failures
    pub backoff: Backoff,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            timeout: Duration::from_secs(15),
            backoff: Backoff::new(Duration::from_millis(500), Duration::from_secs(8), 3),
        }
    }
}

impl RestClient {
    pub fn new(
        token: Token,
        cache: CacheClient,
        http: Arc<dyn HttpTransport>,
        config: RestConfig,
        metrics: GatewayMetrics,
    ) -> Self {
        Self {
            inner: Arc::new(RestInner {
                token,
                base_url: config.base_url.trim_end_matches('/').to_string(),
                http,
                limiter: RateLimiter::new(cache.clone(), metrics.clone()),
                cache,
                backoff: config.backoff,
                timeout: config.timeout,
                metrics,
            }),
        }
    }

    pub fn cache(&self) -> &CacheClient {
        &self.inner.cache
    }

    /// Issue a request and decode a JSON response
    pub async fn request<T, B>(&self, route: Route, body: Option<&B>) -> Result<T, GatewayError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let context = route.key();
        let body = body
            .map(serde_json::to_vec)
            .transpose()
            .map_err(|e| GatewayError::serialization(context.clone(), e))?;
        let response = self.execute(&route, body).await?;
        serde_json::from_slice(&response.body).map_err(|e| GatewayError::serialization(context, e))
    }

    /// Issue a request whose response has no body
    pub async fn request_empty<B>(&self, route: Route, body: Option<&B>) -> Result<(), GatewayError>
    where
        B: Serialize + ?Sized,
    {
        let body = body
            .map(serde_json::to_vec)
            .transpose()
            .map_err(|e| GatewayError::serialization(route.key(), e))?;
        self.execute(&route, body).await.map(|_| ())
    }

    async fn execute(
        &self,
        route: &Route,
        body: Option<Vec<u8>>,
    ) -> Result<HttpResponse, GatewayError> {
        let inner = &self.inner;
        let route_key = route.key();
        let request_id = Uuid::new_v4();
        let mut transient_failures = 0u32;
        let mut rate_limited = false;

        loop {
            let permit = inner.limiter.acquire(&route_key).await?;

            let request = self.build_request(route, body.clone(), request_id);
            debug!(%request_id, route = %route_key, "REST request");

            let response = match timeout(inner.timeout, inner.http.send(request)).await {
                Ok(Ok(response)) => response,
                Ok(Err(source)) => {
                    drop(permit);
                    transient_failures += 1;
                    if !inner.backoff.allows(transient_failures) {
                        return Err(GatewayError::Connection {
                            attempts: transient_failures,
                            source,
                        });
                    }
                    self.retry_delay(&route_key, transient_failures, &source.to_string())
                        .await;
                    continue;
                }
                Err(_) => {
                    drop(permit);
                    transient_failures += 1;
                    if !inner.backoff.allows(transient_failures) {
                        return Err(GatewayError::Timeout {
                            operation: "rest request",
                            after: inner.timeout,
                        });
                    }
                    self.retry_delay(&route_key, transient_failures, "timed out")
                        .await;
                    continue;
                }
            };

            inner
                .limiter
                .update(&permit, &RateLimitHeaders::from_response(&response))
                .await?;
            drop(permit);
            inner.metrics.record_rest_request(&route_key, response.status);

            match response.status {
                200..=299 => return Ok(response),
                429 => {
                    let (retry_after, global) = retry_after(&response);
                    inner.limiter.block(&route_key, retry_after, global).await?;
                    if rate_limited {
                        return Err(GatewayError::RateLimited {
                            route: route_key,
                            retry_after,
                        });
                    }
                    rate_limited = true;
                }
                status @ 500..=599 => {
                    transient_failures += 1;
                    if !inner.backoff.allows(transient_failures) {
                        return Err(rejected(route_key, &response));
                    }
                    self.retry_delay(&route_key, transient_failures, &format!("status {status}"))
                        .await;
                }
                _ => return Err(rejected(route_key, &response)),
            }
        }
    }

    fn build_request(&self, route: &Route, body: Option<Vec<u8>>, request_id: Uuid) -> HttpRequest {
        let mut headers = vec![
            (
                "Authorization".to_string(),
                format!("Bot {}", self.inner.token.expose()),
            ),
            ("X-Request-Id".to_string(), request_id.to_string()),
        ];
        if body.is_some() {
            headers.push(("Content-Type".to_string(), "application/json".to_string()));
        }

        HttpRequest {
            method: route.method.clone(),
            url: format!("{}{}", self.inner.base_url, route.path),
            headers,
            body,
        }
    }

    async fn retry_delay(&self, route_key: &str, attempt: u32, reason: &str) {
        let delay = self.inner.backoff.delay(attempt - 1);
        warn!(
            route = route_key,
            attempt,
            delay_ms = delay.as_millis() as u64,
            reason,
            "Transient REST failure, retrying"
        );
        sleep(delay).await;
    }

    /// Cache-first lookup; fills the cache from the network on a miss
    async fn cached<T: DeserializeOwned>(
        &self,
        key: CacheKey,
        route: Route,
    ) -> Result<T, GatewayError> {
        let cache = &self.inner.cache;
        match cache.get::<T>(&key).await {
            Ok(Some(hit)) => return Ok(hit),
            Ok(None) => {}
            Err(e) => debug!(key = %key, error = %e, "Cached entry unusable, refetching"),
        }

        let value: Value = self.request(route, None::<&()>).await?;
        self.fill(&key, &value).await;
        serde_json::from_value(value).map_err(|e| GatewayError::serialization(key.to_string(), e))
    }

    async fn fill(&self, key: &CacheKey, value: &Value) {
        if let Err(e) = self.inner.cache.merge(key, value).await {
            warn!(key = %key, error = %e, "Failed to cache REST response");
        }
    }

    // Service actions

    /// Gateway URL, recommended shard count and identify concurrency
    pub async fn get_gateway_bot(&self) -> Result<GatewayBot, GatewayError> {
        self.request(Route::get("/gateway/bot"), None::<&()>).await
    }

    pub async fn get_current_user(&self) -> Result<User, GatewayError> {
        let user: User = self
            .cached(CacheKey::current_user(), Route::get("/users/@me"))
            .await?;
        Ok(user)
    }

    pub async fn get_user(&self, user_id: Id) -> Result<User, GatewayError> {
        self.cached(CacheKey::user(user_id), Route::get(format!("/users/{user_id}")))
            .await
    }

    pub async fn get_channel(&self, channel_id: Id) -> Result<Channel, GatewayError> {
        self.cached(
            CacheKey::channel(channel_id),
            Route::get(format!("/channels/{channel_id}")),
        )
        .await
    }

    pub async fn get_guild(&self, guild_id: Id) -> Result<Guild, GatewayError> {
        self.cached(
            CacheKey::guild(guild_id),
            Route::get(format!("/guilds/{guild_id}")),
        )
        .await
    }

    pub async fn get_guild_member(&self, guild_id: Id, user_id: Id) -> Result<Member, GatewayError> {
        let key = CacheKey::member(guild_id, user_id);
        if let Ok(Some(member)) = self.inner.cache.get::<Member>(&key).await {
            return Ok(member);
        }

        let mut value: Value = self
            .request(
                Route::get(format!("/guilds/{guild_id}/members/{user_id}")),
                None::<&()>,
            )
            .await?;
        if let Value::Object(fields) = &mut value {
            fields.insert("guild_id".to_string(), Value::String(guild_id.to_string()));
        }
        self.fill(&key, &value).await;
        serde_json::from_value(value).map_err(|e| GatewayError::serialization(key.to_string(), e))
    }

    pub async fn send_message(
        &self,
        channel_id: Id,
        message: &CreateMessage,
    ) -> Result<Message, GatewayError> {
        self.request(
            Route::post(format!("/channels/{channel_id}/messages")),
            Some(message),
        )
        .await
    }

    pub async fn edit_message(
        &self,
        channel_id: Id,
        message_id: Id,
        edit: &EditMessage,
    ) -> Result<Message, GatewayError> {
        self.request(
            Route::patch(format!("/channels/{channel_id}/messages/{message_id}")),
            Some(edit),
        )
        .await
    }

    pub async fn delete_message(&self, channel_id: Id, message_id: Id) -> Result<(), GatewayError> {
        self.request_empty(
            Route::delete(format!("/channels/{channel_id}/messages/{message_id}")),
            None::<&()>,
        )
        .await
    }

    pub async fn trigger_typing(&self, channel_id: Id) -> Result<(), GatewayError> {
        self.request_empty(
            Route::post(format!("/channels/{channel_id}/typing")),
            None::<&()>,
        )
        .await
    }
}

/// Retry delay and scope of a 429
fn retry_after(response: &HttpResponse) -> (Duration, bool) {
    let body: Option<RateLimitedBody> = serde_json::from_slice(&response.body).ok();
    let headers = RateLimitHeaders::from_response(response);

    let retry_after = body
        .as_ref()
        .and_then(|b| b.retry_after)
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
        .or_else(|| response.header("retry-after").and_then(parse_seconds))
        .or(headers.reset_after)
        .unwrap_or(Duration::from_secs(1));
    let global = body.is_some_and(|b| b.global) || headers.is_global;

    (retry_after, global)
}

fn rejected(route_key: String, response: &HttpResponse) -> GatewayError {
    let message = serde_json::from_slice::<ErrorBody>(&response.body)
        .ok()
        .and_then(|b| b.message)
        .unwrap_or_else(|| String::from_utf8_lossy(&response.body).into_owned());

    GatewayError::RequestRejected {
        route: route_key,
        status_code: response.status,
        message,
    }
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.inner.base_url)
            .field("token", &self.inner.token)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn retry_after_prefers_body() {
        let response = HttpResponse::new(429)
            .with_header("Retry-After", "9")
            .with_json(&json!({"retry_after": 1.5, "global": true}));
        assert_eq!(retry_after(&response), (Duration::from_millis(1500), true));
    }

    #[test]
    fn retry_after_falls_back_to_header() {
        let response = HttpResponse::new(429).with_header("Retry-After", "3");
        assert_eq!(retry_after(&response), (Duration::from_secs(3), false));
    }

    #[test]
    fn rejection_carries_service_message() {
        let response = HttpResponse::new(403)
            .with_json(&json!({"message": "Missing Access", "code": 50001}));
        let err = rejected("GET /channels/{id}".into(), &response);
        assert!(matches!(
            err,
            GatewayError::RequestRejected { status_code: 403, ref message, .. } if message == "Missing Access"
        ));
    }

    #[test]
    fn debug_hides_token() {
        let client = RestClient::new(
            Token::new("secret"),
            CacheClient::in_memory(),
            Arc::new(crate::rest::ReqwestTransport::new(Duration::from_secs(1)).unwrap()),
            RestConfig::default(),
            GatewayMetrics::detached(),
        );
        assert!(!format!("{client:?}").contains("secret"));
    }
}
