//! REST client module
//!
//! Rate-limited access to the service's HTTP API, sharing the entity cache
//! with the gateway side.

mod client;
mod http;
mod ratelimit;
mod route;

pub use client::{RestClient, RestConfig, DEFAULT_API_BASE_URL};
pub use http::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
pub use ratelimit::{
    RateLimitBucket, RateLimitHeaders, RateLimitPermit, RateLimiter, GLOBAL_BUCKET,
};
pub use route::{route_key, Route};
