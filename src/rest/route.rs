//! Route classification
//!
//! Requests sharing a route key share a rate-limit bucket. Numeric path
//! segments collapse to `{id}` and reaction emoji to `{emoji}`, so
//! `POST /channels/1/messages` and `POST /channels/2/messages` are one route.

use reqwest::Method;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub method: Method,
    /// Concrete path relative to the API base, starting with `/`
    pub path: String,
}

impl Route {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Bucket key, e.g. `POST /channels/{id}/messages`
    pub fn key(&self) -> String {
        route_key(&self.method, &self.path)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}

pub fn route_key(method: &Method, path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or_default();

    let mut template = String::with_capacity(path.len());
    let mut previous = "";
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        template.push('/');
        if previous == "reactions" {
            template.push_str("{emoji}");
        } else if segment.bytes().all(|b| b.is_ascii_digit()) {
            template.push_str("{id}");
        } else {
            template.push_str(segment);
        }
        previous = segment;
    }
    if template.is_empty() {
        template.push('/');
    }

    format!("{method} {template}")
}
