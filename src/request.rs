//! Immutable view of an incoming request.
//!
//! [`RequestFacts`] snapshots the pieces of a request the engine branches on:
//! method class, cache directives, private-header presence, and the
//! conditional headers used for 304 downgrades.

use std::time::SystemTime;

use axum::http::{HeaderMap, Method, Uri, header, request::Parts};

use crate::cache_control::CacheControl;

/// Snapshot of an incoming request.
#[derive(Debug, Clone)]
pub struct RequestFacts {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    cache_control: CacheControl,
}

impl RequestFacts {
    pub fn from_parts(parts: &Parts) -> Self {
        Self {
            method: parts.method.clone(),
            uri: parts.uri.clone(),
            headers: parts.headers.clone(),
            cache_control: CacheControl::from_headers(&parts.headers),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn cache_control(&self) -> &CacheControl {
        &self.cache_control
    }

    /// Safe methods the cache may answer: GET and HEAD.
    pub fn is_cacheable_method(&self) -> bool {
        self.method == Method::GET || self.method == Method::HEAD
    }

    /// The PURGE extension method.
    pub fn is_purge(&self) -> bool {
        self.method.as_str().eq_ignore_ascii_case("PURGE")
    }

    pub fn no_cache(&self) -> bool {
        self.cache_control.no_cache
    }

    pub fn max_age(&self) -> Option<u64> {
        self.cache_control.max_age
    }

    pub fn max_stale(&self) -> Option<u64> {
        self.cache_control.max_stale
    }

    pub fn min_fresh(&self) -> Option<u64> {
        self.cache_control.min_fresh
    }

    pub fn only_if_cached(&self) -> bool {
        self.cache_control.only_if_cached
    }

    /// True when any of the configured private headers is present.
    pub fn is_private(&self, private_headers: &[String]) -> bool {
        private_headers
            .iter()
            .any(|name| self.headers.contains_key(name.as_str()))
    }

    pub fn if_none_match(&self) -> Option<&str> {
        self.headers
            .get(header::IF_NONE_MATCH)
            .and_then(|value| value.to_str().ok())
    }

    pub fn if_modified_since(&self) -> Option<SystemTime> {
        self.headers
            .get(header::IF_MODIFIED_SINCE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| httpdate::parse_http_date(value).ok())
    }

    /// Path and query for diagnostics, e.g. `/posts?page=2`.
    pub fn path_and_query(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|value| value.as_str())
            .unwrap_or_else(|| self.uri.path())
    }
}
