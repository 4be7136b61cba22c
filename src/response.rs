//! Buffered response with freshness and cacheability arithmetic.
//!
//! [`CachedResponse`] is the engine's working form of a response: backend
//! responses on the cacheable path are buffered into it before the store
//! decision, and cache entries are restored into it by the metastore. All
//! age/TTL computation lives here, in integer seconds with negative
//! differences clamped to zero.

use std::time::SystemTime;

use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, Response, StatusCode, header},
};
use bytes::Bytes;
use http_body_util::BodyExt;
use thiserror::Error;

use crate::cache_control::CacheControl;

/// Statuses a shared cache may store.
const CACHEABLE_STATUSES: [u16; 7] = [200, 203, 300, 301, 302, 404, 410];

/// The backend response body could not be collected.
#[derive(Debug, Error)]
#[error("failed to buffer response body: {0}")]
pub struct BufferError(pub String);

/// A response the engine can do cache arithmetic on.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    request_time: SystemTime,
    response_time: SystemTime,
}

impl CachedResponse {
    /// Buffer a backend response. `request_time` is the instant the request
    /// was forwarded; it feeds the corrected-age computation. A `Date`
    /// header is synthesized when the backend sent none.
    pub async fn from_backend(
        response: Response<Body>,
        request_time: SystemTime,
    ) -> Result<Self, BufferError> {
        let (parts, body) = response.into_parts();
        let collected = body
            .collect()
            .await
            .map_err(|err| BufferError(err.to_string()))?;

        let mut response = Self {
            status: parts.status,
            headers: parts.headers,
            body: collected.to_bytes(),
            request_time,
            response_time: SystemTime::now(),
        };
        response.ensure_date();
        Ok(response)
    }

    /// Rebuild a response from stored parts.
    pub fn restore(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        let now = SystemTime::now();
        let mut response = Self {
            status,
            headers,
            body,
            request_time: now,
            response_time: now,
        };
        response.ensure_date();
        response
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn cache_control(&self) -> CacheControl {
        CacheControl::from_headers(&self.headers)
    }

    /// The `Date` header, falling back to the capture instant.
    pub fn date(&self) -> SystemTime {
        self.headers
            .get(header::DATE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| httpdate::parse_http_date(value).ok())
            .unwrap_or(self.response_time)
    }

    /// Current age in seconds: the larger of the apparent age (capture
    /// instant minus `Date`) and the corrected age (`Age` header plus
    /// response delay plus resident time).
    pub fn age(&self) -> u64 {
        let age_value = self
            .headers
            .get(header::AGE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .unwrap_or(0);

        let now = SystemTime::now();
        let apparent_age = seconds_between(self.date(), self.response_time);
        let corrected_age = age_value
            + seconds_between(self.request_time, self.response_time)
            + seconds_between(self.response_time, now);

        apparent_age.max(corrected_age)
    }

    /// Freshness lifetime in seconds: `s-maxage`, else `max-age`, else
    /// `Expires - Date`, else unknown.
    pub fn freshness_lifetime(&self) -> Option<u64> {
        let cc = self.cache_control();
        if let Some(s_maxage) = cc.s_maxage {
            return Some(s_maxage);
        }
        if let Some(max_age) = cc.max_age {
            return Some(max_age);
        }
        self.headers
            .get(header::EXPIRES)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| httpdate::parse_http_date(value).ok())
            .map(|expires| seconds_between(self.date(), expires))
    }

    /// Seconds of freshness remaining; `None` when the lifetime is unknown.
    pub fn ttl(&self) -> Option<i64> {
        self.freshness_lifetime()
            .map(|lifetime| lifetime as i64 - self.age() as i64)
    }

    pub fn fresh(&self) -> bool {
        self.ttl().is_some_and(|ttl| ttl > 0)
    }

    pub fn etag(&self) -> Option<&str> {
        self.headers
            .get(header::ETAG)
            .and_then(|value| value.to_str().ok())
    }

    pub fn last_modified_raw(&self) -> Option<&str> {
        self.headers
            .get(header::LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
    }

    pub fn last_modified(&self) -> Option<SystemTime> {
        self.last_modified_raw()
            .and_then(|value| httpdate::parse_http_date(value).ok())
    }

    pub fn has_validator(&self) -> bool {
        self.etag().is_some() || self.last_modified_raw().is_some()
    }

    pub fn is_public(&self) -> bool {
        self.cache_control().public
    }

    pub fn is_private(&self) -> bool {
        self.cache_control().private
    }

    pub fn must_revalidate(&self) -> bool {
        let cc = self.cache_control();
        cc.must_revalidate || cc.proxy_revalidate
    }

    /// Whether this response may be stored by a shared cache: status in the
    /// storable set, not `no-store` or `private`, and either fresh or
    /// revalidatable.
    pub fn cacheable(&self) -> bool {
        if !CACHEABLE_STATUSES.contains(&self.status.as_u16()) {
            return false;
        }
        let cc = self.cache_control();
        if cc.no_store || cc.private {
            return false;
        }
        self.fresh() || self.has_validator()
    }

    /// Assign a freshness lifetime: writes `max-age` and drops any now-stale
    /// `Expires`.
    pub fn set_ttl(&mut self, seconds: u64) {
        self.replace_cache_control(&["max-age", "s-maxage"], &format!("max-age={seconds}"));
        self.headers.remove(header::EXPIRES);
    }

    /// Mark the response private, clearing `public`.
    pub fn mark_private(&mut self) {
        self.replace_cache_control(&["public", "private"], "private");
    }

    /// Reflect the current age in the `Age` header.
    pub fn set_age_header(&mut self) {
        if let Ok(value) = HeaderValue::from_str(&self.age().to_string()) {
            self.headers.insert(header::AGE, value);
        }
    }

    /// Force the response stale by pinning `Age` to the freshness lifetime.
    /// The pinned value dominates every later age computation, so the entry
    /// stays stale regardless of which lifetime source it carries.
    pub fn expire(&mut self) {
        if self.fresh()
            && let Some(lifetime) = self.freshness_lifetime()
            && let Ok(value) = HeaderValue::from_str(&lifetime.to_string())
        {
            self.headers.insert(header::AGE, value);
        }
    }

    /// Build the response that replaces a revalidated entry: this entry's
    /// body and headers, with `Date`, `Expires`, `Cache-Control`, `ETag` and
    /// `Last-Modified` taken from the 304 when present.
    pub fn merge_revalidated(
        &self,
        validation: &CachedResponse,
        request_time: SystemTime,
    ) -> CachedResponse {
        let mut headers = self.headers.clone();
        headers.remove(header::AGE);
        for name in [
            header::DATE,
            header::EXPIRES,
            header::CACHE_CONTROL,
            header::ETAG,
            header::LAST_MODIFIED,
        ] {
            if let Some(value) = validation.headers.get(&name) {
                headers.insert(name, value.clone());
            }
        }

        let mut merged = CachedResponse {
            status: self.status,
            headers,
            body: self.body.clone(),
            request_time,
            response_time: SystemTime::now(),
        };
        merged.ensure_date();
        merged
    }

    /// Remove the named headers, e.g. before persisting.
    pub fn strip_headers(&mut self, names: &[String]) {
        for name in names {
            self.headers.remove(name.as_str());
        }
    }

    pub fn into_response(self) -> Response<Body> {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }

    fn ensure_date(&mut self) {
        if !self.headers.contains_key(header::DATE)
            && let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(self.response_time))
        {
            self.headers.insert(header::DATE, value);
        }
    }

    fn replace_cache_control(&mut self, strip: &[&str], add: &str) {
        let existing = self
            .headers
            .get(header::CACHE_CONTROL)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");

        let mut directives: Vec<String> = existing
            .split(',')
            .map(str::trim)
            .filter(|directive| !directive.is_empty())
            .filter(|directive| {
                let name = directive.split('=').next().unwrap_or("").trim();
                !strip.iter().any(|stripped| name.eq_ignore_ascii_case(stripped))
            })
            .map(ToString::to_string)
            .collect();
        directives.push(add.to_string());

        if let Ok(value) = HeaderValue::from_str(&directives.join(", ")) {
            self.headers.insert(header::CACHE_CONTROL, value);
        }
    }
}

fn seconds_between(earlier: SystemTime, later: SystemTime) -> u64 {
    later
        .duration_since(earlier)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
