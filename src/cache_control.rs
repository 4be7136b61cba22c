//! `Cache-Control` header parsing.
//!
//! One flat directive struct covers both the request and the response side;
//! each caller reads the fields that apply to it.

use axum::http::{HeaderMap, header};

/// Parsed `Cache-Control` directives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    /// max-age (seconds)
    pub max_age: Option<u64>,
    /// s-maxage (seconds, shared caches)
    pub s_maxage: Option<u64>,
    /// no-cache flag
    pub no_cache: bool,
    /// no-store flag
    pub no_store: bool,
    /// private flag
    pub private: bool,
    /// public flag
    pub public: bool,
    /// must-revalidate flag
    pub must_revalidate: bool,
    /// proxy-revalidate flag
    pub proxy_revalidate: bool,
    /// no-transform flag
    pub no_transform: bool,
    /// max-stale tolerance; a bare `max-stale` accepts any staleness
    pub max_stale: Option<u64>,
    /// min-fresh (seconds)
    pub min_fresh: Option<u64>,
    /// only-if-cached flag
    pub only_if_cached: bool,
}

impl CacheControl {
    /// Parse a single `Cache-Control` header value. Unknown directives and
    /// unparsable arguments are skipped.
    pub fn parse(value: &str) -> Self {
        let mut cc = Self::default();

        for directive in value.split(',') {
            let directive = directive.trim().to_ascii_lowercase();

            if directive == "no-cache" {
                cc.no_cache = true;
            } else if directive == "no-store" {
                cc.no_store = true;
            } else if directive == "private" {
                cc.private = true;
            } else if directive == "public" {
                cc.public = true;
            } else if directive == "must-revalidate" {
                cc.must_revalidate = true;
            } else if directive == "proxy-revalidate" {
                cc.proxy_revalidate = true;
            } else if directive == "no-transform" {
                cc.no_transform = true;
            } else if directive == "only-if-cached" {
                cc.only_if_cached = true;
            } else if directive == "max-stale" {
                cc.max_stale = Some(u64::MAX);
            } else if let Some(value) = directive.strip_prefix("max-age=") {
                cc.max_age = parse_seconds(value);
            } else if let Some(value) = directive.strip_prefix("s-maxage=") {
                cc.s_maxage = parse_seconds(value);
            } else if let Some(value) = directive.strip_prefix("max-stale=") {
                cc.max_stale = parse_seconds(value);
            } else if let Some(value) = directive.strip_prefix("min-fresh=") {
                cc.min_fresh = parse_seconds(value);
            }
        }

        cc
    }

    /// Parse every `Cache-Control` header in the map, later values merging
    /// over earlier ones the way a comma-joined header would.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let joined = headers
            .get_all(header::CACHE_CONTROL)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect::<Vec<_>>()
            .join(", ");
        Self::parse(&joined)
    }
}

fn parse_seconds(value: &str) -> Option<u64> {
    value.trim().trim_matches('"').parse().ok()
}
