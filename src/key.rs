//! Cache key derivation.
//!
//! The default key is `scheme://authority/path?query` with the query pairs
//! decoded, sorted, and re-encoded so equivalent URLs land on the same key.
//! A [`KeyFn`] supplied through the layer builder replaces the default; the
//! stores treat the produced string as opaque.

use std::sync::Arc;

use axum::http::header;
use url::form_urlencoded;

use crate::request::RequestFacts;

/// User-replaceable key generator.
pub type KeyFn = Arc<dyn Fn(&RequestFacts) -> String + Send + Sync>;

/// Derive the default cache key for a request.
pub fn default_cache_key(facts: &RequestFacts) -> String {
    let uri = facts.uri();
    let scheme = uri.scheme_str().unwrap_or("http");
    let authority = uri
        .authority()
        .map(|authority| authority.as_str())
        .or_else(|| {
            facts
                .headers()
                .get(header::HOST)
                .and_then(|value| value.to_str().ok())
        })
        .unwrap_or("");

    let mut key = format!("{scheme}://{authority}{}", uri.path());

    if let Some(query) = uri.query()
        && !query.is_empty()
    {
        let mut pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        pairs.sort();

        let mut serializer = form_urlencoded::Serializer::new(String::new());
        serializer.extend_pairs(pairs);
        key.push('?');
        key.push_str(&serializer.finish());
    }

    key
}
