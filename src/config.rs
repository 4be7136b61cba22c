//! Cache configuration.
//!
//! [`CacheConfig`] holds the shared, read-mostly options the engine consults
//! on every request. It derives `Deserialize` so an embedding application can
//! load it from a `[cache]` section of its settings file. [`CacheOverride`]
//! is the per-request overlay: upstream middleware may attach one to the
//! request extensions to adjust behavior for a single call.

use serde::Deserialize;

const DEFAULT_METASTORE_URI: &str = "heap:/";
const DEFAULT_ENTITYSTORE_URI: &str = "heap:/";
const DEFAULT_TTL_SECS: u64 = 0;

fn default_metastore() -> String {
    DEFAULT_METASTORE_URI.to_string()
}

fn default_entitystore() -> String {
    DEFAULT_ENTITYSTORE_URI.to_string()
}

fn default_private_headers() -> Vec<String> {
    vec!["Authorization".to_string(), "Cookie".to_string()]
}

fn default_ignore_headers() -> Vec<String> {
    vec!["Set-Cookie".to_string()]
}

fn default_verbose() -> bool {
    true
}

/// Engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Metastore URI (`heap:/`, `file:/var/cache/scorta/meta`).
    pub metastore: String,
    /// Entitystore URI (`heap:/`, `file:/var/cache/scorta/body`).
    pub entitystore: String,
    /// Seconds of freshness assigned to responses that carry none of their
    /// own. Zero disables the assignment.
    pub default_ttl: u64,
    /// Request headers whose presence makes the request private.
    pub private_headers: Vec<String>,
    /// Response headers stripped before a response is persisted.
    pub ignore_headers: Vec<String>,
    /// Honor `Cache-Control: no-cache` on requests.
    pub allow_reload: bool,
    /// Honor `Cache-Control: max-age=0` on requests.
    pub allow_revalidate: bool,
    /// Emit one trace log line per request.
    pub verbose: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            metastore: default_metastore(),
            entitystore: default_entitystore(),
            default_ttl: DEFAULT_TTL_SECS,
            private_headers: default_private_headers(),
            ignore_headers: default_ignore_headers(),
            allow_reload: false,
            allow_revalidate: false,
            verbose: default_verbose(),
        }
    }
}

impl CacheConfig {
    /// Fold a per-request override over this configuration.
    pub fn overlaid(&self, overrides: Option<&CacheOverride>) -> Self {
        let mut effective = self.clone();
        if let Some(overrides) = overrides {
            if let Some(allow_reload) = overrides.allow_reload {
                effective.allow_reload = allow_reload;
            }
            if let Some(allow_revalidate) = overrides.allow_revalidate {
                effective.allow_revalidate = allow_revalidate;
            }
            if let Some(default_ttl) = overrides.default_ttl {
                effective.default_ttl = default_ttl;
            }
            if let Some(verbose) = overrides.verbose {
                effective.verbose = verbose;
            }
        }
        effective
    }
}

/// Per-request configuration overlay, carried in request extensions.
#[derive(Debug, Clone, Default)]
pub struct CacheOverride {
    pub allow_reload: Option<bool>,
    pub allow_revalidate: Option<bool>,
    pub default_ttl: Option<u64>,
    pub verbose: Option<bool>,
}
