//! Per-request trace of engine decisions.
//!
//! Every request through the engine accumulates an ordered list of
//! [`TraceEvent`]s describing the path it took through the state machine.
//! The rendered trace is exposed to clients via the `X-Scorta-Cache`
//! response header and, when verbose logging is enabled, as one log line
//! per request.

use std::fmt;

use axum::http::HeaderName;

/// Response header carrying the rendered trace.
pub const TRACE_HEADER: HeaderName = HeaderName::from_static("x-scorta-cache");

/// One engine decision. The set is closed; diagnostics and tests match on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    /// Forwarded to the backend without consulting the cache.
    Pass,
    /// Stored variants under the key were marked stale before passing.
    Invalidate,
    /// Client sent `no-cache` and reloads are allowed; cache bypassed.
    Reload,
    /// A fresh entry was served from the cache.
    Fresh,
    /// A matching entry was found but is no longer fresh.
    Stale,
    /// The backend confirmed the stale entry with a 304.
    Valid,
    /// The backend replaced the stale entry with a full response.
    Invalid,
    /// No usable entry was found under the key.
    Miss,
    /// The response was persisted to the cache.
    Store,
    /// Stored variants under the key were removed.
    Purge,
}

impl TraceEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            TraceEvent::Pass => "pass",
            TraceEvent::Invalidate => "invalidate",
            TraceEvent::Reload => "reload",
            TraceEvent::Fresh => "fresh",
            TraceEvent::Stale => "stale",
            TraceEvent::Valid => "valid",
            TraceEvent::Invalid => "invalid",
            TraceEvent::Miss => "miss",
            TraceEvent::Store => "store",
            TraceEvent::Purge => "purge",
        }
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Render a trace as it appears in the `X-Scorta-Cache` header.
pub fn render(events: &[TraceEvent]) -> String {
    events
        .iter()
        .map(|event| event.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
