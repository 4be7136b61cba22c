//! # Scorta
//!
//! An HTTP/1.1 shared-cache reverse proxy middleware for tower/axum
//! services. [`CacheLayer`] wraps a backend service and serves cacheable
//! responses from local storage, revalidates stale entries with conditional
//! GETs, and invalidates stored variants on unsafe methods.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  CacheService<S>                             │
//! │  ├─ Transaction (per request)                │← trace, effective config
//! │  ├─ MetaStore   (heap:/ or file:)            │← variant lists per key
//! │  └─ EntityStore (heap:/ or file:)            │← content-addressed bodies
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use axum::{Router, routing::get};
//! use scorta::{CacheConfig, CacheLayer};
//!
//! let config = CacheConfig {
//!     metastore: "file:/var/cache/scorta/meta".to_string(),
//!     entitystore: "file:/var/cache/scorta/body".to_string(),
//!     ..Default::default()
//! };
//!
//! let app: Router = Router::new()
//!     .route("/", get(|| async { "hello" }))
//!     .layer(CacheLayer::new(config));
//! ```
//!
//! Configuration can also come from an embedding application's settings
//! file:
//!
//! ```toml
//! [cache]
//! metastore = "file:/var/cache/scorta/meta"
//! entitystore = "file:/var/cache/scorta/body"
//! default_ttl = 300
//! allow_reload = false
//! ```
//!
//! The engine annotates every response with an `X-Scorta-Cache` header
//! listing the decisions it took (`miss, store`, `fresh`, `stale, valid`,
//! …) and, when `verbose` is set, logs one trace line per request.

pub mod cache_control;
pub mod config;
pub mod error;
pub mod key;
mod lock;
pub mod middleware;
pub mod request;
pub mod response;
pub mod storage;
pub mod telemetry;
pub mod trace;

pub use cache_control::CacheControl;
pub use config::{CacheConfig, CacheOverride};
pub use error::{StorageError, TelemetryError};
pub use key::{KeyFn, default_cache_key};
pub use middleware::{CacheLayer, CacheService};
pub use request::RequestFacts;
pub use response::CachedResponse;
pub use storage::{
    EntityStore, FileEntityStore, FileMetaStore, HeapEntityStore, HeapMetaStore, MetaStore,
    Storage, StoreUri, Variant, default_storage,
};
pub use trace::TraceEvent;
