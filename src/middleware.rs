//! The caching engine.
//!
//! [`CacheLayer`] wraps a backend service in a [`CacheService`]. Each call
//! runs one transaction: the request is classified by method, the
//! metastore is consulted for a matching variant, stale entries are
//! revalidated with a conditional GET, and storable responses are persisted
//! on the way out. The engine forwards to the backend at most once per
//! request.
//!
//! Dispatch:
//!
//! ```text
//! GET/HEAD, no Expect ──► lookup ──► fresh | stale → validate | miss → fetch
//! GET/HEAD with Expect ──► pass
//! PURGE                ──► purge
//! anything else        ──► invalidate, then pass
//! ```
//!
//! Caching is an optimization, never a dependency of request success: store
//! failures are logged and the response is returned uncached.

use std::{
    sync::Arc,
    task::{Context, Poll},
    time::SystemTime,
};

use axum::{
    body::Body,
    http::{HeaderValue, Method, Request, Response, StatusCode, header, request::Parts},
};
use futures::future::BoxFuture;
use tower::{Layer, Service};
use tracing::{error, info, warn};

use crate::{
    config::{CacheConfig, CacheOverride},
    key::{KeyFn, default_cache_key},
    request::RequestFacts,
    response::{BufferError, CachedResponse},
    storage::{EntityStore, MetaStore, Storage, default_storage},
    trace::{TRACE_HEADER, TraceEvent, render},
};

/// Layer that wraps a backend service with the caching engine.
#[derive(Clone)]
pub struct CacheLayer {
    config: CacheConfig,
    key_fn: KeyFn,
    storage: Arc<Storage>,
}

impl CacheLayer {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            key_fn: Arc::new(default_cache_key),
            storage: default_storage(),
        }
    }

    /// Replace the cache key generator.
    pub fn with_key_fn(mut self, key_fn: KeyFn) -> Self {
        self.key_fn = key_fn;
        self
    }

    /// Use a dedicated store resolver instead of the process default.
    pub fn with_storage(mut self, storage: Arc<Storage>) -> Self {
        self.storage = storage;
        self
    }
}

impl Default for CacheLayer {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl<S> Layer<S> for CacheLayer {
    type Service = CacheService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CacheService {
            inner,
            shared: Arc::new(Shared {
                config: self.config.clone(),
                key_fn: self.key_fn.clone(),
                storage: self.storage.clone(),
            }),
        }
    }
}

struct Shared {
    config: CacheConfig,
    key_fn: KeyFn,
    storage: Arc<Storage>,
}

/// Caching middleware around a backend service.
pub struct CacheService<S> {
    inner: S,
    shared: Arc<Shared>,
}

impl<S: Clone> Clone for CacheService<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<S> Service<Request<Body>> for CacheService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Response<Body>, S::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), S::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        // Take the ready inner service and leave a fresh clone behind, so
        // the spawned transaction owns its backend exclusively.
        let clone = self.inner.clone();
        let backend = std::mem::replace(&mut self.inner, clone);
        let shared = self.shared.clone();

        Box::pin(async move {
            let (parts, body) = request.into_parts();

            let overrides = parts.extensions.get::<CacheOverride>().cloned();
            let config = shared.config.overlaid(overrides.as_ref());
            let facts = RequestFacts::from_parts(&parts);
            let key = (shared.key_fn)(&facts);

            let meta = shared.storage.metastore(&config.metastore);
            let entities = shared.storage.entitystore(&config.entitystore);
            let (meta, entities) = match (meta, entities) {
                (Ok(meta), Ok(entities)) => (meta, entities),
                (Err(err), _) | (_, Err(err)) => {
                    error!(
                        target = "scorta::engine",
                        error = %err,
                        "cache store resolution failed"
                    );
                    return Ok(configuration_failure());
                }
            };

            let mut txn = Transaction {
                config,
                facts,
                key,
                trace: Vec::new(),
                backend,
                meta,
                entities,
            };
            let mut response = txn.dispatch(parts, body).await?;
            txn.finish(&mut response);
            Ok(response)
        })
    }
}

/// Per-request engine state. Nothing here outlives the request, so
/// concurrent calls never share mutable state.
struct Transaction<S> {
    config: CacheConfig,
    facts: RequestFacts,
    key: String,
    trace: Vec<TraceEvent>,
    backend: S,
    meta: Arc<dyn MetaStore>,
    entities: Arc<dyn EntityStore>,
}

impl<S> Transaction<S>
where
    S: Service<Request<Body>, Response = Response<Body>>,
{
    async fn dispatch(&mut self, parts: Parts, body: Body) -> Result<Response<Body>, S::Error> {
        if self.facts.is_purge() {
            return Ok(self.purge().await);
        }
        if !self.facts.is_cacheable_method() {
            return self.invalidate(parts, body).await;
        }
        if parts.headers.contains_key(header::EXPECT) {
            self.pass(parts, body).await
        } else {
            self.lookup(parts, body).await
        }
    }

    /// Forward unchanged; the cache is neither consulted nor written.
    async fn pass(&mut self, parts: Parts, body: Body) -> Result<Response<Body>, S::Error> {
        self.record(TraceEvent::Pass);
        self.forward(Request::from_parts(parts, body)).await
    }

    /// Mark every stored variant under the key stale, then pass.
    async fn invalidate(&mut self, parts: Parts, body: Body) -> Result<Response<Body>, S::Error> {
        if let Err(err) = self.meta.invalidate(&self.key).await {
            warn!(
                target = "scorta::engine",
                key = %self.key,
                error = %err,
                "cache invalidation failed"
            );
        }
        self.record(TraceEvent::Invalidate);
        self.pass(parts, body).await
    }

    /// Drop every stored variant under the key. Never reaches the backend.
    async fn purge(&mut self) -> Response<Body> {
        if let Err(err) = self.meta.purge_key(&self.key, &self.entities).await {
            warn!(
                target = "scorta::engine",
                key = %self.key,
                error = %err,
                "cache purge failed"
            );
        }
        self.record(TraceEvent::Purge);

        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::OK;
        response
    }

    async fn lookup(&mut self, parts: Parts, body: Body) -> Result<Response<Body>, S::Error> {
        if self.config.allow_reload && self.facts.no_cache() {
            self.record(TraceEvent::Reload);
            return self.fetch(parts, body).await;
        }

        // A failing metastore must not fail the request.
        let entry = match self.meta.lookup(&self.key, &self.facts, &self.entities).await {
            Ok(entry) => entry,
            Err(err) => {
                warn!(
                    target = "scorta::engine",
                    key = %self.key,
                    error = %err,
                    "metastore lookup failed; treating as miss"
                );
                None
            }
        };

        match entry {
            None => {
                self.record(TraceEvent::Miss);
                self.fetch(parts, body).await
            }
            Some(mut entry) => {
                if self.fresh_enough(&entry) {
                    self.record(TraceEvent::Fresh);
                    entry.set_age_header();
                    Ok(entry.into_response())
                } else {
                    self.record(TraceEvent::Stale);
                    self.validate(parts, entry).await
                }
            }
        }
    }

    /// Revalidate a stale entry with a conditional GET.
    async fn validate(
        &mut self,
        mut parts: Parts,
        entry: CachedResponse,
    ) -> Result<Response<Body>, S::Error> {
        parts.method = Method::GET;
        parts.headers.remove(header::IF_MODIFIED_SINCE);
        parts.headers.remove(header::IF_NONE_MATCH);
        if let Some(last_modified) = entry.last_modified_raw()
            && let Ok(value) = HeaderValue::from_str(last_modified)
        {
            parts.headers.insert(header::IF_MODIFIED_SINCE, value);
        }
        if let Some(etag) = entry.etag()
            && let Ok(value) = HeaderValue::from_str(etag)
        {
            parts.headers.insert(header::IF_NONE_MATCH, value);
        }

        let request_time = SystemTime::now();
        let backend_response = self
            .forward(Request::from_parts(parts, Body::empty()))
            .await?;

        let not_modified = backend_response.status() == StatusCode::NOT_MODIFIED;
        let backend = match CachedResponse::from_backend(backend_response, request_time).await {
            Ok(backend) => backend,
            Err(err) => return Ok(buffer_failure(err)),
        };

        if not_modified {
            self.record(TraceEvent::Valid);
            let mut merged = entry.merge_revalidated(&backend, request_time);
            if merged.cacheable() {
                self.store_response(&mut merged).await;
            }
            return Ok(merged.into_response());
        }

        self.record(TraceEvent::Invalid);
        let mut response = backend;
        if response.cacheable() {
            self.store_response(&mut response).await;
        }
        Ok(response.into_response())
    }

    /// Fetch from the backend with conditionals stripped.
    async fn fetch(&mut self, mut parts: Parts, body: Body) -> Result<Response<Body>, S::Error> {
        parts.method = Method::GET;
        parts.headers.remove(header::IF_MODIFIED_SINCE);
        parts.headers.remove(header::IF_NONE_MATCH);

        let request_time = SystemTime::now();
        let backend_response = self.forward(Request::from_parts(parts, body)).await?;

        let mut response = match CachedResponse::from_backend(backend_response, request_time).await
        {
            Ok(response) => response,
            Err(err) => return Ok(buffer_failure(err)),
        };

        if self.facts.is_private(&self.config.private_headers) && !response.is_public() {
            response.mark_private();
        } else if self.config.default_ttl > 0
            && response.ttl().is_none()
            && !response.must_revalidate()
        {
            response.set_ttl(self.config.default_ttl);
        }

        if response.cacheable() {
            self.store_response(&mut response).await;
        }
        Ok(response.into_response())
    }

    /// Persist the response. Failures leave the response uncached.
    async fn store_response(&mut self, response: &mut CachedResponse) {
        response.strip_headers(&self.config.ignore_headers);
        match self
            .meta
            .store(&self.key, &self.facts, response, &self.entities)
            .await
        {
            Ok(()) => {
                self.record(TraceEvent::Store);
                response.set_age_header();
            }
            Err(err) => {
                warn!(
                    target = "scorta::engine",
                    key = %self.key,
                    error = %err,
                    "cache store failed; returning response uncached"
                );
            }
        }
    }

    async fn forward(&mut self, request: Request<Body>) -> Result<Response<Body>, S::Error> {
        self.backend.call(request).await
    }

    fn fresh_enough(&self, entry: &CachedResponse) -> bool {
        if !entry.fresh() {
            return false;
        }
        if self.config.allow_revalidate
            && let Some(max_age) = self.facts.max_age()
        {
            return max_age > 0 && max_age >= entry.age();
        }
        true
    }

    fn record(&mut self, event: TraceEvent) {
        self.trace.push(event);
    }

    /// Applied to every response on the way out: conditional downgrade,
    /// HEAD body stripping, trace header, and the verbose log line.
    fn finish(&self, response: &mut Response<Body>) {
        if self.not_modified(response) {
            *response.status_mut() = StatusCode::NOT_MODIFIED;
            *response.body_mut() = Body::empty();
            response.headers_mut().remove(header::CONTENT_LENGTH);
        }

        if self.facts.method() == Method::HEAD {
            *response.body_mut() = Body::empty();
        }

        let rendered = render(&self.trace);
        if let Ok(value) = HeaderValue::from_str(&rendered) {
            response.headers_mut().insert(TRACE_HEADER, value);
        }

        if self.config.verbose {
            info!(
                target = "scorta::trace",
                "cache: [{} {}] {}",
                self.facts.method(),
                self.facts.path_and_query(),
                rendered
            );
        }
    }

    fn not_modified(&self, response: &Response<Body>) -> bool {
        if let Some(if_none_match) = self.facts.if_none_match()
            && let Some(etag) = response
                .headers()
                .get(header::ETAG)
                .and_then(|value| value.to_str().ok())
            && if_none_match
                .split(',')
                .map(str::trim)
                .any(|candidate| candidate == "*" || candidate == etag)
        {
            return true;
        }

        let last_modified = response
            .headers()
            .get(header::LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| httpdate::parse_http_date(value).ok());
        match (self.facts.if_modified_since(), last_modified) {
            (Some(if_modified_since), Some(last_modified)) => last_modified <= if_modified_since,
            _ => false,
        }
    }
}

fn buffer_failure(err: BufferError) -> Response<Body> {
    warn!(
        target = "scorta::engine",
        error = %err,
        "failed to buffer backend response body"
    );
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

fn configuration_failure() -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}
