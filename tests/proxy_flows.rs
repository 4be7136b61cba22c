//! End-to-end engine flows against a scripted backend.
//!
//! Every test drives the full middleware stack: dispatch, lookup,
//! revalidation, storage, and post-processing, asserting on the
//! `X-Scorta-Cache` trace, the returned body, and the number of backend
//! calls.

use std::{
    collections::VecDeque,
    convert::Infallible,
    future::{Ready, ready},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    task::{Context, Poll},
    time::{Duration, SystemTime},
};

use axum::{
    body::Body,
    http::{HeaderMap, Method, Request, Response, StatusCode, header},
};
use http_body_util::BodyExt;
use tower::{Layer, Service, ServiceExt};

use scorta::{CacheConfig, CacheLayer, RequestFacts, Storage, default_cache_key};

#[derive(Clone, Debug)]
struct CannedResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

fn canned(status: u16, headers: &[(&str, &str)], body: &str) -> CannedResponse {
    CannedResponse {
        status,
        headers: headers
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect(),
        body: body.to_string(),
    }
}

/// Backend that replays a scripted queue of responses and records what it
/// was asked.
#[derive(Clone)]
struct ScriptedBackend {
    responses: Arc<Mutex<VecDeque<CannedResponse>>>,
    calls: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<(Method, HeaderMap)>>>,
}

impl ScriptedBackend {
    fn new(responses: Vec<CannedResponse>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            calls: Arc::new(AtomicUsize::new(0)),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_request(&self) -> (Method, HeaderMap) {
        self.seen
            .lock()
            .expect("seen lock")
            .last()
            .cloned()
            .expect("backend was never called")
    }
}

impl Service<Request<Body>> for ScriptedBackend {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = Ready<Result<Response<Body>, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .expect("seen lock")
            .push((request.method().clone(), request.headers().clone()));

        let canned = self
            .responses
            .lock()
            .expect("responses lock")
            .pop_front()
            .expect("backend script exhausted");

        let mut builder = Response::builder().status(canned.status);
        for (name, value) in &canned.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        ready(Ok(builder.body(Body::from(canned.body)).expect("response")))
    }
}

fn cache(config: CacheConfig, backend: ScriptedBackend) -> scorta::CacheService<ScriptedBackend> {
    CacheLayer::new(config)
        .with_storage(Arc::new(Storage::new()))
        .layer(backend)
}

fn get(uri: &str) -> Request<Body> {
    request(Method::GET, uri, &[])
}

fn request(method: Method, uri: &str, headers: &[(&str, &str)]) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::empty()).expect("request")
}

fn http_date(offset_secs: i64) -> String {
    let now = SystemTime::now();
    let instant = if offset_secs >= 0 {
        now + Duration::from_secs(offset_secs as u64)
    } else {
        now - Duration::from_secs((-offset_secs) as u64)
    };
    httpdate::fmt_http_date(instant)
}

fn trace_of(response: &Response<Body>) -> String {
    response
        .headers()
        .get("x-scorta-cache")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string()
}

async fn body_of(response: Response<Body>) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    String::from_utf8(bytes.to_vec()).expect("utf8")
}

// ============================================================================
// Miss / hit
// ============================================================================

#[tokio::test]
async fn miss_then_hit_with_advancing_age() {
    let date = http_date(-5);
    let backend = ScriptedBackend::new(vec![canned(
        200,
        &[("Cache-Control", "max-age=60"), ("Date", &date)],
        "x",
    )]);
    let service = cache(CacheConfig::default(), backend.clone());

    let first = service.clone().oneshot(get("http://host/a")).await.unwrap();
    assert_eq!(trace_of(&first), "miss, store");
    assert_eq!(body_of(first).await, "x");

    let second = service.clone().oneshot(get("http://host/a")).await.unwrap();
    assert_eq!(trace_of(&second), "fresh");
    let age: u64 = second
        .headers()
        .get(header::AGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .expect("age header");
    assert!((5..=6).contains(&age), "age was {age}");
    assert_eq!(body_of(second).await, "x");
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn responses_without_freshness_or_validators_are_not_stored() {
    let backend = ScriptedBackend::new(vec![canned(200, &[], "x"), canned(200, &[], "x")]);
    let service = cache(CacheConfig::default(), backend.clone());

    let first = service.clone().oneshot(get("http://host/a")).await.unwrap();
    assert_eq!(trace_of(&first), "miss");

    let second = service.clone().oneshot(get("http://host/a")).await.unwrap();
    assert_eq!(trace_of(&second), "miss");
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn default_ttl_applies_to_responses_without_freshness_info() {
    let backend = ScriptedBackend::new(vec![canned(200, &[], "x")]);
    let config = CacheConfig {
        default_ttl: 300,
        ..Default::default()
    };
    let service = cache(config, backend.clone());

    let first = service.clone().oneshot(get("http://host/a")).await.unwrap();
    assert_eq!(trace_of(&first), "miss, store");
    let cache_control = first
        .headers()
        .get(header::CACHE_CONTROL)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    assert!(cache_control.contains("max-age=300"));

    let second = service.clone().oneshot(get("http://host/a")).await.unwrap();
    assert_eq!(trace_of(&second), "fresh");
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn must_revalidate_blocks_the_default_ttl() {
    let backend = ScriptedBackend::new(vec![canned(
        200,
        &[("Cache-Control", "must-revalidate")],
        "x",
    )]);
    let config = CacheConfig {
        default_ttl: 300,
        ..Default::default()
    };
    let service = cache(config, backend.clone());

    let response = service.clone().oneshot(get("http://host/a")).await.unwrap();
    assert_eq!(trace_of(&response), "miss");
    let cache_control = response
        .headers()
        .get(header::CACHE_CONTROL)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    assert!(!cache_control.contains("max-age"));
}

// ============================================================================
// Revalidation
// ============================================================================

fn stale_entry_backend(second: CannedResponse) -> ScriptedBackend {
    let date = http_date(-120);
    ScriptedBackend::new(vec![
        canned(
            200,
            &[
                ("Cache-Control", "max-age=60"),
                ("Date", &date),
                ("ETag", "\"v1\""),
            ],
            "x",
        ),
        second,
    ])
}

#[tokio::test]
async fn stale_entry_revalidated_with_304() {
    let backend = stale_entry_backend(canned(
        304,
        &[("Date", &http_date(0)), ("ETag", "\"v1\"")],
        "",
    ));
    let service = cache(CacheConfig::default(), backend.clone());

    let first = service.clone().oneshot(get("http://host/a")).await.unwrap();
    assert_eq!(trace_of(&first), "miss, store");

    let second = service.clone().oneshot(get("http://host/a")).await.unwrap();
    assert_eq!(trace_of(&second), "stale, valid, store");
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(body_of(second).await, "x");

    // the conditional was built from the entry's validator
    let (method, headers) = backend.last_request();
    assert_eq!(method, Method::GET);
    assert_eq!(headers.get(header::IF_NONE_MATCH).unwrap(), "\"v1\"");
    assert_eq!(backend.calls(), 2);

    // the merged entry is fresh again
    let third = service.clone().oneshot(get("http://host/a")).await.unwrap();
    assert_eq!(trace_of(&third), "fresh");
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn stale_entry_replaced_by_full_response() {
    let backend = stale_entry_backend(canned(200, &[("Cache-Control", "max-age=60")], "y"));
    let service = cache(CacheConfig::default(), backend.clone());

    service.clone().oneshot(get("http://host/a")).await.unwrap();

    let second = service.clone().oneshot(get("http://host/a")).await.unwrap();
    assert_eq!(trace_of(&second), "stale, invalid, store");
    assert_eq!(body_of(second).await, "y");

    let third = service.clone().oneshot(get("http://host/a")).await.unwrap();
    assert_eq!(trace_of(&third), "fresh");
    assert_eq!(body_of(third).await, "y");
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn allow_revalidate_honors_request_max_age_zero() {
    let backend = ScriptedBackend::new(vec![
        canned(
            200,
            &[("Cache-Control", "max-age=60"), ("ETag", "\"v1\"")],
            "x",
        ),
        canned(304, &[("Date", &http_date(0))], ""),
    ]);
    let config = CacheConfig {
        allow_revalidate: true,
        ..Default::default()
    };
    let service = cache(config, backend.clone());

    service.clone().oneshot(get("http://host/a")).await.unwrap();

    let response = service
        .clone()
        .oneshot(request(
            Method::GET,
            "http://host/a",
            &[("Cache-Control", "max-age=0")],
        ))
        .await
        .unwrap();
    assert_eq!(trace_of(&response), "stale, valid, store");
    assert_eq!(backend.calls(), 2);
}

// ============================================================================
// Private requests
// ============================================================================

#[tokio::test]
async fn explicitly_public_response_overrides_private_request() {
    let backend = ScriptedBackend::new(vec![canned(
        200,
        &[("Cache-Control", "public, max-age=60")],
        "z",
    )]);
    let service = cache(CacheConfig::default(), backend.clone());

    let first = service
        .clone()
        .oneshot(request(
            Method::GET,
            "http://host/a",
            &[("Cookie", "session=1")],
        ))
        .await
        .unwrap();
    assert_eq!(trace_of(&first), "miss, store");

    let second = service
        .clone()
        .oneshot(request(
            Method::GET,
            "http://host/a",
            &[("Cookie", "session=1")],
        ))
        .await
        .unwrap();
    assert_eq!(trace_of(&second), "fresh");
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn unmarked_response_to_private_request_stays_private() {
    let backend = ScriptedBackend::new(vec![canned(200, &[], "z"), canned(200, &[], "z")]);
    let service = cache(CacheConfig::default(), backend.clone());

    let first = service
        .clone()
        .oneshot(request(
            Method::GET,
            "http://host/a",
            &[("Authorization", "Bearer token")],
        ))
        .await
        .unwrap();
    assert_eq!(trace_of(&first), "miss");
    let cache_control = first
        .headers()
        .get(header::CACHE_CONTROL)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    assert!(cache_control.contains("private"));

    let second = service
        .clone()
        .oneshot(request(
            Method::GET,
            "http://host/a",
            &[("Authorization", "Bearer token")],
        ))
        .await
        .unwrap();
    assert_eq!(trace_of(&second), "miss");
    assert_eq!(backend.calls(), 2);
}

// ============================================================================
// Invalidation / purge
// ============================================================================

#[tokio::test]
async fn post_invalidates_then_next_get_revalidates() {
    let backend = ScriptedBackend::new(vec![
        canned(200, &[("Cache-Control", "max-age=60")], "x"),
        canned(200, &[], "posted"),
        canned(200, &[("Cache-Control", "max-age=60")], "x2"),
    ]);
    let service = cache(CacheConfig::default(), backend.clone());

    let first = service.clone().oneshot(get("http://host/a")).await.unwrap();
    assert_eq!(trace_of(&first), "miss, store");

    let post = service
        .clone()
        .oneshot(request(Method::POST, "http://host/a", &[]))
        .await
        .unwrap();
    assert_eq!(trace_of(&post), "invalidate, pass");
    assert_eq!(body_of(post).await, "posted");

    let second = service.clone().oneshot(get("http://host/a")).await.unwrap();
    assert_eq!(trace_of(&second), "stale, invalid, store");
    assert_eq!(body_of(second).await, "x2");
}

#[tokio::test]
async fn non_safe_methods_never_store_or_serve() {
    let backend = ScriptedBackend::new(vec![canned(
        200,
        &[("Cache-Control", "max-age=60")],
        "created",
    )]);
    let service = cache(CacheConfig::default(), backend.clone());

    let response = service
        .clone()
        .oneshot(request(Method::PUT, "http://host/a", &[]))
        .await
        .unwrap();
    let trace = trace_of(&response);
    assert!(!trace.contains("store"));
    assert!(!trace.contains("fresh"));
    assert_eq!(trace, "invalidate, pass");
}

#[tokio::test]
async fn purge_then_miss() {
    let backend = ScriptedBackend::new(vec![
        canned(200, &[("Cache-Control", "max-age=60")], "x"),
        canned(200, &[("Cache-Control", "max-age=60")], "x"),
    ]);
    let service = cache(CacheConfig::default(), backend.clone());

    service.clone().oneshot(get("http://host/a")).await.unwrap();

    let purge = service
        .clone()
        .oneshot(request(Method::from_bytes(b"PURGE").unwrap(), "http://host/a", &[]))
        .await
        .unwrap();
    assert_eq!(purge.status(), StatusCode::OK);
    assert_eq!(trace_of(&purge), "purge");
    assert_eq!(body_of(purge).await, "");

    let next = service.clone().oneshot(get("http://host/a")).await.unwrap();
    assert_eq!(trace_of(&next), "miss, store");
    assert_eq!(backend.calls(), 2);
}

// ============================================================================
// Request reload directives
// ============================================================================

#[tokio::test]
async fn no_cache_without_allow_reload_still_serves_from_cache() {
    let backend = ScriptedBackend::new(vec![canned(
        200,
        &[("Cache-Control", "max-age=60")],
        "x",
    )]);
    let service = cache(CacheConfig::default(), backend.clone());

    service.clone().oneshot(get("http://host/a")).await.unwrap();

    let response = service
        .clone()
        .oneshot(request(
            Method::GET,
            "http://host/a",
            &[("Cache-Control", "no-cache")],
        ))
        .await
        .unwrap();
    assert_eq!(trace_of(&response), "fresh");
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn no_cache_with_allow_reload_refetches() {
    let backend = ScriptedBackend::new(vec![
        canned(200, &[("Cache-Control", "max-age=60")], "old"),
        canned(200, &[("Cache-Control", "max-age=60")], "new"),
    ]);
    let config = CacheConfig {
        allow_reload: true,
        ..Default::default()
    };
    let service = cache(config, backend.clone());

    service.clone().oneshot(get("http://host/a")).await.unwrap();

    let response = service
        .clone()
        .oneshot(request(
            Method::GET,
            "http://host/a",
            &[("Cache-Control", "no-cache")],
        ))
        .await
        .unwrap();
    assert_eq!(trace_of(&response), "reload, store");
    assert_eq!(body_of(response).await, "new");
}

// ============================================================================
// Vary
// ============================================================================

#[tokio::test]
async fn vary_serves_the_matching_variant() {
    let backend = ScriptedBackend::new(vec![
        canned(
            200,
            &[("Cache-Control", "max-age=60"), ("Vary", "Accept-Language")],
            "hello",
        ),
        canned(
            200,
            &[("Cache-Control", "max-age=60"), ("Vary", "Accept-Language")],
            "hallo",
        ),
    ]);
    let service = cache(CacheConfig::default(), backend.clone());

    let english = service
        .clone()
        .oneshot(request(
            Method::GET,
            "http://host/a",
            &[("Accept-Language", "en")],
        ))
        .await
        .unwrap();
    assert_eq!(trace_of(&english), "miss, store");
    assert_eq!(body_of(english).await, "hello");

    let german = service
        .clone()
        .oneshot(request(
            Method::GET,
            "http://host/a",
            &[("Accept-Language", "de")],
        ))
        .await
        .unwrap();
    assert_eq!(trace_of(&german), "miss, store");
    assert_eq!(body_of(german).await, "hallo");

    let english_again = service
        .clone()
        .oneshot(request(
            Method::GET,
            "http://host/a",
            &[("Accept-Language", "en")],
        ))
        .await
        .unwrap();
    assert_eq!(trace_of(&english_again), "fresh");
    assert_eq!(body_of(english_again).await, "hello");
    assert_eq!(backend.calls(), 2);
}

// ============================================================================
// Conditional downgrades
// ============================================================================

#[tokio::test]
async fn client_conditional_is_stripped_on_fetch_and_applied_on_the_way_out() {
    let backend = ScriptedBackend::new(vec![canned(
        200,
        &[("Cache-Control", "max-age=60"), ("ETag", "\"v1\"")],
        "x",
    )]);
    let service = cache(CacheConfig::default(), backend.clone());

    let response = service
        .clone()
        .oneshot(request(
            Method::GET,
            "http://host/a",
            &[("If-None-Match", "\"v1\"")],
        ))
        .await
        .unwrap();

    // the backend never saw the client's conditional
    let (_, headers) = backend.last_request();
    assert!(!headers.contains_key(header::IF_NONE_MATCH));

    // but the client got its 304, and the entry was stored
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(trace_of(&response), "miss, store");
    assert_eq!(body_of(response).await, "");

    let follow_up = service.clone().oneshot(get("http://host/a")).await.unwrap();
    assert_eq!(trace_of(&follow_up), "fresh");
    assert_eq!(body_of(follow_up).await, "x");
}

#[tokio::test]
async fn if_modified_since_downgrades_when_not_newer() {
    let last_modified = http_date(-3600);
    let backend = ScriptedBackend::new(vec![canned(
        200,
        &[
            ("Cache-Control", "max-age=60"),
            ("Last-Modified", &last_modified),
        ],
        "x",
    )]);
    let service = cache(CacheConfig::default(), backend.clone());

    let response = service
        .clone()
        .oneshot(request(
            Method::GET,
            "http://host/a",
            &[("If-Modified-Since", &http_date(0))],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
}

// ============================================================================
// Store internals observed through the engine
// ============================================================================

#[tokio::test]
async fn storing_twice_leaves_one_variant() {
    let storage = Arc::new(Storage::new());
    let backend = ScriptedBackend::new(vec![
        canned(200, &[("Cache-Control", "max-age=60")], "one"),
        canned(200, &[("Cache-Control", "max-age=60")], "two"),
    ]);
    let config = CacheConfig {
        allow_reload: true,
        ..Default::default()
    };
    let service = CacheLayer::new(config)
        .with_storage(storage.clone())
        .layer(backend);

    service.clone().oneshot(get("http://host/a")).await.unwrap();
    service
        .clone()
        .oneshot(request(
            Method::GET,
            "http://host/a",
            &[("Cache-Control", "no-cache")],
        ))
        .await
        .unwrap();

    let meta = storage.metastore("heap:/").expect("metastore");
    let (parts, _) = get("http://host/a").into_parts();
    let key = default_cache_key(&RequestFacts::from_parts(&parts));
    let variants = meta.read(&key).await.expect("read");
    assert_eq!(variants.len(), 1);
}

#[tokio::test]
async fn missing_body_blob_degrades_to_miss() {
    let storage = Arc::new(Storage::new());
    let backend = ScriptedBackend::new(vec![
        canned(200, &[("Cache-Control", "max-age=60")], "x"),
        canned(200, &[("Cache-Control", "max-age=60")], "x"),
    ]);
    let service = CacheLayer::new(CacheConfig::default())
        .with_storage(storage.clone())
        .layer(backend.clone());

    service.clone().oneshot(get("http://host/a")).await.unwrap();

    // drop the blob out from under the metastore
    let meta = storage.metastore("heap:/").expect("metastore");
    let entities = storage.entitystore("heap:/").expect("entitystore");
    let (parts, _) = get("http://host/a").into_parts();
    let key = default_cache_key(&RequestFacts::from_parts(&parts));
    let digest = meta.read(&key).await.expect("read")[0].digest.clone();
    entities.purge(&digest).await.expect("purge blob");

    let response = service.clone().oneshot(get("http://host/a")).await.unwrap();
    assert_eq!(trace_of(&response), "miss, store");
    assert_eq!(body_of(response).await, "x");
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn file_backed_stores_roundtrip() {
    let dir = tempfile::TempDir::new().expect("tempdir");
    let config = CacheConfig {
        metastore: format!("file:{}", dir.path().join("meta").display()),
        entitystore: format!("file:{}", dir.path().join("body").display()),
        ..Default::default()
    };
    let backend = ScriptedBackend::new(vec![canned(
        200,
        &[("Cache-Control", "max-age=60")],
        "on disk",
    )]);
    let service = cache(config, backend.clone());

    let first = service.clone().oneshot(get("http://host/a")).await.unwrap();
    assert_eq!(trace_of(&first), "miss, store");

    let second = service.clone().oneshot(get("http://host/a")).await.unwrap();
    assert_eq!(trace_of(&second), "fresh");
    assert_eq!(body_of(second).await, "on disk");
    assert_eq!(backend.calls(), 1);
}
