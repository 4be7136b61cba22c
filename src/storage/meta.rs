//! Response metadata stores.
//!
//! A metastore maps a cache key to an ordered list of [`Variant`]s, most
//! recently stored first. Backends supply three primitives (`read`, `write`,
//! `purge`); variant selection, storage, invalidation and purge share one
//! implementation on top of them, so every backend behaves identically under
//! `Vary` and staleness rules.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::{fs, io::AsyncWriteExt};
use tracing::warn;
use uuid::Uuid;

use crate::error::StorageError;
use crate::lock::{rw_read, rw_write};
use crate::request::RequestFacts;
use crate::response::CachedResponse;
use crate::storage::entity::{EntityStore, content_digest};

const SOURCE: &str = "storage::meta";

/// Response header recording the entitystore address of the body.
pub const CONTENT_DIGEST_HEADER: HeaderName = HeaderName::from_static("x-content-digest");

/// One stored response under a cache key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    /// Request header snapshot taken at store time, used for `Vary` matching.
    pub request_headers: Vec<(String, String)>,
    /// Stored response status.
    pub status: u16,
    /// Stored response headers, including `Age: 0` and the content digest.
    pub response_headers: Vec<(String, String)>,
    /// Entitystore address of the body.
    pub digest: String,
    /// Body size in bytes.
    pub size: u64,
}

impl Variant {
    fn vary(&self) -> Option<&str> {
        stored_header(&self.response_headers, "vary")
    }
}

/// Snapshot a header map into serializable pairs. Values that are not valid
/// UTF-8 are dropped.
pub fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

/// Rebuild a header map from stored pairs, skipping entries that no longer
/// parse.
pub fn header_map(pairs: &[(String, String)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        if let Ok(name) = HeaderName::try_from(name.as_str())
            && let Ok(value) = HeaderValue::from_str(value)
        {
            headers.append(name, value);
        }
    }
    headers
}

fn stored_header<'a>(pairs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(stored, _)| stored.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Whether a stored request matches the incoming one under the given `Vary`
/// value: every named header must carry the same trimmed value on both
/// sides, with an absent header equal to an empty one. `Vary: *` matches
/// nothing.
fn requests_match(vary: Option<&str>, stored: &[(String, String)], incoming: &HeaderMap) -> bool {
    let Some(vary) = vary.map(str::trim).filter(|value| !value.is_empty()) else {
        return true;
    };
    if vary == "*" {
        return false;
    }

    vary.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .all(|name| {
            let stored_value = stored_header(stored, name).map(str::trim).unwrap_or("");
            let incoming_value = incoming
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .unwrap_or("");
            stored_value == incoming_value
        })
}

fn same_vary(stored: Option<&str>, incoming: Option<&str>) -> bool {
    match (stored.map(str::trim), incoming.map(str::trim)) {
        (None, None) => true,
        (Some(stored), Some(incoming)) => stored == incoming,
        _ => false,
    }
}

/// Keyed store of response metadata and body references.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Read the variant list under `key`. Unknown keys yield an empty list.
    async fn read(&self, key: &str) -> Result<Vec<Variant>, StorageError>;

    /// Replace the variant list under `key`.
    async fn write(&self, key: &str, variants: Vec<Variant>) -> Result<(), StorageError>;

    /// Drop the variant list under `key`. Unknown keys are a no-op.
    async fn purge(&self, key: &str) -> Result<(), StorageError>;

    /// Select the first variant whose stored request matches `facts` under
    /// the variant's `Vary`, and bind its body from the entitystore.
    /// Variants whose body has gone missing are dropped opportunistically
    /// and the scan continues.
    async fn lookup(
        &self,
        key: &str,
        facts: &RequestFacts,
        entities: &Arc<dyn EntityStore>,
    ) -> Result<Option<CachedResponse>, StorageError> {
        let variants = self.read(key).await?;

        let mut dangling: Vec<String> = Vec::new();
        let mut selected: Option<(&Variant, Bytes)> = None;
        for variant in &variants {
            if !requests_match(variant.vary(), &variant.request_headers, facts.headers()) {
                continue;
            }
            match entities.read(&variant.digest).await {
                Ok(Some(body)) => {
                    selected = Some((variant, body));
                    break;
                }
                Ok(None) => dangling.push(variant.digest.clone()),
                Err(err) => {
                    warn!(
                        target = "scorta::storage",
                        key,
                        digest = %variant.digest,
                        error = %err,
                        "entity read failed during lookup; treating variant as missing"
                    );
                    dangling.push(variant.digest.clone());
                }
            }
        }

        let entry = selected.map(|(variant, body)| {
            let status = StatusCode::from_u16(variant.status).unwrap_or(StatusCode::OK);
            CachedResponse::restore(status, header_map(&variant.response_headers), body)
        });

        if !dangling.is_empty() {
            let remaining: Vec<Variant> = variants
                .iter()
                .filter(|variant| !dangling.contains(&variant.digest))
                .cloned()
                .collect();
            if let Err(err) = self.write(key, remaining).await {
                warn!(
                    target = "scorta::storage",
                    key,
                    error = %err,
                    "failed to drop dangling variants"
                );
            }
        }

        Ok(entry)
    }

    /// Persist `response` under `key`: the body goes to the entitystore, the
    /// new variant is prepended, and older variants with the same vary
    /// snapshot are displaced. The live response gains `X-Content-Digest`
    /// and an exact `Content-Length`.
    async fn store(
        &self,
        key: &str,
        facts: &RequestFacts,
        response: &mut CachedResponse,
        entities: &Arc<dyn EntityStore>,
    ) -> Result<(), StorageError> {
        let (digest, size) = entities.write(response.body().clone()).await?;

        if let Ok(value) = HeaderValue::from_str(&digest) {
            response.headers_mut().insert(CONTENT_DIGEST_HEADER, value);
        }
        if !response.headers().contains_key(header::TRANSFER_ENCODING)
            && let Ok(value) = HeaderValue::from_str(&size.to_string())
        {
            response.headers_mut().insert(header::CONTENT_LENGTH, value);
        }

        let vary = response
            .headers()
            .get(header::VARY)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string);

        let mut response_headers = header_pairs(response.headers());
        response_headers.retain(|(name, _)| !name.eq_ignore_ascii_case("age"));
        response_headers.push(("age".to_string(), "0".to_string()));

        let mut variants = self.read(key).await?;
        variants.retain(|existing| {
            if !same_vary(existing.vary(), vary.as_deref()) {
                return true;
            }
            // A `Vary: *` variant can never be selected again, so the next
            // store under the same vary displaces it unconditionally.
            let unreachable = existing.vary().map(str::trim) == Some("*");
            !(unreachable
                || requests_match(existing.vary(), &existing.request_headers, facts.headers()))
        });
        variants.insert(
            0,
            Variant {
                request_headers: header_pairs(facts.headers()),
                status: response.status().as_u16(),
                response_headers,
                digest,
                size,
            },
        );

        self.write(key, variants).await
    }

    /// Mark every variant under `key` stale, leaving bodies in place for
    /// revalidation.
    async fn invalidate(&self, key: &str) -> Result<(), StorageError> {
        let mut variants = self.read(key).await?;

        let mut changed = false;
        for variant in &mut variants {
            let status = StatusCode::from_u16(variant.status).unwrap_or(StatusCode::OK);
            let mut response = CachedResponse::restore(
                status,
                header_map(&variant.response_headers),
                Bytes::new(),
            );
            if response.fresh() {
                response.expire();
                variant.response_headers = header_pairs(response.headers());
                changed = true;
            }
        }

        if changed {
            self.write(key, variants).await
        } else {
            Ok(())
        }
    }

    /// Drop every variant under `key` and best-effort purge their blobs.
    async fn purge_key(
        &self,
        key: &str,
        entities: &Arc<dyn EntityStore>,
    ) -> Result<(), StorageError> {
        let variants = self.read(key).await.unwrap_or_default();
        for variant in &variants {
            if let Err(err) = entities.purge(&variant.digest).await {
                warn!(
                    target = "scorta::storage",
                    key,
                    digest = %variant.digest,
                    error = %err,
                    "entity purge failed"
                );
            }
        }
        self.purge(key).await
    }
}

/// In-process volatile metastore.
pub struct HeapMetaStore {
    entries: RwLock<HashMap<String, Vec<Variant>>>,
}

impl HeapMetaStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for HeapMetaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetaStore for HeapMetaStore {
    async fn read(&self, key: &str) -> Result<Vec<Variant>, StorageError> {
        Ok(rw_read(&self.entries, SOURCE, "read")
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    async fn write(&self, key: &str, variants: Vec<Variant>) -> Result<(), StorageError> {
        rw_write(&self.entries, SOURCE, "write").insert(key.to_string(), variants);
        Ok(())
    }

    async fn purge(&self, key: &str) -> Result<(), StorageError> {
        rw_write(&self.entries, SOURCE, "purge").remove(key);
        Ok(())
    }
}

/// Filesystem-backed metastore: one JSON variant list per key digest,
/// sharded as `<root>/aa/bb/<digest>.json`.
pub struct FileMetaStore {
    root: PathBuf,
}

impl FileMetaStore {
    /// Initialise the store rooted at `root`, creating the directory if
    /// necessary.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn key_path(&self, key: &str) -> PathBuf {
        let digest = content_digest(key.as_bytes());
        self.root
            .join(&digest[..2])
            .join(&digest[2..4])
            .join(format!("{digest}.json"))
    }
}

#[async_trait]
impl MetaStore for FileMetaStore {
    async fn read(&self, key: &str) -> Result<Vec<Variant>, StorageError> {
        match fs::read(self.key_path(key)).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    async fn write(&self, key: &str, variants: Vec<Variant>) -> Result<(), StorageError> {
        let path = self.key_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let encoded = serde_json::to_vec(&variants)?;
        let staging = path.with_extension(format!("tmp.{}", Uuid::new_v4()));
        let mut file = fs::File::create(&staging).await?;
        file.write_all(&encoded).await?;
        file.flush().await?;
        drop(file);

        fs::rename(&staging, &path).await?;
        Ok(())
    }

    async fn purge(&self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.key_path(key)).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::Io(err)),
        }
    }
}
