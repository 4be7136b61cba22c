//! Store resolution.
//!
//! [`StoreUri`] parses the configured store locations and [`Storage`]
//! resolves them to shared instances, caching each resolution so every layer
//! pointing at the same URI shares one store. A lazily initialized process
//! default is available through [`default_storage`] for layers that do not
//! inject their own resolver.

pub mod entity;
pub mod meta;

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, OnceLock, RwLock},
};

pub use entity::{EntityBody, EntityStore, FileEntityStore, HeapEntityStore, content_digest};
pub use meta::{FileMetaStore, HeapMetaStore, MetaStore, Variant};

use crate::error::StorageError;
use crate::lock::{rw_read, rw_write};

const SOURCE: &str = "storage::resolver";

/// Parsed store location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreUri {
    /// In-process volatile store; distinct names resolve to distinct stores.
    Heap { name: String },
    /// Filesystem-backed store rooted at `path`.
    File { path: PathBuf },
    /// Network-attached memcached store. Parsed for configuration
    /// round-tripping; no backend ships for it.
    Memcached {
        server: String,
        namespace: Option<String>,
    },
}

impl StoreUri {
    pub fn parse(uri: &str) -> Result<Self, StorageError> {
        let Some((scheme, rest)) = uri.split_once(':') else {
            return Err(StorageError::configuration(format!(
                "store uri `{uri}` has no scheme"
            )));
        };

        match scheme {
            "heap" => Ok(Self::Heap {
                name: rest.to_string(),
            }),
            "file" => {
                let path = rest.strip_prefix("//").unwrap_or(rest);
                if path.is_empty() {
                    Err(StorageError::configuration(format!(
                        "file store uri `{uri}` has no path"
                    )))
                } else {
                    Ok(Self::File {
                        path: PathBuf::from(path),
                    })
                }
            }
            "memcached" | "memcache" => {
                let rest = rest.trim_start_matches('/');
                let (server, namespace) = match rest.split_once('/') {
                    Some((server, namespace)) if !namespace.is_empty() => {
                        (server, Some(namespace.to_string()))
                    }
                    Some((server, _)) => (server, None),
                    None => (rest, None),
                };
                if server.is_empty() {
                    return Err(StorageError::configuration(format!(
                        "memcached store uri `{uri}` has no server"
                    )));
                }
                Ok(Self::Memcached {
                    server: server.to_string(),
                    namespace,
                })
            }
            other => Err(StorageError::unsupported_scheme(other)),
        }
    }
}

/// Resolves store URIs to shared instances, caching each resolution.
pub struct Storage {
    metastores: RwLock<HashMap<String, Arc<dyn MetaStore>>>,
    entitystores: RwLock<HashMap<String, Arc<dyn EntityStore>>>,
}

impl Storage {
    pub fn new() -> Self {
        Self {
            metastores: RwLock::new(HashMap::new()),
            entitystores: RwLock::new(HashMap::new()),
        }
    }

    pub fn metastore(&self, uri: &str) -> Result<Arc<dyn MetaStore>, StorageError> {
        if let Some(found) = rw_read(&self.metastores, SOURCE, "metastore").get(uri) {
            return Ok(found.clone());
        }

        let resolved: Arc<dyn MetaStore> = match StoreUri::parse(uri)? {
            StoreUri::Heap { .. } => Arc::new(HeapMetaStore::new()),
            StoreUri::File { path } => Arc::new(FileMetaStore::new(path)?),
            StoreUri::Memcached { .. } => {
                return Err(StorageError::unsupported_scheme("memcached"));
            }
        };

        let mut stores = rw_write(&self.metastores, SOURCE, "metastore");
        Ok(stores.entry(uri.to_string()).or_insert(resolved).clone())
    }

    pub fn entitystore(&self, uri: &str) -> Result<Arc<dyn EntityStore>, StorageError> {
        if let Some(found) = rw_read(&self.entitystores, SOURCE, "entitystore").get(uri) {
            return Ok(found.clone());
        }

        let resolved: Arc<dyn EntityStore> = match StoreUri::parse(uri)? {
            StoreUri::Heap { .. } => Arc::new(HeapEntityStore::new()),
            StoreUri::File { path } => Arc::new(FileEntityStore::new(path)?),
            StoreUri::Memcached { .. } => {
                return Err(StorageError::unsupported_scheme("memcached"));
            }
        };

        let mut stores = rw_write(&self.entitystores, SOURCE, "entitystore");
        Ok(stores.entry(uri.to_string()).or_insert(resolved).clone())
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide default resolver, initialized on first use.
pub fn default_storage() -> Arc<Storage> {
    static DEFAULT: OnceLock<Arc<Storage>> = OnceLock::new();
    DEFAULT.get_or_init(|| Arc::new(Storage::new())).clone()
}
