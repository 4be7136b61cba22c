//! Content-addressed body blob stores.
//!
//! Bodies are stored under the lowercase SHA-256 hex of their content, so
//! writes are idempotent and identical bodies share one blob. The file
//! backend writes through a temp file and renames, keeping partial blobs
//! invisible to concurrent readers.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::RwLock,
};

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::{
    fs,
    io::{AsyncRead, AsyncWriteExt},
};
use uuid::Uuid;

use crate::error::StorageError;
use crate::lock::{rw_read, rw_write};

const SOURCE: &str = "storage::entity";

/// Streaming reader over a stored blob.
pub type EntityBody = Box<dyn AsyncRead + Send + Unpin>;

/// Lowercase hex SHA-256 of the content.
pub fn content_digest(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Content-addressed store of response bodies.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Open a streaming reader over the blob, if present.
    async fn open(&self, digest: &str) -> Result<Option<EntityBody>, StorageError>;

    /// Read the whole blob into memory, if present.
    async fn read(&self, digest: &str) -> Result<Option<Bytes>, StorageError>;

    /// Write a blob, returning its digest and size. Idempotent.
    async fn write(&self, body: Bytes) -> Result<(String, u64), StorageError>;

    /// Delete a blob. Missing blobs are treated as success.
    async fn purge(&self, digest: &str) -> Result<(), StorageError>;
}

/// In-process volatile blob store.
pub struct HeapEntityStore {
    blobs: RwLock<HashMap<String, Bytes>>,
}

impl HeapEntityStore {
    pub fn new() -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for HeapEntityStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EntityStore for HeapEntityStore {
    async fn open(&self, digest: &str) -> Result<Option<EntityBody>, StorageError> {
        let blob = rw_read(&self.blobs, SOURCE, "open").get(digest).cloned();
        Ok(blob.map(|bytes| Box::new(std::io::Cursor::new(bytes)) as EntityBody))
    }

    async fn read(&self, digest: &str) -> Result<Option<Bytes>, StorageError> {
        Ok(rw_read(&self.blobs, SOURCE, "read").get(digest).cloned())
    }

    async fn write(&self, body: Bytes) -> Result<(String, u64), StorageError> {
        let digest = content_digest(&body);
        let size = body.len() as u64;
        rw_write(&self.blobs, SOURCE, "write")
            .entry(digest.clone())
            .or_insert(body);
        Ok((digest, size))
    }

    async fn purge(&self, digest: &str) -> Result<(), StorageError> {
        rw_write(&self.blobs, SOURCE, "purge").remove(digest);
        Ok(())
    }
}

/// Filesystem-backed blob store: `<root>/aa/bb/<digest>`.
pub struct FileEntityStore {
    root: PathBuf,
}

impl FileEntityStore {
    /// Initialise the store rooted at `root`, creating the directory if
    /// necessary.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        if digest.len() < 4 {
            return self.root.join(digest);
        }
        self.root
            .join(&digest[..2])
            .join(&digest[2..4])
            .join(digest)
    }
}

#[async_trait]
impl EntityStore for FileEntityStore {
    async fn open(&self, digest: &str) -> Result<Option<EntityBody>, StorageError> {
        match fs::File::open(self.blob_path(digest)).await {
            Ok(file) => Ok(Some(Box::new(file) as EntityBody)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    async fn read(&self, digest: &str) -> Result<Option<Bytes>, StorageError> {
        match fs::read(self.blob_path(digest)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    async fn write(&self, body: Bytes) -> Result<(String, u64), StorageError> {
        let digest = content_digest(&body);
        let size = body.len() as u64;
        let path = self.blob_path(&digest);

        // Identical content is already on disk under the same digest.
        if fs::metadata(&path).await.is_ok() {
            return Ok((digest, size));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let staging = path.with_extension(format!("tmp.{}", Uuid::new_v4()));
        let mut file = fs::File::create(&staging).await?;
        file.write_all(&body).await?;
        file.flush().await?;
        drop(file);

        fs::rename(&staging, &path).await?;
        Ok((digest, size))
    }

    async fn purge(&self, digest: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.blob_path(digest)).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::Io(err)),
        }
    }
}
