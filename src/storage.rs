//! Object storage for deployment files
//!
//! Objects are addressed by flat keys of the form `<prefix><path>`. Uploads
//! consume a byte stream and only become visible once the stream finishes
//! without error.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use hyper::body::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

/// A boxed stream of file content
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store the stream under `key`, returning the number of bytes written
    async fn upload(&self, key: &str, body: ByteStream) -> Result<u64, StorageError>;

    async fn get(&self, key: &str) -> Result<Bytes, StorageError>;
}

/// Reject keys that could leave the storage namespace
fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() || key.ends_with('/') {
        return Err(StorageError::InvalidKey(format!("not an object key: {key}")));
    }
    if key.starts_with('/') || key.contains('\\') || key.contains('\0') {
        return Err(StorageError::InvalidKey(format!(
            "path traversal not allowed: {key}"
        )));
    }
    if key
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(StorageError::InvalidKey(format!(
            "contains unsafe path component: {key}"
        )));
    }
    Ok(())
}

/// Stores objects as files below a root directory
pub struct FilesystemStorage {
    root: PathBuf,
}

impl FilesystemStorage {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn key_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

async fn write_stream(path: &Path, mut body: ByteStream) -> io::Result<u64> {
    let mut file = fs::File::create(path).await?;
    let mut written = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}

#[async_trait]
impl ObjectStorage for FilesystemStorage {
    async fn upload(&self, key: &str, body: ByteStream) -> Result<u64, StorageError> {
        let path = self.key_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = path.with_file_name(format!(".{}.tmp.{}", file_name, Uuid::new_v4().simple()));

        match write_stream(&temp_path, body).await {
            Ok(written) => {
                fs::rename(&temp_path, &path).await?;
                debug!(key, bytes = written, "Stored object");
                Ok(written)
            }
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(StorageError::Io(e))
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        let path = self.key_path(key)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Bytes::from(fs::read(&path).await?)),
            Ok(_) => Err(StorageError::NotFound(key.to_string())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

/// In-process storage, used by the `memory` backend and tests
#[derive(Default)]
pub struct MemoryStorage {
    objects: DashMap<String, Bytes>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored keys in sorted order
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn upload(&self, key: &str, mut body: ByteStream) -> Result<u64, StorageError> {
        validate_key(key)?;
        let mut data = Vec::new();
        while let Some(chunk) = body.next().await {
            data.extend_from_slice(&chunk?);
        }
        let written = data.len() as u64;
        self.objects.insert(key.to_string(), Bytes::from(data));
        Ok(written)
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        validate_key(key)?;
        self.objects
            .get(key)
            .map(|e| e.value().clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}
