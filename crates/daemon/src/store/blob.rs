// Blob store seam: bundle archives in, externalized call results out.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use mcpd_common::path::bundle_entry_path;
use thiserror::Error;
use tokio::sync::RwLock;

const MEMORY_SCHEME: &str = "mem://";
const FILE_SCHEME: &str = "file://";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("invalid blob reference `{uri}`: {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("blob I/O failed for `{uri}`: {message}")]
    Io { uri: String, message: String },
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn fetch(&self, uri: &str) -> Result<Vec<u8>, BlobError>;

    /// Stores `bytes` under `key` and returns the URI to fetch them back.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String, BlobError>;
}

// ── Memory ─────────────────────────────────────────────────────────

/// Process-local blob store. URIs look like `mem://<key>`.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    fetches: AtomicUsize,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uri_for(key: &str) -> String {
        format!("{MEMORY_SCHEME}{key}")
    }

    /// Number of `fetch` calls served, hits and misses alike.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.blobs.read().await.contains_key(key)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn fetch(&self, uri: &str) -> Result<Vec<u8>, BlobError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let key = uri.strip_prefix(MEMORY_SCHEME).unwrap_or(uri);
        self.blobs.read().await.get(key).cloned().ok_or_else(|| BlobError::NotFound(uri.to_string()))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String, BlobError> {
        self.blobs.write().await.insert(key.to_string(), bytes);
        Ok(Self::uri_for(key))
    }
}

// ── Local directory ────────────────────────────────────────────────

/// Blob store rooted at a local directory. Keys are relative paths under
/// the root; URIs are `file://` absolute paths.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, uri: &str) -> Result<PathBuf, BlobError> {
        if let Some(path) = uri.strip_prefix(FILE_SCHEME) {
            let path = PathBuf::from(path);
            let escapes = path.components().any(|c| matches!(c, std::path::Component::ParentDir));
            if escapes || !path.starts_with(&self.root) {
                return Err(BlobError::InvalidUri {
                    uri: uri.to_string(),
                    reason: "outside of the blob root".to_string(),
                });
            }
            return Ok(path);
        }
        self.key_path(uri)
    }

    fn key_path(&self, key: &str) -> Result<PathBuf, BlobError> {
        let relative = bundle_entry_path(key).map_err(|error| BlobError::InvalidUri {
            uri: key.to_string(),
            reason: error.to_string(),
        })?;
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn fetch(&self, uri: &str) -> Result<Vec<u8>, BlobError> {
        let path = self.resolve(uri)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Err(BlobError::NotFound(uri.to_string())),
            Err(error) => Err(BlobError::Io { uri: uri.to_string(), message: error.to_string() }),
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<String, BlobError> {
        let path = self.key_path(key)?;
        let io_error = |error: std::io::Error| BlobError::Io { uri: key.to_string(), message: error.to_string() };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        tokio::fs::write(&path, bytes).await.map_err(io_error)?;
        Ok(format!("{FILE_SCHEME}{}", path.display()))
    }
}
