//! Object storage
//!
//! The pipeline only ever needs three calls: fetch a blob, write a blob and
//! list blobs under a prefix. Paths are slash-separated keys relative to the
//! bucket.

use crate::error::StoreError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Content type for JSON artifacts
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Capability: blob storage
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the blob at `path`
    ///
    /// # Errors
    /// [`StoreError::NotFound`] if there is none
    async fn get(&self, path: &str) -> Result<Vec<u8>, StoreError>;

    /// Write (or overwrite) the blob at `path`
    ///
    /// # Errors
    /// Backend failures
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), StoreError>;

    /// Paths of all blobs starting with `prefix`, sorted
    ///
    /// # Errors
    /// Backend failures
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Join an object prefix and a name with exactly one slash
#[must_use]
pub fn join_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    content_type: String,
}

/// In-memory store, for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: DashMap<String, StoredObject>,
}

impl MemoryObjectStore {
    /// Create an empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With a pre-populated blob
    #[must_use]
    pub fn with_object(self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.insert(path, bytes);
        self
    }

    /// Insert a blob synchronously
    pub fn insert(&self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.objects.insert(
            path.into(),
            StoredObject {
                bytes: bytes.into(),
                content_type: JSON_CONTENT_TYPE.to_string(),
            },
        );
    }

    /// Read a blob synchronously
    #[must_use]
    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.get(path).map(|entry| entry.bytes.clone())
    }

    /// Content type a blob was written with
    #[must_use]
    pub fn content_type(&self, path: &str) -> Option<String> {
        self.objects.get(path).map(|entry| entry.content_type.clone())
    }

    /// All keys, sorted
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        self.read(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), StoreError> {
        self.objects.insert(
            path.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// A local directory used as a bucket
///
/// Writes go to a hidden temporary file next to the target and are renamed
/// into place, so readers never see a half-written checkpoint.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Store rooted at `root`
    #[inline]
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(key);
        let clean = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if clean {
            Ok(self.root.join(relative))
        } else {
            Err(StoreError::InvalidPath(key.to_string()))
        }
    }

    fn io_error(key: &str) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
        move |source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(key.to_string())
            } else {
                StoreError::Io {
                    path: key.to_string(),
                    source,
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let file = self.resolve(path)?;
        tokio::fs::read(&file).await.map_err(Self::io_error(path))
    }

    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), StoreError> {
        let file = self.resolve(path)?;
        let parent = file
            .parent()
            .ok_or_else(|| StoreError::InvalidPath(path.to_string()))?;
        let name = file
            .file_name()
            .ok_or_else(|| StoreError::InvalidPath(path.to_string()))?
            .to_string_lossy();

        tokio::fs::create_dir_all(parent)
            .await
            .map_err(Self::io_error(path))?;

        let temp = parent.join(format!(".{name}.{}.tmp", ulid::Ulid::new()));
        tokio::fs::write(&temp, &bytes)
            .await
            .map_err(Self::io_error(path))?;
        if let Err(err) = tokio::fs::rename(&temp, &file).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(Self::io_error(path)(err));
        }

        debug!(path, content_type, bytes = bytes.len(), "object written");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];

        while let Some((dir, key_prefix)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(Self::io_error(prefix)(err)),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(Self::io_error(prefix))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                let key = join_key(&key_prefix, &name);
                let file_type = entry.file_type().await.map_err(Self::io_error(prefix))?;
                if file_type.is_dir() {
                    pending.push((entry.path(), key));
                } else if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}
