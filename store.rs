//! Object storage backends.
//!
//! [`ObjectStore`] is the interface the upload coordinator streams into: a
//! body of unknown length, a key and the transform metadata. Two backends
//! ship with the crate:
//!
//! - [`MemoryStore`] keeps objects in memory (tests, dry runs)
//! - [`FsStore`] writes objects under `root/<bucket>/<key>` with a JSON
//!   sidecar `<key>.meta.json` holding the metadata

use crate::error::StoreError;
use crate::metadata::Metadata;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Object body: chunks of bytes, total length unknown up front
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

const SIDECAR_SUFFIX: &str = ".meta.json";
const PARTIAL_SUFFIX: &str = ".partial";

/// Result of a successful put
#[derive(Debug, Clone)]
pub struct PutResult {
    pub size_bytes: u64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store everything `body` yields as `bucket/key` with `metadata` attached.
    /// An error from `body` fails the put and leaves no object behind.
    async fn put_stream(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
        metadata: Metadata,
    ) -> Result<PutResult, StoreError>;
}

/// A stored object and its metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub metadata: Metadata,
}

/// In-memory object store.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<(String, String), StoredObject>>,
    puts: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// Keys stored in `bucket`, sorted
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.objects
            .lock()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    /// Number of `put_stream` calls received, failed ones included
    pub fn put_calls(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put_stream(
        &self,
        bucket: &str,
        key: &str,
        mut body: ByteStream,
        metadata: Metadata,
    ) -> Result<PutResult, StoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        validate_key(key)?;

        let mut data = Vec::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(StoreError::body)?;
            data.extend_from_slice(&chunk);
        }

        let size_bytes = data.len() as u64;
        self.objects.lock().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject { data, metadata },
        );
        debug!(bucket, key, size = size_bytes, "object stored in memory");
        Ok(PutResult { size_bytes })
    }
}

/// Sidecar record written next to every object in an [`FsStore`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub key: String,
    pub size: u64,
    pub metadata: Metadata,
}

/// Filesystem-backed object store.
pub struct FsStore {
    root: PathBuf,
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::invalid("object key cannot be empty"));
    }
    let normal = Path::new(key)
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if !normal {
        return Err(StoreError::invalid(format!(
            "object key '{}' must be a relative path without '.' or '..'",
            key
        )));
    }
    if key.ends_with(SIDECAR_SUFFIX) || key.ends_with(PARTIAL_SUFFIX) {
        return Err(StoreError::invalid(format!(
            "object key '{}' uses a reserved suffix",
            key
        )));
    }
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(bucket)?;
        validate_key(key)?;
        Ok(self.root.join(bucket).join(key))
    }

    /// Check if an object exists
    pub async fn exists(&self, bucket: &str, key: &str) -> bool {
        match self.object_path(bucket, key) {
            Ok(path) => fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Read a whole object into memory
    pub async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.object_path(bucket, key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::not_found(bucket, key)),
            Err(e) => Err(e.into()),
        }
    }

    /// Read the sidecar record for an object
    pub async fn head(&self, bucket: &str, key: &str) -> Result<ObjectRecord, StoreError> {
        let path = self.object_path(bucket, key)?;
        let content = match fs::read_to_string(with_suffix(&path, SIDECAR_SUFFIX)).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::not_found(bucket, key));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&content)?)
    }

    /// Delete an object and its sidecar. Deleting a missing object succeeds.
    pub async fn delete(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        let path = self.object_path(bucket, key)?;
        if fs::try_exists(&path).await.unwrap_or(false) {
            fs::remove_file(&path).await?;
            debug!(bucket, key, "object deleted");
        } else {
            warn!(bucket, key, "object not found during delete");
        }
        // Best effort, don't fail if missing
        fs::remove_file(with_suffix(&path, SIDECAR_SUFFIX)).await.ok();
        Ok(())
    }

    /// List all objects in `bucket`, sorted by key
    pub async fn list(&self, bucket: &str) -> Result<Vec<ObjectRecord>, StoreError> {
        validate_key(bucket)?;
        let bucket_root = self.root.join(bucket);
        let mut records = Vec::new();

        if !fs::try_exists(&bucket_root).await.unwrap_or(false) {
            return Ok(records);
        }

        let mut pending = vec![bucket_root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }

                let name = entry.file_name().to_string_lossy().into_owned();
                if name.ends_with(SIDECAR_SUFFIX) || name.ends_with(PARTIAL_SUFFIX) {
                    continue;
                }

                let key = match path.strip_prefix(&bucket_root) {
                    Ok(rel) => rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/"),
                    Err(_) => continue,
                };

                let record = match self.head(bucket, &key).await {
                    Ok(record) => record,
                    Err(StoreError::NotFound { .. }) => {
                        warn!(bucket, key = %key, "object has no metadata sidecar");
                        ObjectRecord {
                            key: key.clone(),
                            size: entry.metadata().await?.len(),
                            metadata: Metadata::new(),
                        }
                    }
                    Err(e) => return Err(e),
                };
                records.push(record);
            }
        }

        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }

    async fn write_body(path: &Path, mut body: ByteStream) -> Result<u64, StoreError> {
        let mut file = fs::File::create(path).await?;
        let mut size = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(StoreError::body)?;
            file.write_all(&chunk).await?;
            size += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(size)
    }

    /// Move a complete body into place, then write its sidecar. An object
    /// whose sidecar cannot be written is removed again.
    async fn commit(
        partial: &Path,
        path: &Path,
        key: &str,
        size: u64,
        metadata: Metadata,
    ) -> Result<u64, StoreError> {
        let record = ObjectRecord {
            key: key.to_string(),
            size,
            metadata,
        };
        let json = serde_json::to_string_pretty(&record)?;
        fs::rename(partial, path).await?;

        if let Err(e) = fs::write(with_suffix(path, SIDECAR_SUFFIX), json).await {
            fs::remove_file(path).await.ok();
            fs::remove_file(with_suffix(path, SIDECAR_SUFFIX)).await.ok();
            return Err(e.into());
        }
        Ok(size)
    }
}

#[async_trait]
impl ObjectStore for FsStore {
    async fn put_stream(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
        metadata: Metadata,
    ) -> Result<PutResult, StoreError> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let partial = with_suffix(&path, PARTIAL_SUFFIX);
        let result = match Self::write_body(&partial, body).await {
            Ok(size) => Self::commit(&partial, &path, key, size, metadata).await,
            Err(e) => Err(e),
        };
        let size = match result {
            Ok(size) => size,
            Err(e) => {
                fs::remove_file(&partial).await.ok();
                warn!(bucket, key, error = %e, "upload aborted, partial object removed");
                return Err(e);
            }
        };

        info!(bucket, key, size, "object stored");
        Ok(PutResult { size_bytes: size })
    }
}
