//! Byte-oriented key/value persistence underneath the TTL caches.
//!
//! The store knows nothing about records or expiry; it only moves bytes.
//! Several [`crate::cache::Cache`] instances may share one store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid store key: {0:?}")]
    InvalidKey(String),
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// `None` deletes the key.  Deleting a missing key is not an error.
    async fn set(&self, key: &str, value: Option<&[u8]>) -> Result<(), StoreError>;

    /// Snapshot of every `(key, bytes)` pair currently stored.
    async fn entries(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError>;
}

// ── MemoryStore ───────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MemoryStore {
    map: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.map.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.map.read().await.is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.map.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Option<&[u8]>) -> Result<(), StoreError> {
        let mut map = self.map.write().await;
        match value {
            Some(bytes) => {
                map.insert(key.to_string(), bytes.to_vec());
            }
            None => {
                map.remove(key);
            }
        }
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        Ok(self
            .map
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

// ── FileStore ─────────────────────────────────────────────────────────────────

/// One file per key.  File names are the hex-encoded key, so arbitrary keys
/// (release titles with slashes, unicode, …) are safe and recoverable.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

const FILE_SUFFIX: &str = ".rec";

/// Distinguishes temp files of concurrent writers to the same key.
static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

impl FileStore {
    /// Creates `dir` if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        debug!("[store] file store at {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{}{}", hex::encode(key), FILE_SUFFIX)))
    }

    fn tmp_path_for(&self, key: &str) -> PathBuf {
        let n = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.dir
            .join(format!("{}.{}-{}.tmp", hex::encode(key), std::process::id(), n))
    }

    fn key_for(file_name: &str) -> Option<String> {
        let stem = file_name.strip_suffix(FILE_SUFFIX)?;
        let raw = hex::decode(stem).ok()?;
        String::from_utf8(raw).ok()
    }
}

#[async_trait]
impl KvStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: Option<&[u8]>) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match value {
            Some(bytes) => {
                // Write to a sibling temp file then rename so readers never see a torn record.
                let tmp = self.tmp_path_for(key);
                if let Err(e) = tokio::fs::write(&tmp, bytes).await {
                    let _ = tokio::fs::remove_file(&tmp).await;
                    return Err(e.into());
                }
                tokio::fs::rename(&tmp, &path).await?;
                Ok(())
            }
            None => match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }

    async fn entries(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mut out = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(key) = name.to_str().and_then(Self::key_for) else {
                continue;
            };
            match tokio::fs::read(entry.path()).await {
                Ok(bytes) => out.push((key, bytes)),
                // Deleted between listing and reading.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("[store] skipping unreadable {}: {}", entry.path().display(), e),
            }
        }
        Ok(out)
    }
}
