//! Namespaced TTL cache over a shared [`KvStore`].
//!
//! Reads are expiry-aware: an expired record is reported once as
//! [`Lookup::Expired`] and deleted in the same call.  Consumers that do not
//! care about the distinction use [`Cache::get`], which folds expiry, misses,
//! storage failures and corrupt bytes into `None`.
//!
//! Cleanup deletes are conditional: the key is re-read under the cache's
//! write lock and only removed if it still holds what was judged stale, so a
//! write that lands between the read and the delete survives.

use crate::record::{CacheRecord, Clock, Lifespan, SystemClock};
use crate::store::{KvStore, StoreError};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("corrupt cache record for {key:?}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode cache record for {key:?}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Outcome of an expiry-aware read.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Hit(T),
    Miss,
    /// Was present but stale; the record has been deleted unless it was
    /// rewritten in the meantime.
    Expired,
}

impl<T> Lookup<T> {
    pub fn hit(self) -> Option<T> {
        match self {
            Lookup::Hit(v) => Some(v),
            Lookup::Miss | Lookup::Expired => None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeReport {
    pub scanned: usize,
    pub expired: usize,
    pub superseded: usize,
    pub corrupt: usize,
}

impl PurgeReport {
    pub fn removed(&self) -> usize {
        self.expired + self.superseded + self.corrupt
    }
}

#[derive(Clone)]
pub struct Cache {
    store: Arc<dyn KvStore>,
    namespace: String,
    clock: Arc<dyn Clock>,
    /// Serializes writes through this cache (and its clones) with the
    /// re-read of a conditional delete.
    write_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl Cache {
    pub fn new(store: Arc<dyn KvStore>, namespace: impl Into<String>) -> Self {
        Self::with_clock(store, namespace, Arc::new(SystemClock))
    }

    /// # Panics
    ///
    /// If `namespace` is empty or contains `.`, the separator between
    /// namespace and key in the store.
    pub fn with_clock(
        store: Arc<dyn KvStore>,
        namespace: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let namespace = namespace.into();
        assert!(
            !namespace.is_empty() && !namespace.contains('.'),
            "invalid cache namespace {:?}",
            namespace
        );
        Self {
            store,
            namespace,
            clock,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Another namespace over the same store and clock.
    pub fn sibling(&self, namespace: impl Into<String>) -> Self {
        Self::with_clock(Arc::clone(&self.store), namespace, Arc::clone(&self.clock))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn prefix(&self) -> String {
        format!("{}.", self.namespace)
    }

    fn store_key(&self, key: &str) -> String {
        format!("{}.{}", self.namespace, key)
    }

    pub async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Result<Lookup<T>, CacheError> {
        let store_key = self.store_key(key);
        let Some(bytes) = self.store.get(&store_key).await? else {
            return Ok(Lookup::Miss);
        };

        let record: CacheRecord<T> =
            serde_json::from_slice(&bytes).map_err(|source| CacheError::Decode {
                key: key.to_string(),
                source,
            })?;

        if record.is_expired(self.clock.now()) {
            debug!("[cache] {}: expired, deleting", store_key);
            self.delete_if(&store_key, |current| current == bytes.as_slice())
                .await?;
            return Ok(Lookup::Expired);
        }

        Ok(Lookup::Hit(record.value))
    }

    /// Consumer-facing read.  Never fails: anything but a fresh hit is `None`.
    /// Corrupt records are deleted so the next write starts clean.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.lookup(key).await {
            Ok(lookup) => lookup.hit(),
            Err(CacheError::Decode { key, source }) => {
                warn!("[cache] {}.{}: undecodable record, deleting: {}", self.namespace, key, source);
                let still_corrupt =
                    |current: &[u8]| serde_json::from_slice::<CacheRecord<T>>(current).is_err();
                if let Err(e) = self.delete_if(&self.store_key(&key), still_corrupt).await {
                    warn!("[cache] failed to delete corrupt record {}: {}", key, e);
                }
                None
            }
            Err(e) => {
                warn!("[cache] {}.{}: read failed: {}", self.namespace, key, e);
                None
            }
        }
    }

    /// `None` deletes the key.
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: Option<&T>,
        lifespan: Lifespan,
    ) -> Result<(), CacheError> {
        let store_key = self.store_key(key);
        let _guard = self.write_lock.lock().await;
        let Some(value) = value else {
            debug!("[cache] {}: cleared", store_key);
            self.store.set(&store_key, None).await?;
            return Ok(());
        };

        let record = CacheRecord::new(value, lifespan, self.clock.now());
        let bytes = serde_json::to_vec(&record).map_err(|source| CacheError::Encode {
            key: key.to_string(),
            source,
        })?;
        debug!("[cache] {}: set ({} bytes, lifespan {:?})", store_key, bytes.len(), lifespan);
        self.store.set(&store_key, Some(&bytes)).await?;
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.set::<()>(key, None, Lifespan::Forever).await
    }

    /// Deletes `store_key` only if its current bytes are still `stale`.
    async fn delete_if(
        &self,
        store_key: &str,
        stale: impl Fn(&[u8]) -> bool,
    ) -> Result<bool, CacheError> {
        let _guard = self.write_lock.lock().await;
        match self.store.get(store_key).await? {
            Some(current) if stale(&current) => {
                self.store.set(store_key, None).await?;
                Ok(true)
            }
            Some(_) => {
                debug!("[cache] {}: rewritten since read, keeping", store_key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Startup sweep over this namespace: drops expired records, permanent
    /// records in a superseded format, and anything that does not decode.
    pub async fn purge(&self) -> Result<PurgeReport, CacheError> {
        let prefix = self.prefix();
        let now = self.clock.now();
        let mut report = PurgeReport::default();

        for (store_key, bytes) in self.store.entries().await? {
            if !store_key.starts_with(&prefix) {
                continue;
            }
            report.scanned += 1;

            match serde_json::from_slice::<CacheRecord<IgnoredAny>>(&bytes) {
                Ok(record) if record.is_expired(now) => report.expired += 1,
                Ok(record) if record.is_superseded() => report.superseded += 1,
                Ok(_) => continue,
                Err(e) => {
                    warn!("[cache] {}: corrupt record, deleting: {}", store_key, e);
                    report.corrupt += 1;
                }
            }
            self.delete_if(&store_key, |current| current == bytes.as_slice())
                .await?;
        }

        info!(
            "[cache] purged namespace {}: scanned={} expired={} superseded={} corrupt={}",
            self.namespace, report.scanned, report.expired, report.superseded, report.corrupt
        );
        Ok(report)
    }
}
