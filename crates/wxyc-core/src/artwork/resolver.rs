//! ArtworkResolver: cache first, then remote fetchers in priority order.
//!
//! Concurrent requests for the same derived key share one resolution: the
//! first caller spawns the work and parks a shared handle in the in-flight
//! table; later callers await that handle.  The work runs on its own task,
//! so a caller going away never cancels it for the others, and the entry is
//! removed by the task itself when it finishes (panics included).
//!
//! Failures are remembered in a sibling namespace of the artwork cache
//! ([`crate::ARTWORK_ERROR_NAMESPACE`]), so no release title can address a
//! negative record through the artwork keys.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{
    derived_key, error_key, Artwork, ArtworkError, ArtworkFetcher, CachedArtworkFetcher,
    ContentSafetyChecker, Safety,
};
use crate::cache::Cache;
use crate::playlist::Playcut;
use crate::record::{Lifespan, THIRTY_DAYS};

type Resolution = Shared<BoxFuture<'static, Option<Artwork>>>;

struct Inner {
    cache: Cache,
    errors: Cache,
    cache_fetcher: CachedArtworkFetcher,
    remotes: Vec<Arc<dyn ArtworkFetcher>>,
    safety: Option<Arc<dyn ContentSafetyChecker>>,
    negative_ttl: Duration,
    in_flight: Mutex<HashMap<String, Resolution>>,
}

#[derive(Clone)]
pub struct ArtworkResolver {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ArtworkResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.inner.remotes.iter().map(|r| r.name()).collect();
        f.debug_struct("ArtworkResolver")
            .field("remotes", &names)
            .field("safety", &self.inner.safety.is_some())
            .finish()
    }
}

impl ArtworkResolver {
    /// `remotes` are tried in the given order after the cache.
    pub fn new(cache: Cache, remotes: Vec<Arc<dyn ArtworkFetcher>>) -> Self {
        Self::build(cache, remotes, None, THIRTY_DAYS)
    }

    pub fn build(
        cache: Cache,
        remotes: Vec<Arc<dyn ArtworkFetcher>>,
        safety: Option<Arc<dyn ContentSafetyChecker>>,
        negative_ttl: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache_fetcher: CachedArtworkFetcher::new(cache.clone()),
                errors: cache.sibling(crate::ARTWORK_ERROR_NAMESPACE),
                cache,
                remotes,
                safety,
                negative_ttl,
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Resolve artwork for `playcut`.  Never fails; `None` means nothing
    /// usable was found (or a remembered failure is still fresh).
    pub async fn resolve(&self, playcut: &Playcut) -> Option<Artwork> {
        let key = derived_key(playcut);

        let resolution = {
            let mut in_flight = self.inner.in_flight.lock().await;
            match in_flight.get(&key) {
                Some(existing) => {
                    debug!("[artwork] joining in-flight resolution for {:?}", key);
                    existing.clone()
                }
                None => {
                    let inner = Arc::clone(&self.inner);
                    let task_key = key.clone();
                    let task_playcut = playcut.clone();
                    let task = tokio::spawn(async move {
                        let outcome = AssertUnwindSafe(inner.scan_fetchers(&task_key, &task_playcut))
                            .catch_unwind()
                            .await;
                        inner.in_flight.lock().await.remove(&task_key);
                        outcome.unwrap_or_else(|_| {
                            error!("[artwork] resolution for {:?} panicked", task_key);
                            None
                        })
                    });
                    let resolution = task.map(|joined| joined.ok().flatten()).boxed().shared();
                    in_flight.insert(key.clone(), resolution.clone());
                    resolution
                }
            }
        };

        resolution.await
    }

    /// Where failures are remembered.
    pub fn error_cache(&self) -> &Cache {
        &self.inner.errors
    }

    /// Number of resolutions currently running.
    pub async fn in_flight(&self) -> usize {
        self.inner.in_flight.lock().await.len()
    }
}

impl Inner {
    async fn scan_fetchers(&self, key: &str, playcut: &Playcut) -> Option<Artwork> {
        let error_key = error_key(key);
        if let Some(previous) = self.errors.get::<ArtworkError>(&error_key).await {
            info!(
                "[artwork] previous attempt for {:?} ended in {:?}, skipping",
                key, previous
            );
            return None;
        }

        let started = Instant::now();

        match self.cache_fetcher.fetch_artwork(playcut).await {
            Ok(artwork) => {
                debug!("[artwork] cache hit for {:?} ({} bytes)", key, artwork.len());
                return Some(artwork);
            }
            Err(e) => debug!("[artwork] {:?}: {}", key, e),
        }

        for fetcher in &self.remotes {
            let artwork = match fetcher.fetch_artwork(playcut).await {
                Ok(artwork) => artwork,
                Err(e) => {
                    info!(
                        "[artwork] no artwork for {:?} from {}: {:#}",
                        key,
                        fetcher.name(),
                        e
                    );
                    continue;
                }
            };
            info!(
                "[artwork] found artwork for {:?} via {} after {:?}",
                key,
                fetcher.name(),
                started.elapsed()
            );

            if let Some(checker) = &self.safety {
                match checker.check(&artwork).await {
                    Ok(Safety::Safe) => {}
                    Ok(Safety::Unsafe) => {
                        info!(
                            "[artwork] artwork for {:?} from {} rejected by safety check",
                            key,
                            fetcher.name()
                        );
                        self.remember_failure(&error_key, ArtworkError::Rejected).await;
                        return None;
                    }
                    Err(e) => {
                        warn!(
                            "[artwork] safety check failed for {:?} from {}: {:#}",
                            key,
                            fetcher.name(),
                            e
                        );
                        continue;
                    }
                }
            }

            if let Err(e) = self.cache.set(key, Some(&artwork), Lifespan::Forever).await {
                warn!("[artwork] failed to cache artwork for {:?}: {}", key, e);
            }
            return Some(artwork);
        }

        error!(
            "[artwork] no artwork for {:?} from any fetcher after {:?}",
            key,
            started.elapsed()
        );
        self.remember_failure(&error_key, ArtworkError::NoArtworkAvailable)
            .await;
        None
    }

    async fn remember_failure(&self, error_key: &str, failure: ArtworkError) {
        if let Err(e) = self
            .errors
            .set(error_key, Some(&failure), Lifespan::Finite(self.negative_ttl))
            .await
        {
            warn!("[artwork] failed to cache {:?} for {:?}: {}", failure, error_key, e);
        }
    }
}
