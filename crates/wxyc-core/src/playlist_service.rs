//! PlaylistService: owns the canonical playlist and fans it out.
//!
//! The remote playlist is polled only while at least one subscriber is
//! attached.  All subscriber bookkeeping and the decision to start or stop the
//! fetch loop go through one `std::sync::Mutex<State>`, which is never held
//! across an `.await`; that single critical section is what guarantees:
//!
//!   * at most one fetch loop exists, however many subscribers race to attach;
//!   * broadcasts reach subscribers in attachment order;
//!   * `last` has one writer (the live loop) and a cancelled loop never publishes;
//!   * once the last subscriber detaches, the loop's token is cancelled and no
//!     further fetch is started (an in-flight one is abandoned).
//!
//! Each broadcast gets a sequence number under that lock.  Cache writes are
//! serialized and a write older than the last one is dropped, so a cancelled
//! loop finishing a slow write cannot leave an older playlist in the cache.
//!
//! Lifecycle:
//!
//!   Stopped ──first attach──▶ Running ──last detach / shutdown()──▶ Stopped

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::Cache;
use crate::playlist::{
    Playlist, PlaylistFetcher, DEFAULT_FETCH_INTERVAL, DEFAULT_PLAYLIST_LIFESPAN,
    PLAYLIST_CACHE_KEY,
};
use crate::record::Lifespan;

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub cache_lifespan: Lifespan,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_FETCH_INTERVAL,
            cache_lifespan: Lifespan::Finite(DEFAULT_PLAYLIST_LIFESPAN),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

// ── Shared state ──────────────────────────────────────────────────────────────

struct Subscriber {
    id: SubscriberId,
    tx: mpsc::UnboundedSender<Arc<Playlist>>,
}

struct FetchLoop {
    generation: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    last: Option<Arc<Playlist>>,
    /// Attachment order.
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
    fetch_loop: Option<FetchLoop>,
    generation: u64,
    published: u64,
}

struct Inner {
    fetcher: Arc<dyn PlaylistFetcher>,
    cache: Cache,
    settings: PollSettings,
    state: Mutex<State>,
    /// Sequence number of the playlist last written to the cache.
    cached_seq: tokio::sync::Mutex<u64>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn attach_sender(self: &Arc<Self>, tx: mpsc::UnboundedSender<Arc<Playlist>>) -> SubscriberId {
        let mut state = self.lock();
        state.next_subscriber += 1;
        let id = SubscriberId(state.next_subscriber);

        if let Some(last) = &state.last {
            let _ = tx.send(Arc::clone(last));
        }
        state.subscribers.push(Subscriber { id, tx });
        debug!(
            "[playlist] subscriber {:?} attached ({} total)",
            id,
            state.subscribers.len()
        );

        if state.fetch_loop.is_none() {
            self.start_loop(&mut state);
        }
        id
    }

    fn detach(&self, id: SubscriberId) {
        let mut state = self.lock();
        let before = state.subscribers.len();
        state.subscribers.retain(|s| s.id != id);
        if state.subscribers.len() == before {
            return;
        }
        debug!(
            "[playlist] subscriber {:?} detached ({} left)",
            id,
            state.subscribers.len()
        );
        if state.subscribers.is_empty() {
            Self::stop_loop(&mut state, "last subscriber detached");
        }
    }

    fn start_loop(self: &Arc<Self>, state: &mut State) {
        state.generation += 1;
        let generation = state.generation;
        let token = CancellationToken::new();
        let handle = tokio::spawn(run_fetch_loop(Arc::clone(self), generation, token.clone()));
        state.fetch_loop = Some(FetchLoop {
            generation,
            token,
            handle,
        });
        info!("[playlist] fetch loop #{} started", generation);
    }

    fn stop_loop(state: &mut State, reason: &str) -> Option<JoinHandle<()>> {
        let fetch_loop = state.fetch_loop.take()?;
        fetch_loop.token.cancel();
        info!(
            "[playlist] fetch loop #{} stopping: {}",
            fetch_loop.generation, reason
        );
        Some(fetch_loop.handle)
    }

    /// Called by the loop before each fetch.  Prunes subscribers whose
    /// receiving side is gone and stops the loop when nobody is left.
    fn should_fetch(&self, generation: u64, token: &CancellationToken) -> bool {
        let mut state = self.lock();
        if token.is_cancelled() {
            return false;
        }
        state.subscribers.retain(|s| !s.tx.is_closed());
        if state.subscribers.is_empty() {
            if state.fetch_loop.as_ref().map(|l| l.generation) == Some(generation) {
                Self::stop_loop(&mut state, "no live subscribers");
            }
            return false;
        }
        true
    }

    async fn publish(&self, generation: u64, token: &CancellationToken, playlist: Playlist) {
        let (playlist, seq) = {
            let mut state = self.lock();
            if token.is_cancelled() {
                debug!("[playlist] loop #{} cancelled, discarding fetch result", generation);
                return;
            }
            if state.last.as_deref() == Some(&playlist) {
                debug!(
                    "[playlist] no change ({} entries)",
                    playlist.entries().len()
                );
                return;
            }
            if playlist.is_empty() {
                info!("[playlist] remote returned an empty playlist");
            }

            let playlist = Arc::new(playlist);
            state.last = Some(Arc::clone(&playlist));
            state
                .subscribers
                .retain(|s| s.tx.send(Arc::clone(&playlist)).is_ok());
            info!(
                "[playlist] new playlist broadcast to {} subscribers, ids {:?}",
                state.subscribers.len(),
                playlist.entry_ids()
            );
            if state.subscribers.is_empty() {
                Self::stop_loop(&mut state, "no live subscribers");
            }
            state.published += 1;
            (playlist, state.published)
        };

        let mut cached_seq = self.cached_seq.lock().await;
        if *cached_seq > seq {
            debug!("[playlist] newer playlist already cached, skipping write #{}", seq);
            return;
        }
        match self
            .cache
            .set(PLAYLIST_CACHE_KEY, Some(playlist.as_ref()), self.settings.cache_lifespan)
            .await
        {
            Ok(()) => *cached_seq = seq,
            Err(e) => warn!("[playlist] failed to write playlist cache: {}", e),
        }
    }
}

async fn run_fetch_loop(inner: Arc<Inner>, generation: u64, token: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if !inner.should_fetch(generation, &token) {
            break;
        }

        debug!("[playlist] fetching remote playlist");
        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            r = inner.fetcher.fetch_playlist() => r,
        };

        match result {
            Ok(playlist) => {
                debug!(
                    "[playlist] remote fetch succeeded in {:?}, {} entries",
                    started.elapsed(),
                    playlist.entries().len()
                );
                inner.publish(generation, &token, playlist).await;
            }
            Err(e) => {
                warn!(
                    "[playlist] remote fetch failed after {:?}: {:#}",
                    started.elapsed(),
                    e
                );
            }
        }
    }

    debug!("[playlist] fetch loop #{} exited", generation);
}

// ── PlaylistService ───────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct PlaylistService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PlaylistService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("PlaylistService")
            .field("subscribers", &state.subscribers.len())
            .field("polling", &state.fetch_loop.is_some())
            .finish()
    }
}

impl PlaylistService {
    /// A zero poll interval is replaced by the default one.
    pub fn new(fetcher: Arc<dyn PlaylistFetcher>, cache: Cache, mut settings: PollSettings) -> Self {
        if settings.interval.is_zero() {
            warn!(
                "[playlist] zero poll interval, using {:?}",
                DEFAULT_FETCH_INTERVAL
            );
            settings.interval = DEFAULT_FETCH_INTERVAL;
        }
        Self {
            inner: Arc::new(Inner {
                fetcher,
                cache,
                settings,
                state: Mutex::new(State::default()),
                cached_seq: tokio::sync::Mutex::new(0),
            }),
        }
    }

    pub fn settings(&self) -> PollSettings {
        self.inner.settings
    }

    /// Attach a channel-backed subscriber.  The current playlist, if any, is
    /// delivered immediately.  Must be called inside a tokio runtime: the
    /// first subscriber spawns the fetch loop.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.attach_sender(tx);
        Subscription {
            id,
            rx,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Attach a callback.  It runs on a forwarding task, once with the
    /// current playlist (if any) and then on every change.
    pub fn attach<F>(&self, mut callback: F) -> SubscriberToken
    where
        F: FnMut(Arc<Playlist>) + Send + 'static,
    {
        let mut subscription = self.subscribe();
        let id = subscription.id();
        let handle = tokio::spawn(async move {
            while let Some(playlist) = subscription.recv().await {
                callback(playlist);
            }
        });
        SubscriberToken { id, handle }
    }

    /// Detach a callback.  When this returns the callback will not run again.
    pub async fn detach(&self, token: SubscriberToken) {
        token.handle.abort();
        // The aborted task drops its Subscription, which detaches it.
        let _ = token.handle.await;
        debug!("[playlist] callback {:?} detached", token.id);
    }

    pub fn current(&self) -> Option<Arc<Playlist>> {
        self.inner.lock().last.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    pub fn is_polling(&self) -> bool {
        self.inner.lock().fetch_loop.is_some()
    }

    /// Seed the current value from the playlist cache so early subscribers
    /// see something before the first network round-trip.  Returns whether a
    /// cached playlist was adopted.
    pub async fn warm_from_cache(&self) -> bool {
        let Some(cached) = self.inner.cache.get::<Playlist>(PLAYLIST_CACHE_KEY).await else {
            debug!("[playlist] no cached playlist to warm from");
            return false;
        };

        let mut state = self.inner.lock();
        if state.last.is_some() {
            return false;
        }
        let cached = Arc::new(cached);
        state.last = Some(Arc::clone(&cached));
        state
            .subscribers
            .retain(|s| s.tx.send(Arc::clone(&cached)).is_ok());
        info!(
            "[playlist] warmed from cache ({} entries)",
            cached.entries().len()
        );
        true
    }

    /// One-shot read outside the polling loop.  Uses the cache unless
    /// `force_sync`, then the remote fetcher.  Does not touch subscribers.
    pub async fn fetch_playlist(&self, force_sync: bool) -> Option<Playlist> {
        if !force_sync {
            if let Some(cached) = self.inner.cache.get::<Playlist>(PLAYLIST_CACHE_KEY).await {
                return Some(cached);
            }
            debug!("[playlist] no cached playlist, falling back to remote");
        }

        let started = Instant::now();
        match self.inner.fetcher.fetch_playlist().await {
            Ok(playlist) => {
                debug!("[playlist] one-shot fetch succeeded in {:?}", started.elapsed());
                Some(playlist)
            }
            Err(e) => {
                warn!(
                    "[playlist] one-shot fetch failed after {:?}: {:#}",
                    started.elapsed(),
                    e
                );
                None
            }
        }
    }

    /// Stop polling and disconnect every current subscriber (their streams
    /// end).  Waits for the fetch loop to exit.
    pub async fn shutdown(&self) {
        let handle = {
            let mut state = self.inner.lock();
            state.subscribers.clear();
            Inner::stop_loop(&mut state, "shutdown")
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("[playlist] service shut down");
    }
}

// ── Subscribers ───────────────────────────────────────────────────────────────

/// Channel-backed subscription.  Dropping it detaches.
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::UnboundedReceiver<Arc<Playlist>>,
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next playlist.  `None` once the service has shut down.
    pub async fn recv(&mut self) -> Option<Arc<Playlist>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<Playlist>> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.detach(self.id);
    }
}

impl Stream for Subscription {
    type Item = Arc<Playlist>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

#[must_use = "dropping the token leaves the callback attached forever"]
#[derive(Debug)]
pub struct SubscriberToken {
    id: SubscriberId,
    handle: JoinHandle<()>,
}

impl SubscriberToken {
    pub fn id(&self) -> SubscriberId {
        self.id
    }
}
