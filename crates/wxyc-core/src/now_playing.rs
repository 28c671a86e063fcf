//! NowPlayingService: the playcut on air plus its artwork.
//!
//! Subscribes to [`PlaylistService`] and republishes on a `watch` channel
//! only when the on-air playcut changes identity, so a playlist refresh that
//! merely appends a breakpoint does not trigger another artwork lookup.

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::artwork::{Artwork, ArtworkResolver};
use crate::playlist::Playcut;
use crate::playlist_service::PlaylistService;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NowPlayingItem {
    pub playcut: Playcut,
    #[serde(skip)]
    pub artwork: Option<Artwork>,
}

pub struct NowPlayingService {
    rx: watch::Receiver<Option<NowPlayingItem>>,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl std::fmt::Debug for NowPlayingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NowPlayingService")
            .field("current", &self.rx.borrow().as_ref().map(|i| i.playcut.id))
            .finish()
    }
}

impl NowPlayingService {
    /// Attach to `playlists` and start following the on-air playcut.
    pub fn start(playlists: &PlaylistService, resolver: ArtworkResolver) -> Self {
        let (tx, rx) = watch::channel(None);
        let token = CancellationToken::new();
        let mut subscription = playlists.subscribe();
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            let mut current_id: Option<u64> = None;
            loop {
                let playlist = tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    p = subscription.recv() => match p {
                        Some(p) => p,
                        None => break,
                    },
                };

                let Some(playcut) = playlist.now_playing().cloned() else {
                    debug!("[now-playing] playlist has no playcuts");
                    continue;
                };
                if current_id == Some(playcut.id) {
                    continue;
                }
                current_id = Some(playcut.id);

                let artwork = tokio::select! {
                    biased;
                    _ = task_token.cancelled() => break,
                    a = resolver.resolve(&playcut) => a,
                };
                info!(
                    "[now-playing] {} – {} (artwork: {})",
                    playcut.artist_name,
                    playcut.song_title,
                    if artwork.is_some() { "yes" } else { "no" }
                );
                tx.send_replace(Some(NowPlayingItem { playcut, artwork }));
            }
            debug!("[now-playing] follower exited");
        });

        Self { rx, token, handle }
    }

    pub fn watch(&self) -> watch::Receiver<Option<NowPlayingItem>> {
        self.rx.clone()
    }

    pub fn current(&self) -> Option<NowPlayingItem> {
        self.rx.borrow().clone()
    }

    /// Stop following; detaches from the playlist service.
    pub async fn stop(self) {
        self.token.cancel();
        let _ = self.handle.await;
        info!("[now-playing] stopped");
    }

    /// One-shot lookup that bypasses the caches for the playlist itself.
    pub async fn fetch_once(
        playlists: &PlaylistService,
        resolver: &ArtworkResolver,
    ) -> Option<NowPlayingItem> {
        let playlist = playlists.fetch_playlist(true).await?;
        let playcut = playlist.now_playing()?.clone();
        let artwork = resolver.resolve(&playcut).await;
        Some(NowPlayingItem { playcut, artwork })
    }
}

