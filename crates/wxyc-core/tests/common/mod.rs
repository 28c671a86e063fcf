#![allow(dead_code)]

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use wxyc_core::artwork::{Artwork, ArtworkFetcher, ContentSafetyChecker, Safety};
use wxyc_core::playlist::{Breakpoint, Playcut, Playlist, PlaylistFetcher};
use wxyc_core::store::MemoryStore;
use wxyc_core::Cache;

pub fn playcut(id: u64, artist: &str, song: &str, release: Option<&str>) -> Playcut {
    Playcut {
        id,
        hour: 1_700_000_000_000,
        chron_order_id: id,
        song_title: song.to_string(),
        label_name: None,
        artist_name: artist.to_string(),
        release_title: release.map(str::to_string),
    }
}

/// Playlist whose newest playcut has id `head`.
pub fn playlist(head: u64) -> Playlist {
    let song = format!("Song {head}");
    let release = format!("Release {head}");
    Playlist {
        playcuts: vec![
            playcut(head, "Stereolab", &song, Some(release.as_str())),
            playcut(head - 1, "Broadcast", "Come On Let's Go", Some("Work and Non Work")),
        ],
        breakpoints: vec![Breakpoint {
            id: head + 1000,
            hour: 1_700_000_000_000,
            chron_order_id: head - 2,
        }],
        talksets: vec![],
    }
}

pub fn memory_cache(namespace: &str) -> Cache {
    Cache::new(Arc::new(MemoryStore::new()), namespace)
}

pub fn png(tag: u8) -> Artwork {
    Artwork::new(vec![0x89, b'P', b'N', b'G', tag], "image/png")
}

// ── Playlist fetchers ─────────────────────────────────────────────────────────

/// Serves scripted responses in order, then repeats the last one.  Counts
/// every call and optionally sleeps before answering.
pub struct ScriptedPlaylistFetcher {
    responses: Mutex<VecDeque<Result<Playlist, String>>>,
    last: Mutex<Option<Result<Playlist, String>>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedPlaylistFetcher {
    pub fn new(responses: Vec<Result<Playlist, String>>) -> Arc<Self> {
        Self::with_delay(responses, Duration::ZERO)
    }

    pub fn with_delay(responses: Vec<Result<Playlist, String>>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            last: Mutex::new(None),
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn always(playlist: Playlist) -> Arc<Self> {
        Self::new(vec![Ok(playlist)])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlaylistFetcher for ScriptedPlaylistFetcher {
    async fn fetch_playlist(&self) -> Result<Playlist> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = {
            let mut responses = self.responses.lock().unwrap();
            let mut last = self.last.lock().unwrap();
            if let Some(r) = responses.pop_front() {
                *last = Some(r);
            }
            last.clone()
        };
        match next {
            Some(Ok(p)) => Ok(p),
            Some(Err(e)) => bail!(e),
            None => bail!("no scripted response"),
        }
    }
}

// ── Artwork fetchers ──────────────────────────────────────────────────────────

/// Returns a fixed outcome, counting calls and recording the shared call log.
pub struct CountingArtworkFetcher {
    name: String,
    outcome: Option<Artwork>,
    delay: Duration,
    calls: AtomicUsize,
    log: Arc<Mutex<Vec<String>>>,
}

impl CountingArtworkFetcher {
    pub fn new(
        name: &str,
        outcome: Option<Artwork>,
        delay: Duration,
        log: Arc<Mutex<Vec<String>>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            outcome,
            delay,
            calls: AtomicUsize::new(0),
            log,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArtworkFetcher for CountingArtworkFetcher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_artwork(&self, _playcut: &Playcut) -> Result<Artwork> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push(self.name.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.outcome {
            Some(a) => Ok(a.clone()),
            None => bail!("{} has nothing", self.name),
        }
    }
}

pub struct FixedSafety {
    pub verdict: Result<Safety, String>,
    pub calls: AtomicUsize,
}

impl FixedSafety {
    pub fn new(verdict: Result<Safety, String>) -> Arc<Self> {
        Arc::new(Self {
            verdict,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ContentSafetyChecker for FixedSafety {
    async fn check(&self, _artwork: &Artwork) -> Result<Safety> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.verdict {
            Ok(v) => Ok(*v),
            Err(e) => bail!(e.clone()),
        }
    }
}
