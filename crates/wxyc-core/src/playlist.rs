//! Playlist model as served by the WXYC playlist endpoint, plus the fetchers
//! that produce it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::cache::Cache;

/// Key of the playlist record inside the playlist cache namespace.
pub const PLAYLIST_CACHE_KEY: &str = "playlist";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Playcut {
    pub id: u64,
    pub hour: u64,
    #[serde(rename = "chronOrderID")]
    pub chron_order_id: u64,
    pub song_title: String,
    #[serde(default)]
    pub label_name: Option<String>,
    pub artist_name: String,
    #[serde(default)]
    pub release_title: Option<String>,
}

/// Hour-boundary marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Breakpoint {
    pub id: u64,
    pub hour: u64,
    #[serde(rename = "chronOrderID")]
    pub chron_order_id: u64,
}

/// Talk-segment marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Talkset {
    pub id: u64,
    pub hour: u64,
    #[serde(rename = "chronOrderID")]
    pub chron_order_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistEntry<'a> {
    Playcut(&'a Playcut),
    Breakpoint(&'a Breakpoint),
    Talkset(&'a Talkset),
}

impl PlaylistEntry<'_> {
    pub fn id(&self) -> u64 {
        match self {
            Self::Playcut(p) => p.id,
            Self::Breakpoint(b) => b.id,
            Self::Talkset(t) => t.id,
        }
    }

    pub fn chron_order_id(&self) -> u64 {
        match self {
            Self::Playcut(p) => p.chron_order_id,
            Self::Breakpoint(b) => b.chron_order_id,
            Self::Talkset(t) => t.chron_order_id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Playlist {
    #[serde(default)]
    pub playcuts: Vec<Playcut>,
    #[serde(default)]
    pub breakpoints: Vec<Breakpoint>,
    #[serde(default)]
    pub talksets: Vec<Talkset>,
}

impl Playlist {
    pub fn is_empty(&self) -> bool {
        self.playcuts.is_empty() && self.breakpoints.is_empty() && self.talksets.is_empty()
    }

    /// All entries, most recent first.
    pub fn entries(&self) -> Vec<PlaylistEntry<'_>> {
        let mut entries: Vec<PlaylistEntry<'_>> = self
            .playcuts
            .iter()
            .map(PlaylistEntry::Playcut)
            .chain(self.breakpoints.iter().map(PlaylistEntry::Breakpoint))
            .chain(self.talksets.iter().map(PlaylistEntry::Talkset))
            .collect();
        entries.sort_by(|a, b| b.chron_order_id().cmp(&a.chron_order_id()));
        entries
    }

    /// The playcut currently on air, if any.
    pub fn now_playing(&self) -> Option<&Playcut> {
        self.playcuts.iter().max_by_key(|p| p.chron_order_id)
    }

    pub fn entry_ids(&self) -> Vec<u64> {
        self.entries().iter().map(|e| e.id()).collect()
    }
}

// ── Fetchers ──────────────────────────────────────────────────────────────────

#[async_trait]
pub trait PlaylistFetcher: Send + Sync {
    async fn fetch_playlist(&self) -> Result<Playlist>;
}

/// Pulls the playlist JSON over HTTP.
#[derive(Debug, Clone)]
pub struct HttpPlaylistFetcher {
    client: reqwest::Client,
    url: String,
}

impl HttpPlaylistFetcher {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl PlaylistFetcher for HttpPlaylistFetcher {
    async fn fetch_playlist(&self) -> Result<Playlist> {
        let response = self
            .client
            .get(&self.url)
            .header("Accept", "application/json")
            .send()
            .await
            .context("Failed to fetch playlist")?;

        if !response.status().is_success() {
            anyhow::bail!("Playlist endpoint returned status: {}", response.status());
        }

        response
            .json::<Playlist>()
            .await
            .context("Failed to parse playlist response")
    }
}

/// Serves the last playlist written through the playlist cache.
#[derive(Debug, Clone)]
pub struct CachedPlaylistFetcher {
    cache: Cache,
}

impl CachedPlaylistFetcher {
    pub fn new(cache: Cache) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl PlaylistFetcher for CachedPlaylistFetcher {
    async fn fetch_playlist(&self) -> Result<Playlist> {
        self.cache
            .get::<Playlist>(PLAYLIST_CACHE_KEY)
            .await
            .context("No cached playlist")
    }
}

pub const DEFAULT_FETCH_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_PLAYLIST_LIFESPAN: Duration = Duration::from_secs(30);
