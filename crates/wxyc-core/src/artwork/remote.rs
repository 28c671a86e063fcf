//! Remote artwork databases.  Each fetcher runs one metadata lookup and one
//! image download; any miss or transport failure is an `Err` and the
//! resolver moves on to the next fetcher.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::{Artwork, ArtworkFetcher};
use crate::config::ArtworkConfig;
use crate::playlist::Playcut;

pub const DISCOGS_BASE_URL: &str = "https://api.discogs.com";
pub const LASTFM_BASE_URL: &str = "https://ws.audioscrobbler.com";
pub const ITUNES_BASE_URL: &str = "https://itunes.apple.com";

/// Download an image and keep its content type.
pub async fn download_image(client: &reqwest::Client, url: &str) -> Result<Artwork> {
    let response = client
        .get(url)
        .send()
        .await
        .context("Failed to fetch image")?;

    if !response.status().is_success() {
        anyhow::bail!("Image fetch returned status: {}", response.status());
    }

    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("image/jpeg")
        .to_string();

    if !content_type.starts_with("image/") {
        anyhow::bail!("Image fetch returned non-image content type: {}", content_type);
    }

    let bytes = response.bytes().await.context("Failed to read image body")?;
    if bytes.is_empty() {
        anyhow::bail!("Image fetch returned an empty body");
    }

    Ok(Artwork::new(bytes, content_type))
}

/// Remote fetchers in priority order: Discogs, Last.fm, iTunes.  Sources
/// without credentials are left out.
pub fn from_config(config: &ArtworkConfig, client: &reqwest::Client) -> Vec<Arc<dyn ArtworkFetcher>> {
    let mut fetchers: Vec<Arc<dyn ArtworkFetcher>> = Vec::new();
    match config.discogs_token.as_deref().filter(|t| !t.is_empty()) {
        Some(token) => fetchers.push(Arc::new(DiscogsFetcher::new(client.clone(), token))),
        None => info!("[artwork] no Discogs token configured, skipping Discogs"),
    }
    match config.lastfm_api_key.as_deref().filter(|k| !k.is_empty()) {
        Some(key) => fetchers.push(Arc::new(LastFmFetcher::new(client.clone(), key))),
        None => info!("[artwork] no Last.fm API key configured, skipping Last.fm"),
    }
    if config.itunes_enabled {
        fetchers.push(Arc::new(ItunesFetcher::new(client.clone())));
    }
    fetchers
}

fn search_term(playcut: &Playcut) -> String {
    let subject = playcut
        .release_title
        .as_deref()
        .unwrap_or(&playcut.song_title);
    format!("{} {}", playcut.artist_name, subject)
}

// ── Discogs ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct DiscogsSearch {
    #[serde(default)]
    results: Vec<DiscogsResult>,
}

#[derive(Debug, Deserialize)]
struct DiscogsResult {
    cover_image: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DiscogsFetcher {
    client: reqwest::Client,
    token: String,
    base_url: String,
}

impl DiscogsFetcher {
    pub fn new(client: reqwest::Client, token: impl Into<String>) -> Self {
        Self::with_base_url(client, token, DISCOGS_BASE_URL)
    }

    pub fn with_base_url(
        client: reqwest::Client,
        token: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            token: token.into(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ArtworkFetcher for DiscogsFetcher {
    fn name(&self) -> &str {
        "discogs"
    }

    async fn fetch_artwork(&self, playcut: &Playcut) -> Result<Artwork> {
        let url = format!("{}/database/search", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Discogs token={}", self.token))
            .query(&[
                ("q", search_term(playcut).as_str()),
                ("type", "release"),
                ("per_page", "1"),
            ])
            .send()
            .await
            .context("Failed to query Discogs")?;

        if !response.status().is_success() {
            anyhow::bail!("Discogs returned status: {}", response.status());
        }

        let search: DiscogsSearch = response
            .json()
            .await
            .context("Failed to parse Discogs response")?;

        // Discogs serves a spacer gif when a release has no image.
        let image_url = search
            .results
            .into_iter()
            .filter_map(|r| r.cover_image)
            .find(|u| !u.is_empty() && !u.ends_with("spacer.gif"))
            .context("Discogs has no cover for this release")?;

        download_image(&self.client, &image_url).await
    }
}

// ── Last.fm ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct LastFmAlbumInfo {
    album: Option<LastFmAlbum>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LastFmAlbum {
    #[serde(default)]
    image: Vec<LastFmImage>,
}

#[derive(Debug, Deserialize)]
struct LastFmImage {
    #[serde(rename = "#text")]
    url: String,
    #[serde(default)]
    size: String,
}

fn lastfm_size_rank(size: &str) -> u8 {
    match size {
        "mega" => 5,
        "extralarge" => 4,
        "large" => 3,
        "medium" => 2,
        "small" => 1,
        _ => 0,
    }
}

#[derive(Debug, Clone)]
pub struct LastFmFetcher {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl LastFmFetcher {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>) -> Self {
        Self::with_base_url(client, api_key, LASTFM_BASE_URL)
    }

    pub fn with_base_url(
        client: reqwest::Client,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ArtworkFetcher for LastFmFetcher {
    fn name(&self) -> &str {
        "lastfm"
    }

    async fn fetch_artwork(&self, playcut: &Playcut) -> Result<Artwork> {
        let album = playcut
            .release_title
            .as_deref()
            .context("Last.fm lookup needs a release title")?;

        let url = format!("{}/2.0/", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .query(&[
                ("method", "album.getinfo"),
                ("artist", playcut.artist_name.as_str()),
                ("album", album),
                ("api_key", self.api_key.as_str()),
                ("format", "json"),
            ])
            .send()
            .await
            .context("Failed to query Last.fm")?;

        if !response.status().is_success() {
            anyhow::bail!("Last.fm returned status: {}", response.status());
        }

        let info: LastFmAlbumInfo = response
            .json()
            .await
            .context("Failed to parse Last.fm response")?;

        let Some(album) = info.album else {
            anyhow::bail!(
                "Last.fm: {}",
                info.message.unwrap_or_else(|| "album not found".to_string())
            );
        };

        let image_url = album
            .image
            .into_iter()
            .filter(|i| !i.url.is_empty())
            .max_by_key(|i| lastfm_size_rank(&i.size))
            .map(|i| i.url)
            .context("Last.fm has no image for this album")?;

        download_image(&self.client, &image_url).await
    }
}

// ── iTunes ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItunesSearch {
    #[serde(default)]
    results: Vec<ItunesResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItunesResult {
    artwork_url100: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ItunesFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl ItunesFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_base_url(client, ITUNES_BASE_URL)
    }

    pub fn with_base_url(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ArtworkFetcher for ItunesFetcher {
    fn name(&self) -> &str {
        "itunes"
    }

    async fn fetch_artwork(&self, playcut: &Playcut) -> Result<Artwork> {
        let url = format!("{}/search", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .query(&[
                ("term", search_term(playcut).as_str()),
                ("entity", "album"),
                ("limit", "1"),
            ])
            .send()
            .await
            .context("Failed to query iTunes")?;

        if !response.status().is_success() {
            anyhow::bail!("iTunes returned status: {}", response.status());
        }

        let search: ItunesSearch = response
            .json()
            .await
            .context("Failed to parse iTunes response")?;

        let thumb = search
            .results
            .into_iter()
            .find_map(|r| r.artwork_url100)
            .context("iTunes has no artwork for this search")?;

        // The search API only hands out 100px thumbnails; the CDN serves any size.
        let image_url = thumb.replace("100x100", "600x600");
        download_image(&self.client, &image_url).await
    }
}
