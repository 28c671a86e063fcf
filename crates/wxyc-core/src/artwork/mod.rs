//! Cover artwork: the value type, the fetcher seam, and the resolver that
//! walks the fetchers.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::cache::Cache;
use crate::playlist::Playcut;

pub mod remote;
pub mod resolver;

pub use remote::{DiscogsFetcher, ItunesFetcher, LastFmFetcher};
pub use resolver::ArtworkResolver;

/// Prefix of negative-result keys in the artwork error cache.
pub const ERROR_KEY_PREFIX: &str = "error_";

/// Artwork identity: two plays of the same release share one cache entry.
pub fn derived_key(playcut: &Playcut) -> String {
    playcut
        .release_title
        .clone()
        .unwrap_or_else(|| playcut.song_title.clone())
}

pub fn error_key(key: &str) -> String {
    format!("{}{}", ERROR_KEY_PREFIX, key)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artwork {
    #[serde(serialize_with = "bytes_to_base64", deserialize_with = "bytes_from_base64")]
    pub bytes: Bytes,
    pub content_type: String,
}

impl Artwork {
    pub fn new(bytes: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type: content_type.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

fn bytes_to_base64<S: Serializer>(bytes: &Bytes, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&BASE64.encode(bytes))
}

fn bytes_from_base64<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
    let encoded = String::deserialize(d)?;
    BASE64
        .decode(encoded.as_bytes())
        .map(Bytes::from)
        .map_err(serde::de::Error::custom)
}

/// Negative results remembered in the artwork error cache under `error_<key>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtworkError {
    /// Every fetcher came back empty.
    NoArtworkAvailable,
    /// Found, but the content-safety check refused it.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Safety {
    Safe,
    Unsafe,
}

#[async_trait]
pub trait ArtworkFetcher: Send + Sync {
    /// Short label for logs.
    fn name(&self) -> &str;

    async fn fetch_artwork(&self, playcut: &Playcut) -> Result<Artwork>;
}

#[async_trait]
pub trait ContentSafetyChecker: Send + Sync {
    async fn check(&self, artwork: &Artwork) -> Result<Safety>;
}

/// The artwork cache presented as a fetcher: always tried first.
#[derive(Debug, Clone)]
pub struct CachedArtworkFetcher {
    cache: Cache,
}

impl CachedArtworkFetcher {
    pub fn new(cache: Cache) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl ArtworkFetcher for CachedArtworkFetcher {
    fn name(&self) -> &str {
        "cache"
    }

    async fn fetch_artwork(&self, playcut: &Playcut) -> Result<Artwork> {
        self.cache
            .get::<Artwork>(&derived_key(playcut))
            .await
            .context("No cached artwork")
    }
}
