use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use super::platform;
use crate::playlist_service::PollSettings;
use crate::record::Lifespan;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("playlist.url must not be empty")]
    EmptyPlaylistUrl,
    #[error("playlist.fetch_interval_secs must be greater than zero")]
    ZeroFetchInterval,
    #[error("http.timeout_secs must be greater than zero")]
    ZeroTimeout,
    #[error("artwork.negative_ttl_days must be at most 36500, got {0}")]
    NegativeTtlTooLong(u64),
}

/// A hundred years: longer than any failure is worth remembering.
pub const MAX_NEGATIVE_TTL_DAYS: u64 = 36_500;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub playlist: PlaylistConfig,
    #[serde(default)]
    pub artwork: ArtworkConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistConfig {
    #[serde(default = "default_playlist_url")]
    pub url: String,
    #[serde(default = "default_fetch_interval_secs")]
    pub fetch_interval_secs: u64,
    #[serde(default = "default_cache_lifespan_secs")]
    pub cache_lifespan_secs: u64,
}

/// Remote artwork sources.  A source without credentials is skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtworkConfig {
    #[serde(default = "default_negative_ttl_days")]
    pub negative_ttl_days: u64,
    #[serde(default)]
    pub discogs_token: Option<String>,
    #[serde(default)]
    pub lastfm_api_key: Option<String>,
    #[serde(default = "default_itunes_enabled")]
    pub itunes_enabled: bool,
}

/// Outbound client settings plus the local read-only API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "platform::cache_dir")]
    pub cache_dir: PathBuf,
}

impl Default for PlaylistConfig {
    fn default() -> Self {
        Self {
            url: default_playlist_url(),
            fetch_interval_secs: default_fetch_interval_secs(),
            cache_lifespan_secs: default_cache_lifespan_secs(),
        }
    }
}

impl Default for ArtworkConfig {
    fn default() -> Self {
        Self {
            negative_ttl_days: default_negative_ttl_days(),
            discogs_token: None,
            lastfm_api_key: None,
            itunes_enabled: default_itunes_enabled(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            cache_dir: platform::cache_dir(),
        }
    }
}

fn default_playlist_url() -> String {
    "https://wxyc.info/playlists/recentEntries?v=2".to_string()
}

fn default_fetch_interval_secs() -> u64 {
    30
}

fn default_cache_lifespan_secs() -> u64 {
    30
}

fn default_negative_ttl_days() -> u64 {
    30
}

fn default_itunes_enabled() -> bool {
    true
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8990
}

fn default_user_agent() -> String {
    concat!("wxyc-core/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

impl PlaylistConfig {
    pub fn fetch_interval(&self) -> Duration {
        Duration::from_secs(self.fetch_interval_secs)
    }

    pub fn cache_lifespan(&self) -> Duration {
        Duration::from_secs(self.cache_lifespan_secs)
    }

    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: self.fetch_interval(),
            cache_lifespan: Lifespan::Finite(self.cache_lifespan()),
        }
    }
}

impl ArtworkConfig {
    pub fn negative_ttl(&self) -> Duration {
        let days = self.negative_ttl_days.min(MAX_NEGATIVE_TTL_DAYS);
        Duration::from_secs(days * 24 * 60 * 60)
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Client shared by the playlist and artwork fetchers.
    pub fn build_client(&self) -> anyhow::Result<reqwest::Client> {
        reqwest::Client::builder()
            .user_agent(self.user_agent.as_str())
            .timeout(self.timeout())
            .build()
            .context("Failed to build HTTP client")
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {:?}", config_path))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }

    /// Reject values the services cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.playlist.url.trim().is_empty() {
            return Err(ConfigError::EmptyPlaylistUrl);
        }
        if self.playlist.fetch_interval_secs == 0 {
            return Err(ConfigError::ZeroFetchInterval);
        }
        if self.http.timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.artwork.negative_ttl_days > MAX_NEGATIVE_TTL_DAYS {
            return Err(ConfigError::NegativeTtlTooLong(self.artwork.negative_ttl_days));
        }
        Ok(())
    }
}
