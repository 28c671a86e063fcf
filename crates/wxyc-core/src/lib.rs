//! Playlist polling, artwork resolution and the TTL cache that backs both.

pub mod artwork;
pub mod cache;
pub mod config;
pub mod now_playing;
pub mod platform;
pub mod playlist;
pub mod playlist_service;
pub mod record;
pub mod store;

pub use artwork::{Artwork, ArtworkError, ArtworkFetcher, ArtworkResolver};
pub use cache::{Cache, CacheError, Lookup, PurgeReport};
pub use config::Config;
pub use now_playing::{NowPlayingItem, NowPlayingService};
pub use playlist::{Playcut, Playlist, PlaylistFetcher};
pub use playlist_service::{PlaylistService, PollSettings, SubscriberToken, Subscription};
pub use record::{CacheRecord, Lifespan};
pub use store::{FileStore, KvStore, MemoryStore};

/// Cache namespaces shared by the services.
pub const PLAYLIST_NAMESPACE: &str = "playlist";
pub const ARTWORK_NAMESPACE: &str = "artwork";
/// Remembered artwork failures, kept apart from the artwork records.
pub const ARTWORK_ERROR_NAMESPACE: &str = "artwork_error";
