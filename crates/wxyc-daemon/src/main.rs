mod http;

use anyhow::Context;
use std::collections::VecDeque;
use std::sync::{Arc, PoisonError};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use wxyc_core::artwork::remote;
use wxyc_core::playlist::HttpPlaylistFetcher;
use wxyc_core::{
    ArtworkResolver, Cache, Config, FileStore, NowPlayingService, PlaylistService,
    ARTWORK_ERROR_NAMESPACE, ARTWORK_NAMESPACE, PLAYLIST_NAMESPACE,
};

use crate::http::RecentLogs;

const RECENT_LOG_CAPACITY: usize = 100;

/// Keeps the latest WARN and ERROR lines for `/api/logs`.
struct RecentLogLayer {
    logs: RecentLogs,
}

impl<S> tracing_subscriber::Layer<S> for RecentLogLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        let mut logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        if logs.len() == RECENT_LOG_CAPACITY {
            logs.pop_front();
        }
        logs.push_back(message);
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let logs: RecentLogs = Arc::new(std::sync::Mutex::new(VecDeque::new()));

    // File log + stderr + in-memory tail of warnings
    let data_dir = wxyc_core::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file {:?}", log_path))?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(RecentLogLayer { logs: logs.clone() })
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,wxyc_core=debug,wxyc_daemon=debug")
            }),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let client = config.http.build_client()?;

    let store = Arc::new(
        FileStore::open(&config.paths.cache_dir)
            .await
            .with_context(|| format!("Failed to open cache at {:?}", config.paths.cache_dir))?,
    );
    let playlist_cache = Cache::new(store.clone(), PLAYLIST_NAMESPACE);
    let artwork_cache = Cache::new(store, ARTWORK_NAMESPACE);
    let artwork_errors = artwork_cache.sibling(ARTWORK_ERROR_NAMESPACE);

    for cache in [&playlist_cache, &artwork_cache, &artwork_errors] {
        if let Err(e) = cache.purge().await {
            warn!("[cache] purge of {} failed: {}", cache.namespace(), e);
        }
    }

    let fetcher = Arc::new(HttpPlaylistFetcher::new(
        client.clone(),
        config.playlist.url.clone(),
    ));
    let playlists = PlaylistService::new(fetcher, playlist_cache, config.playlist.poll_settings());
    if playlists.warm_from_cache().await {
        info!("[playlist] serving cached playlist until the first fetch lands");
    }

    let resolver = ArtworkResolver::build(
        artwork_cache,
        remote::from_config(&config.artwork, &client),
        None,
        config.artwork.negative_ttl(),
    );
    let now_playing = NowPlayingService::start(&playlists, resolver);

    let playlist_log = playlists.attach(|playlist| {
        info!(
            "[playlist] {} entries, newest first: {:?}",
            playlist.entries().len(),
            playlist.entry_ids().iter().take(5).collect::<Vec<_>>()
        );
    });

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            http::HttpState {
                playlists: playlists.clone(),
                now_playing: now_playing.watch(),
                logs,
            },
        );
    }

    info!("Daemon initialised, polling {}", config.playlist.url);
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down");
    playlists.detach(playlist_log).await;
    now_playing.stop().await;
    playlists.shutdown().await;

    Ok(())
}
