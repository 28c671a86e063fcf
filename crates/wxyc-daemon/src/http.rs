use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info};
use wxyc_core::{NowPlayingItem, Playcut, Playlist, PlaylistService};

pub type RecentLogs = Arc<Mutex<VecDeque<String>>>;

#[derive(Clone)]
pub struct HttpState {
    pub playlists: PlaylistService,
    pub now_playing: watch::Receiver<Option<NowPlayingItem>>,
    pub logs: RecentLogs,
}

#[derive(Serialize)]
struct ApiNowPlaying {
    playcut: Playcut,
    has_artwork: bool,
}

#[derive(Serialize)]
struct ApiStatus {
    subscribers: usize,
    polling: bool,
    playlist_entries: Option<usize>,
    now_playing: Option<u64>,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/api/playlist", get(get_playlist))
        .route("/api/now-playing", get(get_now_playing))
        .route("/api/artwork", get(get_artwork))
        .route("/api/status", get(get_status))
        .route("/api/logs", get(get_logs))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state: HttpState,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("[http] Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("[http] API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("[http] server error: {}", e);
        }
    })
}

async fn get_playlist(State(state): State<HttpState>) -> Result<Json<Playlist>, StatusCode> {
    debug!("[http] GET /api/playlist");
    let playlist = state
        .playlists
        .current()
        .ok_or(StatusCode::SERVICE_UNAVAILABLE)?;
    Ok(Json(playlist.as_ref().clone()))
}

async fn get_now_playing(
    State(state): State<HttpState>,
) -> Result<Json<ApiNowPlaying>, StatusCode> {
    let item = state
        .now_playing
        .borrow()
        .clone()
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(ApiNowPlaying {
        has_artwork: item.artwork.is_some(),
        playcut: item.playcut,
    }))
}

async fn get_artwork(State(state): State<HttpState>) -> Response {
    let artwork = state
        .now_playing
        .borrow()
        .as_ref()
        .and_then(|item| item.artwork.clone());

    match artwork {
        Some(artwork) => (
            [(header::CONTENT_TYPE, artwork.content_type.clone())],
            artwork.bytes,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn get_status(State(state): State<HttpState>) -> Json<ApiStatus> {
    let playlist = state.playlists.current();
    let now_playing = state.now_playing.borrow().as_ref().map(|i| i.playcut.id);
    Json(ApiStatus {
        subscribers: state.playlists.subscriber_count(),
        polling: state.playlists.is_polling(),
        playlist_entries: playlist.map(|p| p.entries().len()),
        now_playing,
    })
}

async fn get_logs(State(state): State<HttpState>) -> Json<Vec<String>> {
    let logs = state.logs.lock().unwrap_or_else(PoisonError::into_inner);
    Json(logs.iter().cloned().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;
    use wxyc_core::playlist::PlaylistFetcher;
    use wxyc_core::store::MemoryStore;
    use wxyc_core::{Artwork, Cache, PollSettings};

    struct Fixed(Playlist);

    #[async_trait]
    impl PlaylistFetcher for Fixed {
        async fn fetch_playlist(&self) -> anyhow::Result<Playlist> {
            Ok(self.0.clone())
        }
    }

    fn playcut() -> Playcut {
        Playcut {
            id: 9,
            hour: 0,
            chron_order_id: 9,
            song_title: "Windowlicker".into(),
            label_name: Some("Warp".into()),
            artist_name: "Aphex Twin".into(),
            release_title: None,
        }
    }

    fn state(item: Option<NowPlayingItem>) -> (HttpState, watch::Sender<Option<NowPlayingItem>>) {
        let playlist = Playlist {
            playcuts: vec![playcut()],
            ..Default::default()
        };
        let playlists = PlaylistService::new(
            Arc::new(Fixed(playlist)),
            Cache::new(Arc::new(MemoryStore::new()), "playlist"),
            PollSettings::default(),
        );
        let (tx, rx) = watch::channel(item);
        let state = HttpState {
            playlists,
            now_playing: rx,
            logs: RecentLogs::default(),
        };
        (state, tx)
    }

    async fn get(app: Router, uri: &str) -> Response {
        app.oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_empty_service_reports_unavailable() {
        let (state, _tx) = state(None);
        let app = router(state);
        assert_eq!(
            get(app.clone(), "/api/playlist").await.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            get(app.clone(), "/api/now-playing").await.status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(get(app, "/api/artwork").await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_now_playing_and_artwork() {
        let item = NowPlayingItem {
            playcut: playcut(),
            artwork: Some(Artwork::new(vec![1u8, 2, 3], "image/png")),
        };
        let (state, _tx) = state(Some(item));
        let app = router(state);

        let res = get(app.clone(), "/api/now-playing").await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["playcut"]["artistName"], "Aphex Twin");
        assert_eq!(json["has_artwork"], true);

        let res = get(app, "/api/artwork").await;
        assert_eq!(res.headers()[header::CONTENT_TYPE], "image/png");
        let body = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], &[1u8, 2, 3]);
    }

    #[tokio::test]
    async fn test_playlist_after_first_fetch() {
        let (state, _tx) = state(None);
        let playlists = state.playlists.clone();
        let mut sub = playlists.subscribe();
        sub.recv().await.unwrap();

        let res = get(router(state), "/api/playlist").await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["playcuts"][0]["chronOrderID"], 9);
        assert_eq!(json["breakpoints"], serde_json::json!([]));
    }
}
