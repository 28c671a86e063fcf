mod common;

use anyhow::Result;
use async_trait::async_trait;
use common::{memory_cache, playcut, png, CountingArtworkFetcher, FixedSafety};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wxyc_core::artwork::{derived_key, error_key, Artwork, ArtworkError, ArtworkFetcher, Safety};
use wxyc_core::playlist::Playcut;
use wxyc_core::record::{ManualClock, THIRTY_DAYS};
use wxyc_core::store::MemoryStore;
use wxyc_core::{ArtworkResolver, Cache, Lifespan};

type Log = Arc<Mutex<Vec<String>>>;

fn fetcher(name: &str, outcome: Option<Artwork>, log: &Log) -> Arc<CountingArtworkFetcher> {
    CountingArtworkFetcher::new(name, outcome, Duration::ZERO, log.clone())
}

fn slow_fetcher(name: &str, outcome: Option<Artwork>, log: &Log) -> Arc<CountingArtworkFetcher> {
    CountingArtworkFetcher::new(name, outcome, Duration::from_millis(100), log.clone())
}

fn remotes(fetchers: &[&Arc<CountingArtworkFetcher>]) -> Vec<Arc<dyn ArtworkFetcher>> {
    fetchers
        .iter()
        .map(|f| Arc::clone(*f) as Arc<dyn ArtworkFetcher>)
        .collect()
}

fn kind_of_blue() -> Playcut {
    playcut(1, "Miles Davis", "So What", Some("Kind of Blue"))
}

#[tokio::test(start_paused = true)]
async fn concurrent_requests_for_one_key_share_a_single_scan() {
    let log = Log::default();
    let discogs = slow_fetcher("discogs", None, &log);
    let lastfm = slow_fetcher("lastfm", Some(png(1)), &log);
    let resolver = ArtworkResolver::new(memory_cache("artwork"), remotes(&[&discogs, &lastfm]));

    let tasks: Vec<_> = (0..50)
        .map(|_| {
            let resolver = resolver.clone();
            tokio::spawn(async move { resolver.resolve(&kind_of_blue()).await })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.unwrap(), Some(png(1)));
    }
    assert_eq!(discogs.calls(), 1);
    assert_eq!(lastfm.calls(), 1);
    assert_eq!(resolver.in_flight().await, 0);
}

#[tokio::test]
async fn found_artwork_is_written_through_to_the_cache() {
    let log = Log::default();
    let cache = memory_cache("artwork");
    let discogs = fetcher("discogs", Some(png(7)), &log);
    let resolver = ArtworkResolver::new(cache.clone(), remotes(&[&discogs]));

    let first = kind_of_blue();
    assert_eq!(resolver.resolve(&first).await, Some(png(7)));
    assert_eq!(cache.get::<Artwork>(&derived_key(&first)).await, Some(png(7)));

    // Another track off the same release resolves from the cache.
    let second = playcut(2, "Miles Davis", "Blue in Green", Some("Kind of Blue"));
    assert_eq!(resolver.resolve(&second).await, Some(png(7)));
    assert_eq!(discogs.calls(), 1);
}

#[tokio::test]
async fn fetchers_run_in_priority_order_and_stop_at_first_hit() {
    let log = Log::default();
    let discogs = fetcher("discogs", None, &log);
    let lastfm = fetcher("lastfm", None, &log);
    let itunes = fetcher("itunes", Some(png(3)), &log);
    let spare = fetcher("spare", Some(png(4)), &log);
    let resolver = ArtworkResolver::new(
        memory_cache("artwork"),
        remotes(&[&discogs, &lastfm, &itunes, &spare]),
    );

    assert_eq!(resolver.resolve(&kind_of_blue()).await, Some(png(3)));
    assert_eq!(*log.lock().unwrap(), vec!["discogs", "lastfm", "itunes"]);
    assert_eq!(spare.calls(), 0);
}

#[tokio::test]
async fn total_miss_is_remembered_and_short_circuits() {
    let log = Log::default();
    let cache = memory_cache("artwork");
    let discogs = fetcher("discogs", None, &log);
    let itunes = fetcher("itunes", None, &log);
    let resolver = ArtworkResolver::new(cache.clone(), remotes(&[&discogs, &itunes]));

    let pc = kind_of_blue();
    assert_eq!(resolver.resolve(&pc).await, None);
    assert!(cache.get::<ArtworkError>(&error_key(&derived_key(&pc))).await.is_none());
    assert_eq!(
        resolver
            .error_cache()
            .get::<ArtworkError>(&error_key(&derived_key(&pc)))
            .await,
        Some(ArtworkError::NoArtworkAvailable)
    );

    assert_eq!(resolver.resolve(&pc).await, None);
    assert_eq!(discogs.calls(), 1);
    assert_eq!(itunes.calls(), 1);
}

#[tokio::test]
async fn remembered_miss_expires_after_negative_ttl() {
    let log = Log::default();
    let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
    let cache = Cache::with_clock(Arc::new(MemoryStore::new()), "artwork", clock.clone());
    let discogs = fetcher("discogs", None, &log);
    let resolver = ArtworkResolver::new(cache, remotes(&[&discogs]));

    let pc = kind_of_blue();
    assert_eq!(resolver.resolve(&pc).await, None);

    clock.advance(THIRTY_DAYS - Duration::from_secs(1));
    assert_eq!(resolver.resolve(&pc).await, None);
    assert_eq!(discogs.calls(), 1);

    clock.advance(Duration::from_secs(2));
    assert_eq!(resolver.resolve(&pc).await, None);
    assert_eq!(discogs.calls(), 2);
}

#[tokio::test]
async fn release_titled_like_an_error_key_leaves_the_failure_intact() {
    let log = Log::default();
    let discogs = fetcher("discogs", None, &log);
    let resolver = ArtworkResolver::new(memory_cache("artwork"), remotes(&[&discogs]));

    let foo = playcut(1, "Artist", "Track", Some("Foo"));
    let lookalike = playcut(2, "Artist", "Track", Some("error_Foo"));

    assert_eq!(resolver.resolve(&foo).await, None);
    assert_eq!(resolver.resolve(&lookalike).await, None);
    assert_eq!(
        resolver.error_cache().get::<ArtworkError>("error_Foo").await,
        Some(ArtworkError::NoArtworkAvailable)
    );

    assert_eq!(resolver.resolve(&foo).await, None);
    assert_eq!(discogs.calls(), 2);
}

#[tokio::test]
async fn unsafe_artwork_is_rejected_and_remembered() {
    let log = Log::default();
    let cache = memory_cache("artwork");
    let discogs = fetcher("discogs", Some(png(1)), &log);
    let lastfm = fetcher("lastfm", Some(png(2)), &log);
    let safety = FixedSafety::new(Ok(Safety::Unsafe));
    let resolver = ArtworkResolver::build(
        cache.clone(),
        remotes(&[&discogs, &lastfm]),
        Some(safety.clone()),
        THIRTY_DAYS,
    );

    let pc = kind_of_blue();
    assert_eq!(resolver.resolve(&pc).await, None);
    assert_eq!(lastfm.calls(), 0);
    assert_eq!(cache.get::<Artwork>(&derived_key(&pc)).await, None);
    assert_eq!(
        resolver
            .error_cache()
            .get::<ArtworkError>(&error_key(&derived_key(&pc)))
            .await,
        Some(ArtworkError::Rejected)
    );

    assert_eq!(resolver.resolve(&pc).await, None);
    assert_eq!(discogs.calls(), 1);
    assert_eq!(safety.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn safety_check_failure_moves_on_to_next_fetcher() {
    let log = Log::default();
    let discogs = fetcher("discogs", Some(png(1)), &log);
    let lastfm = fetcher("lastfm", Some(png(2)), &log);
    let safety = FixedSafety::new(Err("classifier offline".to_string()));
    let resolver = ArtworkResolver::build(
        memory_cache("artwork"),
        remotes(&[&discogs, &lastfm]),
        Some(safety.clone()),
        THIRTY_DAYS,
    );

    assert_eq!(resolver.resolve(&kind_of_blue()).await, None);
    assert_eq!(*log.lock().unwrap(), vec!["discogs", "lastfm"]);
    assert_eq!(safety.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn safe_artwork_is_cached_and_not_rechecked() {
    let log = Log::default();
    let discogs = fetcher("discogs", Some(png(1)), &log);
    let safety = FixedSafety::new(Ok(Safety::Safe));
    let resolver = ArtworkResolver::build(
        memory_cache("artwork"),
        remotes(&[&discogs]),
        Some(safety.clone()),
        THIRTY_DAYS,
    );

    assert_eq!(resolver.resolve(&kind_of_blue()).await, Some(png(1)));
    assert_eq!(resolver.resolve(&kind_of_blue()).await, Some(png(1)));
    assert_eq!(discogs.calls(), 1);
    assert_eq!(safety.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn preexisting_cache_entry_skips_remotes() {
    let log = Log::default();
    let cache = memory_cache("artwork");
    cache
        .set("Kind of Blue", Some(&png(9)), Lifespan::Forever)
        .await
        .unwrap();
    let discogs = fetcher("discogs", Some(png(1)), &log);
    let resolver = ArtworkResolver::new(cache, remotes(&[&discogs]));

    assert_eq!(resolver.resolve(&kind_of_blue()).await, Some(png(9)));
    assert_eq!(discogs.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn abandoned_caller_does_not_cancel_shared_scan() {
    let log = Log::default();
    let discogs = CountingArtworkFetcher::new("discogs", Some(png(5)), Duration::from_secs(10), log);
    let resolver = ArtworkResolver::new(memory_cache("artwork"), remotes(&[&discogs]));

    let first = {
        let resolver = resolver.clone();
        tokio::spawn(async move { resolver.resolve(&kind_of_blue()).await })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(resolver.in_flight().await, 1);
    first.abort();

    assert_eq!(resolver.resolve(&kind_of_blue()).await, Some(png(5)));
    assert_eq!(discogs.calls(), 1);
    assert_eq!(resolver.in_flight().await, 0);
}

struct PanickingFetcher {
    calls: AtomicUsize,
}

#[async_trait]
impl ArtworkFetcher for PanickingFetcher {
    fn name(&self) -> &str {
        "panicky"
    }

    async fn fetch_artwork(&self, _playcut: &Playcut) -> Result<Artwork> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        panic!("fetcher bug");
    }
}

#[tokio::test]
async fn panicking_fetcher_releases_in_flight_entry() {
    let panicky = Arc::new(PanickingFetcher {
        calls: AtomicUsize::new(0),
    });
    let resolver = ArtworkResolver::new(memory_cache("artwork"), vec![panicky.clone() as Arc<dyn ArtworkFetcher>]);

    assert_eq!(resolver.resolve(&kind_of_blue()).await, None);
    assert_eq!(resolver.in_flight().await, 0);

    // Nothing was remembered, so the next request scans again.
    assert_eq!(resolver.resolve(&kind_of_blue()).await, None);
    assert_eq!(panicky.calls.load(Ordering::SeqCst), 2);
}
