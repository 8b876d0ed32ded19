//! Whole-cycle behaviour against in-memory story server, API and CDN.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rotulos_common::{EntryStatus, LabelClass, MediaKind, MonitorConfig, PostId};
use rotulos_monitor::testing::{resolved_post, MockMediaFetcher, MockMediaSource, MockStoryServer};
use rotulos_monitor::resolver::MediaItem;
use rotulos_monitor::store::ContentStateStore;
use rotulos_monitor::{DownloadError, Monitor, MonitorSettings, ResolutionError};
use x_client::{PostSummary, RemoteMediaKind};

const RUNDOWN: &str = "/SHOW/TD1/RUNDOWN";

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_737_100_000 + secs, 0).unwrap()
}

fn id(raw: &str) -> PostId {
    PostId::parse(raw).unwrap()
}

fn settings(root: &Path) -> MonitorSettings {
    let base = root.join("Descargas");
    MonitorSettings {
        watchers: vec![MonitorConfig {
            name: "TD1".into(),
            rundown_path: RUNDOWN.into(),
            interval_seconds: 30,
            ap_filter: None,
        }],
        state_path: base.join("content_state.json"),
        manifest_path: base.join("manifest.json"),
        index_path: base.join("index.csv"),
        base_dir: base,
        concurrency: 4,
        download_attempts: 3,
        download_backoff: Duration::ZERO,
        fetch_attempts: 2,
        fetch_backoff: Duration::ZERO,
        api_capacity: 100,
        api_window: Duration::from_secs(60),
        api_max_wait: Duration::from_secs(1),
        max_retries: 3,
        grace: Duration::from_secs(60),
    }
}

fn label(post: &str) -> String {
    format!(
        "<head><f id=title>PORTADA</f></head><body>\
         <p>Texto de la pieza</p>\
         <ap>[CG1] 10 X_Total -- 00010829: |https://x.com/rtve/status/{post}(</ap>\
         </body>"
    )
}

struct Harness {
    _root: tempfile::TempDir,
    base: PathBuf,
    server: Arc<MockStoryServer>,
    source: Arc<MockMediaSource>,
    fetcher: Arc<MockMediaFetcher>,
    monitor: Monitor,
}

impl Harness {
    /// Rundown with one cited post (`12345`, one photo) and one story
    /// without labels, so removing the cited story never empties the listing.
    fn new() -> Self {
        Self::with(
            settings,
            MockMediaSource::new().on_post(resolved_post(
                "12345",
                &[(RemoteMediaKind::Photo, "https://pbs.twimg.com/media/a.jpg")],
            )),
            MockMediaFetcher::new().on_media("https://pbs.twimg.com/media/a.jpg", b"jpeg"),
        )
    }

    fn with(
        settings: fn(&Path) -> MonitorSettings,
        source: MockMediaSource,
        fetcher: MockMediaFetcher,
    ) -> Self {
        let root = tempfile::tempdir().unwrap();
        let settings = settings(root.path());
        let base = settings.base_dir.clone();
        let server = Arc::new(
            MockStoryServer::new()
                .with_story(RUNDOWN, "0001", &label("12345"))
                .with_story(RUNDOWN, "0002", "<body><p>Sin rótulos</p></body>"),
        );
        let source = Arc::new(source);
        let fetcher = Arc::new(fetcher);
        let monitor =
            Monitor::new(settings, server.clone(), source.clone(), fetcher.clone()).unwrap();
        Self {
            _root: root,
            base,
            server,
            source,
            fetcher,
            monitor,
        }
    }

    async fn status(&self, raw: &str) -> Option<EntryStatus> {
        self.monitor.store().get(&id(raw)).await.map(|e| e.status)
    }
}

#[tokio::test]
async fn first_cycle_downloads_cited_post() {
    let mut h = Harness::new();

    let stats = h.monitor.run_cycle_at(at(0), true).await.unwrap();

    assert_eq!(stats.posts_seen, 1);
    assert_eq!(stats.downloaded, 1);
    assert_eq!(h.status("12345").await, Some(EntryStatus::Downloaded));
    assert_eq!(
        std::fs::read(h.base.join("12345").join("FotoPost.jpg")).unwrap(),
        b"jpeg"
    );
    assert!(h.base.join("12345").join("tweet_api.json").exists());
    assert!(h.base.join("content_state.json").exists());

    let index = std::fs::read_to_string(h.base.join("index.csv")).unwrap();
    let expected = h.base.join("12345").join("tweet_api.json");
    assert!(index.contains(&format!("https://x.com/rtve/status/12345;{}", expected.display())));
}

#[tokio::test]
async fn seen_again_is_not_downloaded_again() {
    let mut h = Harness::new();
    h.monitor.run_cycle_at(at(0), true).await.unwrap();

    let stats = h.monitor.run_cycle_at(at(30), true).await.unwrap();

    assert_eq!(stats.downloaded, 0);
    assert_eq!(h.source.lookups(&id("12345")), 1);
    assert_eq!(h.fetcher.total_fetches(), 1);
    let entry = h.monitor.store().get(&id("12345")).await.unwrap();
    assert_eq!(entry.last_seen, at(30));
}

#[tokio::test]
async fn unreferenced_post_goes_stale_then_is_removed() {
    let mut h = Harness::new();
    h.monitor.run_cycle_at(at(0), true).await.unwrap();
    let post_dir = h.base.join("12345");

    h.server.remove_story(RUNDOWN, "0001");
    let stats = h.monitor.run_cycle_at(at(10), true).await.unwrap();
    assert_eq!(stats.stale, 1);
    assert_eq!(h.status("12345").await, Some(EntryStatus::Stale));
    assert!(post_dir.exists());

    h.monitor.run_cycle_at(at(40), true).await.unwrap();
    assert_eq!(h.status("12345").await, Some(EntryStatus::Stale));

    let stats = h.monitor.run_cycle_at(at(71), true).await.unwrap();
    assert_eq!(stats.removed, 1);
    assert_eq!(h.status("12345").await, None);
    assert!(!post_dir.exists());

    let manifest: serde_json::Value =
        serde_json::from_slice(&std::fs::read(h.base.join("manifest.json")).unwrap()).unwrap();
    assert_eq!(manifest["entries"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn reappearance_within_grace_cancels_removal() {
    let mut h = Harness::new();
    h.monitor.run_cycle_at(at(0), true).await.unwrap();

    h.server.remove_story(RUNDOWN, "0001");
    h.monitor.run_cycle_at(at(10), true).await.unwrap();
    h.server.set_story(RUNDOWN, "0001", &label("12345"));
    let stats = h.monitor.run_cycle_at(at(40), true).await.unwrap();

    assert_eq!(stats.resurrected, 1);
    assert_eq!(h.status("12345").await, Some(EntryStatus::Downloaded));

    h.monitor.run_cycle_at(at(200), true).await.unwrap();
    assert_eq!(h.status("12345").await, Some(EntryStatus::Downloaded));
    assert!(h.base.join("12345").join("FotoPost.jpg").exists());
    assert_eq!(h.source.lookups(&id("12345")), 1);
}

#[tokio::test]
async fn one_failed_item_does_not_block_its_siblings() {
    let mut h = Harness::with(
        settings,
        MockMediaSource::new().on_post(resolved_post(
            "12345",
            &[
                (RemoteMediaKind::Photo, "https://pbs.twimg.com/media/a.jpg"),
                (RemoteMediaKind::Photo, "https://pbs.twimg.com/media/b.jpg"),
                (RemoteMediaKind::Video, "https://video.twimg.com/v.mp4"),
            ],
        )),
        MockMediaFetcher::new()
            .on_media("https://pbs.twimg.com/media/a.jpg", b"a")
            .on_error(
                "https://pbs.twimg.com/media/b.jpg",
                DownloadError::Permanent("HTTP 403".into()),
            )
            .on_media("https://video.twimg.com/v.mp4", b"mp4"),
    );

    h.monitor.run_cycle_at(at(0), true).await.unwrap();

    let entry = h.monitor.store().get(&id("12345")).await.unwrap();
    assert_eq!(entry.status, EntryStatus::Downloaded);
    assert_eq!(entry.media.len(), 2);
    assert!(h.base.join("12345").join("VideoPost.mp4").exists());
    assert!(!h.base.join("12345").join("FotoPost2.jpg").exists());
}

#[tokio::test]
async fn resolution_failures_are_bounded() {
    let mut h = Harness::with(
        settings,
        MockMediaSource::new().on_error("12345", ResolutionError::Api("HTTP 500".into())),
        MockMediaFetcher::new(),
    );

    for (i, expected) in [EntryStatus::Pending, EntryStatus::Pending, EntryStatus::Failed]
        .into_iter()
        .enumerate()
    {
        h.monitor.run_cycle_at(at(i as i64), true).await.unwrap();
        assert_eq!(h.status("12345").await, Some(expected));
    }

    h.monitor.run_cycle_at(at(10), true).await.unwrap();
    assert_eq!(h.source.lookups(&id("12345")), 3);
}

#[tokio::test]
async fn unreachable_server_keeps_previous_references() {
    let mut h = Harness::new();
    h.monitor.run_cycle_at(at(0), true).await.unwrap();

    h.server.fail_next_connections(10);
    let stats = h.monitor.run_cycle_at(at(500), true).await.unwrap();

    assert_eq!(stats.watchers_failed, 1);
    assert_eq!(stats.stale, 0);
    assert_eq!(h.status("12345").await, Some(EntryStatus::Downloaded));
    assert!(h.base.join("12345").exists());
}

#[tokio::test]
async fn manifest_is_stable_for_identical_state() {
    let mut h = Harness::new();
    h.monitor.run_cycle_at(at(0), true).await.unwrap();
    h.monitor.run_cycle_at(at(30), true).await.unwrap();
    let first = std::fs::read(h.base.join("manifest.json")).unwrap();

    h.monitor.run_cycle_at(at(30), true).await.unwrap();

    assert_eq!(std::fs::read(h.base.join("manifest.json")).unwrap(), first);
}

#[tokio::test]
async fn exhausted_token_bucket_defers_resolution() {
    fn tight(root: &Path) -> MonitorSettings {
        MonitorSettings {
            api_capacity: 1,
            api_window: Duration::from_secs(3600),
            api_max_wait: Duration::from_millis(50),
            ..settings(root)
        }
    }
    let mut h = Harness::with(
        tight,
        MockMediaSource::new()
            .on_post(resolved_post(
                "12345",
                &[(RemoteMediaKind::Photo, "https://pbs.twimg.com/media/a.jpg")],
            ))
            .on_post(resolved_post(
                "67890",
                &[(RemoteMediaKind::Photo, "https://pbs.twimg.com/media/a.jpg")],
            )),
        MockMediaFetcher::new().on_media("https://pbs.twimg.com/media/a.jpg", b"jpeg"),
    );
    h.server.set_story(RUNDOWN, "0003", &label("67890"));

    let stats = h.monitor.run_cycle_at(at(0), true).await.unwrap();

    assert_eq!(stats.downloaded, 1);
    assert_eq!(stats.retry_later, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(h.source.total_lookups(), 1);
}

#[tokio::test]
async fn restart_resumes_from_committed_state() {
    let root = tempfile::tempdir().unwrap();
    let server = Arc::new(MockStoryServer::new().with_story(RUNDOWN, "0001", &label("12345")));
    let source = Arc::new(MockMediaSource::new().on_post(resolved_post(
        "12345",
        &[(RemoteMediaKind::Photo, "https://pbs.twimg.com/media/a.jpg")],
    )));
    let fetcher =
        Arc::new(MockMediaFetcher::new().on_media("https://pbs.twimg.com/media/a.jpg", b"jpeg"));

    let mut first = Monitor::new(
        settings(root.path()),
        server.clone(),
        source.clone(),
        fetcher.clone(),
    )
    .unwrap();
    first.run_cycle_at(at(0), true).await.unwrap();
    drop(first);

    let mut second =
        Monitor::new(settings(root.path()), server, source.clone(), fetcher.clone()).unwrap();
    let stats = second.run_cycle_at(at(30), true).await.unwrap();

    assert_eq!(stats.downloaded, 0);
    assert_eq!(source.lookups(&id("12345")), 1);
    assert_eq!(fetcher.total_fetches(), 1);
}

#[tokio::test]
async fn missing_rundown_does_not_block_cleanup_of_the_others() {
    fn two_rundowns(root: &Path) -> MonitorSettings {
        let mut settings = settings(root);
        settings.watchers.push(MonitorConfig {
            name: "TYPO".into(),
            rundown_path: "/SHOW/NOPE/RUNDOWN".into(),
            interval_seconds: 30,
            ap_filter: None,
        });
        settings
    }
    let mut h = Harness::with(
        two_rundowns,
        MockMediaSource::new().on_post(resolved_post(
            "12345",
            &[(RemoteMediaKind::Photo, "https://pbs.twimg.com/media/a.jpg")],
        )),
        MockMediaFetcher::new().on_media("https://pbs.twimg.com/media/a.jpg", b"jpeg"),
    );

    let stats = h.monitor.run_cycle_at(at(0), true).await.unwrap();
    assert_eq!(stats.watchers_failed, 1);
    assert_eq!(h.status("12345").await, Some(EntryStatus::Downloaded));

    h.server.remove_story(RUNDOWN, "0001");
    h.monitor.run_cycle_at(at(10), true).await.unwrap();
    assert_eq!(h.status("12345").await, Some(EntryStatus::Stale));

    h.monitor.run_cycle_at(at(100), true).await.unwrap();
    assert_eq!(h.status("12345").await, None);
    assert!(!h.base.join("12345").exists());
}

#[tokio::test]
async fn resolved_post_resumes_with_its_metadata_after_restart() {
    let root = tempfile::tempdir().unwrap();
    let settings = settings(root.path());

    let seeded = ContentStateStore::open(&settings.state_path).unwrap();
    seeded
        .upsert_seen(&id("12345"), LabelClass::Total, "https://x.com/rtve/status/12345", at(0))
        .await;
    seeded
        .mark_resolved(
            &id("12345"),
            vec![MediaItem {
                kind: MediaKind::Photo,
                remote_url: "https://pbs.twimg.com/media/a.jpg".into(),
                file_name: "FotoPost.jpg".into(),
            }],
            Some(PostSummary {
                id: "12345".into(),
                text: "Última hora".into(),
                name: "RTVE".into(),
                username: "@rtve".into(),
                created_at: None,
            }),
        )
        .await;
    seeded.commit().await.unwrap();
    drop(seeded);

    let server = Arc::new(MockStoryServer::new().with_story(RUNDOWN, "0001", &label("12345")));
    let source = Arc::new(MockMediaSource::new());
    let fetcher =
        Arc::new(MockMediaFetcher::new().on_media("https://pbs.twimg.com/media/a.jpg", b"jpeg"));
    let base = settings.base_dir.clone();
    let mut monitor = Monitor::new(settings, server, source.clone(), fetcher).unwrap();

    monitor.run_cycle_at(at(30), true).await.unwrap();

    let entry = monitor.store().get(&id("12345")).await.unwrap();
    assert_eq!(entry.status, EntryStatus::Downloaded);
    assert_eq!(source.total_lookups(), 0);
    let metadata: serde_json::Value = serde_json::from_slice(
        &std::fs::read(base.join("12345").join("tweet_api.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(metadata["text"], "Última hora");
}

#[tokio::test]
async fn monitor_filter_ignores_unmatched_stories() {
    fn only_cg2(root: &Path) -> MonitorSettings {
        let mut settings = settings(root);
        settings.watchers[0].ap_filter = Some("CG2".into());
        settings
    }
    let mut h = Harness::with(
        only_cg2,
        MockMediaSource::new(),
        MockMediaFetcher::new(),
    );

    let stats = h.monitor.run_cycle_at(at(0), true).await.unwrap();

    assert_eq!(stats.posts_seen, 0);
    assert_eq!(stats.stories_filtered, 2);
    assert_eq!(h.status("12345").await, None);
}
