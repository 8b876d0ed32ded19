//! Poll loop: snapshot → labels → state → resolve/download → reconcile → manifest.
//!
//! One cycle at a time. Each watcher polls its rundown on its own interval
//! and remembers the references it saw last; the union of every watcher's
//! set is what the store treats as "still referenced".

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use inews_client::{InewsError, StoryServer};
use rotulos_common::{Config, EntryStatus, LabelClass, MonitorConfig, PostId};
use tracing::{debug, error, info, warn};
use x_client::PostSummary;

use crate::cleanup::{ForceRemover, Reconciler};
use crate::download::{write_post_metadata, Downloader};
use crate::error::{CycleError, PersistenceError};
use crate::labels::{extract_labels, story_title, ApFilter};
use crate::manifest::ManifestWriter;
use crate::rate_limit::ApiRateLimiter;
use crate::resolver::{extract_post_reference, MediaItem, PostReference, Resolver};
use crate::snapshot::{SnapshotFetcher, StorySnapshot};
use crate::store::{ContentStateStore, SeenOutcome};
use crate::traits::{MediaFetcher, MediaSource};

/// Tunables for one monitor process, taken from [`Config`].
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub watchers: Vec<MonitorConfig>,
    pub base_dir: PathBuf,
    pub state_path: PathBuf,
    pub manifest_path: PathBuf,
    pub index_path: PathBuf,
    pub concurrency: usize,
    pub download_attempts: u32,
    pub download_backoff: Duration,
    pub fetch_attempts: u32,
    pub fetch_backoff: Duration,
    pub api_capacity: u32,
    pub api_window: Duration,
    pub api_max_wait: Duration,
    pub max_retries: u32,
    pub grace: Duration,
}

impl MonitorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            watchers: config.monitors(),
            base_dir: config.content.download_base_path.clone(),
            state_path: config.state_file_path(),
            manifest_path: config.manifest_file_path(),
            index_path: config.index_file_path(),
            concurrency: config.download.concurrency,
            download_attempts: config.download.max_attempts,
            download_backoff: Duration::from_millis(config.download.backoff_base_ms),
            fetch_attempts: config.fetch.max_attempts,
            fetch_backoff: Duration::from_millis(config.fetch.backoff_base_ms),
            api_capacity: config.api.requests_per_window,
            api_window: Duration::from_secs(config.api.window_secs),
            api_max_wait: Duration::from_secs(config.api.max_wait_secs),
            max_retries: config.api.max_retries,
            grace: config.grace_period(),
        }
    }
}

/// A post as seen in the current rundowns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sighting {
    pub reference: PostReference,
    pub class: LabelClass,
}

struct Watcher {
    config: MonitorConfig,
    filter: ApFilter,
    last_run: Option<Instant>,
    /// References seen on the last successful fetch. `None` until the first
    /// fetch succeeds or the server rejects the rundown path.
    active: Option<BTreeMap<PostId, Sighting>>,
}

impl Watcher {
    fn interval(&self) -> Duration {
        Duration::from_secs(self.config.interval_seconds)
    }

    fn is_due(&self, now: Instant) -> bool {
        self.last_run
            .map_or(true, |last| now.duration_since(last) >= self.interval())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleStats {
    pub watchers_polled: u32,
    pub watchers_failed: u32,
    pub stories: u32,
    pub stories_skipped: u32,
    pub stories_filtered: u32,
    pub labels: u32,
    pub posts_seen: u32,
    pub created: u32,
    pub resurrected: u32,
    pub downloaded: u32,
    pub failed: u32,
    pub retry_later: u32,
    pub stale: u32,
    pub removed: u32,
    pub cleanup_failed: u32,
    pub manifest_entries: u32,
}

impl fmt::Display for CycleStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "watchers {}/{} ok, {} stories ({} skipped, {} filtered), {} labels, {} posts ({} new, {} back), \
             {} downloaded, {} failed, {} retry later, {} stale, {} removed ({} cleanup failures), \
             {} in manifest",
            self.watchers_polled.saturating_sub(self.watchers_failed),
            self.watchers_polled,
            self.stories,
            self.stories_skipped,
            self.stories_filtered,
            self.labels,
            self.posts_seen,
            self.created,
            self.resurrected,
            self.downloaded,
            self.failed,
            self.retry_later,
            self.stale,
            self.removed,
            self.cleanup_failed,
            self.manifest_entries,
        )
    }
}

enum PostOutcome {
    Downloaded,
    Failed,
    RetryLater,
}

pub struct Monitor {
    settings: MonitorSettings,
    watchers: Vec<Watcher>,
    snapshots: SnapshotFetcher,
    resolver: Resolver,
    downloader: Downloader,
    store: ContentStateStore,
    reconciler: Reconciler,
    manifest: ManifestWriter,
}

impl Monitor {
    pub fn new(
        mut settings: MonitorSettings,
        server: Arc<dyn StoryServer>,
        source: Arc<dyn MediaSource>,
        fetcher: Arc<dyn MediaFetcher>,
    ) -> Result<Self, PersistenceError> {
        // Paths handed to the graphics machine must not depend on our cwd.
        settings.base_dir =
            std::path::absolute(&settings.base_dir).unwrap_or_else(|_| settings.base_dir.clone());
        std::fs::create_dir_all(&settings.base_dir).map_err(|source| PersistenceError::Write {
            path: settings.base_dir.clone(),
            source,
        })?;

        let store = ContentStateStore::open(&settings.state_path)?;
        let limiter = Arc::new(ApiRateLimiter::new(
            settings.api_capacity,
            settings.api_window,
            settings.api_max_wait,
        ));

        let watchers = settings
            .watchers
            .iter()
            .map(|config| Watcher {
                config: config.clone(),
                filter: ApFilter::new(config.ap_filter.as_deref().unwrap_or_default()),
                last_run: None,
                active: None,
            })
            .collect();

        Ok(Self {
            snapshots: SnapshotFetcher::new(server, settings.fetch_attempts, settings.fetch_backoff),
            resolver: Resolver::new(source, limiter),
            downloader: Downloader::new(
                fetcher,
                settings.base_dir.clone(),
                settings.concurrency,
                settings.download_attempts,
                settings.download_backoff,
            ),
            reconciler: Reconciler::new(ForceRemover::platform_default(), settings.base_dir.clone()),
            manifest: ManifestWriter::new(
                settings.manifest_path.clone(),
                settings.index_path.clone(),
                settings.base_dir.clone(),
            ),
            store,
            watchers,
            settings,
        })
    }

    pub fn store(&self) -> &ContentStateStore {
        &self.store
    }

    /// Poll until `shutdown` resolves. A shutdown during a cycle drops it;
    /// unfinished downloads remove their part files.
    pub async fn run<S>(&mut self, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(watchers = self.watchers.len(), "Monitor started");

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, abandoning cycle");
                    break;
                }
                result = self.run_cycle(false) => match result {
                    Ok(stats) if stats.watchers_polled > 0 => info!(%stats, "Cycle complete"),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Cycle failed, previous state kept"),
                },
            }

            let wait = self.next_due_in();
            debug!(wait_ms = wait.as_millis() as u64, "Sleeping until next watcher is due");
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Run one cycle now. `force` polls every watcher regardless of interval.
    pub async fn run_cycle(&mut self, force: bool) -> Result<CycleStats, CycleError> {
        self.run_cycle_at(Utc::now(), force).await
    }

    /// One cycle with an explicit wall-clock time for state timestamps.
    pub async fn run_cycle_at(
        &mut self,
        now: DateTime<Utc>,
        force: bool,
    ) -> Result<CycleStats, CycleError> {
        let mut stats = CycleStats::default();

        self.poll_watchers(force, &mut stats).await;
        if stats.watchers_polled == 0 {
            return Ok(stats);
        }

        let seen = self.current_references();
        stats.posts_seen = seen.len() as u32;
        for sighting in seen.values() {
            let outcome = self
                .store
                .upsert_seen(
                    &sighting.reference.id,
                    sighting.class,
                    &sighting.reference.url,
                    now,
                )
                .await;
            match outcome {
                SeenOutcome::Created => stats.created += 1,
                SeenOutcome::Resurrected(_) => stats.resurrected += 1,
                SeenOutcome::Refreshed | SeenOutcome::PendingRemoval => {}
            }
        }
        self.store.commit().await?;

        let this = &*self;
        let pending = this.store.needs_work().await;
        let outcomes: Vec<Result<PostOutcome, PersistenceError>> = stream::iter(pending)
            .map(|id| async move { this.process_post(id, now).await })
            .buffer_unordered(this.settings.concurrency.max(1))
            .collect()
            .await;
        for outcome in outcomes {
            match outcome? {
                PostOutcome::Downloaded => stats.downloaded += 1,
                PostOutcome::Failed => stats.failed += 1,
                PostOutcome::RetryLater => stats.retry_later += 1,
            }
        }

        if self.watchers.iter().all(|w| w.active.is_some()) {
            let ids: BTreeSet<PostId> = seen.keys().cloned().collect();
            stats.stale = self.store.sweep_stale(&ids, now).await.len() as u32;
        } else {
            warn!("Not every rundown has been read yet, skipping stale sweep");
        }

        let removed = self.store.reap(self.settings.grace, now).await;
        if !removed.is_empty() {
            let cleanup = self.reconciler.reconcile(&self.store, removed).await;
            stats.removed = cleanup.removed + cleanup.already_gone;
            stats.cleanup_failed = cleanup.failed;
        }
        self.store.commit().await?;

        stats.manifest_entries = self.manifest.write(&self.store).await? as u32;
        Ok(stats)
    }

    /// Time until the next watcher is due.
    pub fn next_due_in(&self) -> Duration {
        let now = Instant::now();
        self.watchers
            .iter()
            .map(|w| match w.last_run {
                None => Duration::ZERO,
                Some(last) => w.interval().saturating_sub(now.duration_since(last)),
            })
            .min()
            .unwrap_or(Duration::from_secs(1))
    }

    async fn poll_watchers(&mut self, force: bool, stats: &mut CycleStats) {
        let now = Instant::now();
        for watcher in self.watchers.iter_mut() {
            if !force && !watcher.is_due(now) {
                continue;
            }
            watcher.last_run = Some(now);
            stats.watchers_polled += 1;

            let name = watcher.config.name.as_str();
            let rundown = watcher.config.rundown_path.as_str();
            let snapshot = match self.snapshots.fetch(rundown).await {
                Ok(s) => s,
                Err(e @ InewsError::Path { .. }) => {
                    // Counts as read with no references for the stale sweep.
                    error!(monitor = name, rundown, error = %e, "Rundown path rejected by server");
                    stats.watchers_failed += 1;
                    watcher.active.get_or_insert_with(BTreeMap::new);
                    continue;
                }
                Err(e) => {
                    warn!(monitor = name, rundown, error = %e, "Rundown fetch failed, keeping previous references");
                    stats.watchers_failed += 1;
                    continue;
                }
            };

            if snapshot.listed == 0 && watcher.active.as_ref().is_some_and(|a| !a.is_empty()) {
                warn!(monitor = name, rundown, "Rundown listed empty, keeping previous references");
                continue;
            }

            stats.stories += snapshot.stories.len() as u32;
            stats.stories_skipped += snapshot.skipped as u32;
            let scan = references_in(&snapshot, &watcher.filter);
            stats.labels += scan.labels;
            stats.stories_skipped += scan.skipped;
            stats.stories_filtered += scan.filtered;
            info!(
                monitor = name,
                rundown,
                stories = snapshot.stories.len(),
                filtered = scan.filtered,
                labels = scan.labels,
                posts = scan.references.len(),
                "Rundown scanned"
            );
            watcher.active = Some(scan.references);
        }
    }

    fn current_references(&self) -> BTreeMap<PostId, Sighting> {
        let mut out = BTreeMap::new();
        for active in self.watchers.iter().filter_map(|w| w.active.as_ref()) {
            for (id, sighting) in active {
                out.entry(id.clone()).or_insert_with(|| sighting.clone());
            }
        }
        out
    }

    async fn process_post(
        &self,
        id: PostId,
        now: DateTime<Utc>,
    ) -> Result<PostOutcome, PersistenceError> {
        let Some(entry) = self.store.get(&id).await else {
            return Ok(PostOutcome::RetryLater);
        };

        let (media, summary): (Vec<MediaItem>, Option<PostSummary>) =
            if entry.status == EntryStatus::Resolved
                && !entry.planned_media.is_empty()
                && entry.summary.is_some()
            {
                (entry.planned_media, entry.summary)
            } else {
                match self.resolver.resolve(&id).await {
                    Ok(post) if post.media.is_empty() => {
                        warn!(post_id = %id, "Post has no downloadable media");
                        self.store.mark_failed(&id, "post has no downloadable media").await;
                        self.store.commit().await?;
                        return Ok(PostOutcome::Failed);
                    }
                    Ok(post) => {
                        self.store
                            .mark_resolved(&id, post.media.clone(), post.summary.clone())
                            .await;
                        (post.media, post.summary)
                    }
                    Err(e) => {
                        warn!(post_id = %id, error = %e, "Resolution failed");
                        let status = self
                            .store
                            .record_failure(&id, &e.to_string(), self.settings.max_retries)
                            .await;
                        self.store.commit().await?;
                        return Ok(match status {
                            Some(EntryStatus::Failed) => PostOutcome::Failed,
                            _ => PostOutcome::RetryLater,
                        });
                    }
                }
            };

        let report = self.downloader.download_post(&id, &media).await;
        let outcome = if report.saved.is_empty() {
            self.store.mark_failed(&id, &report.failure_summary()).await;
            PostOutcome::Failed
        } else {
            if let Some(summary) = &summary {
                let dir = self.downloader.post_dir(&id);
                if let Err(e) = write_post_metadata(&dir, summary, &report.saved) {
                    warn!(post_id = %id, error = %e, "Could not write post metadata");
                }
            }
            self.store.mark_downloaded(&id, report.paths(), now).await;
            PostOutcome::Downloaded
        };
        self.store.commit().await?;
        Ok(outcome)
    }
}

#[derive(Debug, Default)]
struct Scan {
    references: BTreeMap<PostId, Sighting>,
    labels: u32,
    /// Stories rejected as malformed.
    skipped: u32,
    /// Stories the monitor's filter did not admit.
    filtered: u32,
}

/// Post references of a snapshot, first sighting wins.
fn references_in(snapshot: &StorySnapshot, filter: &ApFilter) -> Scan {
    let mut scan = Scan::default();

    for story in &snapshot.stories {
        let found = match extract_labels(story) {
            Ok(found) => found,
            Err(e) => {
                warn!(
                    story = story.name.as_str(),
                    title = story_title(&story.content).unwrap_or_default(),
                    error = %e,
                    "Malformed story skipped"
                );
                scan.skipped += 1;
                continue;
            }
        };
        if !filter.admits(story) {
            scan.filtered += 1;
            continue;
        }
        for label in found {
            scan.labels += 1;
            let Some(reference) = extract_post_reference(&label.raw) else {
                debug!(story = story.name.as_str(), kind = label.kind.as_str(), "Label without post URL");
                continue;
            };
            scan.references
                .entry(reference.id.clone())
                .or_insert(Sighting {
                    reference,
                    class: label.class,
                });
        }
    }

    scan
}
