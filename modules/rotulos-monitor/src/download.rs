//! Media downloads for resolved posts.
//!
//! Every item of every post shares one semaphore, so `concurrency` bounds
//! the process-wide number of transfers. Items are retried individually and
//! land in `<base>/<post id>/` through a `.part` file renamed into place.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rotulos_common::{MediaKind, PostId};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use x_client::PostSummary;

use crate::atomic::write_atomic;
use crate::error::DownloadError;
use crate::resolver::MediaItem;
use crate::retry::retry_transient;
use crate::traits::MediaFetcher;

/// Metadata file written next to the media for the graphics templates.
pub const METADATA_FILE: &str = "tweet_api.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedMedia {
    pub item: MediaItem,
    pub path: PathBuf,
}

/// Outcome of one post's downloads, in item order.
#[derive(Debug, Default)]
pub struct DownloadReport {
    pub saved: Vec<SavedMedia>,
    pub failed: Vec<(MediaItem, DownloadError)>,
}

impl DownloadReport {
    pub fn paths(&self) -> Vec<PathBuf> {
        self.saved.iter().map(|s| s.path.clone()).collect()
    }

    pub fn failure_summary(&self) -> String {
        self.failed
            .iter()
            .map(|(item, e)| format!("{}: {e}", item.file_name))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

pub struct Downloader {
    fetcher: Arc<dyn MediaFetcher>,
    base_dir: PathBuf,
    permits: Arc<Semaphore>,
    max_attempts: u32,
    backoff_base: Duration,
}

impl Downloader {
    pub fn new(
        fetcher: Arc<dyn MediaFetcher>,
        base_dir: PathBuf,
        concurrency: usize,
        max_attempts: u32,
        backoff_base: Duration,
    ) -> Self {
        Self {
            fetcher,
            base_dir,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            max_attempts,
            backoff_base,
        }
    }

    pub fn post_dir(&self, id: &PostId) -> PathBuf {
        self.base_dir.join(id.as_str())
    }

    /// Download every item of a post. A failed item never blocks its siblings.
    pub async fn download_post(&self, id: &PostId, items: &[MediaItem]) -> DownloadReport {
        let dir = self.post_dir(id);
        let results = join_all(items.iter().map(|item| self.download_item(&dir, item))).await;

        let mut report = DownloadReport::default();
        for (item, result) in items.iter().zip(results) {
            match result {
                Ok(path) => report.saved.push(SavedMedia {
                    item: item.clone(),
                    path,
                }),
                Err(e) => {
                    warn!(post_id = %id, file = item.file_name.as_str(), url = item.remote_url.as_str(), error = %e, "Media download failed");
                    report.failed.push((item.clone(), e));
                }
            }
        }

        info!(
            post_id = %id,
            saved = report.saved.len(),
            failed = report.failed.len(),
            "Post downloads finished"
        );
        report
    }

    async fn download_item(&self, dir: &Path, item: &MediaItem) -> Result<PathBuf, DownloadError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| DownloadError::Io("download pool closed".into()))?;

        let bytes = retry_transient(
            "download media",
            self.max_attempts,
            self.backoff_base,
            DownloadError::is_transient,
            || self.fetcher.fetch(&item.remote_url),
        )
        .await?;

        let target = dir.join(&item.file_name);
        write_via_part(&target, &bytes)
            .await
            .map_err(|e| DownloadError::Io(format!("{}: {e}", target.display())))?;
        debug!(path = %target.display(), bytes = bytes.len(), "Media saved");
        Ok(target)
    }
}

/// Removes the part file unless the rename went through, including when the
/// download future is dropped mid-write.
struct PartGuard {
    path: PathBuf,
    armed: bool,
}

impl Drop for PartGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

async fn write_via_part(target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(dir).await?;

    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut guard = PartGuard {
        path: dir.join(format!(".{name}.part")),
        armed: true,
    };

    let mut file = tokio::fs::File::create(&guard.path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&guard.path, target).await?;
    guard.armed = false;
    Ok(())
}

#[derive(Serialize)]
struct PostMetadata<'a> {
    text: &'a str,
    name: &'a str,
    username: &'a str,
    profile_image: Option<String>,
    tweet_image: Option<String>,
    tweet_video: Option<String>,
}

/// Write `tweet_api.json` with the cleaned post text and the first saved
/// file of each kind, as absolute forward-slash paths.
pub fn write_post_metadata(
    dir: &Path,
    summary: &PostSummary,
    saved: &[SavedMedia],
) -> std::io::Result<PathBuf> {
    let first = |pred: fn(MediaKind) -> bool| {
        saved
            .iter()
            .find(|s| pred(s.item.kind))
            .map(|s| graphics_path(&s.path))
    };

    let metadata = PostMetadata {
        text: &summary.text,
        name: &summary.name,
        username: &summary.username,
        profile_image: first(|k| k == MediaKind::ProfileImage),
        tweet_image: first(|k| k == MediaKind::Photo),
        tweet_video: first(|k| k.is_video()),
    };

    let mut bytes = serde_json::to_vec_pretty(&metadata)?;
    bytes.push(b'\n');
    let path = dir.join(METADATA_FILE);
    write_atomic(&path, &bytes)?;
    Ok(path)
}

fn graphics_path(path: &Path) -> String {
    std::path::absolute(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .replace('\\', "/")
}
