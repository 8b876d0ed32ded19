//! Content state store: the only durable record of what exists locally and why.
//!
//! One entry per post id. Every lifecycle transition goes through the methods
//! below, serialized by an async mutex. Mutations only mark the set dirty;
//! [`ContentStateStore::commit`] writes the whole set through an atomic
//! replace so a crash leaves the previous or the next file, never a torn one.
//!
//! ```text
//! PENDING ─resolve─▶ RESOLVED ─download─▶ DOWNLOADED
//!    │                  │                     │
//!    └────── FAILED ◀───┘                     │
//!  (any of the four) ─unseen─▶ STALE ─grace─▶ REMOVED ─cleanup─▶ (gone)
//!                                 └─seen again─▶ status before STALE
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rotulos_common::{EntryStatus, LabelClass, PostId};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use x_client::PostSummary;

use crate::atomic::write_atomic;
use crate::error::PersistenceError;
use crate::resolver::MediaItem;

const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentStateEntry {
    pub status: EntryStatus,
    pub label_class: LabelClass,
    pub source_url: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_before_stale: Option<EntryStatus>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Items returned by the resolver, kept so a restart between resolve and
    /// download does not spend another API call.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub planned_media: Vec<MediaItem>,
    /// Post text and author from the same lookup, for `tweet_api.json`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<PostSummary>,
    /// Local paths of the downloaded items.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloaded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cleanup_failures: u32,
}

impl ContentStateEntry {
    fn new(class: LabelClass, source_url: &str, now: DateTime<Utc>) -> Self {
        Self {
            status: EntryStatus::Pending,
            label_class: class,
            source_url: source_url.to_string(),
            first_seen: now,
            last_seen: now,
            stale_since: None,
            status_before_stale: None,
            retry_count: 0,
            last_error: None,
            planned_media: Vec::new(),
            summary: None,
            media: Vec::new(),
            downloaded_at: None,
            cleanup_failures: 0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    entries: BTreeMap<PostId, ContentStateEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeenOutcome {
    Created,
    Refreshed,
    /// Was STALE; now back to the status it held before.
    Resurrected(EntryStatus),
    /// REMOVED and waiting for cleanup; the sighting is ignored.
    PendingRemoval,
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<PostId, ContentStateEntry>,
    dirty: bool,
}

pub struct ContentStateStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl ContentStateStore {
    /// Load the committed state. A missing file is an empty store; an
    /// unreadable one is an error rather than a silent reset.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(raw) => {
                let file: StateFile =
                    serde_json::from_slice(&raw).map_err(|source| PersistenceError::Corrupt {
                        path: path.clone(),
                        source,
                    })?;
                file.entries
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => {
                return Err(PersistenceError::Read {
                    path: path.clone(),
                    source,
                })
            }
        };

        info!(path = %path.display(), entries = entries.len(), "Content state loaded");
        Ok(Self {
            path,
            inner: Mutex::new(Inner {
                entries,
                dirty: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a sighting. Creates a PENDING entry, refreshes `last_seen`, or
    /// resurrects a STALE entry.
    pub async fn upsert_seen(
        &self,
        id: &PostId,
        class: LabelClass,
        source_url: &str,
        now: DateTime<Utc>,
    ) -> SeenOutcome {
        let mut inner = self.inner.lock().await;
        inner.dirty = true;

        let Some(entry) = inner.entries.get_mut(id) else {
            inner
                .entries
                .insert(id.clone(), ContentStateEntry::new(class, source_url, now));
            debug!(post_id = %id, class = %class, "New post reference");
            return SeenOutcome::Created;
        };

        match entry.status {
            EntryStatus::Removed => {
                warn!(post_id = %id, "Post seen again while awaiting cleanup, ignoring");
                SeenOutcome::PendingRemoval
            }
            EntryStatus::Stale => {
                let restored = entry.status_before_stale.take().unwrap_or(EntryStatus::Pending);
                entry.status = restored;
                entry.stale_since = None;
                entry.last_seen = now;
                entry.label_class = class;
                info!(post_id = %id, status = %restored, "Stale post referenced again");
                SeenOutcome::Resurrected(restored)
            }
            _ => {
                entry.last_seen = now;
                entry.label_class = class;
                SeenOutcome::Refreshed
            }
        }
    }

    /// PENDING (or RESOLVED) → RESOLVED with the media to download.
    pub async fn mark_resolved(
        &self,
        id: &PostId,
        media: Vec<MediaItem>,
        summary: Option<PostSummary>,
    ) -> bool {
        self.transition(id, "mark_resolved", |entry| {
            matches!(entry.status, EntryStatus::Pending | EntryStatus::Resolved).then(|| {
                entry.status = EntryStatus::Resolved;
                entry.planned_media = media;
                entry.summary = summary;
                entry.retry_count = 0;
                entry.last_error = None;
            })
        })
        .await
    }

    /// RESOLVED → DOWNLOADED with the local paths that were written.
    pub async fn mark_downloaded(
        &self,
        id: &PostId,
        paths: Vec<PathBuf>,
        now: DateTime<Utc>,
    ) -> bool {
        self.transition(id, "mark_downloaded", |entry| {
            (entry.status == EntryStatus::Resolved).then(|| {
                entry.status = EntryStatus::Downloaded;
                entry.media = paths;
                entry.downloaded_at = Some(now);
                entry.last_error = None;
            })
        })
        .await
    }

    /// PENDING or RESOLVED → FAILED, with the reason kept for triage.
    pub async fn mark_failed(&self, id: &PostId, reason: &str) -> bool {
        self.transition(id, "mark_failed", |entry| {
            matches!(entry.status, EntryStatus::Pending | EntryStatus::Resolved).then(|| {
                entry.status = EntryStatus::Failed;
                entry.last_error = Some(reason.to_string());
            })
        })
        .await
    }

    /// Count a retryable failure. The entry moves to FAILED once
    /// `max_retries` failures have been recorded. Returns the resulting
    /// status, or `None` when the entry is not in a retryable state.
    pub async fn record_failure(
        &self,
        id: &PostId,
        reason: &str,
        max_retries: u32,
    ) -> Option<EntryStatus> {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.entries.get_mut(id) else {
            warn!(post_id = %id, "record_failure on unknown post ignored");
            return None;
        };
        if !matches!(entry.status, EntryStatus::Pending | EntryStatus::Resolved) {
            warn!(post_id = %id, status = %entry.status, "record_failure ignored");
            return None;
        }

        entry.retry_count += 1;
        entry.last_error = Some(reason.to_string());
        if entry.retry_count >= max_retries {
            entry.status = EntryStatus::Failed;
            warn!(post_id = %id, retries = entry.retry_count, reason, "Post failed permanently");
        }
        let status = entry.status;
        inner.dirty = true;
        Some(status)
    }

    /// Mark every live entry absent from `seen` as STALE.
    pub async fn sweep_stale(&self, seen: &BTreeSet<PostId>, now: DateTime<Utc>) -> Vec<PostId> {
        let mut inner = self.inner.lock().await;
        let mut swept = Vec::new();
        for (id, entry) in inner.entries.iter_mut() {
            let live = matches!(
                entry.status,
                EntryStatus::Pending
                    | EntryStatus::Resolved
                    | EntryStatus::Downloaded
                    | EntryStatus::Failed
            );
            if live && !seen.contains(id) {
                entry.status_before_stale = Some(entry.status);
                entry.status = EntryStatus::Stale;
                entry.stale_since = Some(now);
                swept.push(id.clone());
            }
        }
        if !swept.is_empty() {
            inner.dirty = true;
            info!(count = swept.len(), "Posts no longer referenced, marked stale");
        }
        swept
    }

    /// Move STALE entries older than `grace` to REMOVED. Returns every
    /// REMOVED id, including ones whose earlier cleanup failed.
    pub async fn reap(&self, grace: Duration, now: DateTime<Utc>) -> Vec<PostId> {
        let mut inner = self.inner.lock().await;
        let mut newly = 0usize;
        let mut removed = Vec::new();
        for (id, entry) in inner.entries.iter_mut() {
            if entry.status == EntryStatus::Stale {
                let expired = entry
                    .stale_since
                    .and_then(|since| (now - since).to_std().ok())
                    .is_some_and(|elapsed| elapsed >= grace);
                if expired {
                    entry.status = EntryStatus::Removed;
                    newly += 1;
                }
            }
            if entry.status == EntryStatus::Removed {
                removed.push(id.clone());
            }
        }
        if newly > 0 {
            inner.dirty = true;
            info!(count = newly, "Stale posts past grace period, removing");
        }
        removed
    }

    /// Cleanup succeeded: the entry is destroyed.
    pub async fn finish_removal(&self, id: &PostId) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.entries.get(id).map(|e| e.status) {
            Some(EntryStatus::Removed) => {
                inner.entries.remove(id);
                inner.dirty = true;
                true
            }
            other => {
                warn!(post_id = %id, status = ?other, "finish_removal ignored");
                false
            }
        }
    }

    /// Cleanup failed: keep the REMOVED entry and count the attempt.
    pub async fn record_cleanup_failure(&self, id: &PostId, error: &str) -> bool {
        self.transition(id, "record_cleanup_failure", |entry| {
            (entry.status == EntryStatus::Removed).then(|| {
                entry.cleanup_failures += 1;
                entry.last_error = Some(error.to_string());
            })
        })
        .await
    }

    /// Posts that still need resolving or downloading.
    pub async fn needs_work(&self) -> Vec<PostId> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .iter()
            .filter(|(_, e)| matches!(e.status, EntryStatus::Pending | EntryStatus::Resolved))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn get(&self, id: &PostId) -> Option<ContentStateEntry> {
        self.inner.lock().await.entries.get(id).cloned()
    }

    pub async fn downloaded(&self) -> Vec<(PostId, ContentStateEntry)> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .iter()
            .filter(|(_, e)| e.status == EntryStatus::Downloaded)
            .map(|(id, e)| (id.clone(), e.clone()))
            .collect()
    }

    pub async fn entries(&self) -> BTreeMap<PostId, ContentStateEntry> {
        self.inner.lock().await.entries.clone()
    }

    /// Persist the entry set if anything changed since the last commit.
    pub async fn commit(&self) -> Result<(), PersistenceError> {
        let mut inner = self.inner.lock().await;
        if !inner.dirty {
            return Ok(());
        }

        let file = StateFile {
            version: STATE_VERSION,
            entries: inner.entries.clone(),
        };
        let mut bytes = serde_json::to_vec_pretty(&file)?;
        bytes.push(b'\n');
        write_atomic(&self.path, &bytes).map_err(|source| PersistenceError::Write {
            path: self.path.clone(),
            source,
        })?;

        inner.dirty = false;
        debug!(path = %self.path.display(), entries = inner.entries.len(), "Content state committed");
        Ok(())
    }

    async fn transition<F>(&self, id: &PostId, op: &str, apply: F) -> bool
    where
        F: FnOnce(&mut ContentStateEntry) -> Option<()>,
    {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.entries.get_mut(id) else {
            warn!(post_id = %id, op, "Transition on unknown post ignored");
            return false;
        };
        let from = entry.status;
        if apply(entry).is_none() {
            warn!(post_id = %id, op, status = %from, "Invalid transition ignored");
            return false;
        }
        inner.dirty = true;
        true
    }
}
