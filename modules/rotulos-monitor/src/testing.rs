// Test mocks for the monitor pipeline.
//
// One mock per trait boundary:
// - MockStoryServer (StoryServer): rundown → stories, editable between cycles
// - MockMediaSource (MediaSource): post id → ResolvedPost or error
// - MockMediaFetcher (MediaFetcher): URL → bytes or error
//
// Plus `resolved_post` for building lookup results.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use inews_client::{DirEntry, InewsError, StoryServer};
use rotulos_common::PostId;
use x_client::{PostSummary, RemoteMedia, RemoteMediaKind};

use crate::error::{DownloadError, ResolutionError};
use crate::resolver::{plan_media, ResolvedPost};
use crate::traits::{MediaFetcher, MediaSource};

// ---------------------------------------------------------------------------
// MockStoryServer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct MockEntry {
    name: String,
    is_dir: bool,
    content: String,
    corrupt: bool,
}

/// In-memory story server. Rundowns keep insertion order.
/// Builder: `.with_story()`, `.with_dir()`; mutators take `&self` so tests
/// can edit a rundown between cycles while the monitor holds the Arc.
#[derive(Default)]
pub struct MockStoryServer {
    rundowns: Mutex<BTreeMap<String, Vec<MockEntry>>>,
    failing_connections: AtomicU32,
    list_calls: AtomicU32,
}

impl MockStoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_story(self, rundown: &str, name: &str, content: &str) -> Self {
        self.set_story(rundown, name, content);
        self
    }

    pub fn with_dir(self, rundown: &str, name: &str) -> Self {
        self.rundowns
            .lock()
            .unwrap()
            .entry(rundown.to_string())
            .or_default()
            .push(MockEntry {
                name: name.to_string(),
                is_dir: true,
                content: String::new(),
                corrupt: false,
            });
        self
    }

    /// Create an empty rundown.
    pub fn with_rundown(self, rundown: &str) -> Self {
        self.rundowns
            .lock()
            .unwrap()
            .entry(rundown.to_string())
            .or_default();
        self
    }

    /// Add a story or replace its content.
    pub fn set_story(&self, rundown: &str, name: &str, content: &str) {
        let mut rundowns = self.rundowns.lock().unwrap();
        let entries = rundowns.entry(rundown.to_string()).or_default();
        match entries.iter_mut().find(|e| e.name == name) {
            Some(e) => {
                e.content = content.to_string();
                e.corrupt = false;
            }
            None => entries.push(MockEntry {
                name: name.to_string(),
                is_dir: false,
                content: content.to_string(),
                corrupt: false,
            }),
        }
    }

    pub fn remove_story(&self, rundown: &str, name: &str) {
        if let Some(entries) = self.rundowns.lock().unwrap().get_mut(rundown) {
            entries.retain(|e| e.name != name);
        }
    }

    /// Reads of this story fail with a transfer error.
    pub fn corrupt_story(&self, rundown: &str, name: &str) {
        if let Some(entries) = self.rundowns.lock().unwrap().get_mut(rundown) {
            for e in entries.iter_mut().filter(|e| e.name == name) {
                e.corrupt = true;
            }
        }
    }

    /// The next `n` calls (list or read) fail with a connection error.
    pub fn fail_next_connections(&self, n: u32) {
        self.failing_connections.store(n, Ordering::SeqCst);
    }

    pub fn list_calls(&self) -> u32 {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn take_connection_failure(&self) -> Result<(), InewsError> {
        let failed = self
            .failing_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            Err(InewsError::Connection("MockStoryServer: connection refused".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StoryServer for MockStoryServer {
    async fn list(&self, dir: &str) -> inews_client::Result<Vec<DirEntry>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.take_connection_failure()?;

        let rundowns = self.rundowns.lock().unwrap();
        let entries = rundowns.get(dir).ok_or_else(|| InewsError::Path {
            path: dir.to_string(),
            message: "550 no such directory".into(),
        })?;
        Ok(entries
            .iter()
            .map(|e| DirEntry {
                name: e.name.clone(),
                is_dir: e.is_dir,
                size: Some(e.content.len() as u64),
                raw: e.name.clone(),
            })
            .collect())
    }

    async fn read(&self, dir: &str, name: &str) -> inews_client::Result<String> {
        self.take_connection_failure()?;

        let rundowns = self.rundowns.lock().unwrap();
        let entry = rundowns
            .get(dir)
            .and_then(|entries| entries.iter().find(|e| e.name == name && !e.is_dir));
        match entry {
            Some(e) if !e.corrupt => Ok(e.content.clone()),
            Some(_) => Err(InewsError::Transfer {
                name: name.to_string(),
                message: "426 transfer aborted".into(),
            }),
            None => Err(InewsError::Transfer {
                name: name.to_string(),
                message: "550 no such story".into(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// MockMediaSource
// ---------------------------------------------------------------------------

/// Lookup result for post `id` with the given remote media, planned the
/// same way the X client's results are.
pub fn resolved_post(id: &str, media: &[(RemoteMediaKind, &str)]) -> ResolvedPost {
    let remote: Vec<RemoteMedia> = media
        .iter()
        .map(|(kind, url)| RemoteMedia {
            kind: *kind,
            url: url.to_string(),
        })
        .collect();
    ResolvedPost {
        id: PostId::parse(id).expect("numeric post id"),
        media: plan_media(&remote),
        summary: Some(PostSummary {
            id: id.to_string(),
            text: format!("Post {id}"),
            name: "Test Author".into(),
            username: "@test".into(),
            created_at: None,
        }),
    }
}

/// HashMap-based media source. Unregistered ids are `NotFound`.
#[derive(Default)]
pub struct MockMediaSource {
    responses: Mutex<HashMap<PostId, Result<ResolvedPost, ResolutionError>>>,
    calls: Mutex<HashMap<PostId, u32>>,
}

impl MockMediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_post(self, post: ResolvedPost) -> Self {
        self.set_post(post);
        self
    }

    pub fn on_error(self, id: &str, err: ResolutionError) -> Self {
        if let Some(id) = PostId::parse(id) {
            self.responses.lock().unwrap().insert(id, Err(err));
        }
        self
    }

    pub fn set_post(&self, post: ResolvedPost) {
        self.responses
            .lock()
            .unwrap()
            .insert(post.id.clone(), Ok(post));
    }

    pub fn lookups(&self, id: &PostId) -> u32 {
        self.calls.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn total_lookups(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl MediaSource for MockMediaSource {
    async fn lookup(&self, id: &PostId) -> Result<ResolvedPost, ResolutionError> {
        *self.calls.lock().unwrap().entry(id.clone()).or_default() += 1;
        self.responses
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_else(|| Err(ResolutionError::NotFound(id.to_string())))
    }
}

// ---------------------------------------------------------------------------
// MockMediaFetcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum MockResponse {
    Body(Bytes),
    Error(DownloadError),
    /// Fails transiently `remaining` more times, then serves the body.
    Flaky { remaining: u32, body: Bytes },
}

/// URL-keyed media fetcher. Unregistered URLs are a permanent 404.
#[derive(Default)]
pub struct MockMediaFetcher {
    responses: Mutex<HashMap<String, MockResponse>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl MockMediaFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_media(self, url: &str, body: &[u8]) -> Self {
        self.insert(url, MockResponse::Body(Bytes::copy_from_slice(body)));
        self
    }

    pub fn on_error(self, url: &str, err: DownloadError) -> Self {
        self.insert(url, MockResponse::Error(err));
        self
    }

    pub fn on_flaky(self, url: &str, failures: u32, body: &[u8]) -> Self {
        self.insert(
            url,
            MockResponse::Flaky {
                remaining: failures,
                body: Bytes::copy_from_slice(body),
            },
        );
        self
    }

    pub fn fetches(&self, url: &str) -> u32 {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_fetches(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }

    fn insert(&self, url: &str, response: MockResponse) {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), response);
    }
}

#[async_trait]
impl MediaFetcher for MockMediaFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, DownloadError> {
        *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;

        let mut responses = self.responses.lock().unwrap();
        match responses.get_mut(url) {
            Some(MockResponse::Body(body)) => Ok(body.clone()),
            Some(MockResponse::Error(e)) => Err(e.clone()),
            Some(MockResponse::Flaky { remaining, body }) => {
                if *remaining > 0 {
                    *remaining -= 1;
                    Err(DownloadError::Transient("MockMediaFetcher: 503".into()))
                } else {
                    Ok(body.clone())
                }
            }
            None => Err(DownloadError::Permanent(format!(
                "MockMediaFetcher: nothing registered for {url}"
            ))),
        }
    }
}
