use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use inews_client::{InewsError, StoryServer};
use tracing::{debug, info, warn};

use crate::retry::retry_transient;

/// One story document of a rundown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Story {
    pub name: String,
    pub content: String,
}

/// Stories of one rundown at one instant. Owned by a single cycle.
#[derive(Debug, Clone)]
pub struct StorySnapshot {
    pub rundown: String,
    pub taken_at: DateTime<Utc>,
    pub stories: Vec<Story>,
    /// Entries the listing returned, before filtering.
    pub listed: usize,
    /// Stories that could not be transferred and were skipped.
    pub skipped: usize,
}

pub struct SnapshotFetcher {
    server: Arc<dyn StoryServer>,
    max_attempts: u32,
    backoff_base: Duration,
}

impl SnapshotFetcher {
    pub fn new(server: Arc<dyn StoryServer>, max_attempts: u32, backoff_base: Duration) -> Self {
        Self {
            server,
            max_attempts,
            backoff_base,
        }
    }

    /// Fetch every story of `rundown`.
    ///
    /// Connection failures are retried with backoff and then returned; the
    /// caller skips this rundown for the cycle. A transfer failure on one
    /// story only drops that story.
    pub async fn fetch(&self, rundown: &str) -> Result<StorySnapshot, InewsError> {
        let entries = retry_transient(
            "list rundown",
            self.max_attempts,
            self.backoff_base,
            InewsError::is_transient,
            || self.server.list(rundown),
        )
        .await?;

        let listed = entries.len();
        let mut stories = Vec::new();
        let mut skipped = 0usize;

        for entry in entries.into_iter().filter(|e| e.is_story()) {
            let read = retry_transient(
                "read story",
                self.max_attempts,
                self.backoff_base,
                InewsError::is_transient,
                || self.server.read(rundown, &entry.name),
            )
            .await;

            match read {
                Ok(content) => stories.push(Story {
                    name: entry.name,
                    content,
                }),
                Err(e @ InewsError::Connection(_)) => return Err(e),
                Err(e) => {
                    warn!(rundown, story = entry.name.as_str(), error = %e, "Skipping story");
                    skipped += 1;
                }
            }
        }

        debug!(rundown, listed, stories = stories.len(), skipped, "Snapshot taken");
        if skipped > 0 {
            info!(rundown, skipped, "Some stories could not be read this cycle");
        }

        Ok(StorySnapshot {
            rundown: rundown.to_string(),
            taken_at: Utc::now(),
            stories,
            listed,
            skipped,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockStoryServer;

    fn fetcher(server: Arc<MockStoryServer>) -> SnapshotFetcher {
        SnapshotFetcher::new(server, 3, Duration::ZERO)
    }

    #[tokio::test]
    async fn reads_every_story_and_skips_directories() {
        let server = Arc::new(
            MockStoryServer::new()
                .with_story("SHOW.RUNDOWN", "0001", "<ap>X_Total |a|</ap>")
                .with_story("SHOW.RUNDOWN", "0002", "plain")
                .with_dir("SHOW.RUNDOWN", "ARCHIVE"),
        );

        let snapshot = fetcher(server).fetch("SHOW.RUNDOWN").await.unwrap();
        let names: Vec<_> = snapshot.stories.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["0001", "0002"]);
        assert_eq!(snapshot.listed, 3);
    }

    #[tokio::test]
    async fn transient_connection_failures_are_retried() {
        let server = Arc::new(MockStoryServer::new().with_story("R", "0001", "x"));
        server.fail_next_connections(2);

        let snapshot = fetcher(server.clone()).fetch("R").await.unwrap();
        assert_eq!(snapshot.stories.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_fetch() {
        let server = Arc::new(MockStoryServer::new().with_story("R", "0001", "x"));
        server.fail_next_connections(3);

        let err = fetcher(server).fetch("R").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn transfer_error_skips_only_that_story() {
        let server = Arc::new(
            MockStoryServer::new()
                .with_story("R", "0001", "ok")
                .with_story("R", "0002", "ok"),
        );
        server.corrupt_story("R", "0001");

        let snapshot = fetcher(server).fetch("R").await.unwrap();
        assert_eq!(snapshot.stories.len(), 1);
        assert_eq!(snapshot.stories[0].name, "0002");
        assert_eq!(snapshot.skipped, 1);
    }

    #[tokio::test]
    async fn unknown_rundown_is_not_retried() {
        let server = Arc::new(MockStoryServer::new());
        let err = fetcher(server.clone()).fetch("MISSING").await.unwrap_err();
        assert!(matches!(err, InewsError::Path { .. }));
        assert_eq!(server.list_calls(), 1);
    }
}
