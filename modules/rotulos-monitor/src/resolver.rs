//! From label text to downloadable media.
//!
//! A label cites a post by its x.com / twitter.com status URL. The numeric id
//! is looked up through a [`MediaSource`] once the shared API token bucket
//! grants a token, and the returned assets are named the way the graphics
//! templates expect them.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use rotulos_common::{MediaKind, PostId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use x_client::{PostSummary, RemoteMedia, RemoteMediaKind};

use crate::error::ResolutionError;
use crate::rate_limit::ApiRateLimiter;
use crate::traits::MediaSource;

static POST_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)https?://(?:www\.|mobile\.)?(?:x|twitter)\.com/[A-Za-z0-9_]+/status(?:es)?/(\d+)",
    )
    .expect("valid regex")
});

/// A post cited by a label. Many labels may point at the same post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostReference {
    pub id: PostId,
    /// Status URL up to and including the id.
    pub url: String,
}

/// First x.com / twitter.com status URL in `text`.
pub fn extract_post_reference(text: &str) -> Option<PostReference> {
    let cap = POST_URL_RE.captures(text)?;
    let id = PostId::parse(cap.get(1)?.as_str())?;
    Some(PostReference {
        id,
        url: cap.get(0)?.as_str().to_string(),
    })
}

/// One asset to download for a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaItem {
    pub kind: MediaKind,
    pub remote_url: String,
    /// File name inside the post directory.
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPost {
    pub id: PostId,
    pub media: Vec<MediaItem>,
    pub summary: Option<PostSummary>,
}

/// Name remote assets the way the graphics templates expect them:
/// `FotoPerfil.jpg`, `FotoPost.jpg`, `FotoPost2.png`, `VideoPost.mp4`, ...
/// Repeated URLs are dropped.
pub fn plan_media(remote: &[RemoteMedia]) -> Vec<MediaItem> {
    let mut seen = HashSet::new();
    let mut photos = 0u32;
    let mut videos = 0u32;
    let mut out = Vec::new();

    for media in remote {
        if !seen.insert(media.url.as_str()) {
            continue;
        }
        let (kind, stem, n) = match media.kind {
            RemoteMediaKind::ProfileImage => (MediaKind::ProfileImage, "FotoPerfil", 1),
            RemoteMediaKind::Photo => {
                photos += 1;
                (MediaKind::Photo, "FotoPost", photos)
            }
            RemoteMediaKind::Video => {
                videos += 1;
                (MediaKind::Video, "VideoPost", videos)
            }
            RemoteMediaKind::AnimatedGif => {
                videos += 1;
                (MediaKind::AnimatedGif, "VideoPost", videos)
            }
        };
        let ext = if kind.is_video() {
            "mp4".to_string()
        } else {
            url_extension(&media.url).unwrap_or_else(|| "jpg".to_string())
        };
        let file_name = if n > 1 {
            format!("{stem}{n}.{ext}")
        } else {
            format!("{stem}.{ext}")
        };
        out.push(MediaItem {
            kind,
            remote_url: media.url.clone(),
            file_name,
        });
    }
    out
}

fn url_extension(raw: &str) -> Option<String> {
    let parsed = url::Url::parse(raw).ok()?;
    let last = parsed.path_segments()?.next_back()?;
    let (_, ext) = last.rsplit_once('.')?;
    let ok = !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric());
    ok.then(|| ext.to_ascii_lowercase())
}

/// Resolves post ids to media through the shared API token bucket.
pub struct Resolver {
    source: Arc<dyn MediaSource>,
    limiter: Arc<ApiRateLimiter>,
}

impl Resolver {
    pub fn new(source: Arc<dyn MediaSource>, limiter: Arc<ApiRateLimiter>) -> Self {
        Self { source, limiter }
    }

    pub async fn resolve(&self, id: &PostId) -> Result<ResolvedPost, ResolutionError> {
        self.limiter.acquire().await?;
        debug!(post_id = %id, "Resolving post");
        let post = self.source.lookup(id).await?;
        info!(post_id = %id, media = post.media.len(), "Post resolved");
        Ok(post)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(kind: RemoteMediaKind, url: &str) -> RemoteMedia {
        RemoteMedia {
            kind,
            url: url.to_string(),
        }
    }

    #[test]
    fn status_url_yields_post_id() {
        let r = extract_post_reference(
            "[CG1] 10 X_Total -- 1: |https://x.com/rtve/status/1880677589356020087?s=46(",
        )
        .unwrap();
        assert_eq!(r.id.as_str(), "1880677589356020087");
        assert_eq!(r.url, "https://x.com/rtve/status/1880677589356020087");
    }

    #[test]
    fn twitter_domain_and_mobile_host_are_accepted() {
        assert!(extract_post_reference("https://twitter.com/a/status/12").is_some());
        assert!(extract_post_reference("http://mobile.twitter.com/a/statuses/12").is_some());
        assert!(extract_post_reference("https://WWW.X.COM/a/status/12").is_some());
    }

    #[test]
    fn text_without_status_url_is_dropped() {
        assert_eq!(extract_post_reference("texto sin enlace"), None);
        assert_eq!(extract_post_reference("https://x.com/rtve"), None);
        assert_eq!(extract_post_reference("https://example.com/a/status/12"), None);
    }

    #[test]
    fn media_are_named_for_graphics_templates() {
        let items = plan_media(&[
            remote(RemoteMediaKind::ProfileImage, "https://pbs/profile/a_400x400.png"),
            remote(RemoteMediaKind::Photo, "https://pbs/media/one.jpg"),
            remote(RemoteMediaKind::Video, "https://video/v.mp4?tag=12"),
            remote(RemoteMediaKind::Photo, "https://pbs/media/two.PNG"),
            remote(RemoteMediaKind::Photo, "https://pbs/media/one.jpg"),
        ]);
        let names: Vec<_> = items.iter().map(|i| i.file_name.as_str()).collect();
        assert_eq!(
            names,
            vec!["FotoPerfil.png", "FotoPost.jpg", "VideoPost.mp4", "FotoPost2.png"]
        );
        assert_eq!(items[2].kind, MediaKind::Video);
    }

    #[test]
    fn missing_extension_defaults_to_jpg() {
        let items = plan_media(&[remote(RemoteMediaKind::Photo, "https://pbs/media/abc")]);
        assert_eq!(items[0].file_name, "FotoPost.jpg");
    }

    #[tokio::test]
    async fn resolve_goes_through_the_token_bucket() {
        use crate::testing::{resolved_post, MockMediaSource};
        use std::time::Duration;

        let source = Arc::new(MockMediaSource::new().on_post(resolved_post(
            "7",
            &[(RemoteMediaKind::Photo, "https://pbs/media/p.jpg")],
        )));
        let limiter = Arc::new(ApiRateLimiter::new(
            1,
            Duration::from_secs(60),
            Duration::from_millis(10),
        ));
        let resolver = Resolver::new(source.clone(), limiter);
        let id = PostId::parse("7").unwrap();

        assert_eq!(resolver.resolve(&id).await.unwrap().media.len(), 1);
        let err = resolver.resolve(&id).await.unwrap_err();
        assert!(matches!(err, ResolutionError::RateLimited(_)));
        assert_eq!(source.lookups(&id), 1);
    }
}
