use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Response of `GET /2/tweets/:id` with media and author expansions.
#[derive(Debug, Clone, Deserialize)]
pub struct TweetLookup {
    pub data: Option<Tweet>,
    #[serde(default)]
    pub includes: Includes,
    #[serde(default)]
    pub errors: Vec<ApiProblem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Tweet {
    pub id: String,
    #[serde(default)]
    pub text: String,
    pub author_id: Option<String>,
    pub created_at: Option<String>,
    pub attachments: Option<Attachments>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Attachments {
    #[serde(default)]
    pub media_keys: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Includes {
    #[serde(default)]
    pub media: Vec<Media>,
    #[serde(default)]
    pub users: Vec<User>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Media {
    pub media_key: String,
    #[serde(rename = "type")]
    pub media_type: String,
    pub url: Option<String>,
    pub preview_image_url: Option<String>,
    #[serde(default)]
    pub variants: Vec<Variant>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Variant {
    pub bit_rate: Option<u64>,
    pub content_type: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub username: String,
    pub profile_image_url: Option<String>,
}

/// Problem object returned in the `errors` array (partial errors).
#[derive(Debug, Clone, Deserialize)]
pub struct ApiProblem {
    pub title: Option<String>,
    pub detail: Option<String>,
    #[serde(rename = "type")]
    pub problem_type: Option<String>,
}

impl ApiProblem {
    pub fn is_not_found(&self) -> bool {
        self.problem_type
            .as_deref()
            .is_some_and(|t| t.ends_with("resource-not-found"))
    }
}

// --- Derived views ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteMediaKind {
    Photo,
    Video,
    AnimatedGif,
    ProfileImage,
}

/// A downloadable asset of a post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMedia {
    pub kind: RemoteMediaKind,
    pub url: String,
}

/// Author and text of a post, cleaned for on-air use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostSummary {
    pub id: String,
    pub text: String,
    pub name: String,
    pub username: String,
    pub created_at: Option<String>,
}

static PROFILE_SIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_normal(\.\w+)$").expect("valid regex"));
static LEADING_MENTIONS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:@\w+\s*)+").expect("valid regex"));
static TCO_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https://t\.co/\S+").expect("valid regex"));

/// Swap the 48px avatar for the 400x400 rendition.
pub fn upscale_profile_image(url: &str) -> String {
    PROFILE_SIZE_RE.replace(url, "_400x400$1").into_owned()
}

/// Strip reply-chain mentions at the start and t.co links anywhere.
pub fn clean_post_text(text: &str) -> String {
    let text = LEADING_MENTIONS_RE.replace(text.trim(), "");
    let text = TCO_LINK_RE.replace_all(text.trim(), "");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl Media {
    /// Photos carry a direct URL; videos and GIFs use the highest bitrate MP4 variant.
    pub fn best_url(&self) -> Option<&str> {
        match self.media_type.as_str() {
            "photo" => self.url.as_deref(),
            "video" | "animated_gif" => self
                .variants
                .iter()
                .filter(|v| v.content_type == "video/mp4")
                .max_by_key(|v| v.bit_rate.unwrap_or(0))
                .map(|v| v.url.as_str()),
            _ => None,
        }
    }

    pub fn kind(&self) -> Option<RemoteMediaKind> {
        match self.media_type.as_str() {
            "photo" => Some(RemoteMediaKind::Photo),
            "video" => Some(RemoteMediaKind::Video),
            "animated_gif" => Some(RemoteMediaKind::AnimatedGif),
            _ => None,
        }
    }
}

impl TweetLookup {
    pub fn author(&self) -> Option<&User> {
        let tweet = self.data.as_ref()?;
        match &tweet.author_id {
            Some(author_id) => self.includes.users.iter().find(|u| &u.id == author_id),
            None => self.includes.users.first(),
        }
    }

    /// Every downloadable asset: author avatar first, then attachments in
    /// the order the post lists them.
    pub fn media(&self) -> Vec<RemoteMedia> {
        let mut out = Vec::new();

        if let Some(avatar) = self.author().and_then(|u| u.profile_image_url.as_deref()) {
            if !avatar.is_empty() {
                out.push(RemoteMedia {
                    kind: RemoteMediaKind::ProfileImage,
                    url: upscale_profile_image(avatar),
                });
            }
        }

        let keys = self
            .data
            .as_ref()
            .and_then(|t| t.attachments.as_ref())
            .map(|a| a.media_keys.as_slice())
            .unwrap_or_default();

        for key in keys {
            let Some(media) = self.includes.media.iter().find(|m| &m.media_key == key) else {
                continue;
            };
            if let (Some(kind), Some(url)) = (media.kind(), media.best_url()) {
                out.push(RemoteMedia {
                    kind,
                    url: url.to_string(),
                });
            }
        }

        out
    }

    pub fn summary(&self) -> Option<PostSummary> {
        let tweet = self.data.as_ref()?;
        let author = self.author();
        Some(PostSummary {
            id: tweet.id.clone(),
            text: clean_post_text(&tweet.text),
            name: author.map(|u| u.name.clone()).unwrap_or_default(),
            username: author
                .map(|u| format!("@{}", u.username))
                .unwrap_or_default(),
            created_at: tweet.created_at.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TweetLookup {
        serde_json::from_str(
            r#"{
              "data": {
                "id": "1880677589356020087",
                "text": "@a @b Hola mundo https://t.co/xyz",
                "author_id": "42",
                "attachments": { "media_keys": ["3_1", "7_2"] }
              },
              "includes": {
                "media": [
                  { "media_key": "7_2", "type": "video", "preview_image_url": "https://pbs/p.jpg",
                    "variants": [
                      { "content_type": "application/x-mpegURL", "url": "https://v/pl.m3u8" },
                      { "bit_rate": 256000, "content_type": "video/mp4", "url": "https://v/low.mp4" },
                      { "bit_rate": 2176000, "content_type": "video/mp4", "url": "https://v/high.mp4" }
                    ] },
                  { "media_key": "3_1", "type": "photo", "url": "https://pbs/photo.jpg" }
                ],
                "users": [
                  { "id": "42", "name": "Yolanda", "username": "yd",
                    "profile_image_url": "https://pbs/avatar_normal.jpg" }
                ]
              }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn media_lists_avatar_then_attachments_in_post_order() {
        let media = sample().media();
        assert_eq!(
            media,
            vec![
                RemoteMedia { kind: RemoteMediaKind::ProfileImage, url: "https://pbs/avatar_400x400.jpg".into() },
                RemoteMedia { kind: RemoteMediaKind::Photo, url: "https://pbs/photo.jpg".into() },
                RemoteMedia { kind: RemoteMediaKind::Video, url: "https://v/high.mp4".into() },
            ]
        );
    }

    #[test]
    fn summary_cleans_text() {
        let summary = sample().summary().unwrap();
        assert_eq!(summary.text, "Hola mundo");
        assert_eq!(summary.username, "@yd");
        assert_eq!(summary.name, "Yolanda");
    }

    #[test]
    fn video_without_mp4_variant_is_skipped() {
        let media = Media {
            media_key: "k".into(),
            media_type: "video".into(),
            url: None,
            preview_image_url: None,
            variants: vec![Variant { bit_rate: None, content_type: "application/x-mpegURL".into(), url: "u".into() }],
        };
        assert_eq!(media.best_url(), None);
    }

    #[test]
    fn profile_upscale_only_touches_normal_suffix() {
        assert_eq!(upscale_profile_image("https://x/a_normal.png"), "https://x/a_400x400.png");
        assert_eq!(upscale_profile_image("https://x/a_bigger.png"), "https://x/a_bigger.png");
    }
}
