pub mod error;
pub mod types;

pub use error::{Result, XError};
pub use types::{
    clean_post_text, upscale_profile_image, PostSummary, RemoteMedia, RemoteMediaKind, Tweet,
    TweetLookup, User,
};

use std::time::Duration;

const BASE_URL: &str = "https://api.twitter.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const EXPANSIONS: &str = "author_id,attachments.media_keys";
const TWEET_FIELDS: &str = "created_at,text";
const USER_FIELDS: &str = "name,username,profile_image_url";
const MEDIA_FIELDS: &str = "url,type,variants,preview_image_url";

pub struct XClient {
    client: reqwest::Client,
    token: String,
    base_url: String,
}

impl XClient {
    pub fn new(token: String) -> std::result::Result<Self, reqwest::Error> {
        Self::with_base_url(token, BASE_URL.to_string())
    }

    /// Point the client at another host (proxy, mock server).
    pub fn with_base_url(
        token: String,
        base_url: String,
    ) -> std::result::Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            token,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Look up one post with its media attachments and author.
    pub async fn lookup_post(&self, post_id: &str) -> Result<TweetLookup> {
        let url = format!("{}/2/tweets/{}", self.base_url, post_id);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[
                ("expansions", EXPANSIONS),
                ("tweet.fields", TWEET_FIELDS),
                ("user.fields", USER_FIELDS),
                ("media.fields", MEDIA_FIELDS),
            ])
            .send()
            .await?;

        let status = resp.status();
        if status.as_u16() == 429 {
            let reset_at = resp
                .headers()
                .get("x-rate-limit-reset")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            tracing::warn!(post_id, ?reset_at, "X API rate limit hit");
            return Err(XError::RateLimited { reset_at });
        }
        if status.as_u16() == 404 {
            return Err(XError::NotFound(post_id.to_string()));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(XError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let body = resp.text().await?;
        let lookup: TweetLookup = serde_json::from_str(&body)?;

        if lookup.data.is_none() {
            if lookup.errors.iter().any(|e| e.is_not_found()) {
                return Err(XError::NotFound(post_id.to_string()));
            }
            let message = lookup
                .errors
                .iter()
                .filter_map(|e| e.detail.clone().or_else(|| e.title.clone()))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(XError::Api {
                status: status.as_u16(),
                message,
            });
        }

        tracing::debug!(
            post_id,
            media = lookup.includes.media.len(),
            "Fetched post"
        );
        Ok(lookup)
    }
}
