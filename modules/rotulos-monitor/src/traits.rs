// Trait seams for the monitor's network dependencies.
//
// MediaSource:  post id → media descriptors (X API in production).
// MediaFetcher: URL → bytes for one media item.
// StoryServer lives in inews-client; the browser shares it.
//
// MockMediaSource and MockMediaFetcher in testing.rs stand in for both, so
// whole cycles run without a network.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rotulos_common::PostId;
use x_client::XClient;

use crate::error::{DownloadError, ResolutionError};
use crate::resolver::{plan_media, ResolvedPost};

#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Look up a post and describe its downloadable media.
    async fn lookup(&self, id: &PostId) -> Result<ResolvedPost, ResolutionError>;
}

#[async_trait]
impl MediaSource for XClient {
    async fn lookup(&self, id: &PostId) -> Result<ResolvedPost, ResolutionError> {
        let lookup = self.lookup_post(id.as_str()).await?;
        Ok(ResolvedPost {
            id: id.clone(),
            media: plan_media(&lookup.media()),
            summary: lookup.summary(),
        })
    }
}

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Download one media item completely into memory.
    async fn fetch(&self, url: &str) -> Result<Bytes, DownloadError>;
}

/// Plain HTTP download. Media URLs are public CDN links, no auth.
pub struct HttpMediaFetcher {
    client: reqwest::Client,
}

impl HttpMediaFetcher {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, DownloadError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DownloadError::Transient(e.to_string()))?;

        let status = resp.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(DownloadError::Transient(format!("HTTP {status} for {url}")));
        }
        if !status.is_success() {
            return Err(DownloadError::Permanent(format!("HTTP {status} for {url}")));
        }

        resp.bytes()
            .await
            .map_err(|e| DownloadError::Transient(e.to_string()))
    }
}
