use super::http_client::{HttpClient, classify_status};
use super::parsers::parse_watch_page;
use super::{ProviderError, StatsProvider};
use crate::config::ProviderConfig;
use crate::models::VideoStats;
use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

/// Scrapes the public watch page, one video per request. Slow by nature:
/// pair it with a randomized multi-second delay range.
pub struct WatchPageProvider {
    client: HttpClient,
    watch_url: String,
}

impl WatchPageProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        url::Url::parse(&config.watch_url)
            .with_context(|| format!("Invalid provider.watch_url {:?}", config.watch_url))?;

        Ok(Self {
            client: HttpClient::new(config, true)?,
            watch_url: config.watch_url.clone(),
        })
    }

    /// e.g. dQw4w9WgXcQ → https://www.youtube.com/watch?v=dQw4w9WgXcQ
    fn video_url(&self, video_id: &str) -> Result<url::Url, ProviderError> {
        url::Url::parse_with_params(&self.watch_url, &[("v", video_id)])
            .map_err(|e| ProviderError::Blocked(format!("bad watch url: {}", e)))
    }
}

#[async_trait]
impl StatsProvider for WatchPageProvider {
    fn name(&self) -> &'static str {
        "watch-page"
    }

    async fn fetch(&self, video_id: &str) -> Result<VideoStats, ProviderError> {
        let url = self.video_url(video_id)?;
        debug!("Fetching watch page for {}", video_id);

        let resp = self.client.get(&url).await?;
        if !resp.status.is_success() {
            return Err(classify_status(resp.status));
        }
        parse_watch_page(&resp.body)
    }
}
