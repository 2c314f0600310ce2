use super::http_client::HttpClient;
use super::parsers::{classify_api_error, parse_api_response};
use super::{ProviderError, StatsProvider};
use crate::config::ProviderConfig;
use crate::models::VideoStats;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::debug;

/// YouTube Data API v3 `videos.list`, up to 50 ids per call (1 quota unit each).
pub struct YouTubeApiProvider {
    client: HttpClient,
    api_url: String,
    api_key: String,
    batch_size: usize,
}

impl YouTubeApiProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .context(
                "YouTube API key not provided. Set YOUTUBE_API_KEY (or DEARROW__PROVIDER__API_KEY); \
                 keys are created in the Google Cloud console with the YouTube Data API v3 enabled",
            )?;

        url::Url::parse(&config.api_url)
            .with_context(|| format!("Invalid provider.api_url {:?}", config.api_url))?;

        Ok(Self {
            client: HttpClient::new(config, false)?,
            api_url: config.api_url.clone(),
            api_key,
            batch_size: config.batch_size.clamp(1, 50),
        })
    }

    fn request_url(&self, ids: &[String]) -> Result<url::Url, ProviderError> {
        url::Url::parse_with_params(
            &self.api_url,
            &[
                ("part", "snippet,statistics"),
                ("id", ids.join(",").as_str()),
                ("key", self.api_key.as_str()),
            ],
        )
        .map_err(|e| ProviderError::Blocked(format!("bad API url: {}", e)))
    }
}

#[async_trait]
impl StatsProvider for YouTubeApiProvider {
    fn name(&self) -> &'static str {
        "youtube-api"
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn fetch(&self, video_id: &str) -> Result<VideoStats, ProviderError> {
        let mut found = self.fetch_many(&[video_id.to_string()]).await?;
        found.remove(video_id).ok_or_else(|| {
            ProviderError::Unavailable("not returned by the API (deleted, private or invalid)".into())
        })
    }

    async fn fetch_many(
        &self,
        video_ids: &[String],
    ) -> Result<HashMap<String, VideoStats>, ProviderError> {
        if video_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let ids = &video_ids[..video_ids.len().min(self.batch_size)];
        let url = self.request_url(ids)?;

        let resp = self.client.get(&url).await?;
        if !resp.status.is_success() {
            return Err(classify_api_error(resp.status, &resp.body));
        }

        let found = parse_api_response(&resp.body)?;
        debug!("videos.list: {}/{} ids returned", found.len(), ids.len());
        Ok(found)
    }
}
