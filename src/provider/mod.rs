pub mod api;
pub mod http_client;
pub mod parsers;
pub mod watch_page;

use crate::config::{ProviderConfig, ProviderKind};
use crate::models::VideoStats;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

pub use self::api::YouTubeApiProvider;
pub use self::watch_page::WatchPageProvider;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Provider failures, classified by what the caller should do about them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Timeout, connection reset, rate limiting, 5xx. Worth retrying.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Deleted, private, region-blocked or otherwise confirmed missing.
    #[error("video unavailable: {0}")]
    Unavailable(String),

    /// Bot detection, CAPTCHA, exhausted quota, bad credentials. Needs the operator.
    #[error("blocked: {0}")]
    Blocked(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

// ── Source trait ──────────────────────────────────────────────────────────────

/// Swappable video-metadata source.
#[async_trait]
pub trait StatsProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Identifiers per `fetch_many` call. 1 means single-item fetching.
    fn batch_size(&self) -> usize {
        1
    }

    async fn fetch(&self, video_id: &str) -> Result<VideoStats, ProviderError>;

    /// Resolve several identifiers at once. Identifiers missing from the map are
    /// not yet resolved; they are not failures.
    async fn fetch_many(
        &self,
        video_ids: &[String],
    ) -> Result<HashMap<String, VideoStats>, ProviderError> {
        let mut out = HashMap::with_capacity(video_ids.len());
        for id in video_ids {
            match self.fetch(id).await {
                Ok(stats) => {
                    out.insert(id.clone(), stats);
                }
                Err(ProviderError::Unavailable(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}

/// Build the provider selected in configuration.
pub fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn StatsProvider>> {
    Ok(match config.kind {
        ProviderKind::Api => Arc::new(YouTubeApiProvider::new(config)?),
        ProviderKind::WatchPage => Arc::new(WatchPageProvider::new(config)?),
    })
}
