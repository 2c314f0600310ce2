use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Dataset store configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Records per window when scanning for pending work.
    #[serde(default = "default_scan_window")]
    pub scan_window: usize,

    /// Hold `<path>.lock` for the duration of an enrichment run.
    #[serde(default = "default_true")]
    pub lock: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// YouTube Data API v3, batched
    Api,
    /// Public watch page, one video per request
    WatchPage,
}

/// Provider configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_kind")]
    pub kind: ProviderKind,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default = "default_watch_url")]
    pub watch_url: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Identifiers per API call (YouTube caps this at 50).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Pick a browser user agent at random for every watch-page request.
    #[serde(default = "default_true")]
    pub rotate_user_agent: bool,
}

/// Retry/backoff configuration for transient provider failures
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

/// Driver configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Lower bound of the sleep between fetch steps.
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,

    /// Upper bound; equal to `min_delay_ms` for a fixed interval.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Successful resolutions between checkpoints.
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,

    #[serde(default = "default_progress_every")]
    pub progress_every: usize,

    /// Grace period before a run starts, to allow aborting after the estimate is printed.
    #[serde(default)]
    pub start_delay_secs: u64,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_store_path() -> PathBuf {
    PathBuf::from("All_data/all_in_one.csv")
}
fn default_scan_window() -> usize {
    50_000
}
fn default_true() -> bool {
    true
}
fn default_provider_kind() -> ProviderKind {
    ProviderKind::Api
}
fn default_api_url() -> String {
    "https://www.googleapis.com/youtube/v3/videos".to_string()
}
fn default_watch_url() -> String {
    "https://www.youtube.com/watch".to_string()
}
fn default_timeout_secs() -> u64 {
    10
}
fn default_batch_size() -> usize {
    50
}
fn default_user_agent() -> String {
    "dearrow-enricher/0.1 (research dataset enrichment)".to_string()
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    200
}
fn default_backoff_multiplier() -> f64 {
    1.5
}
fn default_jitter_ms() -> u64 {
    250
}
fn default_min_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    100
}
fn default_checkpoint_every() -> usize {
    500
}
fn default_progress_every() -> usize {
    10
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            scan_window: default_scan_window(),
            lock: true,
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
            api_key: None,
            api_url: default_api_url(),
            watch_url: default_watch_url(),
            timeout_secs: default_timeout_secs(),
            batch_size: default_batch_size(),
            user_agent: default_user_agent(),
            rotate_user_agent: true,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            checkpoint_every: default_checkpoint_every(),
            progress_every: default_progress_every(),
            start_delay_secs: 0,
        }
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let cfg = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::Environment::with_prefix("DEARROW")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration sources")?;

        let mut app_cfg: AppConfig = cfg
            .try_deserialize()
            .context("Invalid configuration")?;

        if app_cfg.provider.api_key.is_none() {
            app_cfg.provider.api_key = std::env::var("YOUTUBE_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty());
        }

        app_cfg.validate()?;
        Ok(app_cfg)
    }

    /// Reject settings the driver cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.store.scan_window == 0 {
            anyhow::bail!("store.scan_window must be at least 1");
        }
        if self.provider.batch_size == 0 || self.provider.batch_size > 50 {
            anyhow::bail!("provider.batch_size must be between 1 and 50");
        }
        if self.pipeline.checkpoint_every == 0 {
            anyhow::bail!("pipeline.checkpoint_every must be at least 1");
        }
        if self.pipeline.min_delay_ms > self.pipeline.max_delay_ms {
            anyhow::bail!(
                "pipeline.min_delay_ms ({}) exceeds pipeline.max_delay_ms ({})",
                self.pipeline.min_delay_ms,
                self.pipeline.max_delay_ms
            );
        }
        if !(self.retry.backoff_multiplier >= 1.0) {
            anyhow::bail!("retry.backoff_multiplier must be >= 1.0");
        }
        Ok(())
    }
}
