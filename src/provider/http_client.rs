use super::ProviderError;
use crate::config::ProviderConfig;
use anyhow::{Context, Result};
use rand::seq::IndexedRandom;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderMap, HeaderValue, USER_AGENT};
use std::time::Duration;
use tracing::debug;

const BROWSER_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

/// A response with its status; providers decide what non-2xx means for them.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: String,
}

pub struct HttpClient {
    inner: reqwest::Client,
    rotate_user_agent: bool,
}

impl HttpClient {
    pub fn new(config: &ProviderConfig, browser_like: bool) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if browser_like {
            headers.insert(
                ACCEPT,
                HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
            );
            headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-us,en;q=0.5"));
        }

        let inner = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            // consent/session cookies keep the watch page stable across requests
            .cookie_store(true)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            inner,
            rotate_user_agent: browser_like && config.rotate_user_agent,
        })
    }

    /// One GET, no retry. Network-level failures are already classified.
    pub async fn get(&self, url: &url::Url) -> Result<HttpResponse, ProviderError> {
        let mut req = self.inner.get(url.as_str());
        if self.rotate_user_agent {
            if let Some(ua) = BROWSER_USER_AGENTS.choose(&mut rand::rng()) {
                req = req.header(USER_AGENT, *ua);
            }
        }

        let resp = req.send().await.map_err(classify_reqwest_error)?;
        let status = resp.status();
        let body = resp.text().await.map_err(classify_reqwest_error)?;
        debug!("GET {} {} ({} bytes)", url.path(), status, body.len());

        Ok(HttpResponse { status, body })
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        ProviderError::Transient(e.to_string())
    } else {
        ProviderError::Unavailable(e.to_string())
    }
}

/// Generic meaning of a non-success status.
pub fn classify_status(status: StatusCode) -> ProviderError {
    let msg = format!("HTTP {}", status);
    match status.as_u16() {
        408 | 425 | 429 => ProviderError::Transient(msg),
        s if s >= 500 => ProviderError::Transient(msg),
        401 | 403 => ProviderError::Blocked(msg),
        _ => ProviderError::Unavailable(msg),
    }
}
