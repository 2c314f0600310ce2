use super::ProviderError;
use crate::models::VideoStats;
use chrono::NaiveDate;
use reqwest::StatusCode;
use scraper::{Html, Selector};
use serde::Deserialize;
use std::collections::HashMap;

// ── Shared field parsers ─────────────────────────────────────────────────────

/// "2021-03-04T17:00:09Z" → 2021-03-04 | "20210304" → 2021-03-04
pub fn parse_published(s: &str) -> Option<NaiveDate> {
    let date_part = s.trim().split('T').next()?.trim();
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(date_part, "%Y%m%d"))
        .ok()
}

/// "1,234,567" → 1234567. Signs and decimals are rejected.
pub fn parse_count(s: &str) -> Option<u64> {
    let cleaned: String = s.trim().chars().filter(|c| *c != ',' && *c != ' ').collect();
    if cleaned.is_empty() || !cleaned.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    cleaned.parse().ok()
}

// ── YouTube Data API v3 ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct VideoListResponse {
    #[serde(default)]
    items: Vec<VideoItem>,
}

#[derive(Debug, Deserialize)]
struct VideoItem {
    id: String,
    #[serde(default)]
    snippet: Option<Snippet>,
    #[serde(default)]
    statistics: Option<Statistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snippet {
    #[serde(default)]
    channel_id: Option<String>,
    #[serde(default)]
    published_at: Option<String>,
}

// The API returns counts as strings; likes and comments vanish when hidden or disabled.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Statistics {
    #[serde(default)]
    view_count: Option<String>,
    #[serde(default)]
    like_count: Option<String>,
    #[serde(default)]
    comment_count: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    reason: String,
}

/// Parse a `videos.list` body. Items lacking a channel or publish date are left out.
pub fn parse_api_response(body: &str) -> Result<HashMap<String, VideoStats>, ProviderError> {
    let resp: VideoListResponse = serde_json::from_str(body)
        .map_err(|e| ProviderError::Transient(format!("malformed API response: {}", e)))?;

    let mut out = HashMap::with_capacity(resp.items.len());
    for item in resp.items {
        let Some(snippet) = item.snippet else { continue };
        let stats = item.statistics.unwrap_or_default();

        let Some(channel_id) = snippet.channel_id.filter(|c| !c.trim().is_empty()) else {
            continue;
        };
        let Some(published) = snippet.published_at.as_deref().and_then(parse_published) else {
            continue;
        };

        let count = |v: &Option<String>| v.as_deref().and_then(parse_count).unwrap_or(0);
        out.insert(
            item.id,
            VideoStats {
                channel_id,
                views: count(&stats.view_count),
                published,
                likes: count(&stats.like_count),
                comments: count(&stats.comment_count),
            },
        );
    }
    Ok(out)
}

/// Map a non-2xx API reply to the error taxonomy using the `reason` codes.
pub fn classify_api_error(status: StatusCode, body: &str) -> ProviderError {
    let parsed = serde_json::from_str::<ApiErrorEnvelope>(body).ok();
    let reasons: Vec<String> = parsed
        .as_ref()
        .map(|p| p.error.errors.iter().map(|e| e.reason.clone()).collect())
        .unwrap_or_default();
    let message = parsed
        .as_ref()
        .map(|p| p.error.message.clone())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| format!("HTTP {}", status));

    let has = |r: &str| reasons.iter().any(|x| x == r);

    if has("quotaExceeded") || has("dailyLimitExceeded") {
        return ProviderError::Blocked(format!("API quota exhausted: {}", message));
    }
    if has("keyInvalid") || has("keyExpired") || has("accessNotConfigured") || has("forbidden") {
        return ProviderError::Blocked(format!("API credentials rejected: {}", message));
    }
    if has("rateLimitExceeded") || has("userRateLimitExceeded") || has("backendError") {
        return ProviderError::Transient(message);
    }

    match super::http_client::classify_status(status) {
        ProviderError::Transient(_) => ProviderError::Transient(message),
        ProviderError::Blocked(_) => ProviderError::Blocked(message),
        ProviderError::Unavailable(_) => ProviderError::Unavailable(message),
    }
}

// ── Watch page ───────────────────────────────────────────────────────────────

const BOT_MARKERS: &[&str] = &[
    "confirm you\u{2019}re not a bot",
    "confirm you're not a bot",
    "unusual traffic from your computer",
    "g-recaptcha",
    "/sorry/index",
];

/// Extract stats from a watch page. Challenge pages are `Blocked`; pages whose
/// player refuses playback are `Unavailable`.
pub fn parse_watch_page(html: &str) -> Result<VideoStats, ProviderError> {
    let lower = html.to_lowercase();
    if let Some(marker) = BOT_MARKERS.iter().find(|m| lower.contains(*m)) {
        return Err(ProviderError::Blocked(format!("bot detection page ({})", marker)));
    }

    if let Some(status) = json_string_after(html, "\"playabilityStatus\":{\"status\":\"") {
        if status != "OK" {
            let reason = json_string_after(html, "\"reason\":\"").unwrap_or(status);
            return Err(ProviderError::Unavailable(format!("{}: {}", status, reason)));
        }
    }

    let doc = Html::parse_document(html);

    let channel_id = meta_itemprop(&doc, "channelId")
        .or_else(|| json_string_after(html, "\"channelId\":\"").map(str::to_string))
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ProviderError::Unavailable("no channel id on watch page".into()))?;

    let published = meta_itemprop(&doc, "datePublished")
        .or_else(|| meta_itemprop(&doc, "uploadDate"))
        .or_else(|| json_string_after(html, "\"publishDate\":\"").map(str::to_string))
        .as_deref()
        .and_then(parse_published)
        .ok_or_else(|| ProviderError::Unavailable("no publish date on watch page".into()))?;

    let views = meta_itemprop(&doc, "interactionCount")
        .as_deref()
        .and_then(parse_count)
        .or_else(|| json_digits_after(html, "\"viewCount\":"))
        .unwrap_or(0);

    Ok(VideoStats {
        channel_id,
        views,
        published,
        likes: json_digits_after(html, "\"likeCount\":").unwrap_or(0),
        comments: json_digits_after(html, "\"commentCount\":").unwrap_or(0),
    })
}

fn meta_itemprop(doc: &Html, itemprop: &str) -> Option<String> {
    let sel = Selector::parse(&format!("meta[itemprop=\"{}\"]", itemprop)).ok()?;
    doc.select(&sel)
        .filter_map(|el| el.value().attr("content"))
        .map(|c| c.trim().to_string())
        .find(|c| !c.is_empty())
}

/// The string literal that follows `prefix` in embedded JSON.
fn json_string_after<'a>(haystack: &'a str, prefix: &str) -> Option<&'a str> {
    let start = haystack.find(prefix)? + prefix.len();
    let rest = &haystack[start..];
    let end = rest.find('"')?;
    Some(&rest[..end])
}

/// Digits after `key`, whether quoted (`"123"`) or bare (`123`).
fn json_digits_after(haystack: &str, key: &str) -> Option<u64> {
    let start = haystack.find(key)? + key.len();
    let rest = haystack[start..].trim_start().trim_start_matches('"');
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
