use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ── Column names ──────────────────────────────────────────────────────────────

pub const VIDEO_ID: &str = "videoID";
pub const CHANNEL_ID: &str = "channelID";
pub const VIEWS: &str = "Views";
pub const PUBLISHED: &str = "Published";
pub const LIKES: &str = "likes";
pub const COMMENTS: &str = "comments";

/// Enrichment columns in the order they are appended to a header that lacks them.
pub const ENRICHMENT_COLUMNS: [&str; 5] = [CHANNEL_ID, VIEWS, PUBLISHED, LIKES, COMMENTS];

/// Count cell written for a permanently-failed identifier.
pub const FAILED_COUNT: &str = "-1";

// ── Provider result ───────────────────────────────────────────────────────────

/// Statistics for one video as returned by a provider.
/// Counts are unsigned, so a successful fetch can never collide with the `-1` sentinel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VideoStats {
    pub channel_id: String,
    pub views: u64,
    pub published: NaiveDate,
    pub likes: u64,
    pub comments: u64,
}

/// What gets applied to every row of an identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Enrichment {
    Resolved(VideoStats),
    Unavailable,
}

impl Enrichment {
    /// Cells in `ENRICHMENT_COLUMNS` order.
    pub fn to_cells(&self) -> [String; 5] {
        match self {
            Enrichment::Resolved(s) => [
                s.channel_id.clone(),
                s.views.to_string(),
                s.published.format("%Y-%m-%d").to_string(),
                s.likes.to_string(),
                s.comments.to_string(),
            ],
            Enrichment::Unavailable => [
                String::new(),
                FAILED_COUNT.to_string(),
                String::new(),
                FAILED_COUNT.to_string(),
                FAILED_COUNT.to_string(),
            ],
        }
    }
}

// ── Tri-state fields ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field<T> {
    Unset,
    Resolved(T),
    Failed,
}

impl<T> Field<T> {
    pub fn is_failed(&self) -> bool {
        matches!(self, Field::Failed)
    }

    pub fn resolved(self) -> Option<T> {
        match self {
            Field::Resolved(v) => Some(v),
            _ => None,
        }
    }
}

/// Row-level view of the five enrichment cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichmentFields {
    pub channel_id: Field<String>,
    pub views: Field<u64>,
    pub published: Field<NaiveDate>,
    pub likes: Field<u64>,
    pub comments: Field<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowState {
    Resolved(VideoStats),
    Failed,
    Pending,
}

impl RowState {
    pub fn is_complete(&self) -> bool {
        !matches!(self, RowState::Pending)
    }
}

impl EnrichmentFields {
    /// Decode raw cells (`None` = column absent). Counts never go through a float:
    /// `"1234.0"` is read textually as 1234.
    pub fn from_cells(
        channel_id: Option<&str>,
        views: Option<&str>,
        published: Option<&str>,
        likes: Option<&str>,
        comments: Option<&str>,
    ) -> Self {
        let views = parse_count_field(views.unwrap_or(""));
        let likes = parse_count_field(likes.unwrap_or(""));
        let comments = parse_count_field(comments.unwrap_or(""));

        // An empty string cell only means "failed" when the whole row carries the sentinel family.
        let sentinel_row = views.is_failed() && likes.is_failed() && comments.is_failed();

        let channel_id = match channel_id.unwrap_or("").trim() {
            "-1" => Field::Failed,
            "" if sentinel_row => Field::Failed,
            "" => Field::Unset,
            s => Field::Resolved(s.to_string()),
        };
        let published = match published.unwrap_or("").trim() {
            "-1" => Field::Failed,
            "" if sentinel_row => Field::Failed,
            s => NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(Field::Resolved)
                .unwrap_or(Field::Unset),
        };

        Self { channel_id, views, published, likes, comments }
    }

    pub fn state(&self) -> RowState {
        let all_failed = self.channel_id.is_failed()
            && self.views.is_failed()
            && self.published.is_failed()
            && self.likes.is_failed()
            && self.comments.is_failed();
        if all_failed {
            return RowState::Failed;
        }

        let stats = (|| {
            Some(VideoStats {
                channel_id: self.channel_id.clone().resolved()?,
                views: self.views.clone().resolved()?,
                published: self.published.clone().resolved()?,
                likes: self.likes.clone().resolved()?,
                comments: self.comments.clone().resolved()?,
            })
        })();

        match stats {
            Some(s) => RowState::Resolved(s),
            None => RowState::Pending,
        }
    }
}

/// `""` → unset, `"-1"` → failed, `"42"` / `"42.0"` → 42, anything else → unset.
pub fn parse_count_field(s: &str) -> Field<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Field::Unset;
    }
    if s == FAILED_COUNT || s == "-1.0" {
        return Field::Failed;
    }
    match parse_integer_text(s) {
        Some(n) => Field::Resolved(n),
        None => Field::Unset,
    }
}

/// Parse an unsigned integer that may carry a zero fractional part (`"12.0"`, `"12.00"`).
pub fn parse_integer_text(s: &str) -> Option<u64> {
    let s = s.trim();
    let int_part = match s.split_once('.') {
        Some((int_part, frac)) if !frac.is_empty() && frac.chars().all(|c| c == '0') => int_part,
        Some(_) => return None,
        None => s,
    };
    if int_part.is_empty() || !int_part.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    int_part.parse().ok()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
