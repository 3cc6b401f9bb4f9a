//! Core data models used throughout `postsync`.
//!
//! These types represent the feed entries, extracted posts, chunks, and
//! ledger rows that flow through the sync pipeline.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One entry parsed from a feed document.
///
/// Missing optional fields are empty strings, never absent.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FeedItem {
    pub title: String,
    /// Canonical URL of the post.
    pub link: String,
    pub guid: String,
    /// Raw publication date as it appeared in the feed.
    pub published_at: String,
    pub creator: String,
}

impl FeedItem {
    /// External identity: `guid` when present, otherwise `link`.
    pub fn identity(&self) -> &str {
        if self.guid.trim().is_empty() {
            &self.link
        } else {
            &self.guid
        }
    }

    /// Publication date parsed from the feed (RFC 2822 or RFC 3339).
    pub fn published(&self) -> Option<DateTime<Utc>> {
        parse_date(&self.published_at)
    }
}

/// An outbound hyperlink found inside an article body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedLink {
    #[serde(rename = "text")]
    pub anchor_text: String,
    #[serde(rename = "url")]
    pub target_url: String,
    #[serde(rename = "context")]
    pub surrounding_context: String,
}

/// Rendered and extracted content for one feed item.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractedPost {
    pub title: String,
    pub subtitle: String,
    pub author: String,
    pub published_at: DateTime<Utc>,
    pub canonical_url: String,
    pub slug: String,
    pub plain_text: String,
    pub raw_article_html: String,
    pub links: Vec<ExtractedLink>,
}

/// One overlapping window of a post's plain text, ready to embed.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// `<slug>-<chunk_index>`; stable across re-runs.
    pub id: String,
    pub text: String,
    pub chunk_index: usize,
    pub chunk_count: usize,
    /// Word offset of the first word in this chunk.
    pub start_word: usize,
    /// Exclusive word offset of the end of this chunk.
    pub end_word: usize,
    /// SHA-256 of `text`.
    pub hash: String,
    pub links: Vec<ExtractedLink>,
    pub title: String,
    pub author: String,
    pub published_at: DateTime<Utc>,
    pub canonical_url: String,
    /// Namespace tag of the originating source.
    pub source: String,
}

/// Ledger state of one ingested (or attempted) feed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Synced,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "synced" => Some(SyncStatus::Synced),
            "error" => Some(SyncStatus::Error),
            _ => None,
        }
    }
}

/// Durable ledger entry keyed by `(source, external_id)`.
#[derive(Debug, Clone)]
pub struct SyncRecord {
    pub source: String,
    pub external_id: String,
    pub url: String,
    pub status: SyncStatus,
    /// Prefix shared by every vector id of the post (its slug).
    pub vector_prefix: Option<String>,
    pub chunk_count: i64,
    pub last_error: Option<String>,
    pub last_synced_at: i64,
}

/// A per-item failure kept for the run report.
#[derive(Debug, Clone)]
pub struct ItemFailure {
    pub identity: String,
    pub title: String,
    pub reason: String,
}

/// Per-run counters reported at the end of `postsync sync`.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub source: String,
    pub dry_run: bool,
    /// Unique entries in the feed.
    pub considered: usize,
    /// Entries skipped because a ledger record already exists.
    pub skipped: usize,
    /// Entries selected for this run (after `--limit`).
    pub planned: Vec<FeedItem>,
    pub succeeded: usize,
    pub failures: Vec<ItemFailure>,
    pub chunks_written: usize,
    pub links_extracted: usize,
    pub interrupted: bool,
}

impl RunSummary {
    pub fn new(source: &str, dry_run: bool) -> Self {
        Self {
            source: source.to_string(),
            dry_run,
            ..Self::default()
        }
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// Parse the date formats seen in feeds and article markup.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d", "%b %d, %Y", "%B %d, %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
        }
    }
    None
}
