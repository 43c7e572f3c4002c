//! Typed model shared by the crawler: records, cursors and quota snapshots.

use chrono::{DateTime, Utc};

/// A repository as ingested from one search page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// GitHub node id (stable, unique key in the store)
    pub id: String,
    pub name: String,
    /// Login of the owning user or organization
    pub owner: String,
    pub star_count: u64,
    /// When the stored row was last refreshed
    pub updated_at: DateTime<Utc>,
    /// When this particular fetch happened
    pub fetched_at: DateTime<Utc>,
}

impl Record {
    /// Build a record stamped with the given ingestion time
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        owner: impl Into<String>,
        star_count: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            owner: owner.into(),
            star_count,
            updated_at: now,
            fetched_at: now,
        }
    }
}

/// Pagination state within a single window
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cursor {
    pub end_cursor: Option<String>,
    pub has_next: bool,
}

/// Rate limit budget reported alongside a response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Quota {
    pub remaining: Option<u64>,
    /// `None` when the endpoint omitted it or sent something unparseable
    pub reset_at: Option<DateTime<Utc>>,
}

/// One decoded page of search results
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub records: Vec<Record>,
    pub cursor: Cursor,
    /// Total matches the endpoint reports for the query (not capped at 1000)
    pub total_matches: Option<u64>,
    pub quota: Option<Quota>,
}
