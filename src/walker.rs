//! Cursor pagination over a single window

use std::collections::HashSet;
use tracing::debug;

use crate::errors::FetchError;
use crate::github::SearchSource;
use crate::models::{Cursor, Record};

/// Walks one window's result set page by page
///
/// Each call to [`PageWalker::next_page`] issues at most one request. The walker ends
/// when the endpoint reports no further page, when the caller's remaining budget hits
/// zero, or after the first error (which is handed back once).
pub struct PageWalker<'a, S: SearchSource + ?Sized> {
    source: &'a S,
    filter: String,
    page_size: usize,
    cursor: Cursor,
    pages: usize,
    total_matches: Option<u64>,
    done: bool,
}

impl<'a, S: SearchSource + ?Sized> PageWalker<'a, S> {
    pub fn new(source: &'a S, filter: impl Into<String>, page_size: usize) -> Self {
        Self {
            source,
            filter: filter.into(),
            page_size: page_size.max(1),
            // The first request goes out with a null cursor
            cursor: Cursor {
                end_cursor: None,
                has_next: true,
            },
            pages: 0,
            total_matches: None,
            done: false,
        }
    }

    /// Pages fetched so far
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Match count reported for the whole window (may exceed what is reachable)
    pub fn total_matches(&self) -> Option<u64> {
        self.total_matches
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Fetch the next deduplicated batch, asking for at most `remaining` records
    ///
    /// Returns `None` once the window is exhausted or `remaining` is zero. A zero budget
    /// leaves the window unfinished: [`PageWalker::is_done`] stays false while the
    /// cursor still has pages.
    pub async fn next_page(&mut self, remaining: usize) -> Option<Result<Vec<Record>, FetchError>> {
        if self.done || !self.cursor.has_next {
            self.done = true;
            return None;
        }
        if remaining == 0 {
            return None;
        }

        let first = self.page_size.min(remaining);
        let page = match self
            .source
            .search_page(&self.filter, first, self.cursor.end_cursor.as_deref())
            .await
        {
            Ok(page) => page,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };

        self.pages += 1;
        if page.total_matches.is_some() {
            self.total_matches = page.total_matches;
        }

        let fetched = page.records.len();
        let mut records = dedupe_page(page.records);
        records.truncate(remaining);

        debug!(
            filter = %self.filter,
            page = self.pages,
            fetched,
            kept = records.len(),
            has_next = page.cursor.has_next,
            quota_remaining = ?page.quota.and_then(|q| q.remaining),
            "Fetched page"
        );

        // A cursor-less or empty page can't be advanced past
        if fetched == 0 || page.cursor.end_cursor.is_none() {
            self.cursor.has_next = false;
        } else {
            self.cursor = page.cursor;
        }
        if !self.cursor.has_next {
            self.done = true;
        }

        Some(Ok(records))
    }
}

/// Drop records whose id already appeared earlier in the same page, keeping order
pub fn dedupe_page(records: Vec<Record>) -> Vec<Record> {
    let mut seen = HashSet::with_capacity(records.len());
    records
        .into_iter()
        .filter(|r| seen.insert(r.id.clone()))
        .collect()
}
