//! Core ingestion loop: windows -> pages -> store
//!
//! Drives a [`PageWalker`] over every window in order and hands each deduplicated page
//! to the sink as one batch. Used by the `crawl` command.

use tracing::{info, warn};

use crate::db::RecordSink;
use crate::errors::IngestError;
use crate::github::SearchSource;
use crate::partition::Window;
use crate::walker::PageWalker;

/// GitHub search never serves more than this many results for one query
pub const SEARCH_RESULT_CAP: u64 = 1000;

/// Configuration for an ingestion run
#[derive(Clone, Debug)]
pub struct IngestConfig {
    /// Stop once this many records have been stored
    pub target: usize,
    /// Records requested per page (GitHub allows at most 100)
    pub page_size: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            target: 100_000,
            page_size: 100,
        }
    }
}

/// Progress information after each stored page
#[derive(Debug, Clone)]
pub struct IngestProgress<'a> {
    pub window: &'a Window,
    pub page: usize,
    pub stored_this_page: usize,
    pub window_total: usize,
    pub total: usize,
    pub target: usize,
}

/// Result from a complete ingestion run
#[derive(Debug, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub total: usize,
    pub pages: usize,
    pub windows_completed: usize,
    /// Indices of windows abandoned after a fetch failure
    pub aborted_windows: Vec<usize>,
    /// Stopped early on request rather than by target or exhaustion
    pub stopped: bool,
}

impl IngestReport {
    /// Index of the first window a follow-up run has to fetch, given the windows skipped
    /// by this run
    ///
    /// Windows run in order, so everything before the frontier finished unless it was
    /// aborted; the earliest aborted window wins.
    pub fn resume_from(&self, skip: usize) -> usize {
        let frontier = skip + self.windows_completed + self.aborted_windows.len();
        self.aborted_windows
            .iter()
            .copied()
            .min()
            .map_or(frontier, |first| first.min(frontier))
    }
}

/// Run ingestion until the target is met, the windows run out, or `should_stop` fires
///
/// `should_stop` is checked before every window and every page; a request already in
/// flight always completes. A window whose fetch fails is abandoned (its stored pages
/// stay) and the run continues with the next one. Only sink failures end the run early.
pub async fn run_ingestion<S, K, I, F, C>(
    source: &S,
    sink: &mut K,
    windows: I,
    config: &IngestConfig,
    mut on_progress: F,
    should_stop: C,
) -> Result<IngestReport, IngestError>
where
    S: SearchSource + ?Sized,
    K: RecordSink + ?Sized,
    I: IntoIterator<Item = Window>,
    F: FnMut(&IngestProgress<'_>),
    C: Fn() -> bool,
{
    let mut report = IngestReport::default();

    for window in windows {
        if report.total >= config.target {
            break;
        }
        if should_stop() {
            report.stopped = true;
            break;
        }

        let filter = window.filter();
        info!(window = %window, days = window.days(), filter = %filter, "Starting window");

        let mut walker = PageWalker::new(source, filter, config.page_size);
        let mut window_total = 0;
        let mut aborted = false;

        loop {
            if should_stop() {
                report.stopped = true;
                break;
            }

            let remaining = config.target.saturating_sub(report.total);
            let batch = match walker.next_page(remaining).await {
                None => break,
                Some(Ok(batch)) => batch,
                Some(Err(e)) => {
                    warn!(
                        window = %window,
                        error = %e,
                        committed = window_total,
                        "Window aborted, moving on"
                    );
                    aborted = true;
                    break;
                }
            };

            report.pages += 1;
            if batch.is_empty() {
                continue;
            }

            let stored = sink.upsert_batch(&batch).map_err(|source| IngestError::Sink {
                window: window.to_string(),
                count: batch.len(),
                source,
            })?;

            window_total += stored;
            report.total += stored;

            on_progress(&IngestProgress {
                window: &window,
                page: walker.pages(),
                stored_this_page: stored,
                window_total,
                total: report.total,
                target: config.target,
            });
        }

        if let Some(matches) = walker.total_matches() {
            if matches > SEARCH_RESULT_CAP && !aborted && walker.is_done() && report.total < config.target {
                warn!(
                    window = %window,
                    matches,
                    cap = SEARCH_RESULT_CAP,
                    "Window exceeds search cap, use a finer granularity to reach the rest"
                );
            }
        }

        if aborted {
            report.aborted_windows.push(window.index);
        } else if walker.is_done() {
            report.windows_completed += 1;
            info!(window = %window, stored = window_total, total = report.total, "Window complete");
        } else {
            info!(window = %window, stored = window_total, "Window left unfinished");
        }

        if report.stopped {
            break;
        }
    }

    info!(
        total = report.total,
        target = config.target,
        windows_completed = report.windows_completed,
        windows_aborted = report.aborted_windows.len(),
        stopped = report.stopped,
        "Ingestion finished"
    );

    Ok(report)
}
