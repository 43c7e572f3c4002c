//! Creation-date windowing for GitHub search
//!
//! GitHub search (REST and GraphQL) never returns more than 1000 results for one query,
//! so a historical range is cut into disjoint `created:` windows that each stay under the
//! cap. Generation is lazy and deterministic: the same bounds always produce the same
//! windows in the same order, which is what makes `--skip` resumption work.

use chrono::{Days, Months, NaiveDate};
use std::fmt;
use std::str::FromStr;

/// Predicate appended to every window filter unless overridden
pub const DEFAULT_PREDICATE: &str = "fork:false";

/// Size of one window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Day,
    Week,
    Month,
}

impl Granularity {
    /// Start of the period following `date`, or `None` past the calendar's end
    fn advance(self, date: NaiveDate) -> Option<NaiveDate> {
        match self {
            Granularity::Day => date.checked_add_days(Days::new(1)),
            Granularity::Week => date.checked_add_days(Days::new(7)),
            Granularity::Month => date.checked_add_months(Months::new(1)),
        }
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "day" | "daily" => Ok(Granularity::Day),
            "week" | "weekly" => Ok(Granularity::Week),
            "month" | "monthly" => Ok(Granularity::Month),
            other => Err(format!("unknown granularity '{}' (expected day, week or month)", other)),
        }
    }
}

/// One query partition: the half-open range `[start, end)` plus static predicates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    /// Position in generation order (0-based)
    pub index: usize,
    pub start: NaiveDate,
    /// Exclusive
    pub end: NaiveDate,
    pub predicates: Vec<String>,
}

impl Window {
    /// Render as a GitHub search filter, e.g. `created:2008-01-01..2008-01-01 fork:false`
    ///
    /// GitHub's `a..b` range includes both ends, so the exclusive end is rendered as the
    /// day before it.
    pub fn filter(&self) -> String {
        let last_day = self.end.pred_opt().unwrap_or(self.start);
        let mut filter = format!("created:{}..{}", self.start, last_day);
        for predicate in &self.predicates {
            filter.push(' ');
            filter.push_str(predicate);
        }
        filter
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} [{}, {})", self.index, self.start, self.end)
    }
}

/// Splits `[start, end)` into consecutive windows
#[derive(Debug, Clone)]
pub struct WindowPartitioner {
    start: NaiveDate,
    end: NaiveDate,
    granularity: Granularity,
    predicates: Vec<String>,
}

impl WindowPartitioner {
    /// Day-sized windows excluding forks
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start,
            end,
            granularity: Granularity::Day,
            predicates: vec![DEFAULT_PREDICATE.to_string()],
        }
    }

    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn with_predicates(mut self, predicates: Vec<String>) -> Self {
        self.predicates = predicates
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        self
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// Lazily generate the windows in order
    pub fn windows(&self) -> Windows<'_> {
        Windows {
            partitioner: self,
            next_start: Some(self.start),
            index: 0,
        }
    }

    /// Number of windows the range produces
    pub fn count(&self) -> usize {
        self.windows().count()
    }
}

/// Iterator returned by [`WindowPartitioner::windows`]
pub struct Windows<'a> {
    partitioner: &'a WindowPartitioner,
    next_start: Option<NaiveDate>,
    index: usize,
}

impl Iterator for Windows<'_> {
    type Item = Window;

    fn next(&mut self) -> Option<Window> {
        let start = self.next_start?;
        let bound = self.partitioner.end;
        if start >= bound {
            self.next_start = None;
            return None;
        }

        let end = match self.partitioner.granularity.advance(start) {
            Some(next) if next < bound => next,
            _ => bound,
        };

        let window = Window {
            index: self.index,
            start,
            end,
            predicates: self.partitioner.predicates.clone(),
        };

        self.index += 1;
        self.next_start = Some(end);
        Some(window)
    }
}
