//! Error types for the crawler.
//!
//! Fetch errors are scoped to a single window: the pipeline logs them and moves on.
//! Sink errors abort the whole run.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors raised while fetching one page from the search endpoint.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    /// Connection failure, timeout, bad status or undecodable body. Retried with backoff.
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// The endpoint asked us to slow down. Retried after the governor's wait.
    #[error("Rate limited (reset at {reset_at:?})")]
    RateLimited { reset_at: Option<DateTime<Utc>> },

    /// The API answered with an error that is not a rate limit. Not retried.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Transient failures hit the retry ceiling.
    #[error("Gave up after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

impl FetchError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientNetwork(msg.into())
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }
}

/// Errors raised while persisting a batch.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A record could not be represented in the store.
    #[error("Invalid record {id}: {reason}")]
    InvalidRecord { id: String, reason: String },
}

/// Run-fatal errors of the ingestion pipeline.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Failed to persist batch of {count} records from window {window}: {source}")]
    Sink {
        window: String,
        count: usize,
        #[source]
        source: SinkError,
    },
}
