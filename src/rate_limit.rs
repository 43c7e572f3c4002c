//! GraphQL quota governance
//!
//! The governor never fails: it only decides how long to pause and then sleeps. Delay
//! computation is kept pure (`*_delay` take `now`) so the policy can be tested without
//! touching the clock.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{info, warn};

use crate::formatting::format_wait;
use crate::models::Quota;

/// Governor thresholds
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    /// Wait preemptively once `remaining` drops below this
    pub low_water: u64,
    /// Added on top of `reset_at - now`
    pub safety_margin: Duration,
    /// Used when the reset instant is unknown
    pub fallback_wait: Duration,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            low_water: 50,
            safety_margin: Duration::from_secs(5),
            fallback_wait: Duration::from_secs(60),
        }
    }
}

/// Parse a GraphQL `resetAt` value; malformed input yields `None`
pub fn parse_reset_at(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Convert an `x-ratelimit-reset` header (unix seconds) to a timestamp
pub fn reset_from_epoch(secs: u64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(i64::try_from(secs).ok()?, 0)
}

pub struct RateLimitGovernor {
    config: GovernorConfig,
}

impl RateLimitGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        Self { config }
    }

    /// Time left until `reset_at`, plus the safety margin, never negative
    fn until_reset(&self, reset_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        let until = (reset_at - now).to_std().unwrap_or(Duration::ZERO);
        until + self.config.safety_margin
    }

    /// Delay required before the next request, or `None` if there is enough quota
    pub fn preemptive_delay(&self, quota: &Quota, now: DateTime<Utc>) -> Option<Duration> {
        let remaining = quota.remaining?;
        if remaining >= self.config.low_water {
            return None;
        }

        Some(match quota.reset_at {
            Some(reset_at) => self.until_reset(reset_at, now),
            None => self.config.fallback_wait,
        })
    }

    /// Delay forced by an explicit rate-limit signal
    pub fn reactive_delay(&self, reset_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
        match reset_at {
            Some(reset_at) => self.until_reset(reset_at, now),
            None => self.config.fallback_wait,
        }
    }

    /// Block if the reported quota is below the low-water mark
    ///
    /// Returns true if we had to wait.
    pub async fn throttle(&self, quota: &Quota) -> bool {
        let Some(delay) = self.preemptive_delay(quota, Utc::now()) else {
            return false;
        };

        info!(
            remaining = quota.remaining.unwrap_or(0),
            low_water = self.config.low_water,
            wait = %format_wait(delay),
            reset_at = ?quota.reset_at,
            "Rate limit low, waiting for reset"
        );
        tokio::time::sleep(delay).await;
        info!("Rate limit reset, resuming");
        true
    }

    /// Wait out an explicit rate-limit condition
    pub async fn wait_for_reset(&self, reset_at: Option<DateTime<Utc>>) {
        let delay = self.reactive_delay(reset_at, Utc::now());
        if reset_at.is_some() {
            warn!(wait = %format_wait(delay), reset_at = ?reset_at, "Rate limited, waiting for reset");
        } else {
            warn!(wait = %format_wait(delay), "Rate limited without reset time, backing off");
        }
        tokio::time::sleep(delay).await;
    }
}
