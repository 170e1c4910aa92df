//! Window usage reports.

use serde::{Deserialize, Serialize};

/// Current usage of a window, as reported by
/// [`RateLimiter::status`](super::RateLimiter::status).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Entries currently in the window
    pub total: u64,
    /// Capacity left before the limit is reached
    pub remaining: u64,
    /// Milliseconds until a slot is predicted to free up; 0 while capacity remains
    pub retry_after_ms: u64,
}

/// Which ranked entry an exhausted window's retry estimate is based on.
///
/// Entries are ranked from most recent (index 0) to oldest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPivot {
    /// Rank `max(0, limit - 2)`
    #[default]
    LimitMinusTwo,
    /// Rank `limit - 1`, the oldest entry counted against the limit
    LimitMinusOne,
}

impl RetryPivot {
    /// Rank of the pivot entry for a window holding `limit` entries.
    pub fn rank(&self, limit: u64) -> usize {
        let rank = match self {
            RetryPivot::LimitMinusTwo => limit.saturating_sub(2),
            RetryPivot::LimitMinusOne => limit.saturating_sub(1),
        };
        usize::try_from(rank).unwrap_or(usize::MAX)
    }
}

/// Milliseconds until an entry scored `score` leaves a `duration_ms` window.
pub(crate) fn retry_after_ms(score: i64, duration_ms: u64, now: i64) -> u64 {
    let duration = i64::try_from(duration_ms).unwrap_or(i64::MAX);
    let expires_at = score.saturating_add(duration);
    u64::try_from(expires_at.saturating_sub(now)).unwrap_or(0)
}
