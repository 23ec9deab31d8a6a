//! The result value returned by every limiter operation.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

/// A snapshot of limiter state for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterRes {
    /// Points still available in the current window.
    pub remaining_points: u64,
    /// Milliseconds until the window resets, `-1` if it never expires.
    pub ms_before_next: i64,
    /// Points consumed in the current window. Can exceed the limit, and can
    /// go negative after rewards.
    #[serde(default)]
    pub consumed_points: i64,
    /// True iff the operation created a new window record.
    #[serde(default)]
    pub is_first_in_duration: bool,
}

impl RateLimiterRes {
    /// Create a new result.
    pub fn new(
        remaining_points: u64,
        ms_before_next: i64,
        consumed_points: i64,
        is_first_in_duration: bool,
    ) -> Self {
        Self {
            remaining_points,
            ms_before_next,
            consumed_points,
            is_first_in_duration,
        }
    }

    /// Whether the window never expires.
    pub fn never_expires(&self) -> bool {
        self.ms_before_next < 0
    }

    /// Wall-clock time at which the window resets.
    pub fn reset_at(&self) -> Option<DateTime<Utc>> {
        if self.never_expires() {
            return None;
        }
        Some(Utc::now() + ChronoDuration::milliseconds(self.ms_before_next))
    }

    /// Conventional rate limit response headers for a limiter with `points`.
    ///
    /// `Retry-After` and `X-RateLimit-Reset` are left out when the window
    /// never expires.
    pub fn headers(&self, points: u64) -> Vec<(&'static str, String)> {
        let mut headers = Vec::with_capacity(4);
        if !self.never_expires() {
            let retry_after = (self.ms_before_next as u64).div_ceil(1000);
            headers.push(("Retry-After", retry_after.to_string()));
        }
        headers.push(("X-RateLimit-Limit", points.to_string()));
        headers.push(("X-RateLimit-Remaining", self.remaining_points.to_string()));
        if let Some(reset_at) = self.reset_at() {
            headers.push(("X-RateLimit-Reset", reset_at.to_rfc2822()));
        }
        headers
    }
}

impl std::fmt::Display for RateLimiterRes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        f.write_str(&json)
    }
}
