//! Rate-limit header parsing
//!
//! Two header conventions are understood:
//! - `X-RateLimit-Limit` / `X-RateLimit-Remaining` / `X-RateLimit-Reset`
//!   where reset is a Unix timestamp (small values are read as seconds from now)
//! - `RateLimit-Limit` / `RateLimit-Remaining` / `RateLimit-Reset`
//!   where reset is seconds from now
//!
//! Missing or malformed headers produce an unknown snapshot, never an error.

use chrono::{DateTime, Duration, TimeZone, Utc};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};

/// Reset values below this are deltas, not epoch seconds
const EPOCH_THRESHOLD: i64 = 1_000_000_000;

/// Rate-limit budget reported with one response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset_at: Option<DateTime<Utc>>,
}

impl RateLimitSnapshot {
    /// Parse from response headers
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self::from_headers_at(headers, Utc::now())
    }

    pub fn from_headers_at(headers: &HeaderMap, now: DateTime<Utc>) -> Self {
        let prefixed = Self {
            limit: header_u64(headers, "x-ratelimit-limit"),
            remaining: header_u64(headers, "x-ratelimit-remaining"),
            reset_at: header_i64(headers, "x-ratelimit-reset").and_then(|v| {
                if v >= EPOCH_THRESHOLD {
                    Utc.timestamp_opt(v, 0).single()
                } else {
                    Some(now + Duration::seconds(v))
                }
            }),
        };
        if !prefixed.is_unknown() {
            return prefixed;
        }

        Self {
            limit: header_u64(headers, "ratelimit-limit"),
            remaining: header_u64(headers, "ratelimit-remaining"),
            reset_at: header_i64(headers, "ratelimit-reset").map(|v| now + Duration::seconds(v)),
        }
    }

    /// No rate-limit headers were present
    pub fn is_unknown(&self) -> bool {
        self.limit.is_none() && self.remaining.is_none() && self.reset_at.is_none()
    }

    /// Remaining budget is known and strictly below the low-water mark
    pub fn is_low(&self, low_water_mark: u64) -> bool {
        matches!(self.remaining, Some(r) if r < low_water_mark)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    header_str(headers, name).and_then(|v| v.parse().ok())
}

fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    header_str(headers, name).and_then(|v| v.parse().ok())
}

/// Parse a `Retry-After` header given in seconds
pub fn retry_after_secs(headers: &HeaderMap) -> Option<u64> {
    header_u64(headers, "retry-after")
}
