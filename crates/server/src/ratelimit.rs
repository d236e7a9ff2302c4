//! Sliding-window rate limiting keyed by `(ip, subject)`.
//!
//! Process-local by design; a multi-node deployment swaps this for a shared
//! store behind the same interface.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Default ceiling for auth ceremonies: 10 requests per minute per
/// `(ip, subject)`.
pub const DEFAULT_LIMIT: u32 = 10;

/// Sliding-window limiter over the last minute.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    buckets: DashMap<(String, String), VecDeque<Instant>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_LIMIT, Duration::from_secs(60))
    }
}

impl RateLimiter {
    #[must_use]
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            buckets: DashMap::new(),
        }
    }

    /// Record a hit for `(ip, subject)`; `Err(retry_after_secs)` when the
    /// window is full.
    pub fn check(&self, ip: &str, subject: &str) -> Result<(), u64> {
        let now = Instant::now();
        let mut bucket = self
            .buckets
            .entry((ip.to_owned(), subject.to_owned()))
            .or_default();

        while let Some(front) = bucket.front() {
            if now.duration_since(*front) >= self.window {
                bucket.pop_front();
            } else {
                break;
            }
        }

        if bucket.len() as u32 >= self.limit
            && let Some(oldest) = bucket.front()
        {
            let retry_after = self
                .window
                .saturating_sub(now.duration_since(*oldest))
                .as_secs()
                .max(1);
            return Err(retry_after);
        }

        bucket.push_back(now);
        Ok(())
    }
}
