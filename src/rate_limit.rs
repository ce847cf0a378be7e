// src/rate_limit.rs
use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct Bucket {
    remaining: u64,
    window_start: Instant,
}

struct Buckets {
    by_key: HashMap<String, Bucket>,
    last_sweep: Instant,
}

/// Per-key request budget that refills completely once per window.
///
/// Buckets whose window has elapsed are dropped at most once per window, so
/// the map only holds keys seen during roughly the last two windows.
pub struct RateLimiter {
    capacity: Option<u64>,
    window: Duration,
    buckets: Mutex<Buckets>,
}

impl RateLimiter {
    /// `per_minute <= 0` disables limiting.
    pub fn per_minute(per_minute: i64) -> Self {
        Self::new(per_minute, Duration::from_secs(60))
    }

    pub fn new(limit: i64, window: Duration) -> Self {
        Self {
            capacity: u64::try_from(limit).ok().filter(|c| *c > 0),
            window,
            buckets: Mutex::new(Buckets {
                by_key: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    fn allow_at(&self, key: &str, now: Instant) -> bool {
        let Some(capacity) = self.capacity else {
            return true;
        };
        let window = self.window;
        let mut buckets = self.buckets.lock();
        if now.saturating_duration_since(buckets.last_sweep) >= window {
            buckets
                .by_key
                .retain(|_, b| now.saturating_duration_since(b.window_start) < window);
            buckets.last_sweep = now;
        }
        let bucket = buckets.by_key.entry(key.to_string()).or_insert(Bucket {
            remaining: capacity,
            window_start: now,
        });
        if now.saturating_duration_since(bucket.window_start) >= window {
            bucket.remaining = capacity;
            bucket.window_start = now;
        }
        if bucket.remaining == 0 {
            return false;
        }
        bucket.remaining -= 1;
        true
    }
}
