//! Per-reader token bucket rate limiting.

use std::collections::HashMap;
use std::sync::Mutex;
use tollgate_common::types::Timestamp;

struct Bucket {
    tokens: f64,
    last_refill: Timestamp,
}

/// Token buckets keyed by reader id. Rate and burst come from policy on
/// every call so reloads apply immediately.
#[derive(Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one token; returns false when the bucket is exhausted.
    ///
    /// The token is consumed even when the surrounding event later fails,
    /// matching the side-effect contract of the ingest sequence.
    pub fn try_acquire(&self, reader_id: &str, now: Timestamp, rate_per_sec: f64, burst: u32) -> bool {
        let mut buckets = self.buckets.lock().expect("bucket lock is never poisoned");
        let bucket = buckets.entry(reader_id.to_string()).or_insert(Bucket {
            tokens: burst as f64,
            last_refill: now,
        });

        let elapsed = now.saturating_sub(bucket.last_refill) as f64;
        bucket.tokens = (bucket.tokens + elapsed * rate_per_sec).min(burst as f64);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop buckets idle since the cutoff (sweeper).
    pub fn prune(&self, cutoff: Timestamp) {
        self.buckets
            .lock()
            .expect("bucket lock is never poisoned")
            .retain(|_, bucket| bucket.last_refill >= cutoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_exhaustion() {
        let limiter = RateLimiter::new();
        let now = 1_700_000_000;

        for _ in 0..10 {
            assert!(limiter.try_acquire("r1", now, 5.0, 10));
        }
        assert!(!limiter.try_acquire("r1", now, 5.0, 10));
    }

    #[test]
    fn test_refill_over_time() {
        let limiter = RateLimiter::new();
        let now = 1_700_000_000;

        for _ in 0..10 {
            limiter.try_acquire("r1", now, 5.0, 10);
        }
        assert!(!limiter.try_acquire("r1", now, 5.0, 10));

        // One second refills five tokens
        for _ in 0..5 {
            assert!(limiter.try_acquire("r1", now + 1, 5.0, 10));
        }
        assert!(!limiter.try_acquire("r1", now + 1, 5.0, 10));
    }

    #[test]
    fn test_buckets_are_per_reader() {
        let limiter = RateLimiter::new();
        let now = 1_700_000_000;

        for _ in 0..10 {
            limiter.try_acquire("r1", now, 5.0, 10);
        }
        assert!(!limiter.try_acquire("r1", now, 5.0, 10));
        assert!(limiter.try_acquire("r2", now, 5.0, 10));
    }
}
