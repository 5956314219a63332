//! Rate limiting for preventing service overload
//!
//! Token bucket with lazy, time-proportional refill. The bucket is refilled
//! on every access (acquire, wait estimate, or status read) so callers never
//! observe stale state.

use crate::lock_unpoisoned;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Token bucket configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    /// Bucket capacity (burst size)
    pub max_tokens: f64,
    /// Tokens added per second
    pub refill_per_second: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_tokens: 100.0,
            refill_per_second: 50.0,
        }
    }
}

/// Point-in-time view of the bucket
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitStatus {
    /// Tokens available right now, after refill
    pub tokens_available: f64,
    /// Bucket capacity
    pub max_tokens: f64,
    /// Tokens added per second
    pub refill_rate: f64,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn refill(&mut self, now: Instant, max_tokens: f64, refill_rate: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_rate).min(max_tokens);
        self.last_refill = now;
    }
}

/// Rate limiter using the token bucket algorithm
///
/// # Example
/// ```
/// use salvo_core_resilience::RateLimiter;
///
/// // Burst of 10, refilling 5 tokens per second
/// let limiter = RateLimiter::new(10.0, 5.0);
///
/// assert!(limiter.try_acquire(1.0));
/// assert!(!limiter.try_acquire(50.0));
/// ```
#[derive(Debug)]
pub struct RateLimiter {
    max_tokens: f64,
    refill_rate: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a new rate limiter with a full bucket
    ///
    /// Negative inputs are clamped to zero.
    pub fn new(max_tokens: f64, refill_rate: f64) -> Self {
        let max_tokens = max_tokens.max(0.0);
        Self {
            max_tokens,
            refill_rate: refill_rate.max(0.0),
            bucket: Mutex::new(Bucket {
                tokens: max_tokens,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Create a rate limiter from configuration
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_tokens, config.refill_per_second)
    }

    /// Create a rate limiter allowing `n` requests per second with a burst of `n`
    pub fn per_second(n: u32) -> Self {
        Self::new(f64::from(n), f64::from(n))
    }

    /// Take `n` tokens if that many are available after refill.
    ///
    /// Non-blocking. Returns false and leaves the bucket untouched otherwise,
    /// and for any `n` that is not a finite positive count.
    pub fn try_acquire(&self, n: f64) -> bool {
        self.try_acquire_at(n, Instant::now())
    }

    fn try_acquire_at(&self, n: f64, now: Instant) -> bool {
        if !n.is_finite() || n <= 0.0 {
            return false;
        }
        let mut bucket = lock_unpoisoned(&self.bucket);
        bucket.refill(now, self.max_tokens, self.refill_rate);

        if bucket.tokens >= n {
            bucket.tokens -= n;
            true
        } else {
            false
        }
    }

    /// How long until `n` tokens would be available, without blocking.
    ///
    /// Zero when they are available already.
    pub fn wait_time_for(&self, n: f64) -> Duration {
        self.wait_time_at(n, Instant::now())
    }

    fn wait_time_at(&self, n: f64, now: Instant) -> Duration {
        let mut bucket = lock_unpoisoned(&self.bucket);
        bucket.refill(now, self.max_tokens, self.refill_rate);

        let deficit = n - bucket.tokens;
        if deficit <= 0.0 {
            return Duration::ZERO;
        }
        if self.refill_rate <= 0.0 {
            return Duration::MAX;
        }
        Duration::try_from_secs_f64(deficit / self.refill_rate).unwrap_or(Duration::MAX)
    }

    /// Refill, then report the bucket
    pub fn status(&self) -> RateLimitStatus {
        let mut bucket = lock_unpoisoned(&self.bucket);
        bucket.refill(Instant::now(), self.max_tokens, self.refill_rate);

        RateLimitStatus {
            tokens_available: bucket.tokens,
            max_tokens: self.max_tokens,
            refill_rate: self.refill_rate,
        }
    }

    /// Get the bucket capacity
    pub fn max_tokens(&self) -> f64 {
        self.max_tokens
    }

    /// Get the refill rate in tokens per second
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_starts_full() {
        let limiter = RateLimiter::new(5.0, 1.0);
        let status = limiter.status();
        assert!((status.tokens_available - 5.0).abs() < 1e-6);
        assert_eq!(status.max_tokens, 5.0);
    }

    #[test]
    fn test_acquire_until_empty() {
        let limiter = RateLimiter::new(3.0, 0.0);
        assert!(limiter.try_acquire(1.0));
        assert!(limiter.try_acquire(1.0));
        assert!(limiter.try_acquire(1.0));
        assert!(!limiter.try_acquire(1.0));
    }

    #[test]
    fn test_failed_acquire_leaves_tokens() {
        let limiter = RateLimiter::new(2.0, 0.0);
        assert!(!limiter.try_acquire(3.0));
        assert!((limiter.status().tokens_available - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_counts_rejected() {
        let limiter = RateLimiter::new(5.0, 0.0);
        for n in [-10.0, 0.0, -0.0, f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            assert!(!limiter.try_acquire(n), "accepted {n}");
        }
        let status = limiter.status();
        assert!((status.tokens_available - 5.0).abs() < 1e-9);
        assert!(status.tokens_available <= status.max_tokens);
    }

    #[test]
    fn test_refill_is_proportional_and_capped() {
        let limiter = RateLimiter::new(10.0, 10.0);
        let start = Instant::now();
        assert!(limiter.try_acquire_at(10.0, start));
        assert!(!limiter.try_acquire_at(1.0, start));

        // 300ms at 10/s refills 3 tokens
        let later = start + Duration::from_millis(300);
        assert!(limiter.try_acquire_at(3.0, later));
        assert!(!limiter.try_acquire_at(0.5, later));

        // A long idle period never overfills
        let much_later = later + Duration::from_secs(3600);
        assert_eq!(limiter.wait_time_at(10.0, much_later), Duration::ZERO);
        assert!(!limiter.try_acquire_at(10.5, much_later));
    }

    #[test]
    fn test_wait_time_estimate() {
        let limiter = RateLimiter::new(4.0, 2.0);
        let now = Instant::now();
        assert!(limiter.try_acquire_at(4.0, now));

        let wait = limiter.wait_time_at(1.0, now);
        assert!(wait >= Duration::from_millis(490) && wait <= Duration::from_millis(510));
        assert_eq!(limiter.wait_time_at(1.0, now + Duration::from_secs(1)), Duration::ZERO);
    }

    #[test]
    fn test_zero_refill_waits_forever() {
        let limiter = RateLimiter::new(1.0, 0.0);
        assert!(limiter.try_acquire(1.0));
        assert_eq!(limiter.wait_time_for(1.0), Duration::MAX);
    }

    #[test]
    fn test_tokens_stay_in_bounds() {
        let limiter = RateLimiter::new(5.0, 1000.0);
        for i in 0..200 {
            let _ = limiter.try_acquire(if i % 3 == 0 { 2.0 } else { 1.0 });
            let status = limiter.status();
            assert!(status.tokens_available >= 0.0);
            assert!(status.tokens_available <= status.max_tokens);
        }
    }

    #[test]
    fn test_per_second_config() {
        let limiter = RateLimiter::per_second(20);
        assert_eq!(limiter.max_tokens(), 20.0);
        assert_eq!(limiter.refill_rate(), 20.0);

        let limiter = RateLimiter::from_config(&RateLimitConfig::default());
        assert_eq!(limiter.max_tokens(), 100.0);
    }
}
