//! Async pacing over the shared token buckets
//!
//! Wraps the token buckets from `exwire-types` with an awaitable acquire, so
//! connection attempts and REST calls can sleep out their budget instead of
//! erroring.

use exwire_types::{RateLimitCategory, RateLimitConfig, RateLimitResult, TokenBucket};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Token-bucket limiter covering every request category
pub struct RateLimiter {
    buckets: Mutex<HashMap<RateLimitCategory, TokenBucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let mut buckets = HashMap::new();
        for category in [
            RateLimitCategory::Connection,
            RateLimitCategory::RestPublic,
            RateLimitCategory::RestPrivate,
        ] {
            buckets.insert(category, category.get_config(&config).create_bucket());
        }
        Self {
            buckets: Mutex::new(buckets),
        }
    }

    /// Non-blocking check-and-consume
    pub fn try_acquire(&self, category: RateLimitCategory, tokens: u32) -> RateLimitResult {
        let mut buckets = self.buckets.lock();
        let Some(bucket) = buckets.get_mut(&category) else {
            return RateLimitResult::Allowed;
        };
        match bucket.try_acquire(tokens) {
            Ok(()) => RateLimitResult::Allowed,
            Err(wait) => RateLimitResult::Limited { wait, category },
        }
    }

    /// Consume tokens, sleeping until the bucket refills if needed.
    pub async fn acquire(&self, category: RateLimitCategory, tokens: u32) {
        loop {
            let wait = match self.try_acquire(category, tokens) {
                RateLimitResult::Allowed => return,
                RateLimitResult::Limited { wait, .. } => wait,
            };
            debug!(?category, ?wait, "rate limited, waiting");
            // Small floor so refill rounding cannot spin
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }

    /// Tokens currently available in a category
    pub fn available(&self, category: RateLimitCategory) -> u32 {
        self.buckets
            .lock()
            .get_mut(&category)
            .map_or(0, |bucket| bucket.available())
    }

    /// Refill every bucket to capacity
    pub fn reset(&self) {
        for bucket in self.buckets.lock().values_mut() {
            bucket.reset();
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_acquire_depletes_bucket() {
        let limiter = RateLimiter::new(RateLimitConfig::exchange_defaults());

        // Connection bucket holds 10 tokens
        for _ in 0..10 {
            assert!(limiter
                .try_acquire(RateLimitCategory::Connection, 1)
                .is_allowed());
        }
        let result = limiter.try_acquire(RateLimitCategory::Connection, 1);
        assert!(!result.is_allowed());
        assert!(result.wait_duration().is_some());
    }

    #[test]
    fn test_categories_are_independent() {
        let limiter = RateLimiter::new(RateLimitConfig::exchange_defaults());

        for _ in 0..10 {
            limiter.try_acquire(RateLimitCategory::Connection, 1);
        }
        assert!(limiter
            .try_acquire(RateLimitCategory::RestPublic, 1)
            .is_allowed());
    }

    // Real time: the buckets refill on the wall clock, not the tokio clock
    #[tokio::test]
    async fn test_acquire_waits_for_refill() {
        let limiter = RateLimiter::new(RateLimitConfig::permissive());

        // Drain the bucket, then acquire one more; at 100 tokens/s that
        // needs ~10ms of refill
        limiter.try_acquire(RateLimitCategory::RestPublic, 1000);
        let start = std::time::Instant::now();
        limiter.acquire(RateLimitCategory::RestPublic, 1).await;
        assert!(start.elapsed() >= Duration::from_millis(5));
    }

    #[test]
    fn test_reset_refills() {
        let limiter = RateLimiter::new(RateLimitConfig::exchange_defaults());
        limiter.try_acquire(RateLimitCategory::Connection, 10);
        assert_eq!(limiter.available(RateLimitCategory::Connection), 0);

        limiter.reset();
        assert_eq!(limiter.available(RateLimitCategory::Connection), 10);
    }
}
