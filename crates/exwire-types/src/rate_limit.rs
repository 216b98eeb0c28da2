//! Client-side rate limiting primitives
//!
//! Token bucket-based rate limiting used by the REST client and the
//! connection layer. Buckets are consumed when making requests and refill at
//! a constant rate.

use std::time::{Duration, Instant};

/// Token bucket rate limiter
#[derive(Debug)]
pub struct TokenBucket {
    /// Maximum number of tokens (bucket capacity)
    capacity: u32,
    /// Current number of available tokens
    tokens: f64,
    /// Tokens added per second (refill rate)
    refill_rate: f64,
    /// Last time tokens were refilled
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a new token bucket
    ///
    /// # Arguments
    /// * `capacity` - Maximum number of tokens the bucket can hold
    /// * `refill_rate` - Number of tokens added per second
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity,
            tokens: capacity as f64,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    /// Try to acquire tokens from the bucket
    ///
    /// Returns `Ok(())` if tokens were acquired, or `Err(Duration)` with the
    /// time to wait before enough tokens will be available.
    pub fn try_acquire(&mut self, tokens: u32) -> Result<(), Duration> {
        self.refill();

        let tokens_f64 = tokens as f64;
        if self.tokens >= tokens_f64 {
            self.tokens -= tokens_f64;
            Ok(())
        } else {
            let needed = tokens_f64 - self.tokens;
            let wait_secs = needed / self.refill_rate;
            Err(Duration::from_secs_f64(wait_secs))
        }
    }

    /// Check if tokens are available without consuming them
    pub fn check_available(&mut self, tokens: u32) -> bool {
        self.refill();
        self.tokens >= tokens as f64
    }

    /// Get current available tokens
    pub fn available(&mut self) -> u32 {
        self.refill();
        self.tokens.floor() as u32
    }

    /// Get the capacity of this bucket
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Get the refill rate (tokens per second)
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Reset the bucket to full capacity
    pub fn reset(&mut self) {
        self.tokens = self.capacity as f64;
        self.last_refill = Instant::now();
    }

    /// Refill tokens based on elapsed time
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        let added = elapsed.as_secs_f64() * self.refill_rate;
        self.tokens = (self.tokens + added).min(self.capacity as f64);
        self.last_refill = now;
    }
}

/// Configuration for a single token bucket
#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    /// Maximum tokens
    pub capacity: u32,
    /// Tokens per second refill rate
    pub refill_rate: f64,
}

impl TokenBucketConfig {
    /// Create a new token bucket configuration
    pub const fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
        }
    }

    /// Create a token bucket from this configuration
    pub fn create_bucket(&self) -> TokenBucket {
        TokenBucket::new(self.capacity, self.refill_rate)
    }
}

/// Rate limit configuration for the request classes the exchanges document
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// WebSocket connection attempts
    pub connection: TokenBucketConfig,
    /// Public REST endpoints: 3 req/s with a small burst
    pub rest_public: TokenBucketConfig,
    /// Private (authenticated) REST endpoints: 5 req/s with a small burst
    pub rest_private: TokenBucketConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::exchange_defaults()
    }
}

impl RateLimitConfig {
    /// Documented exchange limits
    pub fn exchange_defaults() -> Self {
        Self {
            connection: TokenBucketConfig::new(10, 0.5),
            rest_public: TokenBucketConfig::new(6, 3.0),
            rest_private: TokenBucketConfig::new(10, 5.0),
        }
    }

    /// Very permissive configuration (for testing)
    pub fn permissive() -> Self {
        Self {
            connection: TokenBucketConfig::new(1000, 100.0),
            rest_public: TokenBucketConfig::new(1000, 100.0),
            rest_private: TokenBucketConfig::new(1000, 100.0),
        }
    }
}

/// Rate limiter category for different request classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitCategory {
    /// WebSocket connection attempts
    Connection,
    /// Public REST endpoints
    RestPublic,
    /// Private REST endpoints (authenticated)
    RestPrivate,
}

impl RateLimitCategory {
    /// Get the configuration for this category
    pub fn get_config(self, config: &RateLimitConfig) -> TokenBucketConfig {
        match self {
            Self::Connection => config.connection,
            Self::RestPublic => config.rest_public,
            Self::RestPrivate => config.rest_private,
        }
    }
}

/// Result of a rate limit check
#[derive(Debug, Clone)]
pub enum RateLimitResult {
    /// Request is allowed
    Allowed,
    /// Request is rate limited, wait the specified duration
    Limited {
        wait: Duration,
        category: RateLimitCategory,
    },
}

impl RateLimitResult {
    /// Check if the request is allowed
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Get the wait duration if rate limited
    pub fn wait_duration(&self) -> Option<Duration> {
        match self {
            Self::Allowed => None,
            Self::Limited { wait, .. } => Some(*wait),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_bucket_acquire() {
        let mut bucket = TokenBucket::new(10, 1.0);

        assert!(bucket.try_acquire(5).is_ok());
        assert_eq!(bucket.available(), 5);

        assert!(bucket.try_acquire(5).is_ok());
        assert_eq!(bucket.available(), 0);

        assert!(bucket.try_acquire(1).is_err());
    }

    #[test]
    fn test_token_bucket_refill() {
        let mut bucket = TokenBucket::new(10, 100.0);

        assert!(bucket.try_acquire(10).is_ok());
        assert_eq!(bucket.available(), 0);

        std::thread::sleep(Duration::from_millis(15));
        assert!(bucket.available() >= 1);
    }

    #[test]
    fn test_token_bucket_reset() {
        let mut bucket = TokenBucket::new(10, 1.0);

        bucket.try_acquire(10).unwrap();
        assert_eq!(bucket.available(), 0);

        bucket.reset();
        assert_eq!(bucket.available(), 10);
    }

    #[test]
    fn test_rate_limit_config_defaults() {
        let config = RateLimitConfig::exchange_defaults();
        assert_eq!(config.rest_public.refill_rate, 3.0);
        assert_eq!(config.rest_private.refill_rate, 5.0);
    }

    #[test]
    fn test_rate_limit_result() {
        let allowed = RateLimitResult::Allowed;
        assert!(allowed.is_allowed());
        assert!(allowed.wait_duration().is_none());

        let limited = RateLimitResult::Limited {
            wait: Duration::from_secs(5),
            category: RateLimitCategory::RestPublic,
        };
        assert!(!limited.is_allowed());
        assert_eq!(limited.wait_duration(), Some(Duration::from_secs(5)));
    }
}
