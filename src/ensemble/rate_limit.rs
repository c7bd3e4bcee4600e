//! Per-provider token-bucket admission control.
//!
//! One bucket per provider, refilled continuously at a configurable rate
//! with a separately configurable burst capacity. Admission is atomic: the
//! refill-then-decrement sequence runs under the bucket's own lock, and no
//! lock is ever held across an await point.
//!
//! # Example
//!
//! ```rust
//! use ensemble::rate_limit::{RateLimiterRegistry, RateLimitConfig};
//!
//! let registry = RateLimiterRegistry::new(RateLimitConfig {
//!     capacity: 2.0,
//!     refill_per_second: 10.0,
//! });
//!
//! assert!(registry.try_acquire("openai").is_ok());
//! assert!(registry.try_acquire("openai").is_ok());
//! // Burst exhausted; the error carries the wait until one token returns.
//! assert!(registry.try_acquire("openai").is_err());
//! ```

use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::ensemble::error::LlmError;

/// Capacity and refill rate for one provider's bucket.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Burst capacity: the maximum number of stored tokens.
    pub capacity: f64,
    /// Steady-state refill rate in tokens per second.
    pub refill_per_second: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 10.0,
            refill_per_second: 5.0,
        }
    }
}

/// A single token bucket.
///
/// `tokens` only decreases on admission; refill is computed lazily from the
/// elapsed time since `last_refill` so an idle bucket needs no timer.
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_ms: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            capacity: config.capacity,
            tokens: config.capacity,
            refill_per_ms: config.refill_per_second / 1000.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed_ms = now.duration_since(self.last_refill).as_secs_f64() * 1000.0;
        self.tokens = (self.tokens + elapsed_ms * self.refill_per_ms).min(self.capacity);
        self.last_refill = now;
    }

    /// Admit one call or report the wait until a single token regenerates.
    fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            let wait_ms = if self.refill_per_ms > 0.0 {
                deficit / self.refill_per_ms
            } else {
                f64::INFINITY
            };
            Err(Duration::from_millis(wait_ms.ceil().min(u64::MAX as f64) as u64))
        }
    }
}

/// Registry of per-provider buckets.
///
/// Buckets are created lazily with the registry's default configuration;
/// [`RateLimiterRegistry::configure`] installs a provider-specific override.
pub struct RateLimiterRegistry {
    buckets: DashMap<String, Mutex<TokenBucket>>,
    default_config: RateLimitConfig,
}

impl RateLimiterRegistry {
    /// Create a registry whose lazily created buckets use `default_config`.
    pub fn new(default_config: RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            default_config,
        }
    }

    /// Install or replace the bucket for a specific provider.
    pub fn configure(&self, provider: &str, config: RateLimitConfig) {
        self.buckets
            .insert(provider.to_string(), Mutex::new(TokenBucket::new(config)));
    }

    /// Attempt to admit one call for `provider`.
    ///
    /// Fails with [`LlmError::RateLimited`] carrying the wait-duration until
    /// one token regenerates.
    pub fn try_acquire(&self, provider: &str) -> Result<(), LlmError> {
        let entry = self
            .buckets
            .entry(provider.to_string())
            .or_insert_with(|| Mutex::new(TokenBucket::new(self.default_config)));
        let mut bucket = entry.lock().expect("bucket lock poisoned");
        bucket.try_acquire(Instant::now()).map_err(|retry_after| {
            LlmError::RateLimited {
                provider: provider.to_string(),
                retry_after,
            }
        })
    }
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
