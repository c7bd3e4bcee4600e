//! Process-level configuration.
//!
//! [`EnsembleConfig`] gathers the tunables the environment may override:
//! breaker thresholds, rate-limit capacities, cache behavior, and the
//! orchestration deadline. Users construct it manually or via
//! [`EnsembleConfig::from_env`] — no config-file parsing dependencies are
//! introduced.

use std::time::Duration;

use crate::ensemble::cache::CacheConfig;
use crate::ensemble::circuit_breaker::CircuitBreakerConfig;
use crate::ensemble::rate_limit::RateLimitConfig;

/// Global configuration for the orchestration core.
#[derive(Debug, Clone)]
pub struct EnsembleConfig {
    /// Circuit-breaker tuning shared by all breakers.
    pub breaker: CircuitBreakerConfig,
    /// Default token-bucket parameters for providers without an override.
    pub rate_limit: RateLimitConfig,
    /// Response-cache behavior.
    pub cache: CacheConfig,
    /// Overall per-orchestration deadline.
    pub orchestration_deadline: Duration,
    /// Maximum model-fallback hops per request.
    pub max_fallback_depth: usize,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cache: CacheConfig::default(),
            orchestration_deadline: Duration::from_secs(300),
            max_fallback_depth: 3,
        }
    }
}

impl EnsembleConfig {
    /// Build a config from environment variables, falling back to defaults
    /// for anything unset.
    ///
    /// Recognized variables:
    /// - breaker: see [`CircuitBreakerConfig::from_env`]
    /// - `ENSEMBLE_RATE_CAPACITY`, `ENSEMBLE_RATE_REFILL_PER_SEC`
    /// - `ENSEMBLE_CACHE_ENABLED` (`0`/`false` disables),
    ///   `ENSEMBLE_CACHE_TTL_SECS`, `ENSEMBLE_CACHE_MAX_SIZE`
    /// - `ENSEMBLE_ORCHESTRATION_DEADLINE_SECS`
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let rate_limit = RateLimitConfig {
            capacity: parse_env("ENSEMBLE_RATE_CAPACITY", defaults.rate_limit.capacity),
            refill_per_second: parse_env(
                "ENSEMBLE_RATE_REFILL_PER_SEC",
                defaults.rate_limit.refill_per_second,
            ),
        };

        let cache_enabled = std::env::var("ENSEMBLE_CACHE_ENABLED")
            .map(|v| !matches!(v.as_str(), "0" | "false" | "no"))
            .unwrap_or(defaults.cache.enabled);
        let cache = CacheConfig {
            enabled: cache_enabled,
            ttl: Duration::from_secs(parse_env(
                "ENSEMBLE_CACHE_TTL_SECS",
                defaults.cache.ttl.as_secs(),
            )),
            max_size: parse_env("ENSEMBLE_CACHE_MAX_SIZE", defaults.cache.max_size),
            sweep_interval: defaults.cache.sweep_interval,
        };

        Self {
            breaker: CircuitBreakerConfig::from_env(),
            rate_limit,
            cache,
            orchestration_deadline: Duration::from_secs(parse_env(
                "ENSEMBLE_ORCHESTRATION_DEADLINE_SECS",
                defaults.orchestration_deadline.as_secs(),
            )),
            max_fallback_depth: defaults.max_fallback_depth,
        }
    }
}

fn parse_env<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
