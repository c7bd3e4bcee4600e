//! Error taxonomy for the orchestration core.
//!
//! Every failure that crosses a module boundary is an [`LlmError`]. The
//! variants map one-to-one onto the failure kinds that are visible on the
//! client event stream, so the gateway can serialize them without a second
//! translation layer.
//!
//! Two properties matter to callers:
//!
//! - [`LlmError::is_retryable`] — whether the single-call path may retry the
//!   request (rate limits, 5xx, transport resets) or must propagate it
//!   (auth, validation, context window).
//! - [`LlmError::kind`] — the stable wire-visible kind string carried in
//!   `error` events.
//!
//! # Example
//!
//! ```rust
//! use ensemble::error::LlmError;
//! use std::time::Duration;
//!
//! let err = LlmError::RateLimited { provider: "openai".into(), retry_after: Duration::from_millis(250) };
//! assert!(err.is_retryable());
//! assert_eq!(err.kind(), "rate_limit");
//! ```

use std::error::Error;
use std::fmt;
use std::time::Duration;

/// All failure kinds surfaced by the orchestration core.
#[derive(Debug, Clone)]
pub enum LlmError {
    /// The provider's token bucket had no capacity. Carries the wait until
    /// one token regenerates.
    RateLimited {
        /// Provider whose bucket rejected the call.
        provider: String,
        /// Time until a single token will be available again.
        retry_after: Duration,
    },

    /// Invalid or missing credential for a provider. Also produced when an
    /// upstream returns an HTML error page instead of a JSON body.
    Authentication {
        /// Provider that rejected the credential.
        provider: String,
    },

    /// The requested logical model is not present in the model registry.
    ModelNotSupported {
        /// The model id that failed to resolve.
        model: String,
        /// Every model the registry does know, for diagnostics.
        known_models: Vec<String>,
    },

    /// The estimated prompt size exceeds the model's context window.
    ContextWindowExceeded {
        /// Estimated token count of the request (⌈chars / 4⌉).
        estimated_tokens: usize,
        /// The model's configured context window.
        limit_tokens: usize,
    },

    /// Malformed request: missing parameters, unknown strategy, unknown tool.
    Validation(String),

    /// Transport failure or remote 5xx that survived bounded retry.
    Provider {
        /// Provider that produced the failure.
        provider: String,
        /// HTTP status if one was observed; `None` for transport resets.
        status: Option<u16>,
        /// Upstream error text, truncated at the adapter.
        message: String,
    },

    /// Admission refused by an open circuit breaker.
    CircuitOpen {
        /// Breaker name, `"<scope>:<name>"`.
        breaker: String,
    },

    /// Competitive strategy received no successful response before its
    /// deadline.
    CompetitiveTimeout {
        /// The deadline that expired.
        timeout: Duration,
    },

    /// Consensus strategy had too few successful responses to attempt a
    /// consensus check.
    ConsensusNotReached {
        /// Successful responses observed.
        successes: usize,
        /// Minimum successes the threshold demanded.
        required: usize,
    },

    /// The overall orchestration deadline expired and all child calls were
    /// cancelled.
    OrchestrationTimeout {
        /// The deadline that expired.
        timeout: Duration,
    },
}

impl LlmError {
    /// Whether the single-call path may retry this failure.
    ///
    /// Retryable: rate limits, 5xx, transport. Everything else is terminal
    /// and bypasses both retry and the in-call backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::RateLimited { .. } => true,
            LlmError::Provider { status, .. } => match status {
                Some(code) => matches!(code, 429 | 500 | 502 | 503 | 504),
                // No status means the transport reset under us.
                None => true,
            },
            _ => false,
        }
    }

    /// Stable kind tag carried on the client event stream.
    pub fn kind(&self) -> &'static str {
        match self {
            LlmError::RateLimited { .. } => "rate_limit",
            LlmError::Authentication { .. } => "authentication",
            LlmError::ModelNotSupported { .. } => "model_not_supported",
            LlmError::ContextWindowExceeded { .. } => "context_window",
            LlmError::Validation(_) => "validation",
            LlmError::Provider { .. } => "server_error",
            LlmError::CircuitOpen { .. } => "circuit_open",
            LlmError::CompetitiveTimeout { .. } => "competitive_timeout",
            LlmError::ConsensusNotReached { .. } => "consensus_not_reached",
            LlmError::OrchestrationTimeout { .. } => "orchestration_timeout",
        }
    }
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::RateLimited {
                provider,
                retry_after,
            } => write!(
                f,
                "Rate limited by {} bucket; retry after {}ms",
                provider,
                retry_after.as_millis()
            ),
            LlmError::Authentication { provider } => {
                write!(f, "Authentication failed for provider {}", provider)
            }
            LlmError::ModelNotSupported {
                model,
                known_models,
            } => write!(
                f,
                "Model not supported: {} (known: {})",
                model,
                known_models.join(", ")
            ),
            LlmError::ContextWindowExceeded {
                estimated_tokens,
                limit_tokens,
            } => write!(
                f,
                "Context window exceeded: estimated {} tokens, limit {}",
                estimated_tokens, limit_tokens
            ),
            LlmError::Validation(msg) => write!(f, "Validation error: {}", msg),
            LlmError::Provider {
                provider,
                status,
                message,
            } => match status {
                Some(code) => write!(f, "Provider {} error ({}): {}", provider, code, message),
                None => write!(f, "Provider {} transport error: {}", provider, message),
            },
            LlmError::CircuitOpen { breaker } => {
                write!(f, "Circuit open: {}", breaker)
            }
            LlmError::CompetitiveTimeout { timeout } => write!(
                f,
                "No agent succeeded within {}ms",
                timeout.as_millis()
            ),
            LlmError::ConsensusNotReached {
                successes,
                required,
            } => write!(
                f,
                "Consensus not reached: {} successful responses, {} required",
                successes, required
            ),
            LlmError::OrchestrationTimeout { timeout } => write!(
                f,
                "Orchestration deadline of {}ms expired",
                timeout.as_millis()
            ),
        }
    }
}

impl Error for LlmError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_split_matches_status_codes() {
        for code in [429u16, 500, 502, 503, 504] {
            let err = LlmError::Provider {
                provider: "openai".into(),
                status: Some(code),
                message: "upstream".into(),
            };
            assert!(err.is_retryable(), "{} should be retryable", code);
        }
        for code in [400u16, 401, 403, 404, 422] {
            let err = LlmError::Provider {
                provider: "openai".into(),
                status: Some(code),
                message: "upstream".into(),
            };
            assert!(!err.is_retryable(), "{} should be terminal", code);
        }
    }

    #[test]
    fn transport_errors_are_retryable() {
        let err = LlmError::Provider {
            provider: "gemini".into(),
            status: None,
            message: "connection reset".into(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn terminal_kinds_are_not_retryable() {
        assert!(!LlmError::Authentication {
            provider: "claude".into()
        }
        .is_retryable());
        assert!(!LlmError::Validation("missing agents".into()).is_retryable());
        assert!(!LlmError::ContextWindowExceeded {
            estimated_tokens: 9000,
            limit_tokens: 8192
        }
        .is_retryable());
    }
}
