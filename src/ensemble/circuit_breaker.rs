//! Named circuit breakers with a CLOSED/OPEN/HALF_OPEN state machine.
//!
//! One breaker exists per `(scope, name)` — scope is `model` or `agent` —
//! and gates admission to a failing dependency:
//!
//! - **CLOSED**: calls flow; consecutive failures up to the threshold flip
//!   the breaker to OPEN and arm the reset timer.
//! - **OPEN**: calls are rejected immediately with `CircuitOpen`. Once the
//!   reset timeout elapses, the next admission attempt moves to HALF_OPEN.
//! - **HALF_OPEN**: exactly one probe is admitted. Success closes the
//!   breaker and zeroes the failure count; failure re-opens it and re-arms
//!   the timer.
//!
//! A rolling window of recent outcomes feeds the success-rate metric in
//! [`BreakerSnapshot`]; it never participates in state transitions.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::ensemble::error::LlmError;

/// Breaker scope: what kind of dependency the breaker guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakerScope {
    Model,
    Agent,
}

impl fmt::Display for BreakerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerScope::Model => write!(f, "model"),
            BreakerScope::Agent => write!(f, "agent"),
        }
    }
}

/// The three breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breakers.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in CLOSED that trip the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays OPEN before admitting a probe.
    pub reset_timeout: Duration,
    /// Length of the rolling window used for the success-rate metric.
    pub monitoring_period: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            monitoring_period: Duration::from_secs(120),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// - `ENSEMBLE_BREAKER_FAILURE_THRESHOLD` — failures before opening (default 5)
    /// - `ENSEMBLE_BREAKER_RESET_TIMEOUT_SECS` — OPEN duration (default 30)
    /// - `ENSEMBLE_BREAKER_MONITORING_SECS` — rolling window (default 120)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let failure_threshold = std::env::var("ENSEMBLE_BREAKER_FAILURE_THRESHOLD")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.failure_threshold);
        let reset_timeout = std::env::var("ENSEMBLE_BREAKER_RESET_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.reset_timeout);
        let monitoring_period = std::env::var("ENSEMBLE_BREAKER_MONITORING_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.monitoring_period);
        Self {
            failure_threshold,
            reset_timeout,
            monitoring_period,
        }
    }
}

/// Point-in-time view of one breaker, for the status surface.
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub scope: BreakerScope,
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Fraction of successful outcomes in the rolling window, when any
    /// outcomes were recorded.
    pub success_rate: Option<f64>,
    /// Remaining OPEN time before a probe is admitted, when OPEN.
    pub until_half_open: Option<Duration>,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    next_half_open_at: Option<Instant>,
    probe_in_flight: bool,
    window: VecDeque<(Instant, bool)>,
}

/// A single circuit breaker.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    fallback: Option<Arc<dyn Fn() -> String + Send + Sync>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                next_half_open_at: None,
                probe_in_flight: false,
                window: VecDeque::new(),
            }),
            fallback: None,
        }
    }

    /// Attach a fallback invoked when admission is refused.
    pub fn with_fallback(mut self, fallback: Arc<dyn Fn() -> String + Send + Sync>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Attempt admission. `Ok(())` means the caller may proceed and must
    /// report the outcome via [`CircuitBreaker::record_success`] or
    /// [`CircuitBreaker::record_failure`].
    ///
    /// In HALF_OPEN only the first caller is admitted; concurrent callers
    /// are rejected until the probe reports its outcome.
    pub fn try_admit(&self) -> Result<(), Option<String>> {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let due = inner
                    .next_half_open_at
                    .map(|at| Instant::now() >= at)
                    .unwrap_or(false);
                if due {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(self.fallback.as_ref().map(|f| f()))
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(self.fallback.as_ref().map(|f| f()))
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.push_outcome(&mut inner, true);
        inner.consecutive_failures = 0;
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.next_half_open_at = None;
        }
        inner.probe_in_flight = false;
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        self.push_outcome(&mut inner, false);
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.next_half_open_at = Some(Instant::now() + self.config.reset_timeout);
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.next_half_open_at = Some(Instant::now() + self.config.reset_timeout);
            }
            CircuitState::Open => {}
        }
        inner.probe_in_flight = false;
    }

    /// Force the breaker back to CLOSED and clear all counters.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.next_half_open_at = None;
        inner.probe_in_flight = false;
        inner.window.clear();
    }

    /// Current state (window-pruned, transition-free view).
    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    fn push_outcome(&self, inner: &mut BreakerInner, success: bool) {
        let now = Instant::now();
        inner.window.push_back((now, success));
        // Prune entries older than the monitoring period.
        while let Some((at, _)) = inner.window.front() {
            if now.duration_since(*at) > self.config.monitoring_period {
                inner.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn snapshot(&self, scope: BreakerScope, name: &str) -> BreakerSnapshot {
        let inner = self.inner.lock().expect("breaker lock poisoned");
        let success_rate = if inner.window.is_empty() {
            None
        } else {
            let successes = inner.window.iter().filter(|(_, ok)| *ok).count();
            Some(successes as f64 / inner.window.len() as f64)
        };
        let until_half_open = match inner.state {
            CircuitState::Open => inner
                .next_half_open_at
                .map(|at| at.saturating_duration_since(Instant::now())),
            _ => None,
        };
        BreakerSnapshot {
            scope,
            name: name.to_string(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            success_rate,
            until_half_open,
        }
    }
}

/// Registry of breakers keyed by `(scope, name)`.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<(BreakerScope, String), Arc<CircuitBreaker>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    /// Fetch or lazily create the breaker for `(scope, name)`.
    pub fn breaker(&self, scope: BreakerScope, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry((scope, name.to_string()))
            .or_insert_with(|| Arc::new(CircuitBreaker::new(self.config.clone())))
            .clone()
    }

    /// Admission shorthand that converts a refusal into [`LlmError::CircuitOpen`].
    pub fn try_admit(&self, scope: BreakerScope, name: &str) -> Result<Arc<CircuitBreaker>, LlmError> {
        let breaker = self.breaker(scope, name);
        match breaker.try_admit() {
            Ok(()) => Ok(breaker),
            Err(_fallback) => Err(LlmError::CircuitOpen {
                breaker: format!("{}:{}", scope, name),
            }),
        }
    }

    /// Force a named breaker back to CLOSED. No-op if it does not exist.
    pub fn reset(&self, scope: BreakerScope, name: &str) {
        if let Some(breaker) = self.breakers.get(&(scope, name.to_string())) {
            breaker.reset();
        }
    }

    /// Snapshot every breaker, sorted by scope then name.
    pub fn list(&self) -> Vec<BreakerSnapshot> {
        let mut all: Vec<BreakerSnapshot> = self
            .breakers
            .iter()
            .map(|entry| {
                let (scope, name) = entry.key();
                entry.value().snapshot(*scope, name)
            })
            .collect();
        all.sort_by(|a, b| {
            format!("{}:{}", a.scope, a.name).cmp(&format!("{}:{}", b.scope, b.name))
        });
        all
    }

    /// Snapshot map keyed `"<scope>:<name>"` for the status event payload.
    pub fn state_map(&self) -> HashMap<String, String> {
        self.list()
            .into_iter()
            .map(|s| (format!("{}:{}", s.scope, s.name), s.state.to_string()))
            .collect()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
