//! Observability events for the service and orchestration layers.
//!
//! Implement [`EventHandler`] to receive real-time notifications about
//! orchestration lifecycle, per-agent outcomes, and model fallbacks. The
//! single method has a default no-op implementation, so handlers only
//! match the events they care about. The handler is shared as
//! `Arc<dyn EventHandler>` across the service and every orchestration task.
//!
//! These events are internal observability; the structured envelopes the
//! gateway sends to clients live in [`gateway`](crate::ensemble::gateway).
//!
//! # Example
//!
//! ```rust
//! use ensemble::event::{EnsembleEvent, EventHandler};
//! use async_trait::async_trait;
//!
//! struct Logger;
//!
//! #[async_trait]
//! impl EventHandler for Logger {
//!     async fn on_event(&self, event: &EnsembleEvent) {
//!         if let EnsembleEvent::ModelFallback { from_model, to_model } = event {
//!             println!("fell back from {} to {}", from_model, to_model);
//!         }
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::ensemble::client_wrapper::TokenUsage;

/// Events emitted during orchestration and single-call execution.
#[derive(Debug, Clone)]
pub enum EnsembleEvent {
    /// An orchestration run has started.
    RunStarted {
        session_id: String,
        strategy: String,
        agent_count: usize,
    },

    /// An orchestration run has finished (successfully or not).
    RunCompleted {
        session_id: String,
        strategy: String,
    },

    /// An agent produced a successful response.
    AgentResponded {
        agent_id: String,
        agent_name: String,
        response_length: usize,
        usage: Option<TokenUsage>,
    },

    /// An agent's call failed. The orchestration continues; the failure is
    /// isolated to this agent's result entry.
    AgentFailed {
        agent_id: String,
        agent_name: String,
        error: String,
    },

    /// The single-call path switched to a fallback model.
    ModelFallback {
        from_model: String,
        to_model: String,
    },

    /// A consensus check completed for one iteration.
    ConsensusChecked {
        session_id: String,
        iteration: usize,
        reached: bool,
        point_count: usize,
    },
}

/// Trait for receiving [`EnsembleEvent`]s.
///
/// The default implementation is a no-op; the `Send + Sync` bound allows
/// the handler to be shared across tokio tasks via `Arc`.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called for every emitted event.
    async fn on_event(&self, _event: &EnsembleEvent) {}
}

/// A handler that drops every event. Used where a handler is required but
/// the embedder did not register one.
pub struct NoopHandler;

#[async_trait]
impl EventHandler for NoopHandler {}
