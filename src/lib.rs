//! # Ensemble
//!
//! Ensemble is a multi-provider LLM orchestration core: given a user message
//! and a set of participating agents — each bound to a chat-completion
//! provider and model — it produces coordinated responses under five
//! collaboration strategies while protecting upstream providers and
//! downstream clients from failures.
//!
//! The crate provides carefully layered abstractions for:
//!
//! * **Provider Adapters**: [`ProviderClient`] implementations for OpenAI,
//!   Anthropic Claude, Google Gemini, and xAI Grok, translating one
//!   normalized request shape to each vendor's wire format — tool-call
//!   shapes included
//! * **Resilience**: per-provider token buckets, per-model circuit
//!   breakers, bounded retry with exponential backoff, automatic
//!   model-fallback chains, and a fingerprint-keyed response cache, all
//!   composed into a single call path by [`LlmService`]
//! * **Three-Tier Memory**: per-agent [`ModelMemory`] (traits, preferences,
//!   Q-learning), per-session [`ConversationMemory`] (timeline, topics,
//!   avoided-topic set), and process-wide [`MetaMemory`] (user profile,
//!   shared facts, collaboration goals)
//! * **Orchestration**: [`Orchestrator`] executing parallel, sequential,
//!   pipeline, competitive, and consensus strategies with per-agent
//!   isolation
//! * **Live Sessions**: [`SessionGateway`], a WebSocket channel that
//!   accepts user turns and streams structured events back in order,
//!   reconnection included
//!
//! ## Getting Started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ensemble::{Agent, LlmService, Orchestrator};
//! use ensemble::memory::MemoryStore;
//! use ensemble::orchestrator::{OrchestrationConfig, Strategy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     ensemble::init_logger();
//!
//!     let service = Arc::new(LlmService::new());
//!     let memory = Arc::new(MemoryStore::ephemeral());
//!     let orchestrator = Orchestrator::new(service, memory);
//!
//!     let agents = vec![
//!         Agent::new("analyst", "Analyst", "openai", "gpt-4.1-mini"),
//!         Agent::new("critic", "Critic", "claude", "claude-sonnet-4-5"),
//!     ];
//!     let config = OrchestrationConfig {
//!         strategy: Strategy::Parallel,
//!         ..Default::default()
//!     };
//!
//!     let outcome = orchestrator
//!         .run("session-1", &agents, "Design a rate limiter.", &config, None)
//!         .await?;
//!     println!("{:?}", outcome);
//!     Ok(())
//! }
//! ```
//!
//! Continue exploring the modules re-exported from the crate root for
//! progressively richer interaction patterns.

use std::sync::Once;

static INIT_LOGGER: Once = Once::new();

/// Initialise the global [`env_logger`] subscriber exactly once.
///
/// The helper is intentionally lightweight so that applications embedding
/// Ensemble can opt in to simple `RUST_LOG` driven diagnostics without
/// having to choose a logging backend upfront.
///
/// ```rust
/// ensemble::init_logger();
/// log::info!("Logger is ready");
/// ```
pub fn init_logger() {
    INIT_LOGGER.call_once(|| {
        env_logger::init();
    });
}

// Import the top-level `ensemble` module.
pub mod ensemble;

// Re-exporting key items for easier external access.
pub use crate::ensemble::agent;
pub use crate::ensemble::agent::Agent;
pub use crate::ensemble::cache;
pub use crate::ensemble::circuit_breaker;
pub use crate::ensemble::client_wrapper;
pub use crate::ensemble::client_wrapper::{
    ChatMessage, MessageChunk, MessageChunkStream, ProviderClient, ProviderRequest,
    ProviderResponse, Role, SamplingParams, TokenUsage, ToolCall, ToolSpec,
};
pub use crate::ensemble::clients;
pub use crate::ensemble::config::EnsembleConfig;
pub use crate::ensemble::credentials;
pub use crate::ensemble::error;
pub use crate::ensemble::error::LlmError;
pub use crate::ensemble::event;
pub use crate::ensemble::event::{EnsembleEvent, EventHandler};
pub use crate::ensemble::gateway;
pub use crate::ensemble::gateway::SessionGateway;
pub use crate::ensemble::llm_service;
pub use crate::ensemble::llm_service::{
    ClientFactory, GenerationOutcome, GenerationRequest, LlmService,
};
pub use crate::ensemble::memory;
pub use crate::ensemble::memory::{ConversationMemory, MemoryStore, MetaMemory, ModelMemory};
pub use crate::ensemble::model_registry;
pub use crate::ensemble::model_registry::{ModelConfig, ModelRegistry};
pub use crate::ensemble::orchestrator;
pub use crate::ensemble::orchestrator::{
    AgentResult, OrchestrationConfig, Orchestrator, Strategy, StrategyOutcome,
};
pub use crate::ensemble::prompt;
pub use crate::ensemble::prompt::{PromptAssembler, Scenario};
pub use crate::ensemble::rate_limit;
pub use crate::ensemble::tool_negotiator;
pub use crate::ensemble::tool_negotiator::ToolNegotiator;
