//! Normalized chat types and the provider client contract.
//!
//! A [`ProviderClient`] is a wrapper around a specific cloud LLM service. It
//! provides a common interface to interact with the LLMs; it does not keep
//! track of conversations or sessions — the orchestrator owns those and uses
//! a `ProviderClient` purely for transport.
//!
//! Adapters receive a [`ProviderRequest`] (already normalized: api name,
//! message list, separate system prompt, sampling parameters, optional tool
//! list) and return a [`ProviderResponse`] with the assistant content, token
//! usage, and any tool calls the model requested, in provider-neutral form.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::ensemble::error::LlmError;

/// Represents the possible roles for a chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Set by the orchestrator to steer the model's responses.
    System,
    /// A message sent by a human user (or the previous pipeline stage).
    User,
    /// Content generated by a model in response to a user message.
    Assistant,
    /// The result of a tool invocation, referencing an earlier tool call.
    Tool,
}

/// A single normalized chat turn.
///
/// Invariants (enforced by the orchestrator, relied on by adapters):
/// at most one leading `System` message; `Assistant` turns are tagged with
/// the producing agent when several agents share one sequence; `Tool` turns
/// always reference a previously emitted tool-call id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The role associated with the message.
    pub role: Role,
    /// The actual content of the message.
    pub content: String,
    /// Producing agent name, when multiple agents share a sequence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    /// For `Tool` turns, the id of the tool call being answered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// Build a bare turn with no agent tag or tool-call reference.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            agent_name: None,
            tool_call_id: None,
        }
    }

    /// Build an assistant turn attributed to a named agent.
    pub fn from_agent(agent_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            agent_name: Some(agent_name.into()),
            tool_call_id: None,
        }
    }

    /// Build a tool-result turn answering the given tool-call id.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            agent_name: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// Sampling parameters forwarded to the provider.
///
/// `repetition_penalty` uses the normalized convention where `1.0` means
/// "no penalty"; each adapter translates it to its provider's scale
/// (`1.0 → 0`, otherwise `penalty − 1`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f64,
    pub top_p: f64,
    pub max_output_tokens: u32,
    pub repetition_penalty: f64,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 1.0,
            max_output_tokens: 1024,
            repetition_penalty: 1.0,
        }
    }
}

/// A tool made available to the model for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON-schema object describing the tool's parameters.
    pub parameters: serde_json::Value,
}

/// A tool invocation requested by the model, in provider-neutral form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id, echoed back in the tool-result turn.
    pub id: String,
    /// Name of the requested tool.
    pub name: String,
    /// Structured arguments (already parsed from the provider's encoding).
    pub arguments: serde_json::Value,
}

/// Token accounting for one or more provider round-trips.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl TokenUsage {
    /// Accumulate another round-trip's usage into this one.
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// A fully normalized request handed to a provider adapter.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    /// The provider-side model identifier (the registry's `api_name`).
    pub api_name: String,
    /// Ordered chat turns, without the system prompt.
    pub messages: Vec<ChatMessage>,
    /// System prompt; may be empty. The adapter places it in the provider's
    /// correct slot (inline system role vs. dedicated field).
    pub system_prompt: String,
    /// Sampling parameters in the normalized convention.
    pub params: SamplingParams,
    /// Tools advertised for this request, if any.
    pub tools: Vec<ToolSpec>,
}

/// A normalized provider response.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    /// Assistant text. Empty when the model answered purely with tool calls.
    pub content: String,
    /// Token usage for this round-trip, if the provider reported it.
    pub usage: Option<TokenUsage>,
    /// Tool calls requested by the model, in normalized form.
    pub tool_calls: Vec<ToolCall>,
}

/// One text delta from a streaming response.
#[derive(Debug, Clone)]
pub struct MessageChunk {
    /// The incremental content for this chunk (may be empty).
    pub content: String,
    /// The provider's finish reason when this is the final chunk.
    pub finish_reason: Option<String>,
}

/// A finite, non-restartable stream of text deltas.
pub type MessageChunkStream = Pin<Box<dyn Stream<Item = Result<MessageChunk, LlmError>> + Send>>;

/// Trait defining the interface to interact with various LLM services.
///
/// Adapters are stateless beyond their credential and base URL; all
/// per-conversation state lives above this trait. Implementations classify
/// their failures into [`LlmError`] so the resilience layer can distinguish
/// retryable from terminal outcomes without provider-specific knowledge.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// The provider tag this client speaks for (e.g. `"openai"`).
    fn provider_name(&self) -> &str;

    /// Send a chat request and await the full response.
    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, LlmError>;

    /// Send a chat request and return a lazy stream of text deltas.
    ///
    /// The stream is finite and cannot be restarted. Implementations must
    /// abandon the in-flight read when the consumer drops the stream, so
    /// competitive cancellation can reclaim the connection.
    async fn complete_streaming(
        &self,
        request: &ProviderRequest,
    ) -> Result<MessageChunkStream, LlmError>;
}
