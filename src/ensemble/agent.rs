//! Agent identity and model binding.
//!
//! An [`Agent`] is a participant in a session: identity (`id`, `name`), a
//! binding to a logical model, sampling parameters, an assembled system
//! prompt, and an optional credential reference. Agents are created when a
//! session starts and are immutable afterwards except for the per-turn
//! derived prompt, which the orchestrator rebuilds through the prompt
//! assembler.
//!
//! # Example
//!
//! ```rust
//! use ensemble::agent::Agent;
//!
//! let agent = Agent::new("analyst", "Technical Analyst", "openai", "gpt-4.1-mini")
//!     .with_archetype("analysis")
//!     .with_temperature(0.3);
//!
//! assert_eq!(agent.model, "gpt-4.1-mini");
//! ```

use serde::{Deserialize, Serialize};

use crate::ensemble::client_wrapper::SamplingParams;

/// A participant in an orchestrated session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Stable identifier referenced in orchestration results and events.
    pub id: String,
    /// Human-readable display name, used to tag shared-sequence turns.
    pub name: String,
    /// Provider tag the agent is bound to.
    pub provider: String,
    /// Logical model id resolved through the model registry.
    pub model: String,
    /// Assembled system prompt for the current turn (may be empty until the
    /// prompt assembler runs).
    #[serde(default)]
    pub system_prompt: String,
    /// Sampling parameters forwarded on every call.
    #[serde(default)]
    pub params: SamplingParams,
    /// Archetype used by the tool negotiator's allow-list
    /// (e.g. `"analysis"`, `"creativity"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archetype: Option<String>,
    /// Opaque credential reference resolved through the credential provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_ref: Option<String>,
}

impl Agent {
    /// Create an agent with the mandatory identity and binding.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            provider: provider.into(),
            model: model.into(),
            system_prompt: String::new(),
            params: SamplingParams::default(),
            archetype: None,
            credential_ref: None,
        }
    }

    /// Set the initial system prompt (builder pattern).
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Set the tool-negotiation archetype (builder pattern).
    pub fn with_archetype(mut self, archetype: impl Into<String>) -> Self {
        self.archetype = Some(archetype.into());
        self
    }

    /// Override the sampling temperature (builder pattern).
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.params.temperature = temperature;
        self
    }

    /// Replace all sampling parameters (builder pattern).
    pub fn with_params(mut self, params: SamplingParams) -> Self {
        self.params = params;
        self
    }

    /// Attach a credential reference (builder pattern).
    pub fn with_credential_ref(mut self, reference: impl Into<String>) -> Self {
        self.credential_ref = Some(reference.into());
        self
    }
}
