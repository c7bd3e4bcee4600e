//! Process-wide model registry and fallback chains.
//!
//! A registration maps a logical model id to its provider, provider-side
//! api name, and context window. Registrations are read-only after
//! construction; the orchestration layer shares the registry behind an
//! `Arc`. A separate table gives each model an ordered fallback chain of
//! other registered models to try when the primary is unavailable.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ensemble::error::LlmError;

/// One model registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Logical model id used everywhere inside the core.
    pub model: String,
    /// Provider tag (`openai`, `claude`, `gemini`, `grok`).
    pub provider: String,
    /// Identifier sent on the provider's wire.
    pub api_name: String,
    /// Context window in tokens, used by the pre-flight size check.
    pub context_window_tokens: usize,
}

/// Read-only table of model registrations plus fallback chains.
pub struct ModelRegistry {
    models: HashMap<String, ModelConfig>,
    fallbacks: HashMap<String, Vec<String>>,
}

/// Builder for [`ModelRegistry`]; consumed by [`ModelRegistryBuilder::build`].
#[derive(Default)]
pub struct ModelRegistryBuilder {
    models: Vec<ModelConfig>,
    fallbacks: HashMap<String, Vec<String>>,
}

impl ModelRegistryBuilder {
    /// Register a model.
    pub fn register(
        mut self,
        model: impl Into<String>,
        provider: impl Into<String>,
        api_name: impl Into<String>,
        context_window_tokens: usize,
    ) -> Self {
        self.models.push(ModelConfig {
            model: model.into(),
            provider: provider.into(),
            api_name: api_name.into(),
            context_window_tokens,
        });
        self
    }

    /// Declare the ordered fallback chain for a model.
    pub fn with_fallbacks(
        mut self,
        model: impl Into<String>,
        chain: Vec<impl Into<String>>,
    ) -> Self {
        self.fallbacks.insert(
            model.into(),
            chain.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// Finalize the registry.
    ///
    /// Fails with `Validation` if a fallback chain references a model that
    /// was never registered.
    pub fn build(self) -> Result<ModelRegistry, LlmError> {
        let models: HashMap<String, ModelConfig> = self
            .models
            .into_iter()
            .map(|m| (m.model.clone(), m))
            .collect();
        for (model, chain) in &self.fallbacks {
            for target in chain {
                if !models.contains_key(target) {
                    return Err(LlmError::Validation(format!(
                        "fallback chain for '{}' references unregistered model '{}'",
                        model, target
                    )));
                }
            }
        }
        Ok(ModelRegistry {
            models,
            fallbacks: self.fallbacks,
        })
    }
}

impl ModelRegistry {
    /// Start building a registry.
    pub fn builder() -> ModelRegistryBuilder {
        ModelRegistryBuilder::default()
    }

    /// Resolve a logical model id.
    pub fn resolve(&self, model: &str) -> Result<&ModelConfig, LlmError> {
        self.models.get(model).ok_or_else(|| {
            let mut known: Vec<String> = self.models.keys().cloned().collect();
            known.sort();
            LlmError::ModelNotSupported {
                model: model.to_string(),
                known_models: known,
            }
        })
    }

    /// The ordered fallback chain for a model (empty when none declared).
    pub fn fallback_chain(&self, model: &str) -> &[String] {
        self.fallbacks
            .get(model)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every registered logical model id, sorted.
    pub fn known_models(&self) -> Vec<String> {
        let mut known: Vec<String> = self.models.keys().cloned().collect();
        known.sort();
        known
    }

    /// The default catalog: current chat models of the four built-in
    /// providers with their published context windows, and conservative
    /// cross-provider fallback chains for the flagship tiers.
    pub fn default_catalog() -> ModelRegistry {
        ModelRegistry::builder()
            // OpenAI
            .register("gpt-4.1", "openai", "gpt-4.1", 1_047_576)
            .register("gpt-4.1-mini", "openai", "gpt-4.1-mini", 1_047_576)
            .register("gpt-4.1-nano", "openai", "gpt-4.1-nano", 1_047_576)
            .register("gpt-4o", "openai", "gpt-4o", 128_000)
            .register("gpt-4o-mini", "openai", "gpt-4o-mini", 128_000)
            .register("o3", "openai", "o3", 200_000)
            .register("o4-mini", "openai", "o4-mini", 200_000)
            // Anthropic
            .register("claude-opus-4-1", "claude", "claude-opus-4-1", 200_000)
            .register("claude-sonnet-4-5", "claude", "claude-sonnet-4-5", 200_000)
            .register("claude-haiku-4-5", "claude", "claude-haiku-4-5", 200_000)
            // Google
            .register("gemini-2.5-pro", "gemini", "gemini-2.5-pro", 1_048_576)
            .register("gemini-2.0-flash", "gemini", "gemini-2.0-flash", 1_048_576)
            // xAI
            .register("grok-3", "grok", "grok-3", 131_072)
            .register("grok-3-mini", "grok", "grok-3-mini", 131_072)
            .with_fallbacks("gpt-4.1", vec!["claude-sonnet-4-5", "gemini-2.5-pro"])
            .with_fallbacks("claude-sonnet-4-5", vec!["gpt-4.1", "gemini-2.5-pro"])
            .with_fallbacks("gemini-2.5-pro", vec!["gpt-4.1", "claude-sonnet-4-5"])
            .with_fallbacks("grok-3", vec!["gpt-4.1-mini", "gemini-2.0-flash"])
            .with_fallbacks("gpt-4o", vec!["gpt-4.1-mini"])
            .build()
            .expect("default catalog is internally consistent")
    }
}
