//! Provider-specific [`ProviderClient`](crate::ensemble::client_wrapper::ProviderClient)
//! implementations.
//!
//! Each submodule offers a concrete adapter that speaks a particular
//! vendor's API while conforming to the uniform contract. [`make_client`]
//! is the dispatch point that maps a provider tag and credential to the
//! right adapter.

pub mod common;
pub mod http_pool;

pub mod claude;
pub mod gemini;
pub mod grok;
pub mod openai;

use std::sync::Arc;

use crate::ensemble::client_wrapper::ProviderClient;
use crate::ensemble::error::LlmError;

/// Provider tags recognized by [`make_client`].
pub const KNOWN_PROVIDERS: [&str; 4] = ["openai", "claude", "gemini", "grok"];

/// Build the adapter for a provider tag with the supplied credential.
///
/// Unknown tags fail with a validation error rather than guessing a
/// compatible transport.
pub fn make_client(provider: &str, credential: &str) -> Result<Arc<dyn ProviderClient>, LlmError> {
    match provider {
        "openai" => Ok(Arc::new(openai::OpenAIClient::new(credential))),
        "claude" => Ok(Arc::new(claude::ClaudeClient::new(credential))),
        "gemini" => Ok(Arc::new(gemini::GeminiClient::new(credential))),
        "grok" => Ok(Arc::new(grok::GrokClient::new(credential))),
        other => Err(LlmError::Validation(format!(
            "unknown provider '{}' (known: {})",
            other,
            KNOWN_PROVIDERS.join(", ")
        ))),
    }
}
