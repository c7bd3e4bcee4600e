//! xAI Grok adapter built on the OpenAI-compatible transport.
//!
//! Grok exposes an OpenAI-compatible surface, so this wrapper delegates all
//! HTTP concerns to [`OpenAIClient`] pointed at the x.ai endpoint. Swapping
//! from OpenAI to Grok only requires a different constructor; failures are
//! tagged with the `grok` provider name.

use async_trait::async_trait;

use crate::ensemble::client_wrapper::{
    MessageChunkStream, ProviderClient, ProviderRequest, ProviderResponse,
};
use crate::ensemble::clients::openai::OpenAIClient;
use crate::ensemble::error::LlmError;

const XAI_BASE_URL: &str = "https://api.x.ai/v1";

/// Adapter for xAI's Grok API routed through the OpenAI-compatible surface.
pub struct GrokClient {
    /// Delegated client that handles the HTTP interactions.
    delegate: OpenAIClient,
}

impl GrokClient {
    /// Create a client from an API key against the official x.ai endpoint.
    pub fn new(secret_key: &str) -> Self {
        Self::new_with_base_url(secret_key, XAI_BASE_URL)
    }

    /// Create a client pointing at a custom Grok-compatible base URL.
    pub fn new_with_base_url(secret_key: &str, base_url: &str) -> Self {
        GrokClient {
            delegate: OpenAIClient::new_for_provider(secret_key, base_url, "grok"),
        }
    }
}

#[async_trait]
impl ProviderClient for GrokClient {
    fn provider_name(&self) -> &str {
        "grok"
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, LlmError> {
        self.delegate.complete(request).await
    }

    async fn complete_streaming(
        &self,
        request: &ProviderRequest,
    ) -> Result<MessageChunkStream, LlmError> {
        self.delegate.complete_streaming(request).await
    }
}
