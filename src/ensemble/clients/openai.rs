//! OpenAI Chat Completions adapter.
//!
//! The `OpenAIClient` implements [`ProviderClient`] for OpenAI's Chat API,
//! capturing the assistant response, detailed token usage, and any native
//! tool calls in normalized form. It also serves as the transport for every
//! OpenAI-compatible endpoint (xAI Grok, self-hosted deployments) via
//! [`OpenAIClient::new_with_base_url`].
//!
//! # Example
//!
//! ```rust,no_run
//! use ensemble::clients::openai::OpenAIClient;
//! use ensemble::client_wrapper::{ChatMessage, ProviderClient, ProviderRequest, Role, SamplingParams};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = OpenAIClient::new(&std::env::var("OPEN_AI_SECRET")?);
//!     let request = ProviderRequest {
//!         api_name: "gpt-4.1-mini".into(),
//!         messages: vec![ChatMessage::new(Role::User, "Hello!")],
//!         system_prompt: "You are terse.".into(),
//!         params: SamplingParams::default(),
//!         tools: vec![],
//!     };
//!     let response = client.complete(&request).await?;
//!     println!("{}", response.content);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::ensemble::client_wrapper::{
    ChatMessage, MessageChunk, MessageChunkStream, ProviderClient, ProviderRequest,
    ProviderResponse, Role, TokenUsage, ToolCall, ToolSpec,
};
use crate::ensemble::clients::common::{
    chunks_to_stream, classify_status, collect_sse_chunks, penalty_to_wire, transport_error,
};
use crate::ensemble::clients::http_pool::get_shared_client;
use crate::ensemble::error::LlmError;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Adapter for OpenAI's Chat Completions API and compatible endpoints.
pub struct OpenAIClient {
    http: reqwest::Client,
    base_url: String,
    secret_key: String,
    provider: String,
}

impl OpenAIClient {
    /// Construct a client against the official OpenAI endpoint.
    pub fn new(secret_key: &str) -> Self {
        Self::new_with_base_url(secret_key, OPENAI_BASE_URL)
    }

    /// Construct a client targeting a custom OpenAI-compatible base URL.
    ///
    /// This is the constructor used by compatible providers (Grok,
    /// self-hosted gateways) that speak the same wire format.
    pub fn new_with_base_url(secret_key: &str, base_url: &str) -> Self {
        Self::new_for_provider(secret_key, base_url, "openai")
    }

    /// Construct a compatible-endpoint client that reports a different
    /// provider tag in its errors and events.
    pub fn new_for_provider(secret_key: &str, base_url: &str, provider: &str) -> Self {
        OpenAIClient {
            http: get_shared_client(base_url, secret_key),
            base_url: base_url.trim_end_matches('/').to_string(),
            secret_key: secret_key.to_string(),
            provider: provider.to_string(),
        }
    }

    fn build_body(&self, request: &ProviderRequest, stream: bool) -> Value {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if !request.system_prompt.is_empty() {
            messages.push(json!({"role": "system", "content": request.system_prompt}));
        }
        for msg in &request.messages {
            messages.push(wire_message(msg));
        }

        let mut body = json!({
            "model": request.api_name,
            "messages": messages,
            "temperature": request.params.temperature,
            "top_p": request.params.top_p,
            "max_tokens": request.params.max_output_tokens,
            "presence_penalty": penalty_to_wire(request.params.repetition_penalty),
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.iter().map(wire_tool).collect());
        }
        if stream {
            body["stream"] = Value::Bool(true);
        }
        body
    }

    async fn post_chat(&self, body: &Value) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.secret_key)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(&self.provider, &e))?;

        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(classify_status(&self.provider, status.as_u16(), &text))
        }
    }
}

/// Convert a normalized turn into the OpenAI message shape.
fn wire_message(msg: &ChatMessage) -> Value {
    match msg.role {
        Role::System => json!({"role": "system", "content": msg.content}),
        Role::User => json!({"role": "user", "content": msg.content}),
        Role::Assistant => json!({"role": "assistant", "content": msg.content}),
        Role::Tool => json!({
            "role": "tool",
            "content": msg.content,
            "tool_call_id": msg.tool_call_id.clone().unwrap_or_default(),
        }),
    }
}

/// Convert a normalized tool spec into OpenAI's function-calling shape.
fn wire_tool(tool: &ToolSpec) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

/// Pull normalized tool calls out of an OpenAI choice message, if any.
fn parse_tool_calls(message: &Value) -> Vec<ToolCall> {
    let Some(calls) = message.get("tool_calls").and_then(Value::as_array) else {
        return Vec::new();
    };
    calls
        .iter()
        .filter_map(|call| {
            let id = call.get("id")?.as_str()?.to_string();
            let function = call.get("function")?;
            let name = function.get("name")?.as_str()?.to_string();
            // Arguments arrive as a JSON-encoded string on this wire.
            let raw_args = function.get("arguments")?.as_str().unwrap_or("{}");
            let arguments = serde_json::from_str(raw_args).unwrap_or(Value::Null);
            Some(ToolCall {
                id,
                name,
                arguments,
            })
        })
        .collect()
}

fn parse_usage(body: &Value) -> Option<TokenUsage> {
    let usage = body.get("usage")?;
    Some(TokenUsage {
        prompt_tokens: usage.get("prompt_tokens")?.as_u64()? as usize,
        completion_tokens: usage.get("completion_tokens")?.as_u64()? as usize,
        total_tokens: usage.get("total_tokens")?.as_u64()? as usize,
    })
}

#[async_trait]
impl ProviderClient for OpenAIClient {
    fn provider_name(&self) -> &str {
        &self.provider
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, LlmError> {
        let body = self.build_body(request, false);
        let response = self.post_chat(&body).await?;
        let parsed: Value = response
            .json()
            .await
            .map_err(|e| transport_error(&self.provider, &e))?;

        let message = parsed
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .ok_or_else(|| LlmError::Provider {
                provider: self.provider.clone(),
                status: None,
                message: "response missing choices[0].message".into(),
            })?;

        let content = message
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let tool_calls = parse_tool_calls(message);

        Ok(ProviderResponse {
            content,
            usage: parse_usage(&parsed),
            tool_calls,
        })
    }

    async fn complete_streaming(
        &self,
        request: &ProviderRequest,
    ) -> Result<MessageChunkStream, LlmError> {
        let body = self.build_body(request, true);
        let response = self.post_chat(&body).await?;
        let chunks = collect_sse_chunks(&self.provider, response, |payload| {
            let parsed: Value = serde_json::from_str(payload).ok()?;
            let choice = parsed.get("choices")?.get(0)?;
            let content = choice
                .get("delta")
                .and_then(|d| d.get("content"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let finish_reason = choice
                .get("finish_reason")
                .and_then(Value::as_str)
                .map(str::to_string);
            Some(MessageChunk {
                content,
                finish_reason,
            })
        })
        .await;
        Ok(chunks_to_stream(chunks))
    }
}
