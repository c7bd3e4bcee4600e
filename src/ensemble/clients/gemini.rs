//! Google Gemini adapter speaking the `generateContent` API.
//!
//! Gemini's wire format differs from the chat-completions family: turns live
//! in `contents` with roles `user`/`model`, the system prompt travels in
//! `systemInstruction`, tools are `functionDeclarations`, and the model's
//! tool calls come back as `functionCall` parts. Gemini assigns no call ids,
//! so the adapter synthesizes stable ids from the call's position.

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

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Adapter for Google's Gemini `generateContent` API.
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    secret_key: String,
}

impl GeminiClient {
    /// Create a client from an API key against the official endpoint.
    pub fn new(secret_key: &str) -> Self {
        Self::new_with_base_url(secret_key, GEMINI_BASE_URL)
    }

    /// Create a client pointing at a custom Gemini-compatible base URL.
    pub fn new_with_base_url(secret_key: &str, base_url: &str) -> Self {
        GeminiClient {
            http: get_shared_client(base_url, secret_key),
            base_url: base_url.trim_end_matches('/').to_string(),
            secret_key: secret_key.to_string(),
        }
    }

    fn build_body(&self, request: &ProviderRequest) -> Value {
        let mut body = json!({
            "contents": wire_contents(&request.messages),
            "generationConfig": {
                "temperature": request.params.temperature,
                "topP": request.params.top_p,
                "maxOutputTokens": request.params.max_output_tokens,
                "presencePenalty": penalty_to_wire(request.params.repetition_penalty),
            }
        });
        if !request.system_prompt.is_empty() {
            body["systemInstruction"] = json!({
                "parts": [{"text": request.system_prompt}]
            });
        }
        if !request.tools.is_empty() {
            body["tools"] = json!([{
                "functionDeclarations": request.tools.iter().map(wire_tool).collect::<Vec<_>>()
            }]);
        }
        body
    }

    async fn post(&self, method: &str, api_name: &str, body: &Value) -> Result<reqwest::Response, LlmError> {
        let sep = if method.contains('?') { '&' } else { '?' };
        let url = format!(
            "{}/models/{}:{}{}key={}",
            self.base_url, api_name, method, sep, self.secret_key
        );
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error("gemini", &e))?;

        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(classify_status("gemini", status.as_u16(), &text))
        }
    }
}

/// Fold normalized turns into Gemini `contents`.
fn wire_contents(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|msg| match msg.role {
            Role::System | Role::User => {
                json!({"role": "user", "parts": [{"text": msg.content}]})
            }
            Role::Assistant => json!({"role": "model", "parts": [{"text": msg.content}]}),
            Role::Tool => json!({
                "role": "user",
                "parts": [{
                    "functionResponse": {
                        // The id carries "<name>#<index>"; the name half goes back out.
                        "name": msg
                            .tool_call_id
                            .as_deref()
                            .and_then(|id| id.split('#').next())
                            .unwrap_or_default(),
                        "response": {"content": msg.content},
                    }
                }]
            }),
        })
        .collect()
}

fn wire_tool(tool: &ToolSpec) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "parameters": tool.parameters,
    })
}

/// Separate text parts from `functionCall` parts in the first candidate.
fn parse_candidate(body: &Value) -> (String, Vec<ToolCall>) {
    let mut text = String::new();
    let mut calls = Vec::new();
    let parts = body
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array);
    if let Some(parts) = parts {
        for (idx, part) in parts.iter().enumerate() {
            if let Some(piece) = part.get("text").and_then(Value::as_str) {
                text.push_str(piece);
            }
            if let Some(call) = part.get("functionCall") {
                let name = call
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                calls.push(ToolCall {
                    id: format!("{}#{}", name, idx),
                    name,
                    arguments: call.get("args").cloned().unwrap_or(Value::Null),
                });
            }
        }
    }
    (text, calls)
}

fn parse_usage(body: &Value) -> Option<TokenUsage> {
    let usage = body.get("usageMetadata")?;
    let prompt = usage.get("promptTokenCount")?.as_u64()? as usize;
    let completion = usage
        .get("candidatesTokenCount")
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize;
    Some(TokenUsage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: prompt + completion,
    })
}

#[async_trait]
impl ProviderClient for GeminiClient {
    fn provider_name(&self) -> &str {
        "gemini"
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, LlmError> {
        let body = self.build_body(request);
        let response = self.post("generateContent", &request.api_name, &body).await?;
        let parsed: Value = response
            .json()
            .await
            .map_err(|e| transport_error("gemini", &e))?;

        let (content, tool_calls) = parse_candidate(&parsed);
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
        let body = self.build_body(request);
        let response = self
            .post("streamGenerateContent?alt=sse", &request.api_name, &body)
            .await?;
        let chunks = collect_sse_chunks("gemini", response, |payload| {
            let parsed: Value = serde_json::from_str(payload).ok()?;
            let (content, _) = parse_candidate(&parsed);
            let finish_reason = parsed
                .get("candidates")
                .and_then(|c| c.get(0))
                .and_then(|c| c.get("finishReason"))
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
