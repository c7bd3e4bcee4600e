//! Anthropic Claude adapter speaking the native Messages API.
//!
//! Claude differs from the OpenAI-compatible wire in three ways the adapter
//! must absorb: the system prompt travels in a dedicated `system` field
//! rather than a leading message, tools are declared with an `input_schema`,
//! and both tool calls and tool results are content blocks inside ordinary
//! messages.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::ensemble::client_wrapper::{
    ChatMessage, MessageChunk, MessageChunkStream, ProviderClient, ProviderRequest,
    ProviderResponse, Role, TokenUsage, ToolCall, ToolSpec,
};
use crate::ensemble::clients::common::{
    chunks_to_stream, classify_status, collect_sse_chunks, transport_error,
};
use crate::ensemble::clients::http_pool::get_shared_client;
use crate::ensemble::error::LlmError;

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Adapter for Anthropic's Messages API.
pub struct ClaudeClient {
    http: reqwest::Client,
    base_url: String,
    secret_key: String,
}

impl ClaudeClient {
    /// Create a client from an API key against the official endpoint.
    pub fn new(secret_key: &str) -> Self {
        Self::new_with_base_url(secret_key, ANTHROPIC_BASE_URL)
    }

    /// Create a client pointing at a custom Claude-compatible base URL.
    pub fn new_with_base_url(secret_key: &str, base_url: &str) -> Self {
        ClaudeClient {
            http: get_shared_client(base_url, secret_key),
            base_url: base_url.trim_end_matches('/').to_string(),
            secret_key: secret_key.to_string(),
        }
    }

    fn build_body(&self, request: &ProviderRequest, stream: bool) -> Value {
        let mut body = json!({
            "model": request.api_name,
            "messages": wire_messages(&request.messages),
            "max_tokens": request.params.max_output_tokens,
            "temperature": request.params.temperature,
            "top_p": request.params.top_p,
        });
        // The repetition penalty has no Messages-API counterpart; Claude's
        // sampling surface simply does not expose one.
        if !request.system_prompt.is_empty() {
            body["system"] = Value::String(request.system_prompt.clone());
        }
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(request.tools.iter().map(wire_tool).collect());
        }
        if stream {
            body["stream"] = Value::Bool(true);
        }
        body
    }

    async fn post_messages(&self, body: &Value) -> Result<reqwest::Response, LlmError> {
        let url = format!("{}/messages", self.base_url);
        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.secret_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error("claude", &e))?;

        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(classify_status("claude", status.as_u16(), &text))
        }
    }
}

/// Fold normalized turns into Anthropic's user/assistant alternation.
///
/// Tool results become `tool_result` content blocks inside a user message,
/// referencing the originating `tool_use` id.
fn wire_messages(messages: &[ChatMessage]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(messages.len());
    for msg in messages {
        match msg.role {
            // A stray system turn in the body maps onto user content; the
            // real system prompt travels in the dedicated field.
            Role::System | Role::User => {
                out.push(json!({"role": "user", "content": msg.content}));
            }
            Role::Assistant => {
                out.push(json!({"role": "assistant", "content": msg.content}));
            }
            Role::Tool => {
                out.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": msg.tool_call_id.clone().unwrap_or_default(),
                        "content": msg.content,
                    }]
                }));
            }
        }
    }
    out
}

fn wire_tool(tool: &ToolSpec) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.parameters,
    })
}

/// Walk the response content blocks, separating text from `tool_use`.
fn parse_content(body: &Value) -> (String, Vec<ToolCall>) {
    let mut text = String::new();
    let mut calls = Vec::new();
    if let Some(blocks) = body.get("content").and_then(Value::as_array) {
        for block in blocks {
            match block.get("type").and_then(Value::as_str) {
                Some("text") => {
                    if let Some(piece) = block.get("text").and_then(Value::as_str) {
                        text.push_str(piece);
                    }
                }
                Some("tool_use") => {
                    let id = block
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let name = block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let arguments = block.get("input").cloned().unwrap_or(Value::Null);
                    calls.push(ToolCall {
                        id,
                        name,
                        arguments,
                    });
                }
                _ => {}
            }
        }
    }
    (text, calls)
}

fn parse_usage(body: &Value) -> Option<TokenUsage> {
    let usage = body.get("usage")?;
    let prompt = usage.get("input_tokens")?.as_u64()? as usize;
    let completion = usage.get("output_tokens")?.as_u64()? as usize;
    Some(TokenUsage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: prompt + completion,
    })
}

#[async_trait]
impl ProviderClient for ClaudeClient {
    fn provider_name(&self) -> &str {
        "claude"
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, LlmError> {
        let body = self.build_body(request, false);
        let response = self.post_messages(&body).await?;
        let parsed: Value = response
            .json()
            .await
            .map_err(|e| transport_error("claude", &e))?;

        let (content, tool_calls) = parse_content(&parsed);
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
        let response = self.post_messages(&body).await?;
        let chunks = collect_sse_chunks("claude", response, |payload| {
            let parsed: Value = serde_json::from_str(payload).ok()?;
            match parsed.get("type").and_then(Value::as_str) {
                Some("content_block_delta") => {
                    let content = parsed
                        .get("delta")
                        .and_then(|d| d.get("text"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    Some(MessageChunk {
                        content,
                        finish_reason: None,
                    })
                }
                Some("message_stop") => Some(MessageChunk {
                    content: String::new(),
                    finish_reason: Some("stop".into()),
                }),
                _ => None,
            }
        })
        .await;
        Ok(chunks_to_stream(chunks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::client_wrapper::SamplingParams;

    #[test]
    fn system_prompt_uses_dedicated_field() {
        let client = ClaudeClient::new("key");
        let request = ProviderRequest {
            api_name: "claude-sonnet-4-5".into(),
            messages: vec![ChatMessage::new(Role::User, "hi")],
            system_prompt: "be brief".into(),
            params: SamplingParams::default(),
            tools: vec![],
        };
        let body = client.build_body(&request, false);
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn tool_result_turn_becomes_content_block() {
        let turns = vec![ChatMessage::tool_result("toolu_1", "{\"sum\":4}")];
        let wire = wire_messages(&turns);
        assert_eq!(wire[0]["role"], "user");
        assert_eq!(wire[0]["content"][0]["type"], "tool_result");
        assert_eq!(wire[0]["content"][0]["tool_use_id"], "toolu_1");
    }

    #[test]
    fn tool_use_blocks_parse_to_normalized_calls() {
        let body = json!({
            "content": [
                {"type": "text", "text": "Let me compute that."},
                {"type": "tool_use", "id": "toolu_9", "name": "calculator",
                 "input": {"expression": "6*7"}}
            ],
            "usage": {"input_tokens": 12, "output_tokens": 7}
        });
        let (text, calls) = parse_content(&body);
        assert_eq!(text, "Let me compute that.");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments["expression"], "6*7");
        assert_eq!(parse_usage(&body).unwrap().total_tokens, 19);
    }
}
