//! Tool negotiation between agents and providers.
//!
//! The negotiator holds a static registry of tools — name, description,
//! JSON-schema parameters, and an execution handler — plus an allow-list
//! mapping agent archetypes to the tools they may see. It converts tool
//! declarations into each provider's native function-calling shape, parses
//! provider responses back into normalized calls, invokes registered
//! handlers, and formats the results as tool-role turns.
//!
//! The negotiator executes nothing beyond what a registered handler does;
//! unknown tool names fail with a validation error.
//!
//! # Built-in tools
//!
//! Two tools ship with the crate and can be registered via
//! [`ToolNegotiator::with_builtin_tools`]:
//!
//! - `calculator` — evaluates arithmetic expressions with `evalexpr`
//! - `scratchpad` — a TTL-aware key-value store for intermediate results

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::ensemble::client_wrapper::{ChatMessage, ProviderResponse, ToolCall, ToolSpec};
use crate::ensemble::error::LlmError;

/// Result future returned by async tool handlers.
pub type ToolFuture = Pin<Box<dyn Future<Output = Result<Value, LlmError>> + Send>>;

/// An executable tool handler.
pub type ToolHandler = Arc<dyn Fn(Value) -> ToolFuture + Send + Sync>;

struct RegisteredTool {
    spec: ToolSpec,
    handler: ToolHandler,
}

/// Static registry of tools plus per-archetype allow-lists.
pub struct ToolNegotiator {
    tools: HashMap<String, RegisteredTool>,
    /// Tool names permitted per agent archetype. Archetypes absent from the
    /// map see every registered tool.
    allow_lists: HashMap<String, Vec<String>>,
}

impl ToolNegotiator {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            allow_lists: HashMap::new(),
        }
    }

    /// Register a tool with its handler. Re-registering a name replaces the
    /// previous entry.
    pub fn register(&mut self, spec: ToolSpec, handler: ToolHandler) {
        self.tools.insert(spec.name.clone(), RegisteredTool { spec, handler });
    }

    /// Restrict an archetype to a named subset of tools.
    pub fn allow(&mut self, archetype: impl Into<String>, tools: Vec<impl Into<String>>) {
        self.allow_lists.insert(
            archetype.into(),
            tools.into_iter().map(Into::into).collect(),
        );
    }

    /// The tool list advertised to an agent of the given archetype.
    ///
    /// `None` (no archetype) and archetypes without an allow-list entry
    /// see all registered tools.
    pub fn advertise(&self, archetype: Option<&str>) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = match archetype.and_then(|a| self.allow_lists.get(a)) {
            Some(allowed) => allowed
                .iter()
                .filter_map(|name| self.tools.get(name))
                .map(|t| t.spec.clone())
                .collect(),
            None => self.tools.values().map(|t| t.spec.clone()).collect(),
        };
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Render tool specs in a provider's native declaration shape.
    ///
    /// The adapters each do this translation for live requests; this form
    /// exists for callers that need to inspect or log what a provider will
    /// be shown.
    pub fn to_provider_format(&self, tools: &[ToolSpec], provider: &str) -> Value {
        match provider {
            "claude" => Value::Array(
                tools
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.parameters,
                        })
                    })
                    .collect(),
            ),
            "gemini" => json!([{
                "functionDeclarations": tools
                    .iter()
                    .map(|t| json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }))
                    .collect::<Vec<_>>()
            }]),
            // OpenAI-compatible family.
            _ => Value::Array(
                tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            ),
        }
    }

    /// Extract the tool calls from a provider response, or `None` when the
    /// model answered with plain text. The adapters have already
    /// translated each provider's native shape into [`ToolCall`]s.
    pub fn parse_tool_calls(&self, response: &ProviderResponse) -> Option<Vec<ToolCall>> {
        if response.tool_calls.is_empty() {
            None
        } else {
            Some(response.tool_calls.clone())
        }
    }

    /// Execute a named tool with the given arguments.
    ///
    /// Unknown names fail with [`LlmError::Validation`]; the registry is the
    /// only dispatch authority, regardless of what a model asked for.
    pub async fn invoke(&self, name: &str, arguments: Value) -> Result<Value, LlmError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| LlmError::Validation(format!("unknown tool '{}'", name)))?;
        (tool.handler)(arguments).await
    }

    /// Format a tool result as the tool-role turn answering `call`.
    pub fn format_result(&self, result: &Value, call: &ToolCall) -> ChatMessage {
        ChatMessage::tool_result(call.id.clone(), result.to_string())
    }

    /// Register the built-in `calculator` and `scratchpad` tools and a
    /// default allow-list that gives the `analysis` archetype the
    /// calculator only.
    pub fn with_builtin_tools(mut self) -> Self {
        self.register(
            ToolSpec {
                name: "calculator".into(),
                description: "Evaluate an arithmetic expression and return the numeric result"
                    .into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "expression": {
                            "type": "string",
                            "description": "Expression to evaluate, e.g. \"(2 + 3) * 4\""
                        }
                    },
                    "required": ["expression"]
                }),
            },
            Arc::new(|args| {
                Box::pin(async move {
                    let expression = args
                        .get("expression")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            LlmError::Validation("calculator: missing 'expression'".into())
                        })?;
                    match evalexpr::eval(expression) {
                        Ok(evalexpr::Value::Int(n)) => Ok(json!({"result": n})),
                        Ok(evalexpr::Value::Float(f)) => Ok(json!({"result": f})),
                        Ok(other) => Ok(json!({"result": other.to_string()})),
                        Err(e) => Err(LlmError::Validation(format!(
                            "calculator: {}",
                            e
                        ))),
                    }
                })
            }),
        );

        let pad = Scratchpad::shared(Duration::from_secs(600));
        self.register(
            ToolSpec {
                name: "scratchpad".into(),
                description: "Store and retrieve short notes across turns. \
                              Actions: set, get, delete."
                    .into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "action": {"type": "string", "enum": ["set", "get", "delete"]},
                        "key": {"type": "string"},
                        "value": {"type": "string"}
                    },
                    "required": ["action", "key"]
                }),
            },
            Arc::new(move |args| {
                let pad = pad.clone();
                Box::pin(async move { pad.handle(args) })
            }),
        );

        self.allow("analysis", vec!["calculator"]);
        self
    }
}

impl Default for ToolNegotiator {
    fn default() -> Self {
        Self::new()
    }
}

/// TTL-aware key-value store backing the `scratchpad` tool.
struct Scratchpad {
    ttl: Duration,
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl Scratchpad {
    fn shared(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        })
    }

    fn handle(&self, args: Value) -> Result<Value, LlmError> {
        let action = args
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| LlmError::Validation("scratchpad: missing 'action'".into()))?;
        let key = args
            .get("key")
            .and_then(Value::as_str)
            .ok_or_else(|| LlmError::Validation("scratchpad: missing 'key'".into()))?;

        let mut entries = self.entries.lock().expect("scratchpad lock poisoned");
        entries.retain(|_, (_, at)| at.elapsed() <= self.ttl);

        match action {
            "set" => {
                let value = args
                    .get("value")
                    .and_then(Value::as_str)
                    .ok_or_else(|| LlmError::Validation("scratchpad: missing 'value'".into()))?;
                entries.insert(key.to_string(), (value.to_string(), Instant::now()));
                Ok(json!({"stored": key}))
            }
            "get" => match entries.get(key) {
                Some((value, _)) => Ok(json!({"value": value})),
                None => Ok(json!({"value": Value::Null})),
            },
            "delete" => {
                entries.remove(key);
                Ok(json!({"deleted": key}))
            }
            other => Err(LlmError::Validation(format!(
                "scratchpad: unknown action '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn calculator_evaluates_expressions() {
        let negotiator = ToolNegotiator::new().with_builtin_tools();
        let result = negotiator
            .invoke("calculator", json!({"expression": "(2 + 3) * 4"}))
            .await
            .unwrap();
        assert_eq!(result["result"], 20);
    }

    #[tokio::test]
    async fn unknown_tool_is_a_validation_error() {
        let negotiator = ToolNegotiator::new();
        let err = negotiator.invoke("launch_rockets", json!({})).await;
        assert!(matches!(err, Err(LlmError::Validation(_))));
    }

    #[tokio::test]
    async fn scratchpad_round_trips_values() {
        let negotiator = ToolNegotiator::new().with_builtin_tools();
        negotiator
            .invoke("scratchpad", json!({"action": "set", "key": "k", "value": "v"}))
            .await
            .unwrap();
        let got = negotiator
            .invoke("scratchpad", json!({"action": "get", "key": "k"}))
            .await
            .unwrap();
        assert_eq!(got["value"], "v");
    }

    #[test]
    fn archetype_allow_list_filters_advertised_tools() {
        let negotiator = ToolNegotiator::new().with_builtin_tools();
        let analysis = negotiator.advertise(Some("analysis"));
        assert_eq!(analysis.len(), 1);
        assert_eq!(analysis[0].name, "calculator");
        // Unlisted archetypes and untyped agents see everything.
        assert_eq!(negotiator.advertise(Some("creativity")).len(), 2);
        assert_eq!(negotiator.advertise(None).len(), 2);
    }

    #[test]
    fn provider_formats_differ_by_wire() {
        let negotiator = ToolNegotiator::new().with_builtin_tools();
        let tools = negotiator.advertise(Some("analysis"));

        let openai = negotiator.to_provider_format(&tools, "openai");
        assert_eq!(openai[0]["type"], "function");

        let claude = negotiator.to_provider_format(&tools, "claude");
        assert!(claude[0]["input_schema"].is_object());

        let gemini = negotiator.to_provider_format(&tools, "gemini");
        assert!(gemini[0]["functionDeclarations"].is_array());
    }

    #[test]
    fn format_result_references_the_call_id() {
        let negotiator = ToolNegotiator::new();
        let call = ToolCall {
            id: "call_7".into(),
            name: "calculator".into(),
            arguments: json!({}),
        };
        let turn = negotiator.format_result(&json!({"result": 42}), &call);
        assert_eq!(turn.tool_call_id.as_deref(), Some("call_7"));
        assert!(turn.content.contains("42"));
    }
}
