//! The single call path for chat generation.
//!
//! Every agent call in every strategy funnels through
//! [`LlmService::generate`], which runs the resilience pipeline in a fixed
//! order:
//!
//! 1. resolve the model in the registry (`ModelNotSupported` on miss);
//! 2. pre-flight token estimate (⌈chars / 4⌉) against the context window;
//! 3. token-bucket admission for the provider (`RateLimited` on empty);
//! 4. cache lookup on the canonical fingerprint — hits return immediately;
//! 5. circuit-breaker admission for the model, then the adapter call under
//!    bounded retry (max 3 attempts, doubling backoff from 1s, retryable
//!    errors only);
//!    a tool-calling response runs the declared tools and re-invokes the
//!    adapter exactly once, accumulating usage across both calls;
//! 6. on circuit-open or a terminal failure with no response, walk the
//!    model's fallback chain and re-enter the pipeline — admission
//!    included — for each hop, bounded by the configured depth.
//!
//! The returned [`GenerationOutcome`] carries the content, accumulated
//! usage, any unexecuted tool calls, and the model that actually answered.

use std::sync::Arc;
use std::time::Duration;

use crate::ensemble::cache::ResponseCache;
use crate::ensemble::circuit_breaker::{BreakerScope, CircuitBreaker, CircuitBreakerRegistry};
use crate::ensemble::client_wrapper::{
    ChatMessage, ProviderClient, ProviderRequest, ProviderResponse, Role, SamplingParams,
    TokenUsage, ToolCall, ToolSpec,
};
use crate::ensemble::clients::make_client;
use crate::ensemble::config::EnsembleConfig;
use crate::ensemble::credentials::{CredentialProvider, EnvCredentialProvider};
use crate::ensemble::error::LlmError;
use crate::ensemble::event::{EnsembleEvent, EventHandler, NoopHandler};
use crate::ensemble::model_registry::ModelRegistry;
use crate::ensemble::rate_limit::RateLimiterRegistry;
use crate::ensemble::tool_negotiator::ToolNegotiator;

/// Retry schedule for retryable adapter failures.
const RETRY_BACKOFF: [Duration; 2] = [Duration::from_secs(1), Duration::from_secs(2)];
const MAX_ATTEMPTS: usize = 3;

/// Everything a caller needs for one generation.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Logical model id, resolved through the registry.
    pub model: String,
    /// Ordered chat turns, system prompt excluded.
    pub messages: Vec<ChatMessage>,
    /// System prompt for this call (may be empty).
    pub system_prompt: String,
    /// Sampling parameters.
    pub params: SamplingParams,
    /// Tools to advertise; tool calls are executed through the negotiator.
    pub tools: Vec<ToolSpec>,
    /// Optional credential reference forwarded to the credential provider.
    pub credential_ref: Option<String>,
}

/// The result of one generation, after retries, tools, and fallbacks.
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub content: String,
    pub usage: TokenUsage,
    /// Tool calls the model requested that were *not* executed (no handler
    /// registered). Executed calls are absorbed into the final content.
    pub tool_calls: Vec<ToolCall>,
    /// The model that actually produced the answer (differs from the
    /// requested model after a fallback).
    pub model_actually_used: String,
}

/// Builds provider clients. The default implementation dispatches to the
/// real adapters; tests install factories that return mocks.
pub trait ClientFactory: Send + Sync {
    fn client(
        &self,
        provider: &str,
        credential: &str,
    ) -> Result<Arc<dyn ProviderClient>, LlmError>;
}

struct DefaultClientFactory;

impl ClientFactory for DefaultClientFactory {
    fn client(
        &self,
        provider: &str,
        credential: &str,
    ) -> Result<Arc<dyn ProviderClient>, LlmError> {
        make_client(provider, credential)
    }
}

/// The resilience pipeline around provider adapters.
pub struct LlmService {
    registry: Arc<ModelRegistry>,
    rate_limiter: RateLimiterRegistry,
    breakers: Arc<CircuitBreakerRegistry>,
    cache: Arc<ResponseCache>,
    negotiator: Arc<ToolNegotiator>,
    credentials: Arc<dyn CredentialProvider>,
    factory: Arc<dyn ClientFactory>,
    events: Arc<dyn EventHandler>,
    max_fallback_depth: usize,
}

impl LlmService {
    /// Build a service with the default catalog, env credentials, real
    /// adapters, and configuration from [`EnsembleConfig::default`].
    pub fn new() -> Self {
        Self::with_config(EnsembleConfig::default())
    }

    /// Build a service from an explicit configuration.
    pub fn with_config(config: EnsembleConfig) -> Self {
        Self::assemble(
            Arc::new(ModelRegistry::default_catalog()),
            config,
            Arc::new(EnvCredentialProvider),
            Arc::new(DefaultClientFactory),
        )
    }

    /// Full dependency-injection constructor.
    pub fn assemble(
        registry: Arc<ModelRegistry>,
        config: EnsembleConfig,
        credentials: Arc<dyn CredentialProvider>,
        factory: Arc<dyn ClientFactory>,
    ) -> Self {
        Self {
            registry,
            rate_limiter: RateLimiterRegistry::new(config.rate_limit),
            breakers: Arc::new(CircuitBreakerRegistry::new(config.breaker)),
            cache: Arc::new(ResponseCache::new(config.cache)),
            negotiator: Arc::new(ToolNegotiator::new().with_builtin_tools()),
            credentials,
            factory,
            events: Arc::new(NoopHandler),
            max_fallback_depth: config.max_fallback_depth,
        }
    }

    /// Replace the tool negotiator (builder pattern).
    pub fn with_negotiator(mut self, negotiator: Arc<ToolNegotiator>) -> Self {
        self.negotiator = negotiator;
        self
    }

    /// Attach an event handler (builder pattern).
    pub fn with_event_handler(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = events;
        self
    }

    /// The breaker registry, for status surfaces and manual resets.
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// The model registry backing this service.
    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// The tool negotiator, for advertising tools to agents.
    pub fn negotiator(&self) -> &Arc<ToolNegotiator> {
        &self.negotiator
    }

    /// Start the cache's background sweep task.
    pub fn spawn_cache_sweeper(&self) -> tokio::task::JoinHandle<()> {
        ResponseCache::spawn_sweeper(self.cache.clone())
    }

    /// Run the full pipeline for one generation.
    pub async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationOutcome, LlmError> {
        let mut last_error = None;
        let mut model = request.model.clone();

        // Hop 0 is the requested model; later hops walk the fallback chain
        // declared for the *original* model.
        let chain = self.registry.fallback_chain(&request.model);
        for hop in 0..=self.max_fallback_depth.min(chain.len()) {
            if hop > 0 {
                let next = &chain[hop - 1];
                log::info!("model fallback: {} -> {}", model, next);
                self.events
                    .on_event(&EnsembleEvent::ModelFallback {
                        from_model: model.clone(),
                        to_model: next.clone(),
                    })
                    .await;
                model = next.clone();
            }

            match self.generate_with_model(&model, request).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    // Rate limits are not absorbed by fallback: the caller
                    // must wait regardless of model.
                    if matches!(err, LlmError::RateLimited { .. }) {
                        return Err(err);
                    }
                    log::warn!("generation via {} failed: {}", model, err);
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| LlmError::Validation("empty fallback chain".into())))
    }

    /// One pipeline pass for a concrete model, admission included.
    async fn generate_with_model(
        &self,
        model: &str,
        request: &GenerationRequest,
    ) -> Result<GenerationOutcome, LlmError> {
        let config = self.registry.resolve(model)?;

        // Pre-flight size check: one token per four characters.
        let total_chars: usize = request.system_prompt.len()
            + request
                .messages
                .iter()
                .map(|m| m.content.len())
                .sum::<usize>();
        let estimated_tokens = total_chars.div_ceil(4);
        if estimated_tokens > config.context_window_tokens {
            return Err(LlmError::ContextWindowExceeded {
                estimated_tokens,
                limit_tokens: config.context_window_tokens,
            });
        }

        // Admission happens on every hop, fallbacks included.
        self.rate_limiter.try_acquire(&config.provider)?;

        let fingerprint =
            ResponseCache::fingerprint(model, &request.messages, &request.params);
        if let Some(cached) = self.cache.get(&fingerprint) {
            log::debug!("cache hit for model {}", model);
            return Ok(GenerationOutcome {
                content: cached.content,
                usage: cached.usage.unwrap_or_default(),
                tool_calls: cached.tool_calls,
                model_actually_used: model.to_string(),
            });
        }

        let credential = self
            .credentials
            .resolve(&config.provider, request.credential_ref.as_deref())?;
        let client = self.factory.client(&config.provider, &credential)?;

        let breaker = self.breakers.try_admit(BreakerScope::Model, model)?;

        let mut provider_request = ProviderRequest {
            api_name: config.api_name.clone(),
            messages: request.messages.clone(),
            system_prompt: request.system_prompt.clone(),
            params: request.params.clone(),
            tools: request.tools.clone(),
        };

        let first = match self.call_with_retry(&*client, &provider_request).await {
            Ok(response) => {
                breaker.record_success();
                response
            }
            Err(err) => {
                breaker.record_failure();
                return Err(err);
            }
        };

        let mut usage = first.usage.unwrap_or_default();
        let outcome = if first.tool_calls.is_empty() {
            GenerationOutcome {
                content: first.content,
                usage,
                tool_calls: vec![],
                model_actually_used: model.to_string(),
            }
        } else {
            // Execute the requested tools and re-invoke exactly once.
            let (follow_up, unexecuted) = self
                .run_tool_round(&mut provider_request, first, &breaker, &*client)
                .await?;
            usage.add(&follow_up.usage.unwrap_or_default());
            GenerationOutcome {
                content: follow_up.content,
                usage,
                tool_calls: unexecuted,
                model_actually_used: model.to_string(),
            }
        };

        self.cache.put(
            fingerprint,
            model,
            ProviderResponse {
                content: outcome.content.clone(),
                usage: Some(outcome.usage),
                tool_calls: outcome.tool_calls.clone(),
            },
        );
        Ok(outcome)
    }

    /// Append the assistant's tool calls and their results to the message
    /// list, then re-invoke the adapter once. Calls without a registered
    /// handler are returned to the caller unexecuted.
    async fn run_tool_round(
        &self,
        provider_request: &mut ProviderRequest,
        first: ProviderResponse,
        breaker: &CircuitBreaker,
        client: &dyn ProviderClient,
    ) -> Result<(ProviderResponse, Vec<ToolCall>), LlmError> {
        let assistant_content = if first.content.is_empty() {
            String::from("(requested tool calls)")
        } else {
            first.content.clone()
        };
        provider_request
            .messages
            .push(ChatMessage::new(Role::Assistant, assistant_content));

        let mut unexecuted = Vec::new();
        for call in &first.tool_calls {
            match self.negotiator.invoke(&call.name, call.arguments.clone()).await {
                Ok(result) => {
                    provider_request
                        .messages
                        .push(self.negotiator.format_result(&result, call));
                }
                Err(LlmError::Validation(msg)) => {
                    log::warn!("tool '{}' not executed: {}", call.name, msg);
                    unexecuted.push(call.clone());
                    provider_request.messages.push(ChatMessage::tool_result(
                        call.id.clone(),
                        format!("{{\"error\":\"{}\"}}", msg),
                    ));
                }
                Err(other) => return Err(other),
            }
        }

        // Tools are answered; do not re-advertise them for the follow-up.
        provider_request.tools.clear();

        match self.call_with_retry(client, provider_request).await {
            Ok(response) => {
                breaker.record_success();
                Ok((response, unexecuted))
            }
            Err(err) => {
                breaker.record_failure();
                Err(err)
            }
        }
    }

    /// Bounded retry: up to three attempts with 1s/2s backoff between
    /// them, for retryable errors only. Terminal errors propagate at once.
    async fn call_with_retry(
        &self,
        client: &dyn ProviderClient,
        request: &ProviderRequest,
    ) -> Result<ProviderResponse, LlmError> {
        let mut last_error = None;
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(RETRY_BACKOFF[attempt - 1]).await;
            }
            match client.complete(request).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() => {
                    log::warn!(
                        "attempt {}/{} against {} failed: {}",
                        attempt + 1,
                        MAX_ATTEMPTS,
                        client.provider_name(),
                        err
                    );
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_error.expect("retry loop ran at least once"))
    }
}

impl Default for LlmService {
    fn default() -> Self {
        Self::new()
    }
}
