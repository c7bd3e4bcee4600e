//! Integration tests for the single call path: breaker behavior, model
//! fallback, bounded retry, caching, and pre-flight checks, all against
//! mock provider clients injected through the client-factory seam.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ensemble::client_wrapper::{
    ChatMessage, MessageChunkStream, ProviderClient, ProviderRequest, ProviderResponse, Role,
    SamplingParams, TokenUsage,
};
use ensemble::cache::CacheConfig;
use ensemble::circuit_breaker::CircuitBreakerConfig;
use ensemble::credentials::StaticCredentialProvider;
use ensemble::rate_limit::RateLimitConfig;
use ensemble::error::LlmError;
use ensemble::event::{EnsembleEvent, EventHandler};
use ensemble::llm_service::{ClientFactory, GenerationRequest, LlmService};
use ensemble::model_registry::ModelRegistry;
use ensemble::EnsembleConfig;

/// Echoes the last user message; counts upstream calls.
struct EchoClient {
    provider: String,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ProviderClient for EchoClient {
    fn provider_name(&self) -> &str {
        &self.provider
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let content = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(ProviderResponse {
            content,
            usage: Some(TokenUsage {
                prompt_tokens: 2,
                completion_tokens: 2,
                total_tokens: 4,
            }),
            tool_calls: vec![],
        })
    }

    async fn complete_streaming(
        &self,
        _request: &ProviderRequest,
    ) -> Result<MessageChunkStream, LlmError> {
        Ok(Box::pin(futures_util::stream::iter(Vec::new())))
    }
}

/// Always fails with the configured error; counts upstream calls.
struct FailingClient {
    provider: String,
    status: Option<u16>,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ProviderClient for FailingClient {
    fn provider_name(&self) -> &str {
        &self.provider
    }

    async fn complete(&self, _request: &ProviderRequest) -> Result<ProviderResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.status {
            Some(401) => Err(LlmError::Authentication {
                provider: self.provider.clone(),
            }),
            status => Err(LlmError::Provider {
                provider: self.provider.clone(),
                status,
                message: "mock failure".into(),
            }),
        }
    }

    async fn complete_streaming(
        &self,
        _request: &ProviderRequest,
    ) -> Result<MessageChunkStream, LlmError> {
        Ok(Box::pin(futures_util::stream::iter(Vec::new())))
    }
}

/// Fails the first `failures` calls with a 503, then echoes.
struct FlakyClient {
    provider: String,
    failures: usize,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ProviderClient for FlakyClient {
    fn provider_name(&self) -> &str {
        &self.provider
    }

    async fn complete(&self, _request: &ProviderRequest) -> Result<ProviderResponse, LlmError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            Err(LlmError::Provider {
                provider: self.provider.clone(),
                status: Some(503),
                message: "overloaded".into(),
            })
        } else {
            Ok(ProviderResponse {
                content: "recovered".into(),
                usage: None,
                tool_calls: vec![],
            })
        }
    }

    async fn complete_streaming(
        &self,
        _request: &ProviderRequest,
    ) -> Result<MessageChunkStream, LlmError> {
        Ok(Box::pin(futures_util::stream::iter(Vec::new())))
    }
}

/// Dispatches to a fixed client per provider tag.
struct MockFactory {
    clients: HashMap<String, Arc<dyn ProviderClient>>,
}

impl ClientFactory for MockFactory {
    fn client(
        &self,
        provider: &str,
        _credential: &str,
    ) -> Result<Arc<dyn ProviderClient>, LlmError> {
        self.clients
            .get(provider)
            .cloned()
            .ok_or_else(|| LlmError::Validation(format!("no mock for provider '{}'", provider)))
    }
}

/// Captures model-fallback events.
#[derive(Default)]
struct FallbackRecorder {
    fallbacks: std::sync::Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl EventHandler for FallbackRecorder {
    async fn on_event(&self, event: &EnsembleEvent) {
        if let EnsembleEvent::ModelFallback {
            from_model,
            to_model,
        } = event
        {
            self.fallbacks
                .lock()
                .unwrap()
                .push((from_model.clone(), to_model.clone()));
        }
    }
}

fn service_with(
    registry: ModelRegistry,
    config: EnsembleConfig,
    clients: Vec<(&str, Arc<dyn ProviderClient>)>,
) -> LlmService {
    let mut credentials = StaticCredentialProvider::new();
    let mut map = HashMap::new();
    for (provider, client) in clients {
        credentials = credentials.with_provider_key(provider, "mock-key");
        map.insert(provider.to_string(), client);
    }
    LlmService::assemble(
        Arc::new(registry),
        config,
        Arc::new(credentials),
        Arc::new(MockFactory { clients: map }),
    )
}

fn request(model: &str, message: &str) -> GenerationRequest {
    GenerationRequest {
        model: model.into(),
        messages: vec![ChatMessage::new(Role::User, message)],
        system_prompt: String::new(),
        params: SamplingParams::default(),
        tools: vec![],
        credential_ref: None,
    }
}

fn base_config() -> EnsembleConfig {
    EnsembleConfig {
        breaker: CircuitBreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_millis(50),
            monitoring_period: Duration::from_secs(60),
        },
        rate_limit: RateLimitConfig {
            capacity: 1_000.0,
            refill_per_second: 1_000.0,
        },
        cache: CacheConfig::default(),
        orchestration_deadline: Duration::from_secs(60),
        max_fallback_depth: 3,
    }
}

#[tokio::test(start_paused = true)]
async fn breaker_opens_after_threshold_and_admits_single_probe() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = ModelRegistry::builder()
        .register("flaky-model", "mockprov", "flaky-model", 8_192)
        .build()
        .unwrap();
    let service = service_with(
        registry,
        base_config(),
        vec![(
            "mockprov",
            Arc::new(FailingClient {
                provider: "mockprov".into(),
                status: Some(500),
                calls: calls.clone(),
            }) as Arc<dyn ProviderClient>,
        )],
    );

    // Three failed generations trip the breaker (each call retries the
    // retryable 500 three times upstream).
    for i in 0..3 {
        let err = service
            .generate(&request("flaky-model", &format!("msg {}", i)))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Provider { .. }));
    }
    let upstream_after_three = calls.load(Ordering::SeqCst);
    assert_eq!(upstream_after_three, 9);

    // The fourth call is rejected without touching the adapter.
    let err = service
        .generate(&request("flaky-model", "msg 3"))
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::CircuitOpen { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), upstream_after_three);

    // After the reset timeout the next call is admitted as a probe.
    std::thread::sleep(Duration::from_millis(60));
    let err = service
        .generate(&request("flaky-model", "msg 4"))
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::Provider { .. }));
    assert!(calls.load(Ordering::SeqCst) > upstream_after_three);
}

#[tokio::test]
async fn fallback_chain_switches_model_and_emits_event() {
    let failing_calls = Arc::new(AtomicUsize::new(0));
    let echo_calls = Arc::new(AtomicUsize::new(0));
    let registry = ModelRegistry::builder()
        .register("primary-model", "failprov", "primary-model", 8_192)
        .register("backup-model", "okprov", "backup-model", 8_192)
        .with_fallbacks("primary-model", vec!["backup-model"])
        .build()
        .unwrap();
    let recorder = Arc::new(FallbackRecorder::default());
    let service = service_with(
        registry,
        base_config(),
        vec![
            (
                "failprov",
                Arc::new(FailingClient {
                    provider: "failprov".into(),
                    status: Some(401),
                    calls: failing_calls.clone(),
                }) as Arc<dyn ProviderClient>,
            ),
            (
                "okprov",
                Arc::new(EchoClient {
                    provider: "okprov".into(),
                    calls: echo_calls.clone(),
                }) as Arc<dyn ProviderClient>,
            ),
        ],
    )
    .with_event_handler(recorder.clone());

    let outcome = service
        .generate(&request("primary-model", "hello fallback"))
        .await
        .unwrap();

    assert_eq!(outcome.model_actually_used, "backup-model");
    assert_eq!(outcome.content, "hello fallback");
    // Terminal auth failure: no retries against the primary.
    assert_eq!(failing_calls.load(Ordering::SeqCst), 1);
    assert_eq!(echo_calls.load(Ordering::SeqCst), 1);

    let fallbacks = recorder.fallbacks.lock().unwrap();
    assert_eq!(
        fallbacks.as_slice(),
        &[("primary-model".to_string(), "backup-model".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn retry_absorbs_transient_failures() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = ModelRegistry::builder()
        .register("flaky-model", "mockprov", "flaky-model", 8_192)
        .build()
        .unwrap();
    let service = service_with(
        registry,
        base_config(),
        vec![(
            "mockprov",
            Arc::new(FlakyClient {
                provider: "mockprov".into(),
                failures: 2,
                calls: calls.clone(),
            }) as Arc<dyn ProviderClient>,
        )],
    );

    let outcome = service.generate(&request("flaky-model", "hi")).await.unwrap();
    assert_eq!(outcome.content, "recovered");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn identical_requests_hit_the_cache() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = ModelRegistry::builder()
        .register("echo-model", "mockprov", "echo-model", 8_192)
        .build()
        .unwrap();
    let service = service_with(
        registry,
        base_config(),
        vec![(
            "mockprov",
            Arc::new(EchoClient {
                provider: "mockprov".into(),
                calls: calls.clone(),
            }) as Arc<dyn ProviderClient>,
        )],
    );

    let first = service.generate(&request("echo-model", "same")).await.unwrap();
    let second = service.generate(&request("echo-model", "same")).await.unwrap();
    assert_eq!(first.content, second.content);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // A different sampling parameter is a different fingerprint.
    let mut hotter = request("echo-model", "same");
    hotter.params.temperature = 0.9;
    service.generate(&hotter).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn oversized_prompt_fails_preflight() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = ModelRegistry::builder()
        .register("tiny-model", "mockprov", "tiny-model", 10)
        .build()
        .unwrap();
    let service = service_with(
        registry,
        base_config(),
        vec![(
            "mockprov",
            Arc::new(EchoClient {
                provider: "mockprov".into(),
                calls: calls.clone(),
            }) as Arc<dyn ProviderClient>,
        )],
    );

    let err = service
        .generate(&request("tiny-model", &"x".repeat(100)))
        .await
        .unwrap_err();
    match err {
        LlmError::ContextWindowExceeded {
            estimated_tokens,
            limit_tokens,
        } => {
            assert_eq!(estimated_tokens, 25);
            assert_eq!(limit_tokens, 10);
        }
        other => panic!("expected ContextWindowExceeded, got {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn empty_bucket_reports_rate_limited() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = ModelRegistry::builder()
        .register("echo-model", "mockprov", "echo-model", 8_192)
        .build()
        .unwrap();
    let mut config = base_config();
    config.rate_limit = RateLimitConfig {
        capacity: 1.0,
        refill_per_second: 0.5,
    };
    let service = service_with(
        registry,
        config,
        vec![(
            "mockprov",
            Arc::new(EchoClient {
                provider: "mockprov".into(),
                calls: calls.clone(),
            }) as Arc<dyn ProviderClient>,
        )],
    );

    service.generate(&request("echo-model", "one")).await.unwrap();
    let err = service
        .generate(&request("echo-model", "two"))
        .await
        .unwrap_err();
    match err {
        LlmError::RateLimited { retry_after, .. } => {
            assert!(retry_after > Duration::ZERO);
        }
        other => panic!("expected RateLimited, got {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_model_lists_the_catalog() {
    let registry = ModelRegistry::builder()
        .register("echo-model", "mockprov", "echo-model", 8_192)
        .build()
        .unwrap();
    let service = service_with(registry, base_config(), vec![]);

    let err = service.generate(&request("ghost", "hi")).await.unwrap_err();
    match err {
        LlmError::ModelNotSupported { known_models, .. } => {
            assert_eq!(known_models, vec!["echo-model".to_string()]);
        }
        other => panic!("expected ModelNotSupported, got {:?}", other),
    }
}
