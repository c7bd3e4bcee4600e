//! Integration tests for the five coordination strategies, driven by mock
//! provider clients behind the service's client-factory seam.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ensemble::agent::Agent;
use ensemble::cache::CacheConfig;
use ensemble::circuit_breaker::CircuitBreakerConfig;
use ensemble::client_wrapper::{
    MessageChunkStream, ProviderClient, ProviderRequest, ProviderResponse, Role,
};
use ensemble::credentials::StaticCredentialProvider;
use ensemble::error::LlmError;
use ensemble::llm_service::{ClientFactory, LlmService};
use ensemble::memory::MemoryStore;
use ensemble::model_registry::ModelRegistry;
use ensemble::orchestrator::{OrchestrationConfig, Orchestrator, Strategy, StrategyOutcome};
use ensemble::rate_limit::RateLimitConfig;
use ensemble::EnsembleConfig;

/// What a mock provider does with the last user message.
#[derive(Clone)]
enum Behavior {
    /// Echo the message unchanged.
    Echo,
    /// Return a fixed canned response.
    Fixed(String),
    /// Uppercase the message.
    Upper,
    /// Reverse the message.
    Reverse,
    /// Prefix the message.
    Prefix(String),
    /// Fail with a terminal error.
    Fail,
    /// Echo after a delay.
    DelayedEcho(Duration),
    /// Join every user turn received, in order.
    Transcript,
}

struct MockClient {
    provider: String,
    behavior: Behavior,
}

#[async_trait]
impl ProviderClient for MockClient {
    fn provider_name(&self) -> &str {
        &self.provider
    }

    async fn complete(&self, request: &ProviderRequest) -> Result<ProviderResponse, LlmError> {
        let input = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let content = match &self.behavior {
            Behavior::Echo => input,
            Behavior::Fixed(text) => text.clone(),
            Behavior::Upper => input.to_uppercase(),
            Behavior::Reverse => input.chars().rev().collect(),
            Behavior::Prefix(prefix) => format!("{}{}", prefix, input),
            Behavior::Fail => {
                return Err(LlmError::Authentication {
                    provider: self.provider.clone(),
                })
            }
            Behavior::DelayedEcho(delay) => {
                tokio::time::sleep(*delay).await;
                input
            }
            Behavior::Transcript => request
                .messages
                .iter()
                .filter(|m| m.role == Role::User)
                .map(|m| m.content.clone())
                .collect::<Vec<_>>()
                .join(" | "),
        };
        Ok(ProviderResponse {
            content,
            usage: None,
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

/// Build an orchestrator whose providers behave as listed; each provider
/// gets one registered model named `<provider>-model`.
fn harness(providers: Vec<(&str, Behavior)>) -> (Orchestrator, Arc<MemoryStore>) {
    let mut builder = ModelRegistry::builder();
    let mut credentials = StaticCredentialProvider::new();
    let mut clients: HashMap<String, Arc<dyn ProviderClient>> = HashMap::new();
    for (provider, behavior) in providers {
        builder = builder.register(
            format!("{}-model", provider),
            provider,
            format!("{}-model", provider),
            100_000,
        );
        credentials = credentials.with_provider_key(provider, "mock-key");
        clients.insert(
            provider.to_string(),
            Arc::new(MockClient {
                provider: provider.to_string(),
                behavior,
            }),
        );
    }
    let config = EnsembleConfig {
        breaker: CircuitBreakerConfig {
            failure_threshold: 100,
            reset_timeout: Duration::from_secs(60),
            monitoring_period: Duration::from_secs(60),
        },
        rate_limit: RateLimitConfig {
            capacity: 10_000.0,
            refill_per_second: 10_000.0,
        },
        // Cached responses would mask per-call assertions here.
        cache: CacheConfig {
            enabled: false,
            ..Default::default()
        },
        orchestration_deadline: Duration::from_secs(300),
        max_fallback_depth: 0,
    };
    let service = Arc::new(LlmService::assemble(
        Arc::new(builder.build().unwrap()),
        config,
        Arc::new(credentials),
        Arc::new(MockFactory { clients }),
    ));
    let memory = Arc::new(MemoryStore::ephemeral());
    (Orchestrator::new(service, memory.clone()), memory)
}

fn agent(id: &str, provider: &str) -> Agent {
    Agent::new(id, id, provider, format!("{}-model", provider))
}

#[tokio::test]
async fn parallel_two_agents_echo() {
    let (orchestrator, _) = harness(vec![("echoprov", Behavior::Echo)]);
    let agents = vec![agent("A", "echoprov"), agent("B", "echoprov")];
    let config = OrchestrationConfig {
        strategy: Strategy::Parallel,
        ..Default::default()
    };

    let outcome = orchestrator
        .run("s1", &agents, "hi", &config, None)
        .await
        .unwrap();

    match outcome {
        StrategyOutcome::Parallel(results) => {
            assert_eq!(results.len(), 2);
            for result in &results {
                assert!(result.success);
                assert_eq!(result.response.as_deref(), Some("hi"));
            }
        }
        other => panic!("expected parallel outcome, got {:?}", other),
    }
}

#[tokio::test]
async fn pipeline_three_stages_compose() {
    let (orchestrator, _) = harness(vec![
        ("upperprov", Behavior::Upper),
        ("reverseprov", Behavior::Reverse),
        ("prefixprov", Behavior::Prefix("X:".into())),
    ]);
    let agents = vec![
        agent("Upper", "upperprov"),
        agent("Reverse", "reverseprov"),
        agent("Prefix", "prefixprov"),
    ];
    let config = OrchestrationConfig {
        strategy: Strategy::Pipeline,
        ..Default::default()
    };

    let outcome = orchestrator
        .run("s1", &agents, "abc", &config, None)
        .await
        .unwrap();

    match outcome {
        StrategyOutcome::Pipeline(pipeline) => {
            assert_eq!(pipeline.final_output, "X:CBA");
            assert_eq!(pipeline.stages.len(), 3);
            assert_eq!(pipeline.stages[0].output.as_deref(), Some("ABC"));
            assert_eq!(pipeline.stages[1].input, "ABC");
            assert_eq!(pipeline.stages[1].output.as_deref(), Some("CBA"));
            assert_eq!(pipeline.stages[2].output.as_deref(), Some("X:CBA"));
        }
        other => panic!("expected pipeline outcome, got {:?}", other),
    }
}

#[tokio::test]
async fn sequential_agents_see_prior_outputs_in_order() {
    let (orchestrator, _) = harness(vec![
        ("alphaprov", Behavior::Fixed("ALPHA-ANSWER".into())),
        ("betaprov", Behavior::Fixed("BETA-ANSWER".into())),
        ("scribeprov", Behavior::Transcript),
    ]);
    let agents = vec![
        agent("Alpha", "alphaprov"),
        agent("Beta", "betaprov"),
        agent("Scribe", "scribeprov"),
    ];
    let config = OrchestrationConfig {
        strategy: Strategy::Sequential,
        ..Default::default()
    };

    let outcome = orchestrator
        .run("s1", &agents, "question", &config, None)
        .await
        .unwrap();

    match outcome {
        StrategyOutcome::Sequential(results) => {
            assert_eq!(results.len(), 3);
            // The scribe sees the user turn plus every prior agent's
            // tagged answer, in order.
            let transcript = results[2].response.as_deref().unwrap();
            assert_eq!(
                transcript,
                "question | [Alpha]: ALPHA-ANSWER | [Beta]: BETA-ANSWER"
            );
        }
        other => panic!("expected sequential outcome, got {:?}", other),
    }
}

#[tokio::test]
async fn sequential_skips_failures_unless_break_on_error() {
    let (orchestrator, _) = harness(vec![
        ("failprov", Behavior::Fail),
        ("echoprov", Behavior::Echo),
    ]);
    let agents = vec![agent("Broken", "failprov"), agent("Echo", "echoprov")];

    let config = OrchestrationConfig {
        strategy: Strategy::Sequential,
        ..Default::default()
    };
    match orchestrator
        .run("s1", &agents, "hi", &config, None)
        .await
        .unwrap()
    {
        StrategyOutcome::Sequential(results) => {
            assert!(!results[0].success);
            assert!(results[1].success);
        }
        other => panic!("expected sequential outcome, got {:?}", other),
    }

    let config = OrchestrationConfig {
        strategy: Strategy::Sequential,
        break_on_error: true,
        ..Default::default()
    };
    match orchestrator
        .run("s2", &agents, "hi", &config, None)
        .await
        .unwrap()
    {
        StrategyOutcome::Sequential(results) => {
            assert_eq!(results.len(), 1);
            assert!(!results[0].success);
        }
        other => panic!("expected sequential outcome, got {:?}", other),
    }
}

#[tokio::test]
async fn parallel_isolates_agent_failures() {
    let (orchestrator, _) = harness(vec![
        ("echoprov", Behavior::Echo),
        ("failprov", Behavior::Fail),
    ]);
    let config = OrchestrationConfig {
        strategy: Strategy::Parallel,
        ..Default::default()
    };

    // Baseline run without the failing agent.
    let healthy = vec![agent("A", "echoprov"), agent("B", "echoprov")];
    let baseline = match orchestrator
        .run("s1", &healthy, "isolated", &config, None)
        .await
        .unwrap()
    {
        StrategyOutcome::Parallel(results) => results,
        other => panic!("expected parallel outcome, got {:?}", other),
    };

    // Same agents plus one that always fails.
    let mixed = vec![
        agent("A", "echoprov"),
        agent("B", "echoprov"),
        agent("Broken", "failprov"),
    ];
    let with_failure = match orchestrator
        .run("s2", &mixed, "isolated", &config, None)
        .await
        .unwrap()
    {
        StrategyOutcome::Parallel(results) => results,
        other => panic!("expected parallel outcome, got {:?}", other),
    };

    assert_eq!(with_failure.len(), 3);
    for baseline_result in &baseline {
        let same = with_failure
            .iter()
            .find(|r| r.agent_id == baseline_result.agent_id)
            .unwrap();
        assert!(same.success);
        assert_eq!(same.response, baseline_result.response);
    }
    let broken = with_failure.iter().find(|r| r.agent_id == "Broken").unwrap();
    assert!(!broken.success);
    assert!(broken.error.is_some());
}

#[tokio::test(start_paused = true)]
async fn competitive_first_success_wins() {
    let (orchestrator, _) = harness(vec![
        ("fastprov", Behavior::DelayedEcho(Duration::from_millis(10))),
        ("slowprov", Behavior::DelayedEcho(Duration::from_secs(5))),
    ]);
    let agents = vec![agent("Slow", "slowprov"), agent("Fast", "fastprov")];
    let config = OrchestrationConfig {
        strategy: Strategy::Competitive,
        competitive_timeout: Duration::from_secs(30),
        ..Default::default()
    };

    match orchestrator
        .run("s1", &agents, "race", &config, None)
        .await
        .unwrap()
    {
        StrategyOutcome::Competitive(winner) => {
            assert_eq!(winner.agent_id, "Fast");
            assert_eq!(winner.response.as_deref(), Some("race"));
        }
        other => panic!("expected competitive outcome, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn competitive_times_out_without_success() {
    let (orchestrator, _) = harness(vec![("failprov", Behavior::Fail)]);
    let agents = vec![agent("A", "failprov"), agent("B", "failprov")];
    let config = OrchestrationConfig {
        strategy: Strategy::Competitive,
        competitive_timeout: Duration::from_millis(200),
        ..Default::default()
    };

    let err = orchestrator
        .run("s1", &agents, "race", &config, None)
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::CompetitiveTimeout { .. }));
}

#[tokio::test]
async fn consensus_reached_records_shared_fact() {
    let canned = "Integration is key for this system. I would also add my own flavor.";
    let (orchestrator, memory) = harness(vec![
        ("aprov", Behavior::Fixed(canned.into())),
        ("bprov", Behavior::Fixed(canned.into())),
        ("cprov", Behavior::Fixed(canned.into())),
    ]);
    let agents = vec![
        agent("A", "aprov"),
        agent("B", "bprov"),
        agent("C", "cprov"),
    ];
    let config = OrchestrationConfig {
        strategy: Strategy::Consensus,
        consensus_threshold: 0.7,
        ..Default::default()
    };

    match orchestrator
        .run("s1", &agents, "Do we agree?", &config, None)
        .await
        .unwrap()
    {
        StrategyOutcome::Consensus { consensus, results } => {
            assert!(consensus.reached);
            assert_eq!(results.len(), 3);
            assert!(consensus
                .points
                .contains(&"integration is key for this system".to_string()));
            assert!(consensus.confidence > 0.0);
            assert_eq!(consensus.participants.len(), 3);
        }
        other => panic!("expected consensus outcome, got {:?}", other),
    }

    let recorded = memory.with_meta(|meta| {
        meta.facts
            .contains_key("integration is key for this system")
    });
    assert!(recorded);
}

#[tokio::test]
async fn consensus_requires_enough_successes() {
    let (orchestrator, _) = harness(vec![
        ("aprov", Behavior::Fixed("A long enough opinion sentence.".into())),
        ("failprov", Behavior::Fail),
    ]);
    let agents = vec![
        agent("A", "aprov"),
        agent("B", "failprov"),
        agent("C", "failprov"),
    ];
    let config = OrchestrationConfig {
        strategy: Strategy::Consensus,
        consensus_threshold: 0.7,
        ..Default::default()
    };

    let err = orchestrator
        .run("s1", &agents, "hi", &config, None)
        .await
        .unwrap_err();
    match err {
        LlmError::ConsensusNotReached {
            successes,
            required,
        } => {
            assert_eq!(successes, 1);
            assert_eq!(required, 3);
        }
        other => panic!("expected ConsensusNotReached, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn orchestration_deadline_cancels_children() {
    let (orchestrator, _) = harness(vec![(
        "slowprov",
        Behavior::DelayedEcho(Duration::from_secs(600)),
    )]);
    let agents = vec![agent("Slow", "slowprov")];
    let config = OrchestrationConfig {
        strategy: Strategy::Parallel,
        deadline: Duration::from_secs(1),
        ..Default::default()
    };

    let err = orchestrator
        .run("s1", &agents, "hi", &config, None)
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::OrchestrationTimeout { .. }));
}

#[tokio::test]
async fn empty_agent_list_is_a_validation_error() {
    let (orchestrator, _) = harness(vec![("echoprov", Behavior::Echo)]);
    let config = OrchestrationConfig::default();
    let err = orchestrator
        .run("s1", &[], "hi", &config, None)
        .await
        .unwrap_err();
    assert!(matches!(err, LlmError::Validation(_)));
}

#[tokio::test]
async fn progress_stream_delivers_each_agent_result() {
    let (orchestrator, _) = harness(vec![("echoprov", Behavior::Echo)]);
    let agents = vec![agent("A", "echoprov"), agent("B", "echoprov")];
    let config = OrchestrationConfig {
        strategy: Strategy::Parallel,
        ..Default::default()
    };

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    orchestrator
        .run("s1", &agents, "hi", &config, Some(tx))
        .await
        .unwrap();

    let mut streamed = Vec::new();
    while let Ok(result) = rx.try_recv() {
        streamed.push(result.agent_id);
    }
    streamed.sort();
    assert_eq!(streamed, vec!["A".to_string(), "B".to_string()]);
}
