//! Multi-agent orchestration: five coordination strategies over a dynamic
//! agent set, with per-agent isolation and per-strategy termination.
//!
//! | Strategy | Pattern | Termination |
//! |----------|---------|-------------|
//! | `Parallel` | All agents answer at once | All agents finished |
//! | `Sequential` | Agents answer in order, seeing prior answers | Last agent (or `break_on_error`) |
//! | `Pipeline` | Each agent transforms the previous output | Last stage or first failure |
//! | `Competitive` | All agents race; first success wins | First success or timeout |
//! | `Consensus` | Parallel rounds + key-point frequency check | Consensus or max iterations |
//!
//! Per-agent failures never cancel a parallel or sequential orchestration;
//! they surface as `success: false` entries. Every agent call funnels
//! through the [`LlmService`] pipeline, so rate limits, breakers, caching,
//! and model fallback apply uniformly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::ensemble::agent::Agent;
use crate::ensemble::circuit_breaker::BreakerScope;
use crate::ensemble::client_wrapper::{ChatMessage, Role, TokenUsage, ToolCall};
use crate::ensemble::error::LlmError;
use crate::ensemble::event::{EnsembleEvent, EventHandler, NoopHandler};
use crate::ensemble::llm_service::{GenerationOutcome, GenerationRequest, LlmService};
use crate::ensemble::memory::MemoryStore;
use crate::ensemble::prompt::{
    CollectiveContext, IndividualContext, PromptAssembler, Scenario,
};

/// Agreement phrases that trigger the early-consensus check.
const AGREEMENT_PHRASES: [&str; 5] = ["agree", "consensus", "aligned", "same", "correct"];

/// The five coordination strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Parallel,
    Sequential,
    Pipeline,
    Competitive,
    Consensus,
}

impl Strategy {
    /// Parse a wire-supplied strategy name; unknown names are a
    /// validation failure.
    pub fn parse(name: &str) -> Result<Self, LlmError> {
        match name {
            "parallel" => Ok(Strategy::Parallel),
            "sequential" => Ok(Strategy::Sequential),
            "pipeline" => Ok(Strategy::Pipeline),
            "competitive" => Ok(Strategy::Competitive),
            "consensus" => Ok(Strategy::Consensus),
            other => Err(LlmError::Validation(format!(
                "unknown orchestration strategy '{}'",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Parallel => "parallel",
            Strategy::Sequential => "sequential",
            Strategy::Pipeline => "pipeline",
            Strategy::Competitive => "competitive",
            Strategy::Consensus => "consensus",
        }
    }
}

/// Per-run configuration.
#[derive(Debug, Clone)]
pub struct OrchestrationConfig {
    pub strategy: Strategy,
    /// Advertise negotiator tools to agents.
    pub enable_tools: bool,
    /// Sequential: stop at the first failed agent instead of skipping it.
    pub break_on_error: bool,
    /// Pipeline: keep feeding the last good output forward past a failed
    /// stage instead of stopping.
    pub continue_pipeline_on_error: bool,
    /// Consensus: fraction of agents that must answer successfully.
    pub consensus_threshold: f64,
    /// Consensus: maximum refinement iterations.
    pub max_consensus_iterations: usize,
    /// Competitive: deadline for the first success.
    pub competitive_timeout: Duration,
    /// Overall orchestration deadline.
    pub deadline: Duration,
    /// Scenario template injected into every assembled prompt this turn.
    pub scenario: Option<Scenario>,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::Parallel,
            enable_tools: false,
            break_on_error: false,
            continue_pipeline_on_error: false,
            consensus_threshold: 0.7,
            max_consensus_iterations: 5,
            competitive_timeout: Duration::from_secs(30),
            deadline: Duration::from_secs(300),
            scenario: None,
        }
    }
}

/// One agent's outcome within a strategy run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent_id: String,
    pub agent_name: String,
    pub success: bool,
    pub response: Option<String>,
    pub usage: Option<TokenUsage>,
    pub tool_calls: Vec<ToolCall>,
    pub error: Option<String>,
    pub response_time_ms: u64,
}

/// One pipeline stage record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStage {
    pub agent_id: String,
    pub agent_name: String,
    pub input: String,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Pipeline strategy result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutcome {
    pub stages: Vec<PipelineStage>,
    /// The last successful stage output (the user-visible answer).
    pub final_output: String,
}

/// Consensus strategy result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusOutcome {
    pub reached: bool,
    /// Normalized consensus points (super-majority key points).
    pub points: Vec<String>,
    /// `consensus points / all distinct points` for the deciding iteration.
    pub confidence: f64,
    /// Distinct non-consensus points, populated when consensus failed.
    pub divergent_points: Vec<String>,
    pub participants: Vec<String>,
    /// Fraction of responses containing an agreement phrase.
    pub agreement_level: f64,
    pub iterations: usize,
}

/// What a strategy run produced.
#[derive(Debug, Clone)]
pub enum StrategyOutcome {
    Parallel(Vec<AgentResult>),
    Sequential(Vec<AgentResult>),
    Pipeline(PipelineOutcome),
    /// The winning agent's result; losers were cancelled.
    Competitive(AgentResult),
    Consensus {
        results: Vec<AgentResult>,
        consensus: ConsensusOutcome,
    },
}

/// The orchestration engine.
///
/// Holds the service, the memory tiers, and the prompt assembler; each
/// [`Orchestrator::run`] call executes one user turn for one session.
pub struct Orchestrator {
    service: Arc<LlmService>,
    memory: Arc<MemoryStore>,
    assembler: Arc<std::sync::Mutex<PromptAssembler>>,
    events: Arc<dyn EventHandler>,
}

impl Orchestrator {
    pub fn new(service: Arc<LlmService>, memory: Arc<MemoryStore>) -> Self {
        Self {
            service,
            memory,
            assembler: Arc::new(std::sync::Mutex::new(PromptAssembler::new())),
            events: Arc::new(NoopHandler),
        }
    }

    /// Attach an event handler (builder pattern).
    pub fn with_event_handler(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = events;
        self
    }

    /// The prompt assembler, shared for template installation.
    pub fn assembler(&self) -> &Arc<std::sync::Mutex<PromptAssembler>> {
        &self.assembler
    }

    /// Execute one user turn under the configured strategy.
    ///
    /// `progress`, when supplied, receives every [`AgentResult`] as it
    /// completes, in completion order for parallel strategies and declared
    /// order for sequential ones. The overall deadline cancels all child
    /// calls and surfaces [`LlmError::OrchestrationTimeout`].
    pub async fn run(
        &self,
        session_id: &str,
        agents: &[Agent],
        user_message: &str,
        config: &OrchestrationConfig,
        progress: Option<mpsc::UnboundedSender<AgentResult>>,
    ) -> Result<StrategyOutcome, LlmError> {
        if agents.is_empty() {
            return Err(LlmError::Validation("no agents provided".into()));
        }

        self.events
            .on_event(&EnsembleEvent::RunStarted {
                session_id: session_id.to_string(),
                strategy: config.strategy.name().to_string(),
                agent_count: agents.len(),
            })
            .await;

        self.memory
            .with_conversation(session_id, |c| c.add_message("user", user_message));

        let run = async {
            match config.strategy {
                Strategy::Parallel => self
                    .run_parallel(session_id, agents, user_message, config, &progress)
                    .await
                    .map(StrategyOutcome::Parallel),
                Strategy::Sequential => self
                    .run_sequential(session_id, agents, user_message, config, &progress)
                    .await
                    .map(StrategyOutcome::Sequential),
                Strategy::Pipeline => self
                    .run_pipeline(session_id, agents, user_message, config, &progress)
                    .await
                    .map(StrategyOutcome::Pipeline),
                Strategy::Competitive => self
                    .run_competitive(session_id, agents, user_message, config, &progress)
                    .await
                    .map(StrategyOutcome::Competitive),
                Strategy::Consensus => {
                    self.run_consensus(session_id, agents, user_message, config, &progress)
                        .await
                }
            }
        };

        let outcome = match tokio::time::timeout(config.deadline, run).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::OrchestrationTimeout {
                timeout: config.deadline,
            }),
        };

        self.events
            .on_event(&EnsembleEvent::RunCompleted {
                session_id: session_id.to_string(),
                strategy: config.strategy.name().to_string(),
            })
            .await;
        outcome
    }

    /// Build the generation request for one agent: assembled prompt,
    /// advertised tools, and the agent's sampling parameters.
    fn build_request(
        &self,
        session_id: &str,
        agent: &Agent,
        messages: Vec<ChatMessage>,
        config: &OrchestrationConfig,
    ) -> GenerationRequest {
        let collective = self.collective_context(session_id);
        let individual = self.individual_context(agent);
        let system_prompt = {
            let mut assembler = self.assembler.lock().expect("assembler lock poisoned");
            assembler.assemble(&agent.id, config.scenario, &collective, &individual)
        };
        let tools = if config.enable_tools {
            self.service.negotiator().advertise(agent.archetype.as_deref())
        } else {
            Vec::new()
        };
        GenerationRequest {
            model: agent.model.clone(),
            messages,
            system_prompt,
            params: agent.params.clone(),
            tools,
            credential_ref: agent.credential_ref.clone(),
        }
    }

    fn collective_context(&self, session_id: &str) -> CollectiveContext {
        let (goals, knowledge, user_context) = self.memory.with_meta(|meta| {
            let goals: Vec<String> = meta
                .short_term_goals
                .iter()
                .chain(meta.long_term_goals.iter())
                .map(|g| format!("{} ({:.0}%)", g.text, g.progress))
                .collect();
            let facts: Vec<String> = meta.facts.keys().take(10).cloned().collect();
            let prefs: Vec<String> = meta
                .user_profile
                .preferences
                .iter()
                .map(|(k, v)| format!("{}: {}", k, v))
                .collect();
            (goals, facts, prefs)
        });
        let session = self.memory.with_conversation(session_id, |c| {
            let context = c.get_context(5);
            let mut lines: Vec<String> = context
                .window
                .iter()
                .map(|e| format!("[{}] {}", e.agent_id, e.text))
                .collect();
            if !context.avoided_topics.is_empty() {
                lines.push(format!(
                    "Avoid dwelling on: {}",
                    context.avoided_topics.join(", ")
                ));
            }
            lines.join("\n")
        });

        CollectiveContext {
            user_context: non_empty(user_context.join("; ")),
            current_goals: non_empty(goals.join("; ")),
            shared_knowledge: non_empty(knowledge.join("; ")),
            session_context: non_empty(session),
        }
    }

    fn individual_context(&self, agent: &Agent) -> IndividualContext {
        let (traits, preferences, emotions) = self.memory.with_model_memory(&agent.id, |m| {
            let traits: Vec<String> = m
                .traits
                .iter()
                .map(|(name, t)| format!("{}: {}", name, t.value))
                .collect();
            let prefs: Vec<String> = m
                .preferences
                .iter()
                .map(|(name, p)| format!("{} ({:.2})", name, p.strength))
                .collect();
            let emotions: Vec<String> = m
                .emotions
                .iter()
                .map(|(name, intensity)| format!("{} {:.2}", name, intensity))
                .collect();
            (traits, prefs, emotions)
        });
        IndividualContext {
            agent_name: Some(agent.name.clone()),
            role: agent.archetype.clone(),
            expertise: None,
            style: None,
            personality_traits: non_empty(traits.join(", ")),
            preferences: non_empty(preferences.join(", ")),
            emotional_state: non_empty(emotions.join(", ")),
            special_instructions: non_empty(agent.system_prompt.clone()),
        }
    }

    /// Run one agent call end to end, recording memory and events.
    async fn call_agent(
        &self,
        session_id: &str,
        agent: &Agent,
        messages: Vec<ChatMessage>,
        config: &OrchestrationConfig,
    ) -> AgentResult {
        let request = self.build_request(session_id, agent, messages, config);
        let started = Instant::now();
        match guarded_generate(&self.service, &agent.id, &request).await {
            Ok(outcome) => {
                self.memory
                    .with_conversation(session_id, |c| c.add_message(&agent.id, &outcome.content));
                self.events
                    .on_event(&EnsembleEvent::AgentResponded {
                        agent_id: agent.id.clone(),
                        agent_name: agent.name.clone(),
                        response_length: outcome.content.len(),
                        usage: Some(outcome.usage),
                    })
                    .await;
                AgentResult {
                    agent_id: agent.id.clone(),
                    agent_name: agent.name.clone(),
                    success: true,
                    response: Some(outcome.content),
                    usage: Some(outcome.usage),
                    tool_calls: outcome.tool_calls,
                    error: None,
                    response_time_ms: started.elapsed().as_millis() as u64,
                }
            }
            Err(err) => {
                self.events
                    .on_event(&EnsembleEvent::AgentFailed {
                        agent_id: agent.id.clone(),
                        agent_name: agent.name.clone(),
                        error: err.to_string(),
                    })
                    .await;
                AgentResult {
                    agent_id: agent.id.clone(),
                    agent_name: agent.name.clone(),
                    success: false,
                    response: None,
                    usage: None,
                    tool_calls: vec![],
                    error: Some(err.to_string()),
                    response_time_ms: started.elapsed().as_millis() as u64,
                }
            }
        }
    }

    /// Parallel: one concurrent call per agent; failures stay isolated.
    async fn run_parallel(
        &self,
        session_id: &str,
        agents: &[Agent],
        user_message: &str,
        config: &OrchestrationConfig,
        progress: &Option<mpsc::UnboundedSender<AgentResult>>,
    ) -> Result<Vec<AgentResult>, LlmError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<AgentResult>();
        let mut handles = Vec::with_capacity(agents.len());

        for agent in agents {
            let messages = vec![ChatMessage::new(Role::User, user_message)];
            let request = self.build_request(session_id, agent, messages, config);
            let service = self.service.clone();
            let agent = agent.clone();
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                let started = Instant::now();
                let result = match guarded_generate(&service, &agent.id, &request).await {
                    Ok(outcome) => AgentResult {
                        agent_id: agent.id.clone(),
                        agent_name: agent.name.clone(),
                        success: true,
                        response: Some(outcome.content),
                        usage: Some(outcome.usage),
                        tool_calls: outcome.tool_calls,
                        error: None,
                        response_time_ms: started.elapsed().as_millis() as u64,
                    },
                    Err(err) => AgentResult {
                        agent_id: agent.id.clone(),
                        agent_name: agent.name.clone(),
                        success: false,
                        response: None,
                        usage: None,
                        tool_calls: vec![],
                        error: Some(err.to_string()),
                        response_time_ms: started.elapsed().as_millis() as u64,
                    },
                };
                let _ = tx.send(result);
            }));
        }
        drop(tx);

        // Collect in completion order.
        let mut by_completion = Vec::with_capacity(agents.len());
        while let Some(result) = rx.recv().await {
            self.record_result(session_id, &result).await;
            if let Some(progress) = progress {
                let _ = progress.send(result.clone());
            }
            by_completion.push(result);
        }
        for handle in handles {
            let _ = handle.await;
        }

        // Report in declared agent order; events already went out in
        // completion order.
        let mut by_agent: HashMap<&str, AgentResult> = by_completion
            .iter()
            .map(|r| (r.agent_id.as_str(), r.clone()))
            .collect();
        Ok(agents
            .iter()
            .filter_map(|a| by_agent.remove(a.id.as_str()))
            .collect())
    }

    /// Sequential: an evolving message list; each agent sees every prior
    /// successful answer, tagged with the producing agent's name.
    async fn run_sequential(
        &self,
        session_id: &str,
        agents: &[Agent],
        user_message: &str,
        config: &OrchestrationConfig,
        progress: &Option<mpsc::UnboundedSender<AgentResult>>,
    ) -> Result<Vec<AgentResult>, LlmError> {
        let mut messages = vec![ChatMessage::new(Role::User, user_message)];
        let mut results = Vec::with_capacity(agents.len());

        for agent in agents {
            let result = self
                .call_agent(session_id, agent, messages.clone(), config)
                .await;
            if let Some(progress) = progress {
                let _ = progress.send(result.clone());
            }
            if result.success {
                let response = result.response.clone().unwrap_or_default();
                // Downstream agents see prior answers as user context,
                // attributed by name.
                let mut turn =
                    ChatMessage::new(Role::User, format!("[{}]: {}", agent.name, response));
                turn.agent_name = Some(agent.name.clone());
                messages.push(turn);
            } else if config.break_on_error {
                results.push(result);
                break;
            }
            results.push(result);
        }
        Ok(results)
    }

    /// Pipeline: each agent receives only the current input; its output
    /// becomes the next input.
    async fn run_pipeline(
        &self,
        session_id: &str,
        agents: &[Agent],
        user_message: &str,
        config: &OrchestrationConfig,
        progress: &Option<mpsc::UnboundedSender<AgentResult>>,
    ) -> Result<PipelineOutcome, LlmError> {
        let mut input = user_message.to_string();
        let mut final_output = String::new();
        let mut stages = Vec::with_capacity(agents.len());

        for agent in agents {
            let messages = vec![ChatMessage::new(Role::User, input.clone())];
            let result = self.call_agent(session_id, agent, messages, config).await;
            if let Some(progress) = progress {
                let _ = progress.send(result.clone());
            }
            match (&result.response, result.success) {
                (Some(output), true) => {
                    stages.push(PipelineStage {
                        agent_id: agent.id.clone(),
                        agent_name: agent.name.clone(),
                        input: input.clone(),
                        output: Some(output.clone()),
                        error: None,
                    });
                    final_output = output.clone();
                    input = output.clone();
                }
                _ => {
                    stages.push(PipelineStage {
                        agent_id: agent.id.clone(),
                        agent_name: agent.name.clone(),
                        input: input.clone(),
                        output: None,
                        error: result.error.clone(),
                    });
                    if !config.continue_pipeline_on_error {
                        break;
                    }
                }
            }
        }

        Ok(PipelineOutcome {
            stages,
            final_output,
        })
    }

    /// Competitive: all agents race; the first success wins and the rest
    /// are cancelled best-effort. Cancelled peers emit no events.
    async fn run_competitive(
        &self,
        session_id: &str,
        agents: &[Agent],
        user_message: &str,
        config: &OrchestrationConfig,
        progress: &Option<mpsc::UnboundedSender<AgentResult>>,
    ) -> Result<AgentResult, LlmError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<AgentResult>();
        let mut handles = Vec::with_capacity(agents.len());

        for agent in agents {
            let messages = vec![ChatMessage::new(Role::User, user_message)];
            let request = self.build_request(session_id, agent, messages, config);
            let service = self.service.clone();
            let agent = agent.clone();
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                let started = Instant::now();
                if let Ok(outcome) = guarded_generate(&service, &agent.id, &request).await {
                    let _ = tx.send(AgentResult {
                        agent_id: agent.id.clone(),
                        agent_name: agent.name.clone(),
                        success: true,
                        response: Some(outcome.content),
                        usage: Some(outcome.usage),
                        tool_calls: outcome.tool_calls,
                        error: None,
                        response_time_ms: started.elapsed().as_millis() as u64,
                    });
                }
                // Failures stay silent: a losing or failing competitor
                // produces no result entry.
            }));
        }
        drop(tx);

        let winner = tokio::time::timeout(config.competitive_timeout, rx.recv()).await;
        // Cancel the losers regardless of outcome.
        for handle in &handles {
            handle.abort();
        }

        match winner {
            Ok(Some(result)) => {
                self.record_result(session_id, &result).await;
                if let Some(progress) = progress {
                    let _ = progress.send(result.clone());
                }
                Ok(result)
            }
            // Every competitor failed before the deadline, or none
            // succeeded in time: both are the competitive timeout.
            Ok(None) | Err(_) => Err(LlmError::CompetitiveTimeout {
                timeout: config.competitive_timeout,
            }),
        }
    }

    /// Consensus: parallel rounds, key-point frequency counting, and a
    /// shared-fact record when agreement lands.
    async fn run_consensus(
        &self,
        session_id: &str,
        agents: &[Agent],
        user_message: &str,
        config: &OrchestrationConfig,
        progress: &Option<mpsc::UnboundedSender<AgentResult>>,
    ) -> Result<StrategyOutcome, LlmError> {
        let required = (config.consensus_threshold * agents.len() as f64).ceil() as usize;
        let mut prompt = user_message.to_string();
        let mut last_results = Vec::new();
        let mut divergent = Vec::new();
        let mut last_agreement = 0.0;

        for iteration in 1..=config.max_consensus_iterations {
            let results = self
                .run_parallel(session_id, agents, &prompt, config, progress)
                .await?;
            let successes: Vec<&AgentResult> = results.iter().filter(|r| r.success).collect();

            if successes.len() < required {
                return Err(LlmError::ConsensusNotReached {
                    successes: successes.len(),
                    required,
                });
            }

            let responses: Vec<&str> = successes
                .iter()
                .filter_map(|r| r.response.as_deref())
                .collect();
            let (consensus_points, all_points) = consensus_points(&responses);
            let agreement = agreement_level(&responses);
            last_agreement = agreement;

            let reached = !consensus_points.is_empty() || agreement >= 0.7;
            self.events
                .on_event(&EnsembleEvent::ConsensusChecked {
                    session_id: session_id.to_string(),
                    iteration,
                    reached,
                    point_count: consensus_points.len(),
                })
                .await;

            if reached {
                let participants: Vec<String> =
                    successes.iter().map(|r| r.agent_id.clone()).collect();
                for point in &consensus_points {
                    self.memory.with_meta(|meta| {
                        meta.add_shared_fact(
                            point.clone(),
                            agreement.max(0.6),
                            participants.clone(),
                        )
                    });
                }
                let confidence = if all_points.is_empty() {
                    0.0
                } else {
                    consensus_points.len() as f64 / all_points.len() as f64
                };
                return Ok(StrategyOutcome::Consensus {
                    results,
                    consensus: ConsensusOutcome {
                        reached: true,
                        points: consensus_points,
                        confidence,
                        divergent_points: vec![],
                        participants,
                        agreement_level: agreement,
                        iterations: iteration,
                    },
                });
            }

            divergent = all_points;
            // Re-dispatch with the combined viewpoints.
            let viewpoints: Vec<String> = successes
                .iter()
                .map(|r| {
                    format!(
                        "[{}]: {}",
                        r.agent_name,
                        r.response.as_deref().unwrap_or_default()
                    )
                })
                .collect();
            prompt = format!(
                "{}\n\nThe group has not converged yet. Current viewpoints:\n{}\n\n\
                 Find the common ground and state the points you can all support.",
                user_message,
                viewpoints.join("\n")
            );
            last_results = results;
        }

        let participants: Vec<String> = last_results
            .iter()
            .filter(|r| r.success)
            .map(|r| r.agent_id.clone())
            .collect();
        Ok(StrategyOutcome::Consensus {
            results: last_results,
            consensus: ConsensusOutcome {
                reached: false,
                points: vec![],
                confidence: 0.0,
                divergent_points: divergent,
                participants,
                agreement_level: last_agreement,
                iterations: config.max_consensus_iterations,
            },
        })
    }

    /// Memory and event bookkeeping for results produced by spawned tasks.
    async fn record_result(&self, session_id: &str, result: &AgentResult) {
        if result.success {
            if let Some(response) = &result.response {
                self.memory
                    .with_conversation(session_id, |c| c.add_message(&result.agent_id, response));
            }
            self.events
                .on_event(&EnsembleEvent::AgentResponded {
                    agent_id: result.agent_id.clone(),
                    agent_name: result.agent_name.clone(),
                    response_length: result
                        .response
                        .as_ref()
                        .map(String::len)
                        .unwrap_or_default(),
                    usage: result.usage,
                })
                .await;
        } else {
            self.events
                .on_event(&EnsembleEvent::AgentFailed {
                    agent_id: result.agent_id.clone(),
                    agent_name: result.agent_name.clone(),
                    error: result.error.clone().unwrap_or_default(),
                })
                .await;
        }
    }
}

/// One agent call behind that agent's own circuit breaker.
///
/// The service guards the *model*; this guards the *agent*, so one
/// misbehaving participant trips independently of the models it shares
/// with healthy peers.
async fn guarded_generate(
    service: &LlmService,
    agent_id: &str,
    request: &GenerationRequest,
) -> Result<GenerationOutcome, LlmError> {
    let breaker = service
        .breakers()
        .try_admit(BreakerScope::Agent, agent_id)?;
    match service.generate(request).await {
        Ok(outcome) => {
            breaker.record_success();
            Ok(outcome)
        }
        Err(err) => {
            breaker.record_failure();
            Err(err)
        }
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Split a response into sentences and keep the first three of at least
/// twenty characters, normalized for counting.
fn key_points(response: &str) -> Vec<String> {
    response
        .split(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| s.len() >= 20)
        .take(3)
        .map(|s| s.to_lowercase())
        .collect()
}

/// Count normalized key points across responses. Returns the points whose
/// frequency reaches ⌈0.6 × responses⌉ plus the full distinct-point list.
fn consensus_points(responses: &[&str]) -> (Vec<String>, Vec<String>) {
    let mut frequency: HashMap<String, usize> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for response in responses {
        let mut seen_in_response = std::collections::HashSet::new();
        for point in key_points(response) {
            if seen_in_response.insert(point.clone()) {
                if !frequency.contains_key(&point) {
                    order.push(point.clone());
                }
                *frequency.entry(point).or_insert(0) += 1;
            }
        }
    }
    let needed = ((0.6 * responses.len() as f64).ceil() as usize).max(1);
    let consensus: Vec<String> = order
        .iter()
        .filter(|p| frequency[*p] >= needed)
        .cloned()
        .collect();
    (consensus, order)
}

/// Fraction of responses containing an agreement phrase.
fn agreement_level(responses: &[&str]) -> f64 {
    if responses.is_empty() {
        return 0.0;
    }
    let agreeing = responses
        .iter()
        .filter(|r| {
            let lower = r.to_lowercase();
            AGREEMENT_PHRASES.iter().any(|phrase| lower.contains(phrase))
        })
        .count();
    agreeing as f64 / responses.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_strategy_fails_validation() {
        assert!(matches!(
            Strategy::parse("roundrobin"),
            Err(LlmError::Validation(_))
        ));
        assert_eq!(Strategy::parse("pipeline").unwrap(), Strategy::Pipeline);
    }

    #[test]
    fn key_points_filter_short_sentences() {
        let points = key_points("Yes. Integration is the key to success. Ok! Done?");
        assert_eq!(points, vec!["integration is the key to success"]);
    }

    #[test]
    fn consensus_points_require_super_majority() {
        let responses = [
            "Integration is key here. My own unique angle on testing.",
            "Integration is key here. A different divergent statement entirely.",
            "Integration is key here. Yet another unshared viewpoint follows.",
        ];
        let (consensus, all) = consensus_points(&responses.iter().copied().collect::<Vec<_>>());
        assert_eq!(consensus, vec!["integration is key here"]);
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn agreement_level_counts_phrases() {
        let responses = ["I fully agree with that", "same here", "absolutely not"];
        let level = agreement_level(&responses.iter().copied().collect::<Vec<_>>());
        assert!((level - 2.0 / 3.0).abs() < 1e-9);
    }
}
