//! Live client session gateway.
//!
//! A WebSocket server that accepts connections identified by an opaque
//! `userId` (query parameter, or auto-generated when absent), dispatches
//! `chat` envelopes through the orchestrator, and streams structured
//! events back in order. An optional access token gates connections and is
//! compared in constant time.
//!
//! # Reconnection contract
//!
//! A new connection presenting an existing `userId` is a reconnection: it
//! receives `connected {isReconnection: true}` and inherits the prior
//! session set. An orchestration that was in flight when the client
//! dropped **keeps running**; events that could not be delivered are
//! buffered per user (bounded) and flushed, in their original order,
//! ahead of any new traffic on the next connection.
//!
//! # Backpressure
//!
//! Each connection has a bounded outbound queue. When it overflows,
//! `status` events are dropped first; if a critical event (`chat_complete`,
//! `error`) cannot be enqueued the connection is closed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::ensemble::agent::Agent;
use crate::ensemble::client_wrapper::{SamplingParams, TokenUsage, ToolCall};
use crate::ensemble::error::LlmError;
use crate::ensemble::llm_service::LlmService;
use crate::ensemble::memory::MemoryStore;
use crate::ensemble::orchestrator::{
    AgentResult, OrchestrationConfig, Orchestrator, PipelineStage, Strategy, StrategyOutcome,
};

/// Outbound queue capacity per connection.
const OUTBOX_CAPACITY: usize = 64;
/// Events buffered per user while disconnected.
const OFFLINE_BUFFER_CAPACITY: usize = 256;

// ── Wire envelopes ─────────────────────────────────────────────────────

/// Agent descriptor as it arrives in a `chat` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireAgent {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

/// Per-chat settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSettings {
    pub orchestration_strategy: Option<String>,
    pub enable_tools: Option<bool>,
    /// Per-agent model overrides, keyed by agent id.
    pub agent_models: Option<HashMap<String, String>>,
    /// Per-agent sampling overrides, keyed by agent id.
    pub agent_parameters: Option<HashMap<String, SamplingParams>>,
    /// Per-agent API keys, keyed by agent id. Installed into the shared
    /// credential store for the duration of the turn, never logged.
    pub agent_api_keys: Option<HashMap<String, String>>,
    pub consensus_threshold: Option<f64>,
    pub competitive_timeout_ms: Option<u64>,
    pub break_on_error: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub session_id: String,
    #[serde(default)]
    pub agents: Vec<WireAgent>,
    pub message: String,
    #[serde(default)]
    pub settings: ChatSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartConversationPayload {
    pub session_id: String,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub agents: Vec<WireAgent>,
}

/// Client → server envelopes.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEnvelope {
    #[serde(rename = "chat")]
    Chat { payload: ChatPayload },
    #[serde(rename = "start-conversation")]
    StartConversation { payload: StartConversationPayload },
    #[serde(rename = "get-status")]
    GetStatus,
}

/// Agent identity attached to per-agent events.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRef {
    pub id: String,
    pub name: String,
}

/// Server → client events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "connected")]
    Connected {
        #[serde(rename = "userId")]
        user_id: String,
        #[serde(rename = "isReconnection")]
        is_reconnection: bool,
        agents: Vec<String>,
    },
    #[serde(rename = "conversation-start")]
    ConversationStart {
        #[serde(rename = "sessionId")]
        session_id: String,
        agents: Vec<String>,
    },
    #[serde(rename = "agent_response")]
    AgentResponse {
        agent: AgentRef,
        response: String,
        #[serde(rename = "responseTime")]
        response_time_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
        #[serde(rename = "toolCalls", skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    #[serde(rename = "agent_response_error")]
    AgentResponseError { agent: AgentRef, error: String },
    #[serde(rename = "pipeline_result")]
    PipelineResult {
        pipeline: Vec<PipelineStage>,
        #[serde(rename = "finalOutput")]
        final_output: String,
    },
    #[serde(rename = "consensus_result")]
    ConsensusResult {
        reached: bool,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        points: Vec<String>,
        confidence: f64,
        #[serde(rename = "divergentPoints", skip_serializing_if = "Vec::is_empty")]
        divergent_points: Vec<String>,
        #[serde(rename = "agreementLevel")]
        agreement_level: f64,
    },
    #[serde(rename = "chat_complete")]
    ChatComplete { strategy: String },
    #[serde(rename = "status")]
    Status {
        agents: Vec<String>,
        #[serde(rename = "activeConversations")]
        active_conversations: usize,
        #[serde(rename = "connectedClients")]
        connected_clients: usize,
        #[serde(rename = "uptimeSecs")]
        uptime_secs: u64,
        breakers: HashMap<String, String>,
    },
    #[serde(rename = "error")]
    Error { error: String, recoverable: bool },
}

impl ServerEvent {
    /// Events that must reach the client; failure to enqueue one closes
    /// the connection.
    fn is_critical(&self) -> bool {
        matches!(self, ServerEvent::ChatComplete { .. } | ServerEvent::Error { .. })
    }

    /// Events dropped first under backpressure.
    fn is_droppable(&self) -> bool {
        matches!(self, ServerEvent::Status { .. })
    }
}

// ── Per-user state ─────────────────────────────────────────────────────

struct UserState {
    user_id: String,
    sessions: Mutex<HashSet<String>>,
    known_agents: Mutex<Vec<String>>,
    /// Sender for the currently attached connection, if any.
    outbox: Mutex<Option<mpsc::Sender<ServerEvent>>>,
    /// Events produced while no connection was attached.
    offline_buffer: Mutex<VecDeque<ServerEvent>>,
    connected: AtomicBool,
    /// Serializes turns: a chat envelope is not dispatched until the
    /// previous one's `chat_complete` has been emitted.
    turn_lock: tokio::sync::Mutex<()>,
}

impl UserState {
    fn new(user_id: String) -> Self {
        Self {
            user_id,
            sessions: Mutex::new(HashSet::new()),
            known_agents: Mutex::new(Vec::new()),
            outbox: Mutex::new(None),
            offline_buffer: Mutex::new(VecDeque::new()),
            connected: AtomicBool::new(false),
            turn_lock: tokio::sync::Mutex::new(()),
        }
    }
}

// ── The gateway ────────────────────────────────────────────────────────

/// WebSocket session gateway over an [`Orchestrator`].
pub struct SessionGateway {
    orchestrator: Arc<Orchestrator>,
    service: Arc<LlmService>,
    memory: Arc<MemoryStore>,
    credentials: Arc<crate::ensemble::credentials::SharedCredentialStore>,
    users: DashMap<String, Arc<UserState>>,
    access_token: Option<String>,
    started_at: Instant,
}

impl SessionGateway {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        service: Arc<LlmService>,
        memory: Arc<MemoryStore>,
        credentials: Arc<crate::ensemble::credentials::SharedCredentialStore>,
    ) -> Self {
        Self {
            orchestrator,
            service,
            memory,
            credentials,
            users: DashMap::new(),
            access_token: None,
            started_at: Instant::now(),
        }
    }

    /// Require a `token` query parameter on every connection (builder
    /// pattern). Compared in constant time.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Bind and serve forever.
    pub async fn bind(self: Arc<Self>, addr: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        log::info!("gateway listening on {}", addr);
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let gateway = self.clone();
            tokio::spawn(async move {
                if let Err(e) = gateway.handle_connection(stream).await {
                    log::debug!("connection from {} ended: {}", peer, e);
                }
            });
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // Capture userId/token from the request line during the handshake.
        let mut query: HashMap<String, String> = HashMap::new();
        let ws = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
            if let Some(q) = request.uri().query() {
                for pair in q.split('&') {
                    if let Some((key, value)) = pair.split_once('=') {
                        query.insert(key.to_string(), value.to_string());
                    }
                }
            }
            Ok(response)
        })
        .await?;

        if let Some(expected) = &self.access_token {
            let presented = query.get("token").map(String::as_str).unwrap_or("");
            let ok: bool = presented
                .as_bytes()
                .ct_eq(expected.as_bytes())
                .into();
            if !ok {
                log::warn!("connection rejected: bad access token");
                return Ok(());
            }
        }

        let user_id = query
            .remove("userId")
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let (user, is_reconnection) = match self.users.get(&user_id) {
            Some(existing) => (existing.clone(), true),
            None => {
                let state = Arc::new(UserState::new(user_id.clone()));
                self.users.insert(user_id.clone(), state.clone());
                (state, false)
            }
        };

        let (outbox_tx, mut outbox_rx) = mpsc::channel::<ServerEvent>(OUTBOX_CAPACITY);
        let (mut ws_sink, mut ws_stream) = ws.split();

        // Writer: serialize queued events onto the socket.
        let writer_user = user.clone();
        let writer = tokio::spawn(async move {
            while let Some(event) = outbox_rx.recv().await {
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        log::error!("event serialization failed: {}", e);
                        continue;
                    }
                };
                if ws_sink.send(WsMessage::Text(json)).await.is_err() {
                    break;
                }
            }
            writer_user.connected.store(false, Ordering::SeqCst);
        });

        // The greeting goes out first, then any events that accumulated
        // while the user was disconnected, in their original order.
        let known_agents = user
            .known_agents
            .lock()
            .expect("agents lock poisoned")
            .clone();
        let _ = outbox_tx
            .send(ServerEvent::Connected {
                user_id: user_id.clone(),
                is_reconnection,
                agents: known_agents,
            })
            .await;
        let backlog: Vec<ServerEvent> = {
            let mut buffered = user.offline_buffer.lock().expect("buffer lock poisoned");
            buffered.drain(..).collect()
        };
        for event in backlog {
            let _ = outbox_tx.send(event).await;
        }

        // Attach: new traffic flows straight to the writer from here on.
        *user.outbox.lock().expect("outbox lock poisoned") = Some(outbox_tx.clone());
        user.connected.store(true, Ordering::SeqCst);
        {
            // Anything buffered during the flush follows immediately.
            let late: Vec<ServerEvent> = {
                let mut buffered = user.offline_buffer.lock().expect("buffer lock poisoned");
                buffered.drain(..).collect()
            };
            for event in late {
                let _ = outbox_tx.send(event).await;
            }
        }

        // Reader: dispatch inbound envelopes until the socket closes.
        while let Some(frame) = ws_stream.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(_) => break,
            };
            match frame {
                WsMessage::Text(text) => self.dispatch(&user, &text).await,
                WsMessage::Close(_) => break,
                _ => {}
            }
        }

        // Detach: subsequent events buffer until a reconnection.
        user.connected.store(false, Ordering::SeqCst);
        *user.outbox.lock().expect("outbox lock poisoned") = None;
        writer.abort();
        Ok(())
    }

    /// Parse and dispatch one inbound envelope.
    async fn dispatch(self: &Arc<Self>, user: &Arc<UserState>, text: &str) {
        let envelope: ClientEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.deliver(
                    user,
                    ServerEvent::Error {
                        error: format!("unrecognized message: {}", e),
                        recoverable: false,
                    },
                );
                return;
            }
        };

        match envelope {
            ClientEnvelope::Chat { payload } => {
                let gateway = self.clone();
                let user = user.clone();
                tokio::spawn(async move {
                    // The next chat waits for this one's completion events.
                    let _turn = user.turn_lock.lock().await;
                    gateway.handle_chat(&user, payload).await;
                });
            }
            ClientEnvelope::StartConversation { payload } => {
                user.sessions
                    .lock()
                    .expect("sessions lock poisoned")
                    .insert(payload.session_id.clone());
                let agent_ids: Vec<String> =
                    payload.agents.iter().map(|a| a.id.clone()).collect();
                if let Some(topic) = &payload.topic {
                    self.memory.with_conversation(&payload.session_id, |c| {
                        c.add_message("user", topic)
                    });
                }
                self.deliver(
                    user,
                    ServerEvent::ConversationStart {
                        session_id: payload.session_id,
                        agents: agent_ids,
                    },
                );
            }
            ClientEnvelope::GetStatus => {
                let agents = user.known_agents.lock().expect("agents lock poisoned").clone();
                self.deliver(
                    user,
                    ServerEvent::Status {
                        agents,
                        active_conversations: self.memory.conversation_count(),
                        connected_clients: self
                            .users
                            .iter()
                            .filter(|u| u.connected.load(Ordering::SeqCst))
                            .count(),
                        uptime_secs: self.started_at.elapsed().as_secs(),
                        breakers: self.service.breakers().state_map(),
                    },
                );
            }
        }
    }

    /// Run one chat turn: build agents and config, orchestrate with a
    /// progress stream, emit per-agent and per-strategy events, finish
    /// with `chat_complete` (or a single `error` if dispatch failed).
    async fn handle_chat(self: &Arc<Self>, user: &Arc<UserState>, payload: ChatPayload) {
        let session_id = payload.session_id.clone();
        user.sessions
            .lock()
            .expect("sessions lock poisoned")
            .insert(session_id.clone());

        let (agents, config, installed_refs) = match self.build_run(user, &payload) {
            Ok(parts) => parts,
            Err(err) => {
                self.deliver(
                    user,
                    ServerEvent::Error {
                        error: err.to_string(),
                        recoverable: true,
                    },
                );
                return;
            }
        };

        *user.known_agents.lock().expect("agents lock poisoned") =
            agents.iter().map(|a| a.id.clone()).collect();

        // Forward per-agent results as they complete.
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<AgentResult>();
        let forwarder_gateway = self.clone();
        let forwarder_user = user.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(result) = progress_rx.recv().await {
                forwarder_gateway.deliver(&forwarder_user, agent_event(result));
            }
        });

        let outcome = self
            .orchestrator
            .run(
                &session_id,
                &agents,
                &payload.message,
                &config,
                Some(progress_tx),
            )
            .await;

        let _ = forwarder.await;

        for reference in installed_refs {
            self.credentials.remove(&reference);
        }

        match outcome {
            Ok(StrategyOutcome::Pipeline(pipeline)) => {
                self.deliver(
                    user,
                    ServerEvent::PipelineResult {
                        pipeline: pipeline.stages,
                        final_output: pipeline.final_output,
                    },
                );
                self.deliver(
                    user,
                    ServerEvent::ChatComplete {
                        strategy: config.strategy.name().to_string(),
                    },
                );
            }
            Ok(StrategyOutcome::Consensus { consensus, .. }) => {
                self.deliver(
                    user,
                    ServerEvent::ConsensusResult {
                        reached: consensus.reached,
                        points: consensus.points,
                        confidence: consensus.confidence,
                        divergent_points: consensus.divergent_points,
                        agreement_level: consensus.agreement_level,
                    },
                );
                self.deliver(
                    user,
                    ServerEvent::ChatComplete {
                        strategy: config.strategy.name().to_string(),
                    },
                );
            }
            Ok(_) => {
                self.deliver(
                    user,
                    ServerEvent::ChatComplete {
                        strategy: config.strategy.name().to_string(),
                    },
                );
            }
            Err(err) => {
                self.deliver(
                    user,
                    ServerEvent::Error {
                        error: err.to_string(),
                        recoverable: true,
                    },
                );
            }
        }
    }

    /// Translate a chat payload into agents and a run configuration,
    /// installing any per-agent API keys into the credential store.
    #[allow(clippy::type_complexity)]
    fn build_run(
        &self,
        user: &Arc<UserState>,
        payload: &ChatPayload,
    ) -> Result<(Vec<Agent>, OrchestrationConfig, Vec<String>), LlmError> {
        if payload.agents.is_empty() {
            return Err(LlmError::Validation("no agents provided".into()));
        }
        let settings = &payload.settings;
        let strategy = match &settings.orchestration_strategy {
            Some(name) => Strategy::parse(name)?,
            None => Strategy::Parallel,
        };

        let mut config = OrchestrationConfig {
            strategy,
            ..Default::default()
        };
        if let Some(enable) = settings.enable_tools {
            config.enable_tools = enable;
        }
        if let Some(threshold) = settings.consensus_threshold {
            config.consensus_threshold = threshold;
        }
        if let Some(ms) = settings.competitive_timeout_ms {
            config.competitive_timeout = Duration::from_millis(ms);
        }
        if let Some(stop) = settings.break_on_error {
            config.break_on_error = stop;
        }

        let mut installed = Vec::new();
        let agents = payload
            .agents
            .iter()
            .map(|wire| {
                let model = settings
                    .agent_models
                    .as_ref()
                    .and_then(|m| m.get(&wire.id))
                    .cloned()
                    .unwrap_or_else(|| wire.model.clone());
                let mut agent = Agent::new(&wire.id, &wire.name, &wire.provider, model);
                if let Some(prompt) = &wire.system_prompt {
                    agent.system_prompt = prompt.clone();
                }
                if let Some(params) = settings
                    .agent_parameters
                    .as_ref()
                    .and_then(|p| p.get(&wire.id))
                {
                    agent.params = params.clone();
                }
                if let Some(key) = settings
                    .agent_api_keys
                    .as_ref()
                    .and_then(|k| k.get(&wire.id))
                {
                    let reference = format!("{}:{}", user.user_id, wire.id);
                    self.credentials.insert(reference.clone(), key.clone());
                    agent.credential_ref = Some(reference.clone());
                    installed.push(reference);
                }
                agent
            })
            .collect();

        Ok((agents, config, installed))
    }

    /// Enqueue an event for a user, honoring the backpressure policy, or
    /// buffer it while the user is disconnected.
    fn deliver(&self, user: &Arc<UserState>, event: ServerEvent) {
        let outbox = user.outbox.lock().expect("outbox lock poisoned").clone();
        match outbox {
            Some(tx) if user.connected.load(Ordering::SeqCst) => {
                match tx.try_send(event) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(event)) => {
                        if event.is_droppable() {
                            log::debug!("dropping status event for {}", user.user_id);
                        } else if event.is_critical() {
                            // The queue cannot absorb a critical event:
                            // detach the connection and buffer it for the
                            // next one.
                            log::warn!(
                                "outbound queue full for {}; closing connection",
                                user.user_id
                            );
                            user.connected.store(false, Ordering::SeqCst);
                            *user.outbox.lock().expect("outbox lock poisoned") = None;
                            Self::buffer_offline(user, event);
                        } else {
                            Self::buffer_offline(user, event);
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(event)) => {
                        Self::buffer_offline(user, event);
                    }
                }
            }
            _ => Self::buffer_offline(user, event),
        }
    }

    fn buffer_offline(user: &Arc<UserState>, event: ServerEvent) {
        // Status snapshots are point-in-time; never worth replaying.
        if event.is_droppable() {
            return;
        }
        let mut buffer = user.offline_buffer.lock().expect("buffer lock poisoned");
        if buffer.len() >= OFFLINE_BUFFER_CAPACITY {
            buffer.pop_front();
        }
        buffer.push_back(event);
    }
}

/// Convert a per-agent result into its wire event.
fn agent_event(result: AgentResult) -> ServerEvent {
    let agent = AgentRef {
        id: result.agent_id,
        name: result.agent_name,
    };
    if result.success {
        ServerEvent::AgentResponse {
            agent,
            response: result.response.unwrap_or_default(),
            response_time_ms: result.response_time_ms,
            usage: result.usage,
            tool_calls: result.tool_calls,
        }
    } else {
        ServerEvent::AgentResponseError {
            agent,
            error: result.error.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_envelopes_parse_from_wire_json() {
        let chat = r#"{
            "type": "chat",
            "payload": {
                "sessionId": "s1",
                "agents": [{"id": "a1", "name": "Echo", "provider": "openai", "model": "gpt-4.1-mini"}],
                "message": "hi",
                "settings": {"orchestrationStrategy": "parallel"}
            }
        }"#;
        match serde_json::from_str::<ClientEnvelope>(chat).unwrap() {
            ClientEnvelope::Chat { payload } => {
                assert_eq!(payload.session_id, "s1");
                assert_eq!(payload.agents[0].provider, "openai");
                assert_eq!(
                    payload.settings.orchestration_strategy.as_deref(),
                    Some("parallel")
                );
            }
            other => panic!("parsed wrong variant: {:?}", other),
        }

        assert!(serde_json::from_str::<ClientEnvelope>(r#"{"type": "get-status"}"#).is_ok());
        assert!(serde_json::from_str::<ClientEnvelope>(r#"{"type": "dance"}"#).is_err());
    }

    #[test]
    fn server_events_serialize_with_wire_names() {
        let event = ServerEvent::ChatComplete {
            strategy: "parallel".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "chat_complete");

        let event = ServerEvent::Connected {
            user_id: "u1".into(),
            is_reconnection: true,
            agents: vec![],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "connected");
        assert_eq!(json["isReconnection"], true);
    }

    #[test]
    fn backpressure_classes_are_disjoint() {
        let status = ServerEvent::Status {
            agents: vec![],
            active_conversations: 0,
            connected_clients: 0,
            uptime_secs: 0,
            breakers: HashMap::new(),
        };
        assert!(status.is_droppable() && !status.is_critical());

        let complete = ServerEvent::ChatComplete {
            strategy: "parallel".into(),
        };
        assert!(complete.is_critical() && !complete.is_droppable());
    }
}
