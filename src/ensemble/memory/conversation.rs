//! Per-session Conversation Memory: timeline, topic tracking, and the
//! avoided-topic set.
//!
//! Topic extraction is deliberately shallow — keyword triggers and
//! capitalized bigrams, no semantic NLP. A topic that has been hammered
//! (count > 5 with depth > 3) enters the avoided set and stays there for
//! the session's lifetime; `should_avoid_topic` additionally flags any
//! topic mentioned more than three times.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

/// Bound on the rolling context window.
pub const CONTEXT_WINDOW_LIMIT: usize = 20;

/// Topic count beyond which (with depth) a topic becomes avoided.
const AVOID_COUNT_THRESHOLD: u32 = 5;
/// Depth beyond which (with count) a topic becomes avoided.
const AVOID_DEPTH_THRESHOLD: f64 = 3.0;
/// Per-mention depth increment, saturating at 5.
const DEPTH_STEP: f64 = 0.2;
const DEPTH_MAX: f64 = 5.0;

/// Trigger words whose following token is extracted as a topic.
const TOPIC_TRIGGERS: [&str; 6] = ["about", "regarding", "discuss", "discussing", "explore", "concerning"];

/// One timeline entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub at: DateTime<Utc>,
    pub agent_id: String,
    pub text: String,
    pub topics: Vec<String>,
    pub hashtags: Vec<String>,
}

/// Per-participant counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParticipantStats {
    pub message_count: u64,
    pub topics: HashSet<String>,
    pub hashtags: HashSet<String>,
}

/// Per-topic counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicStats {
    pub count: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Saturating depth score; grows by 0.2 per mention up to 5.
    pub depth: f64,
}

/// Context view returned by [`ConversationMemory::get_context`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationContext {
    pub window: Vec<TimelineEntry>,
    /// Topics whose `last_seen` is within the past five minutes.
    pub recent_topics: Vec<String>,
    pub avoided_topics: Vec<String>,
}

/// Per-session conversation memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMemory {
    pub session_id: String,
    pub timeline: Vec<TimelineEntry>,
    pub participants: BTreeMap<String, ParticipantStats>,
    pub topics: BTreeMap<String, TopicStats>,
    /// Bounded rolling window of the most recent entries.
    pub context_window: Vec<TimelineEntry>,
    avoided_topics: HashSet<String>,
}

impl ConversationMemory {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            timeline: Vec::new(),
            participants: BTreeMap::new(),
            topics: BTreeMap::new(),
            context_window: Vec::new(),
            avoided_topics: HashSet::new(),
        }
    }

    /// Record a message: extract topics and hashtags, update participant
    /// and topic counters, append to the timeline and the bounded window,
    /// and recompute the avoided set.
    pub fn add_message(&mut self, agent_id: &str, text: &str) {
        let now = Utc::now();
        let hashtags = extract_hashtags(text);
        let topics = extract_topics(text);

        let stats = self.participants.entry(agent_id.to_string()).or_default();
        stats.message_count += 1;
        stats.topics.extend(topics.iter().cloned());
        stats.hashtags.extend(hashtags.iter().cloned());

        for topic in &topics {
            self.topics
                .entry(topic.clone())
                .and_modify(|t| {
                    t.count += 1;
                    t.last_seen = now;
                    t.depth = (t.depth + DEPTH_STEP).min(DEPTH_MAX);
                })
                .or_insert(TopicStats {
                    count: 1,
                    first_seen: now,
                    last_seen: now,
                    depth: DEPTH_STEP,
                });
        }

        let entry = TimelineEntry {
            at: now,
            agent_id: agent_id.to_string(),
            text: text.to_string(),
            topics: topics.clone(),
            hashtags,
        };
        self.timeline.push(entry.clone());
        self.context_window.push(entry);
        if self.context_window.len() > CONTEXT_WINDOW_LIMIT {
            self.context_window.remove(0);
        }

        // The avoided set only ever grows within a session.
        for (topic, stats) in &self.topics {
            if stats.count > AVOID_COUNT_THRESHOLD && stats.depth > AVOID_DEPTH_THRESHOLD {
                self.avoided_topics.insert(topic.clone());
            }
        }
    }

    /// Whether a topic should be steered away from: it is in the avoided
    /// set, or it has been mentioned more than three times.
    pub fn should_avoid_topic(&self, topic: &str) -> bool {
        if self.avoided_topics.contains(topic) {
            return true;
        }
        self.topics.get(topic).map(|t| t.count > 3).unwrap_or(false)
    }

    /// The avoided set (sorted for stable output).
    pub fn avoided_topics(&self) -> Vec<String> {
        let mut avoided: Vec<String> = self.avoided_topics.iter().cloned().collect();
        avoided.sort();
        avoided
    }

    /// The last `limit` window entries, topics seen in the past five
    /// minutes, and the avoided set.
    pub fn get_context(&self, limit: usize) -> ConversationContext {
        let start = self.context_window.len().saturating_sub(limit);
        let cutoff = Utc::now() - ChronoDuration::minutes(5);
        let mut recent: Vec<String> = self
            .topics
            .iter()
            .filter(|(_, stats)| stats.last_seen >= cutoff)
            .map(|(topic, _)| topic.clone())
            .collect();
        recent.sort();
        ConversationContext {
            window: self.context_window[start..].to_vec(),
            recent_topics: recent,
            avoided_topics: self.avoided_topics(),
        }
    }
}

/// Extract `#hashtags`, lower-cased, in order of first appearance.
fn extract_hashtags(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for token in text.split_whitespace() {
        if let Some(rest) = token.strip_prefix('#') {
            let tag: String = rest
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_')
                .collect::<String>()
                .to_lowercase();
            if !tag.is_empty() && seen.insert(tag.clone()) {
                out.push(tag);
            }
        }
    }
    out
}

/// Extract topics: the lower-cased token following a trigger word, plus
/// capitalized bigrams normalized with underscores.
fn extract_topics(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let tokens: Vec<&str> = text.split_whitespace().collect();

    for pair in tokens.windows(2) {
        let trigger = normalize_word(pair[0]);
        if TOPIC_TRIGGERS.contains(&trigger.as_str()) {
            let topic = normalize_word(pair[1]);
            if !topic.is_empty() && seen.insert(topic.clone()) {
                out.push(topic);
            }
        }
        // Capitalized bigram, e.g. "Quantum Computing" → "quantum_computing".
        if is_capitalized(pair[0]) && is_capitalized(pair[1]) {
            let topic = format!("{}_{}", normalize_word(pair[0]), normalize_word(pair[1]));
            if seen.insert(topic.clone()) {
                out.push(topic);
            }
        }
    }
    out
}

fn normalize_word(token: &str) -> String {
    token
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect::<String>()
        .to_lowercase()
}

fn is_capitalized(token: &str) -> bool {
    let mut chars = token.chars();
    match chars.next() {
        Some(first) if first.is_uppercase() => chars.all(|c| c.is_alphanumeric()),
        _ => false,
    }
}
