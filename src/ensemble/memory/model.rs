//! Per-agent Model Memory: personality traits, preferences, skills,
//! emotions, and a Q-learning table.
//!
//! Each agent owns one `ModelMemory`, held by the memory subsystem and
//! referenced by agents through their id. Reinforcement updates mutate the
//! memory in place: rewards and punishments are logged, preference
//! strengths shift by the learning rate, the Q-table follows the standard
//! update rule, and the emotion map drifts toward satisfaction or
//! frustration while every other emotion decays.
//!
//! # Q-learning update
//!
//! For `apply_reinforcement(action, reward, state)` with learning rate α
//! and discount factor γ:
//!
//! ```text
//! Q[s,a] ← Q[s,a] + α · (reward + γ · max_a' Q[s,a'] − Q[s,a])
//! ```
//!
//! On a fresh memory this reduces to `Q[s,a] = α · reward` exactly.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// A personality trait with a confidence level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trait {
    pub value: String,
    /// Confidence in the trait, clamped to `[0, 1]`.
    pub confidence: f64,
}

/// A learned preference with a strength that reinforcement shifts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preference {
    pub value: String,
    /// Strength in `[0, 1]`; moves by `reward × learning_rate`.
    pub strength: f64,
    /// Context in which the preference was observed.
    pub context: String,
}

/// One reinforcement event, kept in the bounded reward/punishment logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReinforcementEvent {
    pub action: String,
    pub magnitude: f64,
    pub state: String,
    pub at: DateTime<Utc>,
}

/// A structured memory entry (free-form, bounded on save).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredEntry {
    pub content: String,
    pub at: DateTime<Utc>,
}

/// Per-agent memory with personality, preferences, and reinforcement state.
///
/// The Q-table is keyed `"state\u{1f}action"` so the whole structure stays
/// serde-friendly; [`ModelMemory::q_value`] hides the encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMemory {
    pub agent_id: String,
    pub traits: BTreeMap<String, Trait>,
    pub preferences: BTreeMap<String, Preference>,
    pub skills: HashSet<String>,
    /// Emotion intensities in `[0, 1]`.
    pub emotions: BTreeMap<String, f64>,
    q_table: BTreeMap<String, f64>,
    pub reward_log: Vec<ReinforcementEvent>,
    pub punishment_log: Vec<ReinforcementEvent>,
    pub structured_memory: Vec<StructuredEntry>,
    pub learning_rate: f64,
    pub discount_factor: f64,
    pub exploration_rate: f64,
}

/// Entries of each reinforcement log kept when persisting.
pub const LOG_RETENTION: usize = 100;
/// Entries of structured memory kept when persisting.
pub const STRUCTURED_RETENTION: usize = 500;

const KEY_SEP: char = '\u{1f}';

fn clamp01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

impl ModelMemory {
    /// Create a fresh memory with conventional learning defaults.
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            traits: BTreeMap::new(),
            preferences: BTreeMap::new(),
            skills: HashSet::new(),
            emotions: BTreeMap::new(),
            q_table: BTreeMap::new(),
            reward_log: Vec::new(),
            punishment_log: Vec::new(),
            structured_memory: Vec::new(),
            learning_rate: 0.1,
            discount_factor: 0.9,
            exploration_rate: 0.1,
        }
    }

    /// Add or update a trait; confidence is clamped to `[0, 1]`.
    pub fn add_trait(&mut self, name: impl Into<String>, value: impl Into<String>, confidence: f64) {
        self.traits.insert(
            name.into(),
            Trait {
                value: value.into(),
                confidence: clamp01(confidence),
            },
        );
    }

    /// Add a preference or shift an existing one's strength by
    /// `strength_delta`, clamped to `[0, 1]`.
    pub fn add_preference(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
        strength_delta: f64,
        context: impl Into<String>,
    ) {
        let name = name.into();
        let value = value.into();
        let context = context.into();
        self.preferences
            .entry(name)
            .and_modify(|p| {
                p.strength = clamp01(p.strength + strength_delta);
                p.context = context.clone();
            })
            .or_insert(Preference {
                value,
                strength: clamp01(strength_delta),
                context,
            });
    }

    /// Record a skill.
    pub fn add_skill(&mut self, name: impl Into<String>) {
        self.skills.insert(name.into());
    }

    /// Append a structured memory entry.
    pub fn remember(&mut self, content: impl Into<String>) {
        self.structured_memory.push(StructuredEntry {
            content: content.into(),
            at: Utc::now(),
        });
    }

    /// The current Q-value for `(state, action)`, zero when unseen.
    pub fn q_value(&self, state: &str, action: &str) -> f64 {
        self.q_table
            .get(&format!("{}{}{}", state, KEY_SEP, action))
            .copied()
            .unwrap_or(0.0)
    }

    /// Max Q over every action recorded for `state`; zero when none exist.
    fn max_q_for_state(&self, state: &str) -> f64 {
        let prefix = format!("{}{}", state, KEY_SEP);
        self.q_table
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(_, v)| *v)
            .fold(None, |best: Option<f64>, v| {
                Some(best.map_or(v, |b| b.max(v)))
            })
            .unwrap_or(0.0)
    }

    /// Apply a reinforcement signal for an action taken in a state.
    ///
    /// Positive rewards land in the reward log, negative ones (by absolute
    /// value) in the punishment log. If `action` names a known preference,
    /// its strength shifts by `reward × learning_rate`. The Q-table is
    /// updated with the standard rule, and the emotion map is nudged:
    /// `satisfaction` (or `frustration` for negative rewards) gains
    /// `0.5 × |reward|`, every other emotion decays by ×0.95.
    pub fn apply_reinforcement(&mut self, action: &str, reward: f64, state: &str) {
        let event = ReinforcementEvent {
            action: action.to_string(),
            magnitude: reward.abs(),
            state: state.to_string(),
            at: Utc::now(),
        };
        if reward > 0.0 {
            self.reward_log.push(event);
        } else {
            self.punishment_log.push(event);
        }

        if let Some(pref) = self.preferences.get_mut(action) {
            pref.strength = clamp01(pref.strength + reward * self.learning_rate);
        }

        let max_next_q = self.max_q_for_state(state);
        let key = format!("{}{}{}", state, KEY_SEP, action);
        let old_q = self.q_table.get(&key).copied().unwrap_or(0.0);
        let new_q = old_q
            + self.learning_rate * (reward + self.discount_factor * max_next_q - old_q);
        self.q_table.insert(key, new_q);

        let boosted = if reward > 0.0 { "satisfaction" } else { "frustration" };
        for (name, intensity) in self.emotions.iter_mut() {
            if name != boosted {
                *intensity *= 0.95;
            }
        }
        let entry = self.emotions.entry(boosted.to_string()).or_insert(0.0);
        *entry = clamp01(*entry + 0.5 * reward.abs());
    }

    /// Pick an action epsilon-greedily: with probability `exploration_rate`
    /// a uniform choice, otherwise the argmax Q (ties go to the first
    /// listed action). Returns `None` for an empty action list.
    pub fn select_action(&self, state: &str, available: &[String]) -> Option<String> {
        if available.is_empty() {
            return None;
        }
        let mut rng = rand::thread_rng();
        if rng.gen::<f64>() < self.exploration_rate {
            let idx = rng.gen_range(0..available.len());
            return Some(available[idx].clone());
        }
        let mut best = &available[0];
        let mut best_q = self.q_value(state, best);
        for action in &available[1..] {
            let q = self.q_value(state, action);
            if q > best_q {
                best = action;
                best_q = q;
            }
        }
        Some(best.clone())
    }

    /// A structured, tagged textual summary of personality, emotional
    /// state, and learning statistics, consumed by the prompt assembler.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        if !self.traits.is_empty() {
            let traits: Vec<String> = self
                .traits
                .iter()
                .map(|(name, t)| format!("{}={} ({:.2})", name, t.value, t.confidence))
                .collect();
            out.push_str(&format!("[traits] {}\n", traits.join(", ")));
        }
        if !self.preferences.is_empty() {
            let prefs: Vec<String> = self
                .preferences
                .iter()
                .map(|(name, p)| format!("{}={} ({:.2})", name, p.value, p.strength))
                .collect();
            out.push_str(&format!("[preferences] {}\n", prefs.join(", ")));
        }
        if !self.skills.is_empty() {
            let mut skills: Vec<&str> = self.skills.iter().map(String::as_str).collect();
            skills.sort();
            out.push_str(&format!("[skills] {}\n", skills.join(", ")));
        }
        if !self.emotions.is_empty() {
            let emotions: Vec<String> = self
                .emotions
                .iter()
                .map(|(name, intensity)| format!("{}={:.2}", name, intensity))
                .collect();
            out.push_str(&format!("[emotions] {}\n", emotions.join(", ")));
        }
        out.push_str(&format!(
            "[learning] rewards={} punishments={} q_entries={}",
            self.reward_log.len(),
            self.punishment_log.len(),
            self.q_table.len()
        ));
        out
    }

    /// Produce the persistence form: a clone with each unbounded log
    /// truncated to its retention limit (most recent entries win).
    pub fn to_persistable(&self) -> ModelMemory {
        let mut copy = self.clone();
        truncate_front(&mut copy.reward_log, LOG_RETENTION);
        truncate_front(&mut copy.punishment_log, LOG_RETENTION);
        truncate_front(&mut copy.structured_memory, STRUCTURED_RETENTION);
        copy
    }
}

fn truncate_front<T>(log: &mut Vec<T>, keep: usize) {
    if log.len() > keep {
        log.drain(..log.len() - keep);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn q_update_on_fresh_memory_is_alpha_times_reward() {
        let mut memory = ModelMemory::new("a1");
        memory.apply_reinforcement("answer_briefly", 1.0, "greeting");
        let expected = memory.learning_rate * 1.0;
        assert!((memory.q_value("greeting", "answer_briefly") - expected).abs() < 1e-12);
    }

    #[test]
    fn q_update_uses_max_next_q() {
        let mut memory = ModelMemory::new("a1");
        memory.learning_rate = 0.5;
        memory.discount_factor = 0.9;
        memory.apply_reinforcement("a", 1.0, "s"); // Q[s,a] = 0.5
        memory.apply_reinforcement("b", 1.0, "s");
        // Q[s,b] = 0 + 0.5·(1 + 0.9·0.5 − 0) = 0.725
        assert!((memory.q_value("s", "b") - 0.725).abs() < 1e-12);
    }

    #[test]
    fn rewards_and_punishments_land_in_separate_logs() {
        let mut memory = ModelMemory::new("a1");
        memory.apply_reinforcement("a", 0.8, "s");
        memory.apply_reinforcement("a", -0.3, "s");
        assert_eq!(memory.reward_log.len(), 1);
        assert_eq!(memory.punishment_log.len(), 1);
        assert!((memory.punishment_log[0].magnitude - 0.3).abs() < 1e-12);
    }

    #[test]
    fn reinforcement_shifts_preference_strength() {
        let mut memory = ModelMemory::new("a1");
        memory.add_preference("concise", "short answers", 0.5, "chat");
        memory.apply_reinforcement("concise", 1.0, "s");
        let strength = memory.preferences["concise"].strength;
        assert!((strength - (0.5 + memory.learning_rate)).abs() < 1e-12);
    }

    #[test]
    fn emotions_boost_and_decay() {
        let mut memory = ModelMemory::new("a1");
        memory.emotions.insert("curiosity".into(), 1.0);
        memory.apply_reinforcement("a", 1.0, "s");
        assert!((memory.emotions["satisfaction"] - 0.5).abs() < 1e-12);
        assert!((memory.emotions["curiosity"] - 0.95).abs() < 1e-12);

        memory.apply_reinforcement("a", -1.0, "s");
        assert!((memory.emotions["frustration"] - 0.5).abs() < 1e-12);
        // Satisfaction decayed once.
        assert!((memory.emotions["satisfaction"] - 0.475).abs() < 1e-12);
    }

    #[test]
    fn greedy_selection_prefers_highest_q() {
        let mut memory = ModelMemory::new("a1");
        memory.exploration_rate = 0.0;
        memory.apply_reinforcement("good", 1.0, "s");
        memory.apply_reinforcement("bad", -1.0, "s");
        let actions = vec!["bad".to_string(), "good".to_string()];
        assert_eq!(memory.select_action("s", &actions).unwrap(), "good");
    }

    #[test]
    fn greedy_ties_pick_the_first_listed() {
        let mut memory = ModelMemory::new("a1");
        memory.exploration_rate = 0.0;
        let actions = vec!["x".to_string(), "y".to_string()];
        assert_eq!(memory.select_action("fresh", &actions).unwrap(), "x");
    }

    #[test]
    fn confidence_and_strength_are_clamped() {
        let mut memory = ModelMemory::new("a1");
        memory.add_trait("bold", "very", 1.7);
        assert_eq!(memory.traits["bold"].confidence, 1.0);
        memory.add_preference("p", "v", -0.4, "ctx");
        assert_eq!(memory.preferences["p"].strength, 0.0);
    }

    #[test]
    fn persistable_form_truncates_logs() {
        let mut memory = ModelMemory::new("a1");
        for i in 0..150 {
            memory.apply_reinforcement("a", 1.0, &format!("s{}", i));
            memory.remember(format!("note {}", i));
        }
        let persisted = memory.to_persistable();
        assert_eq!(persisted.reward_log.len(), LOG_RETENTION);
        assert_eq!(persisted.structured_memory.len(), 150);
        // The newest entries survive.
        assert_eq!(persisted.reward_log.last().unwrap().state, "s149");
    }

    #[test]
    fn summary_carries_tagged_sections() {
        let mut memory = ModelMemory::new("a1");
        memory.add_trait("tone", "direct", 0.9);
        memory.add_skill("rust");
        let summary = memory.summary();
        assert!(summary.contains("[traits]"));
        assert!(summary.contains("[skills] rust"));
        assert!(summary.contains("[learning]"));
    }

    #[test]
    fn round_trip_serialization_preserves_structure() {
        let mut memory = ModelMemory::new("a1");
        memory.add_trait("tone", "direct", 0.9);
        memory.add_preference("concise", "short", 0.4, "chat");
        memory.apply_reinforcement("concise", 0.6, "greeting");

        let json = serde_json::to_string(&memory.to_persistable()).unwrap();
        let loaded: ModelMemory = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.agent_id, "a1");
        assert_eq!(loaded.traits["tone"].value, "direct");
        assert!(
            (loaded.q_value("greeting", "concise") - memory.q_value("greeting", "concise")).abs()
                < 1e-12
        );
    }
}
