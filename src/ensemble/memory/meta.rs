//! Process-wide Meta Memory: user profile, collaboration goals, shared
//! understanding, and the system-effectiveness EMA.
//!
//! One instance lives for the process; sessions read and append through the
//! memory subsystem. All append-style collections are timestamped and
//! append-only; goal completion moves goals between lists rather than
//! deleting them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which list a goal belongs to while active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GoalScope {
    ShortTerm,
    LongTerm,
}

/// A collaboration goal with tracked progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub text: String,
    pub scope: GoalScope,
    /// Progress percentage in `[0, 100]`.
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A shared fact with provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedFact {
    pub confidence: f64,
    pub sources: Vec<String>,
    pub at: DateTime<Utc>,
}

/// A shared concept definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConcept {
    pub definition: String,
    pub examples: Vec<String>,
    pub at: DateTime<Utc>,
}

/// A recorded decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub text: String,
    pub participants: Vec<String>,
    pub reasoning: String,
    pub at: DateTime<Utc>,
}

/// The user profile accumulated across sessions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserProfile {
    pub preferences: BTreeMap<String, String>,
    pub goals: Vec<String>,
    pub highlights: Vec<String>,
    pub context: BTreeMap<String, String>,
}

/// A partial profile update; present fields merge into the profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserProfilePatch {
    pub preferences: BTreeMap<String, String>,
    pub goals: Vec<String>,
    pub highlights: Vec<String>,
    pub context: BTreeMap<String, String>,
}

/// Inputs to the effectiveness score.
#[derive(Debug, Clone, Copy)]
pub struct EffectivenessSample {
    /// Fraction of consensus attempts that reached consensus, `[0, 1]`.
    pub consensus_rate: f64,
    /// Mean goal progress, `[0, 1]`.
    pub goal_progress: f64,
    /// Participation balance across agents, `[0, 1]`.
    pub participation_balance: f64,
}

/// Process-wide shared memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaMemory {
    pub user_profile: UserProfile,
    pub short_term_goals: Vec<Goal>,
    pub long_term_goals: Vec<Goal>,
    pub completed_goals: Vec<Goal>,
    pub facts: BTreeMap<String, SharedFact>,
    pub concepts: BTreeMap<String, SharedConcept>,
    pub decisions: Vec<Decision>,
    pub principles: Vec<String>,
    /// Exponential moving average of collaboration effectiveness, `[0, 1]`.
    pub effectiveness: f64,
}

impl Default for MetaMemory {
    fn default() -> Self {
        Self {
            user_profile: UserProfile::default(),
            short_term_goals: Vec::new(),
            long_term_goals: Vec::new(),
            completed_goals: Vec::new(),
            facts: BTreeMap::new(),
            concepts: BTreeMap::new(),
            decisions: Vec::new(),
            principles: Vec::new(),
            effectiveness: 0.5,
        }
    }
}

impl MetaMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a profile patch: preferences and context shallow-merge, goals
    /// and highlights append.
    pub fn update_user_profile(&mut self, patch: UserProfilePatch) {
        self.user_profile.preferences.extend(patch.preferences);
        self.user_profile.goals.extend(patch.goals);
        self.user_profile.highlights.extend(patch.highlights);
        self.user_profile.context.extend(patch.context);
    }

    /// Add a goal to the given scope with zero progress. Returns its id.
    pub fn add_goal(&mut self, text: impl Into<String>, scope: GoalScope) -> String {
        let goal = Goal {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            scope,
            progress: 0.0,
            created_at: Utc::now(),
            completed_at: None,
        };
        let id = goal.id.clone();
        match scope {
            GoalScope::ShortTerm => self.short_term_goals.push(goal),
            GoalScope::LongTerm => self.long_term_goals.push(goal),
        }
        id
    }

    /// Update a goal's progress (clamped to `[0, 100]`). Reaching 100 moves
    /// the goal to the completed list and stamps `completed_at`. Returns
    /// false when the id matches no active goal.
    pub fn update_goal_progress(&mut self, id: &str, percent: f64) -> bool {
        let percent = percent.clamp(0.0, 100.0);
        for list in [&mut self.short_term_goals, &mut self.long_term_goals] {
            if let Some(idx) = list.iter().position(|g| g.id == id) {
                if percent >= 100.0 {
                    let mut goal = list.remove(idx);
                    goal.progress = 100.0;
                    goal.completed_at = Some(Utc::now());
                    self.completed_goals.push(goal);
                } else {
                    list[idx].progress = percent;
                }
                return true;
            }
        }
        false
    }

    /// Record a shared fact (append-only; re-adding a fact overwrites its
    /// confidence and sources with the newer observation).
    pub fn add_shared_fact(
        &mut self,
        text: impl Into<String>,
        confidence: f64,
        sources: Vec<String>,
    ) {
        self.facts.insert(
            text.into(),
            SharedFact {
                confidence: confidence.clamp(0.0, 1.0),
                sources,
                at: Utc::now(),
            },
        );
    }

    /// Record a shared concept.
    pub fn add_shared_concept(
        &mut self,
        name: impl Into<String>,
        definition: impl Into<String>,
        examples: Vec<String>,
    ) {
        self.concepts.insert(
            name.into(),
            SharedConcept {
                definition: definition.into(),
                examples,
                at: Utc::now(),
            },
        );
    }

    /// Record a decision.
    pub fn add_decision(
        &mut self,
        text: impl Into<String>,
        participants: Vec<String>,
        reasoning: impl Into<String>,
    ) {
        self.decisions.push(Decision {
            text: text.into(),
            participants,
            reasoning: reasoning.into(),
            at: Utc::now(),
        });
    }

    /// Record a collaboration principle.
    pub fn add_principle(&mut self, text: impl Into<String>) {
        self.principles.push(text.into());
    }

    /// Blend a new effectiveness sample into the EMA:
    /// `score = 0.3·consensus + 0.4·goals + 0.3·balance`, then
    /// `effectiveness ← 0.7·effectiveness + 0.3·score`.
    pub fn update_effectiveness(&mut self, sample: EffectivenessSample) -> f64 {
        let score = 0.3 * sample.consensus_rate
            + 0.4 * sample.goal_progress
            + 0.3 * sample.participation_balance;
        self.effectiveness = 0.7 * self.effectiveness + 0.3 * score;
        self.effectiveness
    }

    /// Mean progress of active goals in `[0, 1]`; 1.0 when none are active.
    pub fn mean_goal_progress(&self) -> f64 {
        let active: Vec<&Goal> = self
            .short_term_goals
            .iter()
            .chain(self.long_term_goals.iter())
            .collect();
        if active.is_empty() {
            return 1.0;
        }
        active.iter().map(|g| g.progress / 100.0).sum::<f64>() / active.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn goal_lifecycle_moves_to_completed() {
        let mut memory = MetaMemory::new();
        let id = memory.add_goal("ship the gateway", GoalScope::ShortTerm);

        assert!(memory.update_goal_progress(&id, 40.0));
        assert_eq!(memory.short_term_goals[0].progress, 40.0);

        assert!(memory.update_goal_progress(&id, 120.0));
        assert!(memory.short_term_goals.is_empty());
        assert_eq!(memory.completed_goals.len(), 1);
        assert!(memory.completed_goals[0].completed_at.is_some());
        assert_eq!(memory.completed_goals[0].progress, 100.0);

        // The id no longer matches an active goal.
        assert!(!memory.update_goal_progress(&id, 10.0));
    }

    #[test]
    fn profile_patch_merges_and_appends() {
        let mut memory = MetaMemory::new();
        memory.update_user_profile(UserProfilePatch {
            preferences: [("style".to_string(), "terse".to_string())].into(),
            goals: vec!["learn rust".into()],
            ..Default::default()
        });
        memory.update_user_profile(UserProfilePatch {
            preferences: [("style".to_string(), "verbose".to_string())].into(),
            goals: vec!["ship v1".into()],
            ..Default::default()
        });
        assert_eq!(memory.user_profile.preferences["style"], "verbose");
        assert_eq!(memory.user_profile.goals.len(), 2);
    }

    #[test]
    fn effectiveness_blends_as_ema() {
        let mut memory = MetaMemory::new();
        let value = memory.update_effectiveness(EffectivenessSample {
            consensus_rate: 1.0,
            goal_progress: 1.0,
            participation_balance: 1.0,
        });
        // 0.7·0.5 + 0.3·1.0
        assert!((value - 0.65).abs() < 1e-12);
    }

    #[test]
    fn round_trip_serialization_preserves_structure() {
        let mut memory = MetaMemory::new();
        memory.add_shared_fact("integration is key", 0.9, vec!["a1".into(), "a2".into()]);
        memory.add_shared_concept("breaker", "a three-state gate", vec!["OPEN".into()]);
        memory.add_decision("use websockets", vec!["a1".into()], "bidirectional events");
        let id = memory.add_goal("agree on the schema", GoalScope::LongTerm);
        memory.update_goal_progress(&id, 30.0);

        let json = serde_json::to_string(&memory).unwrap();
        let loaded: MetaMemory = serde_json::from_str(&json).unwrap();
        assert!(loaded.facts.contains_key("integration is key"));
        assert_eq!(loaded.long_term_goals[0].progress, 30.0);
        assert_eq!(loaded.decisions.len(), 1);
    }
}
