//! Prompt assembly: collective, scenario, and individual layers merged
//! into one system prompt per agent per turn.
//!
//! The final prompt is the concatenation, in order, of:
//!
//! 1. the **collective** template shared by all agents, with
//!    `{{userContext}}`, `{{currentGoals}}`, `{{sharedKnowledge}}`, and
//!    `{{sessionContext}}` substituted from Meta and Conversation memory;
//! 2. an optional **scenario** template chosen by the orchestrator for the
//!    turn (consensus, creativity, analysis, learning, collaboration);
//! 3. the agent's **individual** template with `{{agentName}}`, `{{role}}`,
//!    `{{expertise}}`, `{{style}}`, `{{personalityTraits}}`,
//!    `{{preferences}}`, `{{emotionalState}}`, and
//!    `{{specialInstructions}}` substituted from its Model Memory.
//!
//! Placeholders with no value are stripped. The assembler keeps a version
//! counter and an append-only history per agent; [`PromptAssembler::validate`]
//! rejects prompts over 10 000 characters or with residual placeholders.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ensemble::error::LlmError;

/// Hard cap on an assembled prompt.
const MAX_PROMPT_CHARS: usize = 10_000;

/// Scenario templates selectable per turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scenario {
    Consensus,
    Creativity,
    Analysis,
    Learning,
    Collaboration,
}

impl Scenario {
    fn template(self) -> &'static str {
        match self {
            Scenario::Consensus => {
                "The group is working toward consensus. State your position clearly, \
                 acknowledge points you agree with, and flag real disagreements."
            }
            Scenario::Creativity => {
                "This is a divergent-thinking round. Prefer novel angles over safe \
                 summaries; build on other agents' ideas rather than repeating them."
            }
            Scenario::Analysis => {
                "This is an analysis round. Be precise, cite the evidence available \
                 in the conversation, and separate facts from speculation."
            }
            Scenario::Learning => {
                "This is a learning session. Explain reasoning step by step and \
                 define terms the user may not know."
            }
            Scenario::Collaboration => {
                "Work as one team: divide the problem, reference other agents' \
                 contributions by name, and converge on a joint answer."
            }
        }
    }
}

/// Values substituted into the collective layer.
#[derive(Debug, Clone, Default)]
pub struct CollectiveContext {
    pub user_context: Option<String>,
    pub current_goals: Option<String>,
    pub shared_knowledge: Option<String>,
    pub session_context: Option<String>,
}

/// Values substituted into an agent's individual layer.
#[derive(Debug, Clone, Default)]
pub struct IndividualContext {
    pub agent_name: Option<String>,
    pub role: Option<String>,
    pub expertise: Option<String>,
    pub style: Option<String>,
    pub personality_traits: Option<String>,
    pub preferences: Option<String>,
    pub emotional_state: Option<String>,
    pub special_instructions: Option<String>,
}

/// One historical assembly for an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptRecord {
    pub version: u64,
    pub prompt: String,
    pub at: DateTime<Utc>,
}

/// The assembler: templates plus per-agent history.
pub struct PromptAssembler {
    collective_template: String,
    individual_templates: HashMap<String, String>,
    version: u64,
    history: BTreeMap<String, Vec<PromptRecord>>,
}

const DEFAULT_COLLECTIVE: &str = "You are part of a multi-agent team answering one user.\n\
{{userContext}}\n{{currentGoals}}\n{{sharedKnowledge}}\n{{sessionContext}}";

const DEFAULT_INDIVIDUAL: &str = "You are {{agentName}}, acting as {{role}}.\n\
Expertise: {{expertise}}\nStyle: {{style}}\nPersonality: {{personalityTraits}}\n\
Preferences: {{preferences}}\nEmotional state: {{emotionalState}}\n{{specialInstructions}}";

impl PromptAssembler {
    pub fn new() -> Self {
        Self {
            collective_template: DEFAULT_COLLECTIVE.to_string(),
            individual_templates: HashMap::new(),
            version: 0,
            history: BTreeMap::new(),
        }
    }

    /// Replace the collective template (builder pattern).
    pub fn with_collective_template(mut self, template: impl Into<String>) -> Self {
        self.collective_template = template.into();
        self
    }

    /// Install a per-agent individual template; agents without one use the
    /// default. Pipeline stages use this slot for their stage prompt.
    pub fn set_individual_template(&mut self, agent_id: &str, template: impl Into<String>) {
        self.individual_templates
            .insert(agent_id.to_string(), template.into());
    }

    /// Assemble the system prompt for one agent and one turn.
    ///
    /// Bumps the version counter and appends the result to the agent's
    /// history.
    pub fn assemble(
        &mut self,
        agent_id: &str,
        scenario: Option<Scenario>,
        collective: &CollectiveContext,
        individual: &IndividualContext,
    ) -> String {
        let mut collective_vars: HashMap<&str, Option<&str>> = HashMap::new();
        collective_vars.insert("userContext", collective.user_context.as_deref());
        collective_vars.insert("currentGoals", collective.current_goals.as_deref());
        collective_vars.insert("sharedKnowledge", collective.shared_knowledge.as_deref());
        collective_vars.insert("sessionContext", collective.session_context.as_deref());

        let mut individual_vars: HashMap<&str, Option<&str>> = HashMap::new();
        individual_vars.insert("agentName", individual.agent_name.as_deref());
        individual_vars.insert("role", individual.role.as_deref());
        individual_vars.insert("expertise", individual.expertise.as_deref());
        individual_vars.insert("style", individual.style.as_deref());
        individual_vars.insert("personalityTraits", individual.personality_traits.as_deref());
        individual_vars.insert("preferences", individual.preferences.as_deref());
        individual_vars.insert("emotionalState", individual.emotional_state.as_deref());
        individual_vars.insert(
            "specialInstructions",
            individual.special_instructions.as_deref(),
        );

        let mut parts = Vec::with_capacity(3);
        parts.push(substitute(&self.collective_template, &collective_vars));
        if let Some(scenario) = scenario {
            parts.push(scenario.template().to_string());
        }
        let individual_template = self
            .individual_templates
            .get(agent_id)
            .map(String::as_str)
            .unwrap_or(DEFAULT_INDIVIDUAL);
        parts.push(substitute(individual_template, &individual_vars));

        let prompt = parts
            .into_iter()
            .filter(|p| !p.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");

        self.version += 1;
        self.history
            .entry(agent_id.to_string())
            .or_default()
            .push(PromptRecord {
                version: self.version,
                prompt: prompt.clone(),
                at: Utc::now(),
            });
        prompt
    }

    /// Reject prompts over the length cap or with residual placeholders.
    pub fn validate(prompt: &str) -> Result<(), LlmError> {
        if prompt.len() > MAX_PROMPT_CHARS {
            return Err(LlmError::Validation(format!(
                "assembled prompt is {} chars (limit {})",
                prompt.len(),
                MAX_PROMPT_CHARS
            )));
        }
        if let Some(start) = prompt.find("{{") {
            let tail = &prompt[start..];
            let name: String = tail
                .chars()
                .skip(2)
                .take_while(|c| *c != '}')
                .collect();
            return Err(LlmError::Validation(format!(
                "assembled prompt contains unresolved placeholder '{{{{{}}}}}'",
                name
            )));
        }
        Ok(())
    }

    /// Monotonic assembly counter.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The append-only assembly history for an agent.
    pub fn history(&self, agent_id: &str) -> &[PromptRecord] {
        self.history
            .get(agent_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The full history map, for `prompts.json` persistence.
    pub fn history_snapshot(&self) -> &BTreeMap<String, Vec<PromptRecord>> {
        &self.history
    }

    /// Write the assembly history to `prompts.json` under `dir`.
    ///
    /// Called alongside [`MemoryStore::save`](crate::ensemble::memory::MemoryStore::save)
    /// on auto-save and graceful shutdown; last write wins.
    pub fn save_history(&self, dir: &std::path::Path) -> std::io::Result<()> {
        std::fs::create_dir_all(dir)?;
        let data = serde_json::to_string_pretty(&self.history)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(dir.join("prompts.json"), data)
    }

    /// Load a previously saved history, continuing the version counter
    /// from the highest recorded version.
    pub fn load_history(&mut self, dir: &std::path::Path) -> std::io::Result<()> {
        let data = std::fs::read_to_string(dir.join("prompts.json"))?;
        let history: BTreeMap<String, Vec<PromptRecord>> = serde_json::from_str(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.version = history
            .values()
            .flat_map(|records| records.iter().map(|r| r.version))
            .max()
            .unwrap_or(0);
        self.history = history;
        Ok(())
    }
}

impl Default for PromptAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Replace `{{name}}` with its value, or strip the placeholder (and any
/// line left empty by the removal).
fn substitute(template: &str, vars: &HashMap<&str, Option<&str>>) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        let placeholder = format!("{{{{{}}}}}", name);
        out = out.replace(&placeholder, value.unwrap_or(""));
    }
    out.lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
