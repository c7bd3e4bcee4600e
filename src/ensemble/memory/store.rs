//! Ownership and persistence for the three memory tiers.
//!
//! The [`MemoryStore`] owns every Model Memory (keyed by agent id), every
//! Conversation Memory (keyed by session id), and the single process-wide
//! Meta Memory. Callers mutate memories through short closures run under
//! the per-tier lock; nothing holds a memory lock across an await point.
//!
//! Persistence is four JSON documents in a directory:
//! `model-memories.json`, `conversation-memories.json` (trimmed to the
//! most recent sessions), `meta-memory.json`, and `prompts.json` (written
//! by the prompt assembler). They are read on init, written by the
//! periodic auto-save task and on graceful shutdown. The store assumes no
//! transactional semantics — last write wins.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::ensemble::memory::conversation::ConversationMemory;
use crate::ensemble::memory::meta::MetaMemory;
use crate::ensemble::memory::model::ModelMemory;

/// Sessions retained in `conversation-memories.json`.
const SESSION_RETENTION: usize = 50;

/// Owner of the three memory tiers.
pub struct MemoryStore {
    dir: Option<PathBuf>,
    model: Mutex<HashMap<String, ModelMemory>>,
    conversations: Mutex<HashMap<String, ConversationMemory>>,
    meta: Mutex<MetaMemory>,
}

impl MemoryStore {
    /// Create an in-memory store with no persistence directory.
    pub fn ephemeral() -> Self {
        Self {
            dir: None,
            model: Mutex::new(HashMap::new()),
            conversations: Mutex::new(HashMap::new()),
            meta: Mutex::new(MetaMemory::new()),
        }
    }

    /// Open a store backed by `dir`, loading any existing documents.
    /// Missing or unreadable documents start their tier empty.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let model = load_json::<HashMap<String, ModelMemory>>(&dir.join("model-memories.json"))
            .unwrap_or_default();
        let conversations =
            load_json::<HashMap<String, ConversationMemory>>(&dir.join("conversation-memories.json"))
                .unwrap_or_default();
        let meta = load_json::<MetaMemory>(&dir.join("meta-memory.json")).unwrap_or_default();
        Self {
            dir: Some(dir),
            model: Mutex::new(model),
            conversations: Mutex::new(conversations),
            meta: Mutex::new(meta),
        }
    }

    /// Run `f` with the agent's Model Memory, creating it on first use.
    pub fn with_model_memory<R>(&self, agent_id: &str, f: impl FnOnce(&mut ModelMemory) -> R) -> R {
        let mut map = self.model.lock().expect("model memory lock poisoned");
        let memory = map
            .entry(agent_id.to_string())
            .or_insert_with(|| ModelMemory::new(agent_id));
        f(memory)
    }

    /// Run `f` with the session's Conversation Memory, creating it on
    /// first use.
    pub fn with_conversation<R>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut ConversationMemory) -> R,
    ) -> R {
        let mut map = self
            .conversations
            .lock()
            .expect("conversation memory lock poisoned");
        let memory = map
            .entry(session_id.to_string())
            .or_insert_with(|| ConversationMemory::new(session_id));
        f(memory)
    }

    /// Run `f` with the process-wide Meta Memory.
    pub fn with_meta<R>(&self, f: impl FnOnce(&mut MetaMemory) -> R) -> R {
        let mut meta = self.meta.lock().expect("meta memory lock poisoned");
        f(&mut meta)
    }

    /// Drop a session's Conversation Memory (session close or idle expiry).
    pub fn destroy_conversation(&self, session_id: &str) {
        self.conversations
            .lock()
            .expect("conversation memory lock poisoned")
            .remove(session_id);
    }

    /// Count of live conversation memories.
    pub fn conversation_count(&self) -> usize {
        self.conversations
            .lock()
            .expect("conversation memory lock poisoned")
            .len()
    }

    /// Write all tiers to disk. No-op for ephemeral stores.
    pub fn save(&self) -> std::io::Result<()> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        std::fs::create_dir_all(dir)?;

        let model: BTreeMap<String, ModelMemory> = self
            .model
            .lock()
            .expect("model memory lock poisoned")
            .iter()
            .map(|(id, memory)| (id.clone(), memory.to_persistable()))
            .collect();
        write_json(&dir.join("model-memories.json"), &model)?;

        // Keep only the most recently active sessions.
        let conversations = self
            .conversations
            .lock()
            .expect("conversation memory lock poisoned");
        let mut by_recency: Vec<(&String, &ConversationMemory)> = conversations.iter().collect();
        by_recency.sort_by_key(|(_, memory)| {
            std::cmp::Reverse(memory.timeline.last().map(|entry| entry.at))
        });
        let trimmed: BTreeMap<&String, &ConversationMemory> =
            by_recency.into_iter().take(SESSION_RETENTION).collect();
        write_json(&dir.join("conversation-memories.json"), &trimmed)?;
        drop(conversations);

        let meta = self.meta.lock().expect("meta memory lock poisoned");
        write_json(&dir.join("meta-memory.json"), &*meta)?;
        Ok(())
    }

    /// Spawn the periodic auto-save task. The task stops when the store
    /// handle is dropped everywhere else.
    pub fn spawn_auto_save(
        store: Arc<MemoryStore>,
        interval: std::time::Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let store = Arc::downgrade(&store);
            loop {
                tokio::time::sleep(interval).await;
                match store.upgrade() {
                    Some(store) => {
                        if let Err(e) = store.save() {
                            log::warn!("memory auto-save failed: {}", e);
                        }
                    }
                    None => break,
                }
            }
        })
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    let data = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&data) {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("ignoring unreadable memory document {}: {}", path.display(), e);
            None
        }
    }
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let data = serde_json::to_string_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, data)
}
