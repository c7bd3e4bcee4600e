//! Response cache keyed by a canonical request fingerprint.
//!
//! The fingerprint is a SHA-256 digest over a canonical rendering of the
//! cache-relevant request fields only: model, the `(role, content)` pairs of
//! the message list, and the sampling parameters. Nonces, user ids, agent
//! tags, and timestamps never enter the digest, so two requests that differ
//! only in those always collide on the same entry.
//!
//! Entries expire after a TTL (checked lazily on read and by a periodic
//! sweep) and the least-recently-accessed entry is evicted when the cache is
//! at capacity. The whole cache can be disabled by configuration, in which
//! case `get` always misses and `put` is a no-op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::ensemble::client_wrapper::{ChatMessage, ProviderResponse, Role, SamplingParams};

/// Configuration for the response cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Master switch; a disabled cache misses on every read.
    pub enabled: bool,
    /// Time-to-live for entries.
    pub ttl: Duration,
    /// Maximum entry count before LRU eviction.
    pub max_size: usize,
    /// Period of the background sweep that removes expired entries.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(300),
            max_size: 1_000,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

struct CacheEntry {
    response: ProviderResponse,
    model: String,
    inserted_at: Instant,
    last_accessed_at: Instant,
}

/// Fingerprint → response cache with TTL and LRU eviction.
pub struct ResponseCache {
    config: CacheConfig,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Compute the canonical fingerprint for a request.
    ///
    /// Field order is fixed here, so the digest cannot depend on any map
    /// insertion order upstream. Changing any sampling parameter changes
    /// the digest.
    pub fn fingerprint(model: &str, messages: &[ChatMessage], params: &SamplingParams) -> String {
        let mut hasher = Sha256::new();
        hasher.update(model.as_bytes());
        hasher.update([0u8]);
        for msg in messages {
            let role = match msg.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            hasher.update(role.as_bytes());
            hasher.update([0x1f]);
            hasher.update(msg.content.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(params.temperature.to_bits().to_le_bytes());
        hasher.update(params.top_p.to_bits().to_le_bytes());
        hasher.update(params.max_output_tokens.to_le_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Look up a fingerprint. Hits refresh `last_accessed_at`; entries past
    /// their TTL are removed and reported as misses.
    pub fn get(&self, fingerprint: &str) -> Option<ProviderResponse> {
        if !self.config.enabled {
            return None;
        }
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let expired = entries
            .get(fingerprint)
            .map(|e| e.inserted_at.elapsed() > self.config.ttl)
            .unwrap_or(false);
        if expired {
            entries.remove(fingerprint);
            return None;
        }
        entries.get_mut(fingerprint).map(|entry| {
            entry.last_accessed_at = Instant::now();
            entry.response.clone()
        })
    }

    /// Insert a response, evicting the least-recently-accessed entry when
    /// at capacity. No-op when the cache is disabled.
    pub fn put(&self, fingerprint: String, model: &str, response: ProviderResponse) {
        if !self.config.enabled {
            return;
        }
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        if entries.len() >= self.config.max_size && !entries.contains_key(&fingerprint) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.last_accessed_at)
                .map(|(key, _)| key.clone());
            if let Some(key) = oldest {
                entries.remove(&key);
            }
        }
        let now = Instant::now();
        entries.insert(
            fingerprint,
            CacheEntry {
                response,
                model: model.to_string(),
                inserted_at: now,
                last_accessed_at: now,
            },
        );
    }

    /// Remove every TTL-expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let before = entries.len();
        let ttl = self.config.ttl;
        entries.retain(|_, e| e.inserted_at.elapsed() <= ttl);
        before - entries.len()
    }

    /// Current entry count.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count of entries cached for a given model.
    pub fn entries_for_model(&self, model: &str) -> usize {
        self.entries
            .lock()
            .expect("cache lock poisoned")
            .values()
            .filter(|e| e.model == model)
            .count()
    }

    /// Spawn the periodic sweep task. The task stops when the cache handle
    /// is dropped everywhere else.
    pub fn spawn_sweeper(cache: Arc<ResponseCache>) -> tokio::task::JoinHandle<()> {
        let interval = cache.config.sweep_interval;
        tokio::spawn(async move {
            let cache = Arc::downgrade(&cache);
            loop {
                tokio::time::sleep(interval).await;
                match cache.upgrade() {
                    Some(cache) => {
                        let removed = cache.sweep();
                        if removed > 0 {
                            log::debug!("cache sweep removed {} expired entries", removed);
                        }
                    }
                    None => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::client_wrapper::Role;

    fn response(text: &str) -> ProviderResponse {
        ProviderResponse {
            content: text.into(),
            usage: None,
            tool_calls: vec![],
        }
    }

    fn messages(text: &str) -> Vec<ChatMessage> {
        vec![ChatMessage::new(Role::User, text)]
    }

    #[test]
    fn get_returns_prior_put_within_ttl() {
        let cache = ResponseCache::new(CacheConfig::default());
        let fp = ResponseCache::fingerprint("m1", &messages("hi"), &SamplingParams::default());
        cache.put(fp.clone(), "m1", response("hello"));
        assert_eq!(cache.get(&fp).unwrap().content, "hello");
    }

    #[test]
    fn expired_entries_miss_and_are_removed() {
        let cache = ResponseCache::new(CacheConfig {
            ttl: Duration::from_millis(1),
            ..Default::default()
        });
        let fp = ResponseCache::fingerprint("m1", &messages("hi"), &SamplingParams::default());
        cache.put(fp.clone(), "m1", response("hello"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&fp).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn lru_eviction_drops_least_recently_accessed() {
        let cache = ResponseCache::new(CacheConfig {
            max_size: 2,
            ..Default::default()
        });
        let fp_a = ResponseCache::fingerprint("m", &messages("a"), &SamplingParams::default());
        let fp_b = ResponseCache::fingerprint("m", &messages("b"), &SamplingParams::default());
        let fp_c = ResponseCache::fingerprint("m", &messages("c"), &SamplingParams::default());

        cache.put(fp_a.clone(), "m", response("A"));
        std::thread::sleep(Duration::from_millis(2));
        cache.put(fp_b.clone(), "m", response("B"));
        std::thread::sleep(Duration::from_millis(2));
        // Touch A so B becomes the least recently accessed.
        let _ = cache.get(&fp_a);
        std::thread::sleep(Duration::from_millis(2));
        cache.put(fp_c.clone(), "m", response("C"));

        assert!(cache.get(&fp_a).is_some());
        assert!(cache.get(&fp_b).is_none());
        assert!(cache.get(&fp_c).is_some());
    }

    #[test]
    fn fingerprint_ignores_agent_tags_and_call_ids() {
        let params = SamplingParams::default();
        let mut tagged = messages("same text");
        tagged[0].agent_name = Some("Echo".into());
        tagged[0].tool_call_id = Some("call_1".into());
        assert_eq!(
            ResponseCache::fingerprint("m", &messages("same text"), &params),
            ResponseCache::fingerprint("m", &tagged, &params),
        );
    }

    #[test]
    fn fingerprint_changes_with_any_sampling_parameter() {
        let base = SamplingParams::default();
        let msgs = messages("hi");
        let fp = ResponseCache::fingerprint("m", &msgs, &base);

        let mut hotter = base.clone();
        hotter.temperature += 0.1;
        assert_ne!(fp, ResponseCache::fingerprint("m", &msgs, &hotter));

        let mut narrower = base.clone();
        narrower.top_p = 0.5;
        assert_ne!(fp, ResponseCache::fingerprint("m", &msgs, &narrower));

        let mut shorter = base.clone();
        shorter.max_output_tokens = 16;
        assert_ne!(fp, ResponseCache::fingerprint("m", &msgs, &shorter));

        // The repetition penalty is not part of the fingerprint contract.
        let mut penalized = base;
        penalized.repetition_penalty = 1.5;
        assert_eq!(fp, ResponseCache::fingerprint("m", &msgs, &penalized));
    }

    #[test]
    fn disabled_cache_never_hits() {
        let cache = ResponseCache::new(CacheConfig {
            enabled: false,
            ..Default::default()
        });
        let fp = ResponseCache::fingerprint("m", &messages("hi"), &SamplingParams::default());
        cache.put(fp.clone(), "m", response("hello"));
        assert!(cache.get(&fp).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let cache = ResponseCache::new(CacheConfig {
            ttl: Duration::from_millis(20),
            ..Default::default()
        });
        let fp_old = ResponseCache::fingerprint("m", &messages("old"), &SamplingParams::default());
        cache.put(fp_old, "m", response("old"));
        std::thread::sleep(Duration::from_millis(25));
        let fp_new = ResponseCache::fingerprint("m", &messages("new"), &SamplingParams::default());
        cache.put(fp_new.clone(), "m", response("new"));

        assert_eq!(cache.sweep(), 1);
        assert!(cache.get(&fp_new).is_some());
    }
}
