//! Credential resolution for provider clients.
//!
//! The core never stores raw API keys next to agent or session state.
//! Agents carry an opaque credential *reference*; a [`CredentialProvider`]
//! resolves it to the actual secret at client-construction time. Backends
//! are pluggable — the crate ships an environment-variable backend and an
//! in-memory one; encrypted-file or external secret-store backends
//! implement the same trait.
//!
//! Resolved secrets must never be logged; implementations return them to
//! the caller and nothing else.

use std::collections::HashMap;

use crate::ensemble::error::LlmError;

/// Resolves opaque credential references to provider secrets.
pub trait CredentialProvider: Send + Sync {
    /// Resolve the credential for a provider.
    ///
    /// `reference` is an optional per-agent override (e.g. an env-var name
    /// or a vault path); `None` asks for the provider's default credential.
    fn resolve(&self, provider: &str, reference: Option<&str>) -> Result<String, LlmError>;
}

/// Resolves credentials from environment variables.
///
/// The default variable per provider is `<PROVIDER>_API_KEY` upper-cased
/// (`OPENAI_API_KEY`, `CLAUDE_API_KEY`, ...). A reference, when present,
/// names the variable directly.
pub struct EnvCredentialProvider;

impl CredentialProvider for EnvCredentialProvider {
    fn resolve(&self, provider: &str, reference: Option<&str>) -> Result<String, LlmError> {
        let var = match reference {
            Some(name) => name.to_string(),
            None => format!("{}_API_KEY", provider.to_uppercase()),
        };
        std::env::var(&var).map_err(|_| LlmError::Authentication {
            provider: provider.to_string(),
        })
    }
}

/// In-memory credential table, used by embedders that already hold
/// per-connection keys (the gateway's `agentApiKeys` settings land here).
#[derive(Default)]
pub struct StaticCredentialProvider {
    by_provider: HashMap<String, String>,
    by_reference: HashMap<String, String>,
}

impl StaticCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default credential for a provider.
    pub fn with_provider_key(mut self, provider: impl Into<String>, key: impl Into<String>) -> Self {
        self.by_provider.insert(provider.into(), key.into());
        self
    }

    /// Set the credential behind a named reference.
    pub fn with_reference(mut self, reference: impl Into<String>, key: impl Into<String>) -> Self {
        self.by_reference.insert(reference.into(), key.into());
        self
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn resolve(&self, provider: &str, reference: Option<&str>) -> Result<String, LlmError> {
        let found = match reference {
            Some(name) => self.by_reference.get(name),
            None => self.by_provider.get(provider),
        };
        found.cloned().ok_or_else(|| LlmError::Authentication {
            provider: provider.to_string(),
        })
    }
}

/// Concurrent credential table that can be populated while the process
/// runs. The gateway installs per-connection keys here (under references
/// it mints) and removes them when the client disconnects.
#[derive(Default)]
pub struct SharedCredentialStore {
    entries: dashmap::DashMap<String, String>,
}

impl SharedCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a credential under a reference.
    pub fn insert(&self, reference: impl Into<String>, key: impl Into<String>) {
        self.entries.insert(reference.into(), key.into());
    }

    /// Remove a credential.
    pub fn remove(&self, reference: &str) {
        self.entries.remove(reference);
    }
}

impl CredentialProvider for SharedCredentialStore {
    fn resolve(&self, provider: &str, reference: Option<&str>) -> Result<String, LlmError> {
        reference
            .and_then(|r| self.entries.get(r).map(|v| v.clone()))
            .ok_or_else(|| LlmError::Authentication {
                provider: provider.to_string(),
            })
    }
}

/// Chains two providers: the primary wins, the secondary backs it up.
/// Lets gateway-supplied keys override process-level environment keys.
pub struct LayeredCredentialProvider {
    primary: Box<dyn CredentialProvider>,
    secondary: Box<dyn CredentialProvider>,
}

impl LayeredCredentialProvider {
    pub fn new(
        primary: Box<dyn CredentialProvider>,
        secondary: Box<dyn CredentialProvider>,
    ) -> Self {
        Self { primary, secondary }
    }
}

impl CredentialProvider for LayeredCredentialProvider {
    fn resolve(&self, provider: &str, reference: Option<&str>) -> Result<String, LlmError> {
        self.primary
            .resolve(provider, reference)
            .or_else(|_| self.secondary.resolve(provider, reference))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_provider_resolves_by_provider_and_reference() {
        let provider = StaticCredentialProvider::new()
            .with_provider_key("openai", "sk-default")
            .with_reference("team-key", "sk-team");

        assert_eq!(provider.resolve("openai", None).unwrap(), "sk-default");
        assert_eq!(
            provider.resolve("openai", Some("team-key")).unwrap(),
            "sk-team"
        );
        assert!(matches!(
            provider.resolve("claude", None),
            Err(LlmError::Authentication { .. })
        ));
    }

    #[test]
    fn shared_store_resolves_only_by_reference() {
        let store = SharedCredentialStore::new();
        store.insert("u1:analyst", "sk-live");
        assert_eq!(
            store.resolve("openai", Some("u1:analyst")).unwrap(),
            "sk-live"
        );
        assert!(store.resolve("openai", None).is_err());
        store.remove("u1:analyst");
        assert!(store.resolve("openai", Some("u1:analyst")).is_err());
    }

    #[test]
    fn layered_provider_prefers_primary() {
        let primary = StaticCredentialProvider::new().with_provider_key("openai", "sk-override");
        let secondary = StaticCredentialProvider::new()
            .with_provider_key("openai", "sk-base")
            .with_provider_key("gemini", "g-base");
        let layered = LayeredCredentialProvider::new(Box::new(primary), Box::new(secondary));

        assert_eq!(layered.resolve("openai", None).unwrap(), "sk-override");
        assert_eq!(layered.resolve("gemini", None).unwrap(), "g-base");
    }
}
