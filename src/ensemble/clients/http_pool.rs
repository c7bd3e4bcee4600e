//! HTTP client pool for maintaining persistent connections.
//!
//! This module provides a singleton-based HTTP client pool that maintains
//! persistent connections, avoiding DNS/TLS churn and reducing connection
//! overhead. Clients are keyed by `(base_url, credential)` so a revoked or
//! rotated key gets a fresh client without recycling every other provider's
//! connections.
//!
//! The raw credential never becomes part of the key; a SHA-256 digest does.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Global cache of HTTP clients indexed by base URL + credential digest.
/// DashMap gives thread-safe concurrent access without an outer lock.
static CLIENT_POOL: Lazy<DashMap<String, reqwest::Client>> = Lazy::new(DashMap::new);

/// Creates or retrieves a shared HTTP client for the given base URL and
/// credential.
///
/// The client is configured with:
/// - Connection pooling with up to 100 idle connections per host
/// - 90-second idle timeout for persistent connections
/// - TCP keepalive to maintain long-lived connections
/// - 30-second connection timeout
pub fn get_shared_client(base_url: &str, credential: &str) -> reqwest::Client {
    let key = pool_key(base_url, credential);
    CLIENT_POOL
        .entry(key)
        .or_insert_with(create_pooled_client)
        .clone()
}

fn pool_key(base_url: &str, credential: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(credential.as_bytes());
    let digest = hasher.finalize();
    format!("{}#{:x}", base_url, digest)
}

fn create_pooled_client() -> reqwest::Client {
    reqwest::ClientBuilder::new()
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .connect_timeout(Duration::from_secs(30))
        .build()
        .expect("Failed to build HTTP client")
}
