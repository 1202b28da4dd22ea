//! TTL response cache keyed by canonicalized request strings.
//!
//! Consulted before the rate-limit bucket is charged: a cache hit costs
//! no token. Entries expire after the TTL and can be dropped wholesale
//! with `purge` (the admin API endpoint).

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Async TTL cache for one client's responses.
pub struct ResponseCache<V> {
    ttl: Duration,
    entries: RwLock<HashMap<String, Entry<V>>>,
}

impl<V: Clone> ResponseCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value.clone())
    }

    pub async fn insert(&self, key: String, value: V) {
        let mut entries = self.entries.write().await;
        // Opportunistic sweep keeps the map from accumulating dead entries.
        let now = Instant::now();
        entries.retain(|_, e| e.expires_at > now);
        entries.insert(
            key,
            Entry {
                value,
                expires_at: now + self.ttl,
            },
        );
    }

    /// Drop every entry.
    pub async fn purge(&self) {
        self.entries.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

/// Canonical cache key: sorted `name=value` pairs joined with `&`.
pub fn canonical_key(pairs: &[(&str, String)]) -> String {
    let mut sorted: Vec<String> = pairs.iter().map(|(k, v)| format!("{k}={v}")).collect();
    sorted.sort();
    sorted.join("&")
}
