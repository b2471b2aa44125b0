//! Recent-interest tracking for gateway peers
//!
//! Each gateway-kind connection remembers which `(tenant, client)` pairs
//! were recently proxied through it. Return-path routing consults this map
//! to pick the peer that last showed interest in a client.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Entries expire after this long
const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Cleanup only bothers once the map has grown past this
const CLEANUP_THRESHOLD: usize = 25;

/// Short-TTL `(tenant, client) → last seen` map
pub struct RecentInterestMap {
    ttl: Duration,
    inner: Mutex<Inner>,
}

struct Inner {
    entries: HashMap<(String, String), Instant>,
    last_cleanup: Instant,
}

impl RecentInterestMap {
    /// Create a map with the standard 5-minute TTL
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    /// Create a map with a custom TTL
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
        }
    }

    /// Record interest in `(tenant, client)`
    pub fn mark(&self, tenant: &str, client_id: &str) {
        let mut inner = self.inner.lock().expect("interest map lock poisoned");
        let now = Instant::now();

        // Lazy sweep: only once the map is big enough and a full TTL has
        // passed since the last sweep.
        if inner.entries.len() >= CLEANUP_THRESHOLD
            && now.duration_since(inner.last_cleanup) >= self.ttl
        {
            let ttl = self.ttl;
            inner
                .entries
                .retain(|_, seen| now.duration_since(*seen) < ttl);
            inner.last_cleanup = now;
        }

        inner
            .entries
            .insert((tenant.to_string(), client_id.to_string()), now);
    }

    /// True while a non-expired entry for `(tenant, client)` exists
    pub fn contains(&self, tenant: &str, client_id: &str) -> bool {
        let inner = self.inner.lock().expect("interest map lock poisoned");
        inner
            .entries
            .get(&(tenant.to_string(), client_id.to_string()))
            .map(|seen| seen.elapsed() < self.ttl)
            .unwrap_or(false)
    }

    /// Current entry count, expired entries included
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("interest map lock poisoned")
            .entries
            .len()
    }

    /// True when no entries are tracked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RecentInterestMap {
    fn default() -> Self {
        Self::new()
    }
}
