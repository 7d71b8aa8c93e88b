//! Decision cache with TTL for authorization check results.
//!
//! Memoizes `(tenant, user, relation, object) → allow/deny` for a short
//! window. Both outcomes are cached with the same TTL; `grant`/`revoke`
//! invalidate the exact key before they return, which is what upholds
//! read-your-writes regardless of what is cached. Checks that carry
//! contextual tuples are never cached — the context is unbounded and the
//! key would have to encode it.
//!
//! The cache is a performance accelerator only. Every invariant in the
//! service holds with it disabled.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

/// Thread-safe decision cache with TTL expiry
pub struct DecisionCache {
    /// Entries keyed by `tenant:user:relation:object`
    entries: DashMap<String, CachedDecision>,
    /// Entry TTL
    ttl: Duration,
    /// Cache statistics
    stats: CacheStats,
}

/// A cached decision with its absolute expiry
struct CachedDecision {
    allowed: bool,
    expires_at: Instant,
}

impl CachedDecision {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Cache statistics tracked atomically
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStatsSnapshot {
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses
    pub misses: u64,
    /// Total evictions (expired entries removed)
    pub evictions: u64,
    /// Total explicit invalidations (grant/revoke/tenant delete)
    pub invalidations: u64,
    /// Current number of entries
    pub size: usize,
}

impl DecisionCache {
    /// Create an empty cache with the given TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            stats: CacheStats::default(),
        }
    }

    /// Build the cache key for a decision.
    #[must_use]
    pub fn key(tenant: &str, user: &str, relation: &str, object: &str) -> String {
        format!("{tenant}:{user}:{relation}:{object}")
    }

    /// Cached decision, if present and unexpired. Expired entries are
    /// evicted on access.
    pub fn get(&self, key: &str) -> Option<bool> {
        if let Some(entry) = self.entries.get(key) {
            if entry.is_expired() {
                drop(entry);
                self.entries.remove(key);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            } else {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.allowed)
            }
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Record a decision.
    pub fn set(&self, key: &str, allowed: bool) {
        self.entries.insert(
            key.to_string(),
            CachedDecision {
                allowed,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Drop the exact key. Called on the grant/revoke path before the
    /// mutation returns success.
    pub fn invalidate(&self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Drop every key with the `tenant:` prefix. Coarse invalidation for
    /// tenant deletion.
    pub fn invalidate_tenant(&self, tenant: &str) {
        let prefix = format!("{tenant}:");
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(&prefix))
            .map(|e| e.key().clone())
            .collect();

        let count = doomed.len();
        for key in doomed {
            self.entries.remove(&key);
        }
        if count > 0 {
            self.stats
                .invalidations
                .fetch_add(count as u64, Ordering::Relaxed);
        }
    }

    /// Remove expired entries. Called by the background sweeper.
    pub fn sweep(&self) -> usize {
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().is_expired())
            .map(|e| e.key().clone())
            .collect();

        let count = doomed.len();
        for key in doomed {
            self.entries.remove(&key);
        }
        if count > 0 {
            self.stats
                .evictions
                .fetch_add(count as u64, Ordering::Relaxed);
        }
        count
    }

    /// Statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            invalidations: self.stats.invalidations.load(Ordering::Relaxed),
            size: self.entries.len(),
        }
    }
}

/// Spawn the background sweeper for a cache.
///
/// Ticks every `interval` and exits when `shutdown` fires.
pub fn spawn_sweeper(
    cache: Arc<DecisionCache>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let swept = cache.sweep();
                    if swept > 0 {
                        debug!(count = swept, "Swept expired decision cache entries");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Decision cache sweeper shutting down");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> DecisionCache {
        DecisionCache::new(Duration::from_secs(60))
    }

    #[test]
    fn caches_both_outcomes() {
        let cache = cache();
        let allow = DecisionCache::key("acme", "user:alice", "admin", "tenant:acme");
        let deny = DecisionCache::key("acme", "user:bob", "admin", "tenant:acme");

        cache.set(&allow, true);
        cache.set(&deny, false);

        assert_eq!(cache.get(&allow), Some(true));
        assert_eq!(cache.get(&deny), Some(false));
        assert_eq!(cache.get("acme:user:carol:admin:tenant:acme"), None);
    }

    #[test]
    fn exact_invalidation_drops_one_key() {
        let cache = cache();
        let key_a = DecisionCache::key("acme", "user:alice", "reader", "log:sys");
        let key_b = DecisionCache::key("acme", "user:bob", "reader", "log:sys");
        cache.set(&key_a, true);
        cache.set(&key_b, true);

        cache.invalidate(&key_a);

        assert_eq!(cache.get(&key_a), None);
        assert_eq!(cache.get(&key_b), Some(true));
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[test]
    fn tenant_invalidation_drops_the_prefix() {
        let cache = cache();
        cache.set(&DecisionCache::key("acme", "user:a", "reader", "log:x"), true);
        cache.set(&DecisionCache::key("acme", "user:b", "writer", "log:y"), false);
        cache.set(&DecisionCache::key("globex", "user:a", "reader", "log:x"), true);

        cache.invalidate_tenant("acme");

        assert_eq!(cache.stats().size, 1);
        assert_eq!(
            cache.get(&DecisionCache::key("globex", "user:a", "reader", "log:x")),
            Some(true)
        );
    }

    #[test]
    fn expired_entries_are_evicted_on_access() {
        let cache = DecisionCache::new(Duration::from_millis(1));
        let key = DecisionCache::key("acme", "user:alice", "admin", "tenant:acme");
        cache.set(&key, true);

        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(cache.get(&key), None);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn sweep_removes_only_expired() {
        let short = DecisionCache::new(Duration::from_millis(1));
        short.set("acme:a", true);
        std::thread::sleep(Duration::from_millis(5));

        let long = DecisionCache::new(Duration::from_secs(60));
        long.set("acme:b", true);

        assert_eq!(short.sweep(), 1);
        assert_eq!(long.sweep(), 0);
        assert_eq!(short.stats().size, 0);
        assert_eq!(long.stats().size, 1);
    }
}
