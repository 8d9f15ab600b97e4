//! Short-lived cache of subscription status responses, keyed by identity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::subscriptions::{normalize_identity, SubscriptionStatus};

/// Upper bound on cached identities
const MAX_CACHE_ENTRIES: usize = 10_000;

#[derive(Debug, Clone)]
struct CachedStatus {
    status: SubscriptionStatus,
    cached_at: OffsetDateTime,
}

pub struct SubscriptionCache {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<String, CachedStatus>>,
    /// Bumped on every invalidation, under the write lock
    generation: AtomicU64,
}

impl SubscriptionCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            entries: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.ttl > Duration::ZERO
    }

    /// Cached status and the time it was cached, if still within the TTL.
    /// Expired entries are evicted on the way out.
    pub async fn get(&self, identity: &str) -> Option<(SubscriptionStatus, OffsetDateTime)> {
        if !self.is_enabled() {
            return None;
        }
        let key = normalize_identity(identity);
        let now = self.clock.now();

        {
            let entries = self.entries.read().await;
            match entries.get(&key) {
                Some(cached) if now - cached.cached_at < self.ttl => {
                    return Some((cached.status.clone(), cached.cached_at));
                }
                Some(_) => {}
                None => return None,
            }
        }

        let mut entries = self.entries.write().await;
        // Re-check under the write lock; a fresh insert may have landed
        if entries
            .get(&key)
            .is_some_and(|cached| now - cached.cached_at >= self.ttl)
        {
            entries.remove(&key);
            tracing::debug!(identity = %key, "Evicted expired subscription status");
        }
        None
    }

    /// Invalidation generation. Take it before reading the store and hand it
    /// to [`insert_if_current`](Self::insert_if_current).
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub async fn insert(&self, identity: &str, status: SubscriptionStatus) -> OffsetDateTime {
        let cached_at = self.clock.now();
        if !self.is_enabled() {
            return cached_at;
        }
        let mut entries = self.entries.write().await;
        Self::store_entry(&mut entries, identity, status, cached_at);
        cached_at
    }

    /// Insert unless an invalidation landed since `generation` was taken, in
    /// which case `status` may predate a mutation and is dropped.
    pub async fn insert_if_current(
        &self,
        identity: &str,
        status: SubscriptionStatus,
        generation: u64,
    ) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let cached_at = self.clock.now();
        let mut entries = self.entries.write().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!(identity = %identity, "Skipped caching status read before an invalidation");
            return false;
        }
        Self::store_entry(&mut entries, identity, status, cached_at);
        true
    }

    fn store_entry(
        entries: &mut HashMap<String, CachedStatus>,
        identity: &str,
        status: SubscriptionStatus,
        cached_at: OffsetDateTime,
    ) {
        if entries.len() >= MAX_CACHE_ENTRIES {
            if let Some(oldest_key) = entries
                .iter()
                .min_by_key(|(_, v)| v.cached_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest_key);
                tracing::debug!("Evicted oldest subscription status to stay under limit");
            }
        }

        entries.insert(normalize_identity(identity), CachedStatus { status, cached_at });
    }

    pub async fn invalidate(&self, identity: &str) {
        let key = normalize_identity(identity);
        if key.is_empty() {
            return;
        }
        let mut entries = self.entries.write().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        if entries.remove(&key).is_some() {
            tracing::debug!(identity = %key, "Invalidated cached subscription status");
        }
    }

    /// Drop every entry for the identities a record can be looked up by.
    pub async fn invalidate_all<'a>(&self, identities: impl IntoIterator<Item = &'a str>) {
        for identity in identities {
            self.invalidate(identity).await;
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
