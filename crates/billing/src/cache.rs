//! Process-scoped entitlement cache.
//!
//! Read-through TTL cache keyed by (tool, user), fronting the resolver.
//! Explicitly constructed and carried in service state (no global statics),
//! bounded to [`MAX_CACHE_ENTRIES`] with oldest-entry eviction. The expiry
//! instant of an entry is the authority window exposed to vendors: until
//! `authorityExpiresAt` they may trust the answer without re-checking,
//! while push invalidation (fired before any state-change webhook) keeps
//! revocation near-real-time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::entitlements::Entitlements;

/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(900);

/// Hard cap on resident entries; prevents unbounded growth if a caller
/// fans out over many (tool, user) pairs.
const MAX_CACHE_ENTRIES: usize = 10_000;

#[derive(Debug, Clone)]
struct CacheEntry {
    entitlements: Entitlements,
    cached_at: OffsetDateTime,
    expires_at: OffsetDateTime,
}

/// A non-expired entry returned from [`EntitlementCache::get`].
pub(crate) struct CacheHit {
    pub entitlements: Entitlements,
    pub expires_at: OffsetDateTime,
}

/// Knobs for a cached entitlement lookup.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheOptions {
    /// Skip the cache read (still writes the fresh result through).
    pub bypass_cache: bool,
    /// Entry lifetime override; `None` uses the cache default.
    pub ttl: Option<Duration>,
    /// On a hit, re-fetch only the live balance and overlay it.
    pub fresh_credits: bool,
}

/// Resolution result plus cache provenance.
#[derive(Debug, Clone)]
pub struct CachedEntitlements {
    pub entitlements: Entitlements,
    pub from_cache: bool,
    /// Epoch milliseconds until which the answer may be trusted.
    pub authority_expires_at: i64,
}

/// Shared in-memory cache handle. Cloning shares the underlying map.
#[derive(Clone)]
pub struct EntitlementCache {
    entries: Arc<RwLock<HashMap<(Uuid, Uuid), CacheEntry>>>,
    default_ttl: Duration,
}

impl EntitlementCache {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(default_ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub(crate) async fn get(&self, tool_id: Uuid, user_id: Uuid) -> Option<CacheHit> {
        let entries = self.entries.read().await;
        let entry = entries.get(&(tool_id, user_id))?;
        if entry.expires_at <= OffsetDateTime::now_utc() {
            // Stale; left in place, overwritten on the next write-through.
            return None;
        }
        Some(CacheHit {
            entitlements: entry.entitlements.clone(),
            expires_at: entry.expires_at,
        })
    }

    /// Write-through an entry; returns its expiry instant.
    pub(crate) async fn insert(
        &self,
        tool_id: Uuid,
        user_id: Uuid,
        entitlements: Entitlements,
        ttl: Option<Duration>,
    ) -> OffsetDateTime {
        let now = OffsetDateTime::now_utc();
        let expires_at = now + ttl.unwrap_or(self.default_ttl);

        let mut entries = self.entries.write().await;
        if entries.len() >= MAX_CACHE_ENTRIES {
            entries.retain(|_, entry| entry.expires_at > now);
        }
        if entries.len() >= MAX_CACHE_ENTRIES {
            // Still full of live entries: evict the oldest one.
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.cached_at)
                .map(|(key, _)| *key)
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            (tool_id, user_id),
            CacheEntry {
                entitlements,
                cached_at: now,
                expires_at,
            },
        );
        expires_at
    }

    /// Unconditional eviction for (tool, user).
    pub async fn invalidate(&self, tool_id: Uuid, user_id: Uuid) {
        let removed = self.entries.write().await.remove(&(tool_id, user_id));
        if removed.is_some() {
            tracing::debug!(tool_id = %tool_id, user_id = %user_id, "entitlement cache invalidated");
        }
    }

    /// Resident entry count (includes not-yet-pruned expired entries).
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for EntitlementCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlements::SubscriptionStatus;
    use std::collections::BTreeMap;

    fn entitlements(credits: Option<i64>) -> Entitlements {
        Entitlements {
            plan_id: Some("monthly".into()),
            credits_remaining: credits,
            features: vec!["api".into()],
            limits: BTreeMap::new(),
            status: SubscriptionStatus::Active,
            active: true,
            current_period_end: None,
            cancel_at_period_end: false,
        }
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let cache = EntitlementCache::new();
        let (tool, user) = (Uuid::new_v4(), Uuid::new_v4());

        assert!(cache.get(tool, user).await.is_none());
        cache.insert(tool, user, entitlements(Some(100)), None).await;

        let hit = cache.get(tool, user).await.unwrap();
        assert_eq!(hit.entitlements.credits_remaining, Some(100));
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache = EntitlementCache::new();
        let (tool, user) = (Uuid::new_v4(), Uuid::new_v4());

        cache
            .insert(
                tool,
                user,
                entitlements(None),
                Some(Duration::from_millis(20)),
            )
            .await;
        assert!(cache.get(tool, user).await.is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.get(tool, user).await.is_none());
    }

    #[tokio::test]
    async fn invalidate_evicts() {
        let cache = EntitlementCache::new();
        let (tool, user) = (Uuid::new_v4(), Uuid::new_v4());

        cache.insert(tool, user, entitlements(Some(5)), None).await;
        cache.invalidate(tool, user).await;
        assert!(cache.get(tool, user).await.is_none());
    }

    #[tokio::test]
    async fn invalidate_is_scoped_to_the_pair() {
        let cache = EntitlementCache::new();
        let tool = Uuid::new_v4();
        let (user_a, user_b) = (Uuid::new_v4(), Uuid::new_v4());

        cache.insert(tool, user_a, entitlements(Some(1)), None).await;
        cache.insert(tool, user_b, entitlements(Some(2)), None).await;
        cache.invalidate(tool, user_a).await;

        assert!(cache.get(tool, user_a).await.is_none());
        assert!(cache.get(tool, user_b).await.is_some());
    }

    #[tokio::test]
    async fn expiry_instant_reflects_ttl() {
        let cache = EntitlementCache::new();
        let (tool, user) = (Uuid::new_v4(), Uuid::new_v4());

        let before = OffsetDateTime::now_utc();
        let expires_at = cache
            .insert(
                tool,
                user,
                entitlements(None),
                Some(Duration::from_secs(900)),
            )
            .await;
        let lower = before + Duration::from_secs(899);
        let upper = before + Duration::from_secs(901);
        assert!(expires_at > lower && expires_at < upper);
    }

    #[tokio::test]
    async fn capacity_is_bounded() {
        let cache = EntitlementCache::new();
        let user = Uuid::new_v4();
        for _ in 0..(MAX_CACHE_ENTRIES + 1) {
            cache
                .insert(Uuid::new_v4(), user, entitlements(None), None)
                .await;
        }
        assert!(cache.len().await <= MAX_CACHE_ENTRIES);
    }
}
