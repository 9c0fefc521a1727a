//! Scope resolver (spec §2, §4.2 step 1): request-local memoization plus an
//! optional shared cache over `handler.resolve_scopes(actor)`, keyed by
//! `(partition_id, actor, table)`. New surface; the in-process cache is a
//! size-bounded LRU (not just TTL) so a long-running server with many
//! distinct actors can't grow this cache without bound.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use uuid::Uuid;

use syncular_core::handler::HandlerRegistry;
use syncular_core::models::{PartitionId, ScopeMap};
use syncular_core::SyncResult;

const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct CacheKey {
    partition_id: PartitionId,
    actor_id: Uuid,
    table: String,
}

struct CacheEntry {
    scopes: ScopeMap,
    expires_at: Instant,
}

/// Process-wide shared cache: bounded by entry count (LRU eviction) and by
/// a fixed TTL per entry. Spec §9: "the scope cache... [is] keyed by DB
/// handle (treat as per-process)."
pub struct ScopeResolver {
    handlers: Arc<HandlerRegistry>,
    shared: Mutex<LruCache<CacheKey, CacheEntry>>,
    ttl: Duration,
}

impl ScopeResolver {
    pub fn new(handlers: Arc<HandlerRegistry>) -> Self {
        Self::with_ttl(handlers, Duration::from_secs(30))
    }

    pub fn with_ttl(handlers: Arc<HandlerRegistry>, ttl: Duration) -> Self {
        Self::with_capacity(handlers, ttl, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(handlers: Arc<HandlerRegistry>, ttl: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self { handlers, shared: Mutex::new(LruCache::new(capacity)), ttl }
    }

    /// Resolve `table`'s allowed scopes for `actor_id`, consulting the
    /// shared cache before calling the handler. `memo` is the request-local
    /// cache the caller threads across subscriptions in the same pull.
    pub async fn resolve(
        &self,
        memo: &mut HashMap<(PartitionId, Uuid, String), ScopeMap>,
        partition_id: PartitionId,
        actor_id: Uuid,
        table: &str,
    ) -> SyncResult<ScopeMap> {
        let memo_key = (partition_id, actor_id, table.to_string());
        if let Some(scopes) = memo.get(&memo_key) {
            return Ok(scopes.clone());
        }

        let cache_key = CacheKey { partition_id, actor_id, table: table.to_string() };
        {
            let mut shared = self.shared.lock().unwrap();
            if let Some(entry) = shared.get(&cache_key) {
                if entry.expires_at > Instant::now() {
                    memo.insert(memo_key, entry.scopes.clone());
                    return Ok(entry.scopes.clone());
                }
                shared.pop(&cache_key);
            }
        }

        let handler = self.handlers.get(table)?;
        let scopes = handler.resolve_scopes(actor_id).await?;

        self.shared.lock().unwrap().put(
            cache_key,
            CacheEntry { scopes: scopes.clone(), expires_at: Instant::now() + self.ttl },
        );
        memo.insert(memo_key, scopes.clone());
        Ok(scopes)
    }

    /// Drop every cached entry. Tests reset the resolver explicitly (spec §9).
    pub fn reset(&self) {
        self.shared.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use syncular_core::handler::{HandlerConfig, SnapshotRow, TableHandler};
    use syncular_core::models::ScopeValue;

    struct FixedHandler {
        config: HandlerConfig,
        calls: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl TableHandler for FixedHandler {
        fn config(&self) -> &HandlerConfig {
            &self.config
        }

        async fn resolve_scopes(&self, _actor_id: Uuid) -> SyncResult<ScopeMap> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let mut scopes = ScopeMap::new();
            scopes.insert("user".into(), ScopeValue::One("u1".into()));
            Ok(scopes)
        }

        async fn snapshot(
            &self,
            _scope_values: &ScopeMap,
            _row_cursor: Option<&str>,
            _limit: u32,
        ) -> SyncResult<Vec<SnapshotRow>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn caches_repeated_resolution() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let handler = FixedHandler {
            config: HandlerConfig::new("tasks").with_scope_pattern("user:{user_id}").unwrap(),
            calls: calls.clone(),
        };
        let registry = HandlerRegistry::build(vec![Box::new(handler)]).unwrap();
        let resolver = ScopeResolver::new(Arc::new(registry));

        let partition_id = PartitionId(Uuid::new_v4());
        let actor_id = Uuid::new_v4();
        let mut memo = HashMap::new();

        resolver.resolve(&mut memo, partition_id, actor_id, "tasks").await.unwrap();
        resolver.resolve(&mut memo, partition_id, actor_id, "tasks").await.unwrap();

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn evicts_least_recently_used_entry_once_capacity_is_exceeded() {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let handler = FixedHandler {
            config: HandlerConfig::new("tasks").with_scope_pattern("user:{user_id}").unwrap(),
            calls: calls.clone(),
        };
        let registry = HandlerRegistry::build(vec![Box::new(handler)]).unwrap();
        let resolver = ScopeResolver::with_capacity(Arc::new(registry), Duration::from_secs(30), 1);

        let partition_id = PartitionId(Uuid::new_v4());
        let actor_a = Uuid::new_v4();
        let actor_b = Uuid::new_v4();

        resolver.resolve(&mut HashMap::new(), partition_id, actor_a, "tasks").await.unwrap();
        resolver.resolve(&mut HashMap::new(), partition_id, actor_b, "tasks").await.unwrap();
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);

        // actor_a's entry was evicted to make room for actor_b's, so this
        // misses the cache and calls the handler again.
        resolver.resolve(&mut HashMap::new(), partition_id, actor_a, "tasks").await.unwrap();
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }
}
