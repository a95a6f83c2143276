//! Tagged query caching.
//!
//! Two kinds of entries share one store: compiled SQL templates keyed by a
//! query id, and query results keyed by the caller. Result entries can carry
//! tags; invalidating a tag deletes every entry written under it.
//!
//! Store failures never fail the caller. A failed read is a miss and a failed
//! write is skipped, both with a warning.

use crate::cache::store::CacheStore;
use crate::config::CacheConfig;
use crate::error::DbResult;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Tagged writes between sweeps of a tag index for expired members.
pub const TAG_PRUNE_INTERVAL: usize = 64;

/// Called with the tag after it has been invalidated.
pub type InvalidationCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Entry family, each with its own hit/miss counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Compiled,
    Result,
}

impl CacheKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Compiled => "compiled",
            Self::Result => "result",
        }
    }
}

/// Hit and miss counters read back from the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub compiled_hits: u64,
    pub compiled_misses: u64,
    pub result_hits: u64,
    pub result_misses: u64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.compiled_hits + self.result_hits
    }

    pub fn misses(&self) -> u64 {
        self.compiled_misses + self.result_misses
    }

    pub fn lookups(&self) -> u64 {
        self.hits() + self.misses()
    }

    /// Hits over lookups; `None` before the first lookup.
    pub fn hit_ratio(&self) -> Option<f64> {
        let lookups = self.lookups();
        (lookups > 0).then(|| self.hits() as f64 / lookups as f64)
    }
}

pub struct QueryCache {
    store: Arc<dyn CacheStore>,
    config: CacheConfig,
    callbacks: Mutex<HashMap<String, Vec<InvalidationCallback>>>,
    tagged_writes: AtomicUsize,
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl QueryCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self::with_config(store, CacheConfig::default())
    }

    pub fn with_config(store: Arc<dyn CacheStore>, config: CacheConfig) -> Self {
        Self {
            store,
            config,
            callbacks: Mutex::new(HashMap::new()),
            tagged_writes: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    fn key(&self, kind: CacheKind, key: &str) -> String {
        format!("{}:{}:{}", self.config.key_prefix, kind.as_str(), key)
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}:tag:{}", self.config.key_prefix, tag)
    }

    fn stat_key(&self, kind: CacheKind, outcome: &str) -> String {
        format!("{}:stats:{}:{}", self.config.key_prefix, kind.as_str(), outcome)
    }

    /// Compiled SQL for `query_id`, produced and stored on a miss.
    pub async fn compiled<F>(&self, query_id: &str, producer: F) -> DbResult<String>
    where
        F: FnOnce() -> DbResult<String>,
    {
        if !self.config.enabled {
            return producer();
        }

        let key = self.key(CacheKind::Compiled, query_id);
        if let Some(sql) = self.lookup::<String>(CacheKind::Compiled, &key).await {
            return Ok(sql);
        }

        let sql = producer()?;
        self.write(&key, &sql, Some(self.config.default_ttl()), &[]).await;
        Ok(sql)
    }

    /// Cached value for `key`; on a miss `producer` runs and its result is
    /// stored under `key` and every tag.
    pub async fn remember<T, F>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        tags: &[&str],
        producer: F,
    ) -> DbResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: AsyncFnOnce() -> DbResult<T>,
    {
        if !self.config.enabled {
            return producer().await;
        }

        let full_key = self.key(CacheKind::Result, key);
        if let Some(value) = self.lookup::<T>(CacheKind::Result, &full_key).await {
            return Ok(value);
        }

        let value = producer().await?;
        let ttl = ttl.unwrap_or_else(|| self.config.default_ttl());
        self.write(&full_key, &value, Some(ttl), tags).await;
        Ok(value)
    }

    /// Cached value for `key` without a producer.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if !self.config.enabled {
            return None;
        }
        self.lookup(CacheKind::Result, &self.key(CacheKind::Result, key))
            .await
    }

    pub async fn put<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>, tags: &[&str]) {
        if !self.config.enabled {
            return;
        }
        let ttl = ttl.unwrap_or_else(|| self.config.default_ttl());
        self.write(&self.key(CacheKind::Result, key), value, Some(ttl), tags)
            .await;
    }

    /// Remove one result entry. Returns whether it existed.
    pub async fn forget(&self, key: &str) -> bool {
        let full_key = self.key(CacheKind::Result, key);
        match self.store.delete(&full_key).await {
            Ok(existed) => existed,
            Err(e) => {
                warn!(key = %full_key, error = %e, "Cache delete failed");
                false
            }
        }
    }

    /// Delete every entry written under `tag`, then the tag index, then run
    /// the tag's callbacks. Returns the number of entries removed.
    pub async fn invalidate_by_tag(&self, tag: &str) -> usize {
        let tag_key = self.tag_key(tag);
        let members = match self.store.set_members(&tag_key).await {
            Ok(members) => members,
            Err(e) => {
                warn!(tag = %tag, error = %e, "Cache tag lookup failed");
                Vec::new()
            }
        };

        let mut removed = 0;
        for key in &members {
            match self.store.delete(key).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!(key = %key, error = %e, "Cache delete failed"),
            }
        }
        if let Err(e) = self.store.delete(&tag_key).await {
            warn!(tag = %tag, error = %e, "Cache tag delete failed");
        }
        debug!(tag = %tag, removed, "Invalidated cache tag");

        self.fire_callbacks(tag);
        removed
    }

    /// Invalidate `"{entity_type}_{id}"` and `"{entity_type}"`.
    pub async fn invalidate_entity(&self, entity_type: &str, id: impl std::fmt::Display) -> usize {
        let specific = self.invalidate_by_tag(&format!("{}_{}", entity_type, id)).await;
        specific + self.invalidate_by_tag(entity_type).await
    }

    /// Register a callback run after each invalidation of `tag`.
    pub fn on_invalidate<F>(&self, tag: &str, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(tag.to_string())
            .or_default()
            .push(Arc::new(callback));
    }

    fn fire_callbacks(&self, tag: &str) {
        // Cloned out so callbacks may register further callbacks
        let callbacks: Vec<InvalidationCallback> = self
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(tag)
            .cloned()
            .unwrap_or_default();

        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(tag))).is_err() {
                warn!(tag = %tag, "Cache invalidation callback panicked");
            }
        }
    }

    /// Counters for both entry kinds.
    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            compiled_hits: self.counter(CacheKind::Compiled, "hits").await,
            compiled_misses: self.counter(CacheKind::Compiled, "misses").await,
            result_hits: self.counter(CacheKind::Result, "hits").await,
            result_misses: self.counter(CacheKind::Result, "misses").await,
        }
    }

    pub async fn hit_ratio(&self) -> Option<f64> {
        self.stats().await.hit_ratio()
    }

    async fn counter(&self, kind: CacheKind, outcome: &str) -> u64 {
        let key = self.stat_key(kind, outcome);
        match self.store.get(&key).await {
            Ok(value) => value.and_then(|v| v.as_u64()).unwrap_or(0),
            Err(e) => {
                warn!(key = %key, error = %e, "Cache stats read failed");
                0
            }
        }
    }

    async fn count(&self, kind: CacheKind, hit: bool) {
        let key = self.stat_key(kind, if hit { "hits" } else { "misses" });
        if let Err(e) = self.store.increment(&key, 1, None).await {
            warn!(key = %key, error = %e, "Cache stats update failed");
        }
    }

    async fn lookup<T: DeserializeOwned>(&self, kind: CacheKind, key: &str) -> Option<T> {
        let found = match self.store.get(key).await {
            Ok(found) => found,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache read failed, treating as miss");
                None
            }
        };

        let value = found.and_then(|raw| match serde_json::from_value(raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %key, error = %e, "Cached value does not decode, treating as miss");
                None
            }
        });
        self.count(kind, value.is_some()).await;
        value
    }

    async fn write<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        tags: &[&str],
    ) {
        let json = match serde_json::to_value(value) {
            Ok(json) => json,
            Err(e) => {
                warn!(key = %key, error = %e, "Value not cacheable, skipping write");
                return;
            }
        };
        if let Err(e) = self.store.set(key, json, ttl).await {
            warn!(key = %key, error = %e, "Cache write failed");
            return;
        }
        if tags.is_empty() {
            return;
        }

        // Tag indexes live as long as their longest entry
        for tag in tags {
            if let Err(e) = self.store.add_to_set(&self.tag_key(tag), key, ttl).await {
                warn!(key = %key, tag = %tag, error = %e, "Cache tag index update failed");
            }
        }
        let writes = self.tagged_writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % TAG_PRUNE_INTERVAL == 0 {
            for tag in tags {
                if let Err(e) = self.prune_tag(tag).await {
                    warn!(tag = %tag, error = %e, "Cache tag index prune failed");
                }
            }
        }
    }

    /// Drop index members whose entries have expired or been deleted.
    /// Returns how many were dropped.
    pub async fn prune_tag(&self, tag: &str) -> DbResult<usize> {
        let tag_key = self.tag_key(tag);
        let mut dead = Vec::new();
        for key in self.store.set_members(&tag_key).await? {
            if self.store.get(&key).await?.is_none() {
                dead.push(key);
            }
        }
        if dead.is_empty() {
            return Ok(0);
        }
        let removed = self.store.remove_from_set(&tag_key, &dead).await?;
        debug!(tag = %tag, removed, "Pruned cache tag index");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::error::DbError;
    use async_trait::async_trait;
    use serde_json::Value as JsonValue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache() -> QueryCache {
        QueryCache::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_remember_runs_producer_once() {
        let cache = cache();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let v: Vec<i64> = cache
                .remember("posts", None, &[], async || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(vec![1, 2, 3])
                })
                .await
                .unwrap();
            assert_eq!(v, vec![1, 2, 3]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = cache.stats().await;
        assert_eq!(stats.result_hits, 2);
        assert_eq!(stats.result_misses, 1);
        assert_eq!(stats.hit_ratio(), Some(2.0 / 3.0));
    }

    #[tokio::test]
    async fn test_producer_error_is_not_cached() {
        let cache = cache();
        let err = cache
            .remember::<i64, _>("k", None, &[], async || Err(DbError::internal("down")))
            .await;
        assert!(err.is_err());
        assert_eq!(cache.get::<i64>("k").await, None);
    }

    #[tokio::test]
    async fn test_compiled_cache() {
        let cache = cache();
        let first = cache
            .compiled("posts.by_user", || Ok("SELECT * FROM posts WHERE user_id = ?".into()))
            .await
            .unwrap();
        let second = cache
            .compiled("posts.by_user", || Err(DbError::internal("not called")))
            .await
            .unwrap();
        assert_eq!(first, second);
        let stats = cache.stats().await;
        assert_eq!((stats.compiled_hits, stats.compiled_misses), (1, 1));
    }

    #[tokio::test]
    async fn test_invalidate_entity_and_callbacks() {
        let cache = cache();
        cache.put("saga:1", &"one", None, &["saga_1", "saga"]).await;
        cache.put("saga:2", &"two", None, &["saga_2", "saga"]).await;
        cache.put("other", &"x", None, &["entity"]).await;

        let fired = Arc::new(AtomicUsize::new(0));
        let seen = fired.clone();
        cache.on_invalidate("saga", move |tag| {
            assert_eq!(tag, "saga");
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let removed = cache.invalidate_entity("saga", 1).await;
        assert_eq!(removed, 2);
        assert_eq!(cache.get::<String>("saga:1").await, None);
        assert_eq!(cache.get::<String>("saga:2").await, None);
        assert_eq!(cache.get::<String>("other").await, Some("x".to_string()));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tag_index_stays_bounded() {
        let store = Arc::new(MemoryStore::new());
        let cache = QueryCache::new(store.clone());
        let tag_key = cache.tag_key("saga");

        cache.put("saga:index", &"kept", Some(Duration::from_secs(3600)), &["saga"]).await;
        for i in 0..300 {
            cache.put(&format!("saga:{i}"), &i, Some(Duration::from_secs(1)), &["saga"]).await;
            tokio::time::advance(Duration::from_secs(2)).await;
        }

        let members = store.set_members(&tag_key).await.unwrap();
        assert!(members.len() <= TAG_PRUNE_INTERVAL + 1, "{} members", members.len());
        assert!(members.contains(&cache.key(CacheKind::Result, "saga:index")));

        // Expired members are ignored by invalidation
        assert_eq!(cache.invalidate_by_tag("saga").await, 1);

        // An index whose entries all expired goes with them
        cache.put("saga:late", &1, Some(Duration::from_secs(10)), &["saga"]).await;
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.set_members(&tag_key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prune_tag_drops_deleted_entries() {
        let cache = cache();
        cache.put("a", &1, None, &["t"]).await;
        cache.put("b", &2, None, &["t"]).await;
        assert!(cache.forget("a").await);
        assert_eq!(cache.prune_tag("t").await.unwrap(), 1);
        assert_eq!(
            cache.store().set_members(&cache.tag_key("t")).await.unwrap(),
            vec![cache.key(CacheKind::Result, "b")]
        );
    }

    #[tokio::test]
    async fn test_panicking_callback_is_contained() {
        let cache = cache();
        cache.on_invalidate("t", |_| panic!("callback failure"));
        assert_eq!(cache.invalidate_by_tag("t").await, 0);
    }

    #[tokio::test]
    async fn test_disabled_cache_always_produces() {
        let cache = QueryCache::with_config(
            Arc::new(MemoryStore::new()),
            CacheConfig {
                enabled: false,
                ..CacheConfig::default()
            },
        );
        let calls = AtomicUsize::new(0);
        for _ in 0..2 {
            let _: i64 = cache
                .remember("k", None, &[], async || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    struct FailingStore;

    #[async_trait]
    impl CacheStore for FailingStore {
        async fn get(&self, _: &str) -> DbResult<Option<JsonValue>> {
            Err(DbError::cache("offline"))
        }
        async fn set(&self, _: &str, _: JsonValue, _: Option<Duration>) -> DbResult<()> {
            Err(DbError::cache("offline"))
        }
        async fn delete(&self, _: &str) -> DbResult<bool> {
            Err(DbError::cache("offline"))
        }
        async fn increment(&self, _: &str, _: i64, _: Option<Duration>) -> DbResult<i64> {
            Err(DbError::cache("offline"))
        }
        async fn add_to_set(&self, _: &str, _: &str, _: Option<Duration>) -> DbResult<()> {
            Err(DbError::cache("offline"))
        }
        async fn set_members(&self, _: &str) -> DbResult<Vec<String>> {
            Err(DbError::cache("offline"))
        }
        async fn remove_from_set(&self, _: &str, _: &[String]) -> DbResult<usize> {
            Err(DbError::cache("offline"))
        }
    }

    #[tokio::test]
    async fn test_store_failures_degrade_to_miss() {
        let cache = QueryCache::new(Arc::new(FailingStore));
        let v: i64 = cache
            .remember("k", None, &["t"], async || Ok(42))
            .await
            .unwrap();
        assert_eq!(v, 42);
        assert_eq!(cache.invalidate_by_tag("t").await, 0);
        assert!(!cache.forget("k").await);
        assert_eq!(cache.stats().await, CacheStats::default());
    }
}
