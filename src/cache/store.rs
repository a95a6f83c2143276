//! Shared key-value state.
//!
//! The query cache and the performance monitor keep everything they share
//! across requests behind [`CacheStore`]. Each operation is atomic on its own;
//! read-modify-write sequences (`increment`, `add_to_set`) hold the write lock
//! for their whole duration.
//!
//! [`MemoryStore`] also sweeps out expired entries every [`PURGE_INTERVAL`]
//! writes, so keys that are never read again do not pile up.

use crate::error::{DbError, DbResult};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Atomic primitives over a shared store.
///
/// `ttl: None` means the entry never expires.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> DbResult<Option<JsonValue>>;

    async fn set(&self, key: &str, value: JsonValue, ttl: Option<Duration>) -> DbResult<()>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> DbResult<bool>;

    /// Add `by` to a counter, creating it at zero. The TTL applies only when
    /// the counter is created.
    async fn increment(&self, key: &str, by: i64, ttl: Option<Duration>) -> DbResult<i64>;

    /// Add a member. An existing set's expiry moves out to `ttl` from now
    /// when that is later; `None` keeps the set until it is deleted.
    async fn add_to_set(&self, key: &str, member: &str, ttl: Option<Duration>) -> DbResult<()>;

    /// Remove members, returning how many were present. A set left empty is
    /// deleted.
    async fn remove_from_set(&self, key: &str, members: &[String]) -> DbResult<usize>;

    /// Members of a set, empty when the key is missing.
    async fn set_members(&self, key: &str) -> DbResult<Vec<String>>;
}

#[derive(Debug, Clone)]
enum Stored {
    Value(JsonValue),
    Counter(i64),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Stored,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Stored, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }

    /// Keep whichever expiry is later. No expiry wins.
    fn extend(&mut self, ttl: Option<Duration>) {
        self.expires_at = match (self.expires_at, ttl) {
            (Some(at), Some(ttl)) => Some(at.max(Instant::now() + ttl)),
            _ => None,
        };
    }
}

/// Writes between sweeps of expired entries.
pub const PURGE_INTERVAL: usize = 256;

/// In-process store. Cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    writes: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| !e.is_expired())
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop expired entries. Reads already ignore them.
    pub async fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired());
        before - entries.len()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Count a write; every [`PURGE_INTERVAL`]th one sweeps expired entries.
    fn after_write(&self, entries: &mut HashMap<String, Entry>) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % PURGE_INTERVAL == 0 {
            entries.retain(|_, e| !e.is_expired());
        }
    }
}

/// Live entry for `key`, dropping it first when expired.
fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(Entry::is_expired) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> DbResult<Option<JsonValue>> {
        let entries = self.entries.read().await;
        let Some(entry) = entries.get(key).filter(|e| !e.is_expired()) else {
            return Ok(None);
        };
        Ok(Some(match &entry.value {
            Stored::Value(v) => v.clone(),
            Stored::Counter(n) => JsonValue::from(*n),
            Stored::Set(members) => JsonValue::from(members.iter().cloned().collect::<Vec<_>>()),
        }))
    }

    async fn set(&self, key: &str, value: JsonValue, ttl: Option<Duration>) -> DbResult<()> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), Entry::new(Stored::Value(value), ttl));
        self.after_write(&mut entries);
        Ok(())
    }

    async fn delete(&self, key: &str) -> DbResult<bool> {
        let mut entries = self.entries.write().await;
        Ok(entries.remove(key).is_some_and(|e| !e.is_expired()))
    }

    async fn increment(&self, key: &str, by: i64, ttl: Option<Duration>) -> DbResult<i64> {
        let mut entries = self.entries.write().await;
        match live(&mut entries, key) {
            Some(entry) => match &mut entry.value {
                Stored::Counter(n) => {
                    *n += by;
                    Ok(*n)
                }
                Stored::Value(JsonValue::Number(num)) => {
                    let current = num
                        .as_i64()
                        .ok_or_else(|| DbError::cache(format!("Key '{}' is not an integer", key)))?;
                    entry.value = Stored::Counter(current + by);
                    Ok(current + by)
                }
                _ => Err(DbError::cache(format!("Key '{}' is not a counter", key))),
            },
            None => {
                entries.insert(key.to_string(), Entry::new(Stored::Counter(by), ttl));
                self.after_write(&mut entries);
                Ok(by)
            }
        }
    }

    async fn add_to_set(&self, key: &str, member: &str, ttl: Option<Duration>) -> DbResult<()> {
        let mut entries = self.entries.write().await;
        match live(&mut entries, key) {
            Some(entry) => match &mut entry.value {
                Stored::Set(members) => {
                    members.insert(member.to_string());
                    entry.extend(ttl);
                    Ok(())
                }
                _ => Err(DbError::cache(format!("Key '{}' is not a set", key))),
            },
            None => {
                let members = BTreeSet::from([member.to_string()]);
                entries.insert(key.to_string(), Entry::new(Stored::Set(members), ttl));
                self.after_write(&mut entries);
                Ok(())
            }
        }
    }

    async fn remove_from_set(&self, key: &str, members: &[String]) -> DbResult<usize> {
        let mut entries = self.entries.write().await;
        let Some(entry) = live(&mut entries, key) else {
            return Ok(0);
        };
        let Stored::Set(set) = &mut entry.value else {
            return Err(DbError::cache(format!("Key '{}' is not a set", key)));
        };
        let removed = members.iter().filter(|m| set.remove(m.as_str())).count();
        if set.is_empty() {
            entries.remove(key);
        }
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> DbResult<Vec<String>> {
        let entries = self.entries.read().await;
        match entries.get(key).filter(|e| !e.is_expired()).map(|e| &e.value) {
            Some(Stored::Set(members)) => Ok(members.iter().cloned().collect()),
            Some(_) => Err(DbError::cache(format!("Key '{}' is not a set", key))),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemoryStore::new();
        store.set("k", json!({"a": 1}), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(json!({"a": 1})));
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let store = MemoryStore::new();
        store
            .set("k", json!(1), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(store.get("k").await.unwrap().is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get("k").await.unwrap().is_none());
        assert_eq!(store.purge_expired().await, 1);
        assert!(store.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_increment_keeps_original_ttl() {
        let store = MemoryStore::new();
        let ttl = Some(Duration::from_secs(60));
        assert_eq!(store.increment("c", 2, ttl).await.unwrap(), 2);
        tokio::time::advance(Duration::from_secs(40)).await;
        assert_eq!(store.increment("c", 3, ttl).await.unwrap(), 5);
        tokio::time::advance(Duration::from_secs(30)).await;
        // expired at 60s; the next increment starts over
        assert_eq!(store.increment("c", 1, ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_increment_type_mismatch() {
        let store = MemoryStore::new();
        store.set("s", json!("text"), None).await.unwrap();
        assert!(matches!(
            store.increment("s", 1, None).await,
            Err(DbError::Cache { .. })
        ));
        store.set("n", json!(4), None).await.unwrap();
        assert_eq!(store.increment("n", 1, None).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_sets() {
        let store = MemoryStore::new();
        store.add_to_set("tag", "b", None).await.unwrap();
        store.add_to_set("tag", "a", None).await.unwrap();
        store.add_to_set("tag", "a", None).await.unwrap();
        assert_eq!(store.set_members("tag").await.unwrap(), vec!["a", "b"]);
        assert!(store.set_members("missing").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_expiry_follows_longest_member() {
        let store = MemoryStore::new();
        store.add_to_set("tag", "long", Some(Duration::from_secs(60))).await.unwrap();
        store.add_to_set("tag", "short", Some(Duration::from_secs(5))).await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(store.set_members("tag").await.unwrap(), vec!["long", "short"]);

        // refreshed to 50s from now
        store.add_to_set("tag", "late", Some(Duration::from_secs(50))).await.unwrap();
        tokio::time::advance(Duration::from_secs(40)).await;
        assert_eq!(store.set_members("tag").await.unwrap().len(), 3);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.set_members("tag").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_from_set() {
        let store = MemoryStore::new();
        for m in ["a", "b", "c"] {
            store.add_to_set("tag", m, None).await.unwrap();
        }
        let removed = store
            .remove_from_set("tag", &["a".to_string(), "x".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.set_members("tag").await.unwrap(), vec!["b", "c"]);

        store
            .remove_from_set("tag", &["b".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert!(store.entries.read().await.get("tag").is_none());
        assert_eq!(store.remove_from_set("missing", &[]).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_sweep_unread_expired_entries() {
        let store = MemoryStore::new();
        for i in 0..PURGE_INTERVAL - 1 {
            store
                .set(&format!("short:{i}"), json!(i), Some(Duration::from_secs(1)))
                .await
                .unwrap();
        }
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.entries.read().await.len(), PURGE_INTERVAL - 1);

        store.set("kept", json!(true), None).await.unwrap();
        assert_eq!(store.entries.read().await.len(), 1);
        assert_eq!(store.get("kept").await.unwrap(), Some(json!(true)));
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let store = MemoryStore::new();
        let other = store.clone();
        store.increment("hits", 1, None).await.unwrap();
        assert_eq!(other.get("hits").await.unwrap(), Some(json!(1)));
        other.clear().await;
        assert_eq!(store.len().await, 0);
    }
}
