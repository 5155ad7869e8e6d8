//! Thin TTL-aware cache wrapper over the store's `cache` table. Used to
//! rate-limit split-target resyncs and to memoize the daily set of
//! herd-tagged note ids.

use crate::error::HerdResult;
use crate::store::Store;

#[derive(Clone)]
pub struct Cache {
    store: Store,
}

impl Cache {
    pub fn new(store: Store) -> Self {
        Cache { store }
    }

    pub async fn get(&self, key: &str) -> HerdResult<Option<String>> {
        self.store.cache_get(key).await
    }

    pub async fn set(&self, key: &str, value: &str, ttl_secs: i64) -> HerdResult<()> {
        self.store.cache_set(key, value, ttl_secs).await
    }

    /// True if `key` is present and unexpired; does not refresh its TTL.
    pub async fn has_fresh(&self, key: &str) -> HerdResult<bool> {
        Ok(self.store.cache_get(key).await?.is_some())
    }

    pub async fn purge_expired(&self) -> HerdResult<usize> {
        self.store.cache_purge_expired().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = Store::open(":memory:").unwrap();
        let cache = Cache::new(store);
        cache.set("k", "v", 60).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));
        assert!(cache.has_fresh("k").await.unwrap());
    }

    #[tokio::test]
    async fn expired_entries_are_absent() {
        let store = Store::open(":memory:").unwrap();
        let cache = Cache::new(store);
        cache.set("k", "v", -1).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(!cache.has_fresh("k").await.unwrap());
    }
}
