use crate::matching::fuzzy::normalize_name;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::sync::Mutex;

/// Cross-request key-value store with TTL. Writes are idempotent and
/// last-writer-wins; concurrent writers computing the same key are fine.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<()>;
}

/// Cache key for comps lookups: normalized `cardName|set`.
pub fn comps_cache_key(card_name: &str, set: Option<&str>) -> String {
    format!(
        "{}|{}",
        normalize_name(card_name),
        set.map(normalize_name).unwrap_or_default()
    )
}

struct Entry {
    payload: String,
    expires_at: i64, // unix seconds
}

/// In-memory KvStore: LRU for capacity, per-entry TTL checked lazily on read.
pub struct MemoryKvStore {
    inner: Mutex<LruCache<String, Entry>>,
}

impl MemoryKvStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut cache = self.inner.lock().await;
        let now = Utc::now().timestamp();
        match cache.get(key) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.payload.clone())),
            Some(_) => {
                // expired; evict eagerly so it cannot shadow a fresh write
                cache.pop(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut cache = self.inner.lock().await;
        cache.put(
            key.to_string(),
            Entry {
                payload: value,
                expires_at: Utc::now().timestamp() + ttl.as_secs() as i64,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_normalizes_name_and_set() {
        assert_eq!(
            comps_cache_key("Charizard VMAX", Some("Lost Origin")),
            "charizard vmax|lost origin"
        );
        assert_eq!(
            comps_cache_key("  Charizard  VMAX ", Some("LOST ORIGIN")),
            "charizard vmax|lost origin"
        );
        assert_eq!(comps_cache_key("Pikachu", None), "pikachu|");
    }

    #[tokio::test]
    async fn put_then_get_within_ttl() {
        let store = MemoryKvStore::new(16);
        store
            .put("k", "v".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn expired_entries_read_as_miss() {
        let store = MemoryKvStore::new(16);
        store
            .put("k", "v".to_string(), Duration::from_secs(0))
            .await
            .unwrap();
        // same-second expiry: expires_at == now, which is not strictly greater
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn last_writer_wins() {
        let store = MemoryKvStore::new(16);
        store
            .put("k", "first".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .put("k", "second".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("second".to_string()));
    }
}
