//! Shared in-memory distributed tier
//!
//! Clones share one map, so several `TieredCache` instances built from
//! clones of the same provider behave like processes sharing one remote
//! cache. Suitable for single-node deployments and tests.

use crate::cache::errors::{CacheError, CacheResult};
use crate::cache::traits::DistributedCache;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Instant,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryDistributedCache {
    entries: Arc<DashMap<String, StoredValue>>,
    offline: Arc<AtomicBool>,
}

impl InMemoryDistributedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with a connection error until reset
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn ensure_online(&self) -> CacheResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CacheError::ConnectionError(
                "in-memory distributed cache is offline".to_string(),
            ));
        }
        Ok(())
    }
}

impl DistributedCache for InMemoryDistributedCache {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        self.ensure_online()?;

        let now = Instant::now();
        let hit = match self.entries.get(key) {
            Some(stored) if stored.expires_at > now => Some(stored.bytes.clone()),
            Some(_) => None,
            None => return Ok(None),
        };

        if hit.is_none() {
            self.entries.remove_if(key, |_, stored| stored.expires_at <= now);
        }
        Ok(hit)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        self.ensure_online()?;
        self.entries.insert(
            key.to_string(),
            StoredValue {
                bytes: value.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.ensure_online()?;
        self.entries.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> CacheResult<u64> {
        self.ensure_online()?;
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        let deleted = before.saturating_sub(self.entries.len()) as u64;
        debug!(prefix, deleted, "In-memory prefix delete");
        Ok(deleted)
    }

    async fn health_check(&self) -> CacheResult<bool> {
        Ok(!self.offline.load(Ordering::SeqCst))
    }

    fn provider_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clones_share_state() {
        let a = InMemoryDistributedCache::new();
        let b = a.clone();

        a.set("k", b"v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(b.get("k").await.unwrap(), Some(b"v".to_vec()));

        b.delete("k").await.unwrap();
        assert_eq!(a.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let cache = InMemoryDistributedCache::new();
        cache.set("k", b"v", Duration::from_secs(1)).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_offline_fails_operations() {
        let cache = InMemoryDistributedCache::new();
        cache.set_offline(true);

        assert!(matches!(
            cache.get("k").await,
            Err(CacheError::ConnectionError(_))
        ));
        assert!(!cache.health_check().await.unwrap());

        cache.set_offline(false);
        assert!(cache.get("k").await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let cache = InMemoryDistributedCache::new();
        for key in ["zephyr:todo:1", "zephyr:todo:2", "zephyr:user:1"] {
            cache.set(key, b"v", Duration::from_secs(60)).await.unwrap();
        }

        assert_eq!(cache.delete_prefix("zephyr:todo:").await.unwrap(), 2);
        assert_eq!(cache.len(), 1);
    }
}
