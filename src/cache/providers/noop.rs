//! No-op distributed tier
//!
//! Always misses, always succeeds. Used when the distributed tier is
//! disabled or its backend could not be reached at startup.

use crate::cache::errors::CacheResult;
use crate::cache::traits::DistributedCache;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct NoOpDistributedCache;

impl NoOpDistributedCache {
    pub fn new() -> Self {
        Self
    }
}

impl DistributedCache for NoOpDistributedCache {
    async fn get(&self, _key: &str) -> CacheResult<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> CacheResult<()> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> CacheResult<()> {
        Ok(())
    }

    async fn delete_prefix(&self, _prefix: &str) -> CacheResult<u64> {
        Ok(0)
    }

    async fn health_check(&self) -> CacheResult<bool> {
        Ok(true)
    }

    fn provider_name(&self) -> &'static str {
        "noop"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_always_misses() {
        let svc = NoOpDistributedCache::new();
        svc.set("k", b"v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(svc.get("k").await.unwrap(), None);
        assert_eq!(svc.delete_prefix("k").await.unwrap(), 0);
        assert!(svc.health_check().await.unwrap());
    }
}
