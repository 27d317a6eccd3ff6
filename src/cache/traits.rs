//! Distributed cache capability

use super::errors::CacheResult;
use std::time::Duration;

/// Network key-value capability used as the second cache tier
///
/// The core depends only on these operations, never on a specific backing
/// technology. Values are opaque bytes; the tiered cache stores its own
/// versioned envelope inside them.
pub trait DistributedCache: Send + Sync {
    /// Returns `Ok(Some(bytes))` on hit, `Ok(None)` on miss
    fn get(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = CacheResult<Option<Vec<u8>>>> + Send;

    fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> impl std::future::Future<Output = CacheResult<()>> + Send;

    fn delete(&self, key: &str) -> impl std::future::Future<Output = CacheResult<()>> + Send;

    /// Delete every key starting with `prefix`, returning how many went
    fn delete_prefix(
        &self,
        prefix: &str,
    ) -> impl std::future::Future<Output = CacheResult<u64>> + Send;

    fn health_check(&self) -> impl std::future::Future<Output = CacheResult<bool>> + Send;

    fn provider_name(&self) -> &'static str;
}
