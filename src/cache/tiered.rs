//! Tiered cache coordinator
//!
//! Read path: local tier, then distributed tier (populating local), then a
//! single-flight load whose result is written through to the distributed
//! tier and then the local tier.
//!
//! Write path: `put` and `invalidate` touch the distributed tier first and
//! the local tier second. When the distributed step fails the local entry is
//! still invalidated and the error is returned, so a failure costs a miss,
//! never a stale hit.

use super::entry::{CacheEntry, VersionClock};
use super::errors::{CacheError, CacheResult};
use super::local::LocalCache;
use super::provider::DistributedTier;
use super::single_flight::{Role, SingleFlight};
use crate::config::CacheConfig;
use crate::error::CoreError;
use crate::log_cache;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

type Loaded = Option<Vec<u8>>;

#[derive(Debug, Default)]
struct AtomicCacheStats {
    local_hits: AtomicU64,
    distributed_hits: AtomicU64,
    loads: AtomicU64,
    coalesced: AtomicU64,
    distributed_errors: AtomicU64,
}

/// Snapshot of coordinator counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub local_hits: u64,
    pub distributed_hits: u64,
    /// Loader invocations
    pub loads: u64,
    /// Callers that waited on another caller's load
    pub coalesced: u64,
    pub distributed_errors: u64,
    pub local_entries: u64,
}

/// Two-tier cache with single-flight loading
#[derive(Debug)]
pub struct TieredCache {
    local: LocalCache,
    distributed: DistributedTier,
    flights: SingleFlight<Loaded>,
    clock: VersionClock,
    default_ttl: Duration,
    negative_ttl: Duration,
    stats: AtomicCacheStats,
}

impl TieredCache {
    pub fn new(config: &CacheConfig, distributed: DistributedTier) -> Self {
        Self::with_local(
            LocalCache::new(config.local.max_capacity, config.default_ttl()),
            distributed,
            config.default_ttl(),
            config.negative_ttl(),
        )
    }

    pub fn with_local(
        local: LocalCache,
        distributed: DistributedTier,
        default_ttl: Duration,
        negative_ttl: Duration,
    ) -> Self {
        Self {
            local,
            distributed,
            flights: SingleFlight::new(),
            clock: VersionClock::new(),
            default_ttl,
            negative_ttl,
            stats: AtomicCacheStats::default(),
        }
    }

    pub fn distributed(&self) -> &DistributedTier {
        &self.distributed
    }

    pub fn local(&self) -> &LocalCache {
        &self.local
    }

    /// Read `key`, loading it with `loader` on a miss in both tiers
    ///
    /// `Ok(None)` means the key is known absent (a loader returned `None`,
    /// now remembered as a short-lived tombstone).
    pub async fn get<F, Fut>(&self, key: &str, loader: F) -> CacheResult<Option<Vec<u8>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<Vec<u8>>, CoreError>>,
    {
        self.get_with_ttl(key, self.default_ttl, loader).await
    }

    pub async fn get_with_ttl<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        loader: F,
    ) -> CacheResult<Option<Vec<u8>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<Vec<u8>>, CoreError>>,
    {
        if let Some(entry) = self.local.get(key).await {
            self.stats.local_hits.fetch_add(1, Ordering::Relaxed);
            log_cache!(trace, "Local hit", cache_key: key, tombstone: entry.is_tombstone());
            return Ok(entry.value.clone());
        }

        if let Some(entry) = self.read_distributed(key).await {
            self.stats.distributed_hits.fetch_add(1, Ordering::Relaxed);
            let value = entry.value.clone();
            self.local.insert(entry).await;
            return Ok(value);
        }

        let guard = loop {
            match self.flights.join(key) {
                Role::Leader(guard) => break guard,
                Role::Follower(receiver) => {
                    self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                    match SingleFlight::wait(receiver).await {
                        Some(result) => return result,
                        None => {
                            log_cache!(debug, "Load leader went away, retrying", cache_key: key);
                        }
                    }
                }
            }
        };

        // a previous leader may have finished between our miss and our join
        if let Some(entry) = self.local.get(key).await {
            let value = entry.value.clone();
            guard.complete(Ok(value.clone()));
            return Ok(value);
        }

        self.stats.loads.fetch_add(1, Ordering::Relaxed);
        let result = match loader().await {
            Ok(loaded) => {
                let ttl = if loaded.is_some() { ttl } else { self.negative_ttl };
                let entry = CacheEntry::new(key, loaded, ttl, self.clock.next());
                self.write_through(&entry, guard.is_invalidated()).await;
                if guard.is_invalidated() {
                    // an invalidation landed while we wrote; don't leave our copy behind
                    if let Err(err) = self.distributed.delete(key).await {
                        self.stats.distributed_errors.fetch_add(1, Ordering::Relaxed);
                        log_cache!(warn, "Distributed delete after racing invalidation failed", cache_key: key, error: err.to_string());
                    }
                }
                Ok(entry.value)
            }
            Err(err) => {
                log_cache!(warn, "Loader failed, nothing cached", cache_key: key, error: err.to_string());
                Err(CacheError::Loader(err))
            }
        };

        guard.complete(result.clone());
        result
    }

    /// Store `value` in both tiers, distributed first
    pub async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> CacheResult<()> {
        self.flights.mark_invalidated(key);
        let entry = CacheEntry::new(key, Some(value), ttl, self.clock.next());
        let encoded = entry.encode()?;

        if let Err(err) = self.distributed.set(key, &encoded, ttl).await {
            self.stats.distributed_errors.fetch_add(1, Ordering::Relaxed);
            self.local.invalidate(key, self.clock.next()).await;
            log_cache!(warn, "Distributed write failed, local entry invalidated", cache_key: key, error: err.to_string());
            return Err(err);
        }

        self.local.insert(entry).await;
        log_cache!(debug, "Stored", cache_key: key, ttl_ms: ttl.as_millis() as u64);
        Ok(())
    }

    /// Remove `key` from both tiers, distributed first
    pub async fn invalidate(&self, key: &str) -> CacheResult<()> {
        self.flights.mark_invalidated(key);
        let distributed = self.distributed.delete(key).await;
        self.local.invalidate(key, self.clock.next()).await;

        if let Err(err) = distributed {
            self.stats.distributed_errors.fetch_add(1, Ordering::Relaxed);
            log_cache!(warn, "Distributed delete failed", cache_key: key, error: err.to_string());
            return Err(err);
        }

        log_cache!(debug, "Invalidated", cache_key: key);
        Ok(())
    }

    /// Remove every key starting with `prefix` from both tiers
    pub async fn invalidate_prefix(&self, prefix: &str) -> CacheResult<u64> {
        self.flights.mark_invalidated_prefix(prefix);
        let distributed = self.distributed.delete_prefix(prefix).await;
        let local = self.local.invalidate_prefix(prefix, self.clock.next()).await;

        match distributed {
            Ok(deleted) => {
                log_cache!(debug, "Prefix invalidated", cache_key: prefix, distributed: deleted, local: local);
                Ok(deleted.max(local as u64))
            }
            Err(err) => {
                self.stats.distributed_errors.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    /// JSON convenience over [`TieredCache::get`]
    pub async fn get_json<T, F, Fut>(&self, key: &str, loader: F) -> CacheResult<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, CoreError>>,
    {
        let bytes = self
            .get(key, || async move {
                let loaded = loader().await?;
                let encoded = loaded.map(|value| serde_json::to_vec(&value)).transpose()?;
                Ok::<_, CoreError>(encoded)
            })
            .await?;

        bytes
            .map(|bytes| serde_json::from_slice(&bytes).map_err(CacheError::from))
            .transpose()
    }

    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> CacheResult<()> {
        self.put(key, serde_json::to_vec(value)?, ttl).await
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            local_hits: self.stats.local_hits.load(Ordering::Relaxed),
            distributed_hits: self.stats.distributed_hits.load(Ordering::Relaxed),
            loads: self.stats.loads.load(Ordering::Relaxed),
            coalesced: self.stats.coalesced.load(Ordering::Relaxed),
            distributed_errors: self.stats.distributed_errors.load(Ordering::Relaxed),
            local_entries: self.local.entry_count(),
        }
    }

    async fn read_distributed(&self, key: &str) -> Option<CacheEntry> {
        let bytes = match self.distributed.get(key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                self.stats.distributed_errors.fetch_add(1, Ordering::Relaxed);
                log_cache!(debug, "Distributed read failed, treating as miss", cache_key: key, error: err.to_string());
                return None;
            }
        };

        match CacheEntry::decode(&bytes) {
            Ok(entry) if entry.key == key && !entry.is_expired() => Some(entry),
            Ok(_) => None,
            Err(err) => {
                log_cache!(warn, "Undecodable distributed entry ignored", cache_key: key, error: err.to_string());
                None
            }
        }
    }

    async fn write_through(&self, entry: &CacheEntry, invalidated: bool) {
        if invalidated {
            return;
        }

        let encoded = match entry.encode() {
            Ok(encoded) => encoded,
            Err(err) => {
                log_cache!(warn, "Entry encoding failed", cache_key: entry.key, error: err.to_string());
                return;
            }
        };

        match self.distributed.set(&entry.key, &encoded, entry.ttl()).await {
            Ok(()) => {
                self.local.insert(entry.clone()).await;
            }
            Err(err) => {
                self.stats.distributed_errors.fetch_add(1, Ordering::Relaxed);
                log_cache!(warn, "Write-through failed, value served uncached", cache_key: entry.key, error: err.to_string());
            }
        }
    }
}
