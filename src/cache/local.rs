//! In-process cache tier backed by Moka
//!
//! Bounded, least-recently-used eviction with per-entry TTL. Every slot
//! carries a version and an insert only lands if it is newer than what the
//! slot holds, so a slow reader can never overwrite a fresher write or
//! resurrect a key that was invalidated after it read.

use super::entry::CacheEntry;
use moka::future::Cache;
use moka::ops::compute::Op;
use moka::policy::EvictionPolicy;
use moka::Expiry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone)]
enum Slot {
    Live(Arc<CacheEntry>),
    /// Blocks older versions from re-populating an invalidated key
    Invalidated { version: u64, ttl: Duration },
}

impl Slot {
    fn version(&self) -> u64 {
        match self {
            Slot::Live(entry) => entry.version,
            Slot::Invalidated { version, .. } => *version,
        }
    }

    fn time_to_live(&self) -> Duration {
        match self {
            Slot::Live(entry) => entry.remaining_ttl().unwrap_or(Duration::ZERO),
            Slot::Invalidated { ttl, .. } => *ttl,
        }
    }
}

struct SlotExpiry;

impl Expiry<String, Slot> for SlotExpiry {
    fn expire_after_create(&self, _key: &String, value: &Slot, _created_at: Instant) -> Option<Duration> {
        Some(value.time_to_live())
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Slot,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.time_to_live())
    }
}

/// Local (first) cache tier
#[derive(Clone)]
pub struct LocalCache {
    cache: Cache<String, Slot>,
    marker_ttl: Duration,
}

impl std::fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache")
            .field("max_capacity", &self.cache.policy().max_capacity())
            .field("entry_count", &self.cache.entry_count())
            .finish()
    }
}

impl LocalCache {
    /// `marker_ttl` bounds how long an invalidation keeps blocking stale
    /// re-population of its key
    pub fn new(max_capacity: u64, marker_ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .eviction_policy(EvictionPolicy::lru())
            .expire_after(SlotExpiry)
            .build();

        debug!(max_capacity, "Local cache tier created");

        Self { cache, marker_ttl }
    }

    /// Live, unexpired entry for `key` (tombstones included)
    pub async fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        match self.cache.get(key).await {
            Some(Slot::Live(entry)) if !entry.is_expired() => Some(entry),
            _ => None,
        }
    }

    /// Store `entry` unless the slot already holds the same or a newer version
    ///
    /// Returns whether the entry was stored.
    pub async fn insert(&self, entry: CacheEntry) -> bool {
        if entry.is_expired() {
            return false;
        }

        let key = entry.key.clone();
        let version = entry.version;
        let incoming = Slot::Live(Arc::new(entry));
        let result = self
            .cache
            .entry(key)
            .and_compute_with(|existing| {
                let op = match existing {
                    Some(current) if current.value().version() >= version => Op::Nop,
                    _ => Op::Put(incoming),
                };
                std::future::ready(op)
            })
            .await;

        matches!(
            result,
            moka::ops::compute::CompResult::Inserted(_)
                | moka::ops::compute::CompResult::ReplacedWith(_)
        )
    }

    /// Drop `key`, leaving a marker at `version`
    pub async fn invalidate(&self, key: &str, version: u64) {
        let marker = Slot::Invalidated {
            version,
            ttl: self.marker_ttl,
        };
        self.cache
            .entry_by_ref(key)
            .and_compute_with(|existing| {
                let op = match existing {
                    Some(current) if current.value().version() > version => Op::Nop,
                    _ => Op::Put(marker.clone()),
                };
                std::future::ready(op)
            })
            .await;
    }

    /// Invalidate every live key starting with `prefix`
    pub async fn invalidate_prefix(&self, prefix: &str, version: u64) -> usize {
        let keys: Vec<String> = self
            .cache
            .iter()
            .filter(|(key, slot)| key.starts_with(prefix) && matches!(slot, Slot::Live(_)))
            .map(|(key, _)| key.as_ref().clone())
            .collect();

        for key in &keys {
            self.invalidate(key, version).await;
        }
        keys.len()
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Flush Moka's deferred maintenance (eviction, expiry, counts)
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}
