//! Cache entry envelope and version clock
//!
//! Both tiers store the same envelope so a distributed hit can populate the
//! local tier with its original version and remaining TTL.

use super::errors::CacheResult;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A cached value, or a tombstone recording that the loader found nothing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    /// `None` marks a negative-cache tombstone
    pub value: Option<Vec<u8>>,
    /// Wall-clock write time, epoch milliseconds
    pub stored_at_ms: i64,
    pub ttl_ms: u64,
    pub version: u64,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, value: Option<Vec<u8>>, ttl: Duration, version: u64) -> Self {
        Self {
            key: key.into(),
            value,
            stored_at_ms: Utc::now().timestamp_millis(),
            ttl_ms: ttl.as_millis() as u64,
            version,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Time left before expiry, `None` once expired
    pub fn remaining_ttl(&self) -> Option<Duration> {
        let expires_at = self.stored_at_ms.saturating_add(self.ttl_ms as i64);
        let remaining = expires_at - Utc::now().timestamp_millis();
        (remaining > 0).then(|| Duration::from_millis(remaining as u64))
    }

    pub fn is_expired(&self) -> bool {
        self.remaining_ttl().is_none()
    }

    pub fn encode(&self) -> CacheResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> CacheResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Hybrid clock producing strictly increasing versions
///
/// Versions track wall-clock microseconds so that entries written by
/// different processes order roughly by time, but never repeat or go
/// backwards within one process.
#[derive(Debug, Default)]
pub struct VersionClock {
    last: AtomicU64,
}

impl VersionClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        let now = Utc::now().timestamp_micros().max(0) as u64;
        let mut current = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(current + 1);
            match self.last.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(actual) => current = actual,
            }
        }
    }
}
