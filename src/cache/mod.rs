//! # Tiered Cache
//!
//! A bounded in-process tier in front of a shared distributed tier, with
//! stampede protection on misses.
//!
//! ## Architecture
//!
//! ```text
//! TieredCache
//!   ├── LocalCache (moka, LRU + per-entry TTL, version-monotonic)
//!   ├── DistributedTier (enum dispatch, breaker-guarded)
//!   │     ├── Redis(RedisCache)               <- `cache-redis` feature
//!   │     ├── InMemory(InMemoryDistributedCache)
//!   │     └── NoOp(NoOpDistributedCache)
//!   └── SingleFlight (one loader per key)
//! ```
//!
//! ## Coherence
//!
//! Per key and eventually consistent across processes within the TTL
//! window. Writes and invalidations go distributed-first; a process that
//! invalidates never observes the pre-invalidation value afterwards. Other
//! processes may serve their local copy until it expires.

pub mod entry;
pub mod errors;
pub mod local;
pub mod provider;
pub mod providers;
mod single_flight;
pub mod tiered;
pub mod traits;

pub use entry::{CacheEntry, VersionClock};
pub use errors::{CacheError, CacheResult};
pub use local::LocalCache;
pub use provider::{DistributedTier, DISTRIBUTED_CACHE_OPERATION_KEY};
pub use providers::{InMemoryDistributedCache, NoOpDistributedCache};
pub use tiered::{CacheStats, TieredCache};
pub use traits::DistributedCache;

#[cfg(feature = "cache-redis")]
pub use providers::RedisCache;
