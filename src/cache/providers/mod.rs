//! Distributed tier implementations

pub mod in_memory;
pub mod noop;

#[cfg(feature = "cache-redis")]
pub mod redis;

pub use in_memory::InMemoryDistributedCache;
pub use noop::NoOpDistributedCache;

#[cfg(feature = "cache-redis")]
pub use self::redis::RedisCache;
