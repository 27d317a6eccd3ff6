//! Distributed tier with integrated circuit breaker
//!
//! Enum dispatch over the configured backend. Guarding is internal: when the
//! breaker for `cache:distributed` is open, operations fail fast with
//! `CacheError::Unavailable` instead of paying a network timeout, and the
//! tiered cache treats that as a miss (reads) or a surfaced error (writes).

use super::errors::{CacheError, CacheResult};
use super::providers::{InMemoryDistributedCache, NoOpDistributedCache};
use super::traits::DistributedCache;
use crate::config::CacheConfig;
use crate::resilience::{BreakerError, CircuitBreaker, CircuitBreakerRegistry, CircuitState};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[cfg(feature = "cache-redis")]
use super::providers::RedisCache;

/// Operation key of the breaker guarding the distributed tier
pub const DISTRIBUTED_CACHE_OPERATION_KEY: &str = "cache:distributed";

#[derive(Debug, Clone)]
enum DistributedBackend {
    #[cfg(feature = "cache-redis")]
    Redis(Box<RedisCache>),
    InMemory(InMemoryDistributedCache),
    NoOp(NoOpDistributedCache),
}

impl DistributedBackend {
    fn provider_name(&self) -> &'static str {
        match self {
            #[cfg(feature = "cache-redis")]
            Self::Redis(s) => s.provider_name(),
            Self::InMemory(s) => s.provider_name(),
            Self::NoOp(s) => s.provider_name(),
        }
    }

    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        match self {
            #[cfg(feature = "cache-redis")]
            Self::Redis(s) => s.get(key).await,
            Self::InMemory(s) => s.get(key).await,
            Self::NoOp(s) => s.get(key).await,
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        match self {
            #[cfg(feature = "cache-redis")]
            Self::Redis(s) => s.set(key, value, ttl).await,
            Self::InMemory(s) => s.set(key, value, ttl).await,
            Self::NoOp(s) => s.set(key, value, ttl).await,
        }
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        match self {
            #[cfg(feature = "cache-redis")]
            Self::Redis(s) => s.delete(key).await,
            Self::InMemory(s) => s.delete(key).await,
            Self::NoOp(s) => s.delete(key).await,
        }
    }

    async fn delete_prefix(&self, prefix: &str) -> CacheResult<u64> {
        match self {
            #[cfg(feature = "cache-redis")]
            Self::Redis(s) => s.delete_prefix(prefix).await,
            Self::InMemory(s) => s.delete_prefix(prefix).await,
            Self::NoOp(s) => s.delete_prefix(prefix).await,
        }
    }

    async fn health_check(&self) -> CacheResult<bool> {
        match self {
            #[cfg(feature = "cache-redis")]
            Self::Redis(s) => s.health_check().await,
            Self::InMemory(s) => s.health_check().await,
            Self::NoOp(s) => s.health_check().await,
        }
    }
}

/// Second cache tier: backend, key namespace and optional breaker
#[derive(Clone)]
pub struct DistributedTier {
    backend: DistributedBackend,
    circuit_breaker: Option<Arc<CircuitBreaker>>,
    key_prefix: String,
}

impl std::fmt::Debug for DistributedTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedTier")
            .field("backend", &self.backend)
            .field("key_prefix", &self.key_prefix)
            .field(
                "circuit_breaker",
                &self.circuit_breaker.as_ref().map(|cb| cb.state()),
            )
            .finish()
    }
}

impl DistributedTier {
    /// Build the configured backend, degrading to NoOp if it cannot connect
    ///
    /// When `registry` is given and `cache.distributed.guarded` is set, calls
    /// are guarded by the registry's `cache:distributed` breaker so its state
    /// shows up in breaker metrics and health.
    pub async fn from_config_graceful(
        config: &CacheConfig,
        registry: Option<&CircuitBreakerRegistry>,
    ) -> Self {
        let backend = Self::create_backend(config).await;

        let circuit_breaker = match (registry, &backend) {
            (_, DistributedBackend::NoOp(_)) => None,
            (Some(registry), _) if config.distributed.guarded => {
                Some(registry.breaker(DISTRIBUTED_CACHE_OPERATION_KEY))
            }
            _ => None,
        };

        info!(
            backend = backend.provider_name(),
            guarded = circuit_breaker.is_some(),
            key_prefix = %config.key_prefix,
            "Distributed cache tier initialized"
        );

        Self {
            backend,
            circuit_breaker,
            key_prefix: config.key_prefix.clone(),
        }
    }

    async fn create_backend(config: &CacheConfig) -> DistributedBackend {
        match config.distributed.backend.as_str() {
            "redis" | "valkey" => Self::create_redis_backend(config).await,
            "memory" | "in-memory" => DistributedBackend::InMemory(InMemoryDistributedCache::new()),
            "noop" => DistributedBackend::NoOp(NoOpDistributedCache::new()),
            other => {
                warn!(backend = other, "Unknown distributed cache backend, falling back to NoOp");
                DistributedBackend::NoOp(NoOpDistributedCache::new())
            }
        }
    }

    #[cfg(feature = "cache-redis")]
    async fn create_redis_backend(config: &CacheConfig) -> DistributedBackend {
        let Some(redis_config) = &config.distributed.redis else {
            warn!("Redis backend selected but no [cache.distributed.redis] config found, falling back to NoOp");
            return DistributedBackend::NoOp(NoOpDistributedCache::new());
        };

        match RedisCache::from_config(redis_config).await {
            Ok(service) => DistributedBackend::Redis(Box::new(service)),
            Err(e) => {
                warn!(
                    error = %e,
                    "Failed to connect to Redis, falling back to NoOp cache (graceful degradation)"
                );
                DistributedBackend::NoOp(NoOpDistributedCache::new())
            }
        }
    }

    #[cfg(not(feature = "cache-redis"))]
    async fn create_redis_backend(_config: &CacheConfig) -> DistributedBackend {
        warn!("Redis backend requested but 'cache-redis' feature not enabled, using NoOp");
        DistributedBackend::NoOp(NoOpDistributedCache::new())
    }

    /// Tier over a shared in-memory map (no prefix, unguarded)
    pub fn in_memory(cache: InMemoryDistributedCache) -> Self {
        Self {
            backend: DistributedBackend::InMemory(cache),
            circuit_breaker: None,
            key_prefix: String::new(),
        }
    }

    pub fn noop() -> Self {
        Self {
            backend: DistributedBackend::NoOp(NoOpDistributedCache::new()),
            circuit_breaker: None,
            key_prefix: String::new(),
        }
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.circuit_breaker = Some(breaker);
        self
    }

    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = key_prefix.into();
        self
    }

    pub fn provider_name(&self) -> &'static str {
        self.backend.provider_name()
    }

    /// False for the NoOp backend
    pub fn is_enabled(&self) -> bool {
        !matches!(self.backend, DistributedBackend::NoOp(_))
    }

    pub fn circuit_state(&self) -> Option<CircuitState> {
        self.circuit_breaker.as_ref().map(|cb| cb.state())
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    async fn guarded<T, F, Fut>(&self, operation: F) -> CacheResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<T>>,
    {
        let Some(breaker) = &self.circuit_breaker else {
            return operation().await;
        };

        breaker.call(operation).await.map_err(|err| match err {
            BreakerError::Open { operation_key } => {
                CacheError::Unavailable(format!("breaker open for {operation_key}"))
            }
            BreakerError::TimedOut { operation_key } => {
                CacheError::Timeout(format!("{operation_key} call exceeded its timeout"))
            }
            BreakerError::Failed(inner) => inner,
        })
    }

    pub async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let key = self.namespaced(key);
        self.guarded(|| self.backend.get(&key)).await
    }

    pub async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> CacheResult<()> {
        let key = self.namespaced(key);
        self.guarded(|| self.backend.set(&key, value, ttl)).await
    }

    pub async fn delete(&self, key: &str) -> CacheResult<()> {
        let key = self.namespaced(key);
        self.guarded(|| self.backend.delete(&key)).await
    }

    pub async fn delete_prefix(&self, prefix: &str) -> CacheResult<u64> {
        let prefix = self.namespaced(prefix);
        self.guarded(|| self.backend.delete_prefix(&prefix)).await
    }

    /// Backend liveness; an open breaker reports unhealthy without a call
    pub async fn health_check(&self) -> CacheResult<bool> {
        if let Some(breaker) = &self.circuit_breaker {
            if !breaker.should_allow() {
                return Ok(false);
            }
        }
        self.backend.health_check().await
    }
}
