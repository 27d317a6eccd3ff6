//! # Configuration
//!
//! Typed configuration for every component of the core. Defaults are usable
//! as-is for tests and single-node development; deployments override them
//! through a TOML file and `ZEPHYR__*` environment variables (see
//! [`ConfigLoader`]).
//!
//! ```rust,no_run
//! use zephyr_core::config::ConfigLoader;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigLoader::load()?;
//! let db_breaker = config.breaker.config_for_component("store:todo.by_id");
//! println!("cool-down: {}ms", db_breaker.cooldown_ms);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub breaker: CircuitBreakerSettings,
    pub cache: CacheConfig,
    pub bus: BusConfig,
    pub bridge: BridgeConfig,
    pub store: StoreConfig,
    pub executor: ExecutorConfig,
}

impl CoreConfig {
    /// Validate every section, reporting the first offending field
    pub fn validate(&self) -> ConfigResult<()> {
        self.breaker.validate()?;
        self.cache.validate()?;
        self.bus.validate()?;
        self.bridge.validate()?;
        self.executor.validate()?;
        Ok(())
    }
}

/// What a guarded call returns when the breaker rejects or the call fails
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Surface the rejection or failure to the caller
    #[default]
    FailFast,
    /// Answer with a configured value instead
    StaticValue { value: serde_json::Value },
}

/// Per-operation breaker parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerComponentConfig {
    /// Failure ratio (0, 1] over the window that opens the breaker
    pub failure_ratio_threshold: f64,
    /// Number of most recent outcomes kept in the rolling window
    pub window_size: u32,
    /// Outcomes required in the window before the ratio is evaluated
    pub min_samples: u32,
    /// Outcomes older than this are dropped from the window (0 = never)
    pub window_duration_ms: u64,
    /// Time spent OPEN before probes are admitted
    pub cooldown_ms: u64,
    /// Consecutive probe successes needed to close again
    pub success_threshold: u32,
    /// Concurrent probes admitted while HALF_OPEN
    pub half_open_max_probes: u32,
    /// Re-open when a call arrives beyond the probe limit
    pub reopen_on_probe_overflow: bool,
    /// Per-call timeout applied on top of any command deadline (0 = none)
    pub call_timeout_ms: u64,
    pub fallback: FallbackPolicy,
}

impl Default for BreakerComponentConfig {
    fn default() -> Self {
        Self {
            failure_ratio_threshold: 0.5,
            window_size: 10,
            min_samples: 10,
            window_duration_ms: 0,
            cooldown_ms: 30_000,
            success_threshold: 1,
            half_open_max_probes: 1,
            reopen_on_probe_overflow: true,
            call_timeout_ms: 0,
            fallback: FallbackPolicy::FailFast,
        }
    }
}

impl BreakerComponentConfig {
    /// Convert to the resilience module's runtime format
    pub fn to_resilience_config(&self) -> crate::resilience::CircuitBreakerConfig {
        crate::resilience::CircuitBreakerConfig {
            failure_ratio_threshold: self.failure_ratio_threshold,
            window_size: self.window_size as usize,
            min_samples: self.min_samples as usize,
            window_duration: non_zero_millis(self.window_duration_ms),
            cooldown: Duration::from_millis(self.cooldown_ms),
            success_threshold: self.success_threshold,
            half_open_max_probes: self.half_open_max_probes,
            reopen_on_probe_overflow: self.reopen_on_probe_overflow,
            call_timeout: non_zero_millis(self.call_timeout_ms),
        }
    }

    fn validate(&self, component: &str) -> ConfigResult<()> {
        let field = |name: &str| format!("breaker.{component}.{name}");

        if !(self.failure_ratio_threshold > 0.0 && self.failure_ratio_threshold <= 1.0) {
            return Err(ConfigurationError::invalid_value(
                field("failure_ratio_threshold"),
                self.failure_ratio_threshold,
                "must be in (0, 1]",
            ));
        }
        if self.window_size == 0 {
            return Err(ConfigurationError::invalid_value(
                field("window_size"),
                self.window_size,
                "must be greater than 0",
            ));
        }
        if self.min_samples == 0 || self.min_samples > self.window_size {
            return Err(ConfigurationError::invalid_value(
                field("min_samples"),
                self.min_samples,
                "must be between 1 and window_size",
            ));
        }
        if self.cooldown_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                field("cooldown_ms"),
                self.cooldown_ms,
                "must be greater than 0",
            ));
        }
        if self.success_threshold == 0 {
            return Err(ConfigurationError::invalid_value(
                field("success_threshold"),
                self.success_threshold,
                "must be greater than 0",
            ));
        }
        if self.half_open_max_probes == 0 {
            return Err(ConfigurationError::invalid_value(
                field("half_open_max_probes"),
                self.half_open_max_probes,
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// System-wide breaker configuration with per-operation-key overrides
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// When false every guarded call passes straight through
    pub enabled: bool,
    /// Soft cap on distinct operation keys; exceeding it only logs
    pub max_breakers: usize,
    pub default_config: BreakerComponentConfig,
    pub component_configs: HashMap<String, BreakerComponentConfig>,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_breakers: 1000,
            default_config: BreakerComponentConfig::default(),
            component_configs: HashMap::new(),
        }
    }
}

impl CircuitBreakerSettings {
    /// Get configuration for a specific operation key
    pub fn config_for_component(&self, operation_key: &str) -> BreakerComponentConfig {
        self.component_configs
            .get(operation_key)
            .cloned()
            .unwrap_or_else(|| self.default_config.clone())
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.max_breakers == 0 {
            return Err(ConfigurationError::invalid_value(
                "breaker.max_breakers",
                self.max_breakers,
                "must be greater than 0",
            ));
        }
        self.default_config.validate("default_config")?;
        for (name, component) in &self.component_configs {
            component.validate(name)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalCacheConfig {
    /// Maximum number of entries held in-process
    pub max_capacity: u64,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedCacheConfig {
    /// `redis` / `valkey`, `memory`, or `noop`
    pub backend: String,
    pub redis: Option<RedisConfig>,
    /// Guard distributed calls with a breaker under `cache:distributed`
    pub guarded: bool,
}

impl Default for DistributedCacheConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            redis: None,
            guarded: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub local: LocalCacheConfig,
    pub distributed: DistributedCacheConfig,
    /// Prefix applied to every key in the distributed tier
    pub key_prefix: String,
    /// TTL used when a caller does not supply one
    pub default_ttl_ms: u64,
    /// TTL of "not found" tombstones
    pub negative_ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local: LocalCacheConfig::default(),
            distributed: DistributedCacheConfig::default(),
            key_prefix: "zephyr:".to_string(),
            default_ttl_ms: 3_600_000,
            negative_ttl_ms: 30_000,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_millis(self.negative_ttl_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.local.max_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "cache.local.max_capacity",
                self.local.max_capacity,
                "must be greater than 0",
            ));
        }
        if self.default_ttl_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "cache.default_ttl_ms",
                self.default_ttl_ms,
                "must be greater than 0",
            ));
        }
        if self.negative_ttl_ms == 0 || self.negative_ttl_ms > self.default_ttl_ms {
            return Err(ConfigurationError::invalid_value(
                "cache.negative_ttl_ms",
                self.negative_ttl_ms,
                "must be between 1 and default_ttl_ms",
            ));
        }
        match self.distributed.backend.as_str() {
            "redis" | "valkey" | "memory" | "in-memory" | "noop" => Ok(()),
            other => Err(ConfigurationError::invalid_value(
                "cache.distributed.backend",
                other,
                "expected one of redis, valkey, memory, noop",
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Bounded inbound queue per subscriber
    pub subscriber_queue_capacity: usize,
    /// Deadline applied by `CommandFactory` when the request carries none
    pub default_send_timeout_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            subscriber_queue_capacity: 256,
            default_send_timeout_ms: 30_000,
        }
    }
}

impl BusConfig {
    pub fn default_send_timeout(&self) -> Duration {
        Duration::from_millis(self.default_send_timeout_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.subscriber_queue_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "bus.subscriber_queue_capacity",
                self.subscriber_queue_capacity,
                "must be greater than 0",
            ));
        }
        if self.default_send_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "bus.default_send_timeout_ms",
                self.default_send_timeout_ms,
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// One permitted address: exact match or regular expression
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddressRuleConfig {
    pub address: Option<String>,
    pub address_regex: Option<String>,
}

impl AddressRuleConfig {
    pub fn exact(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            address_regex: None,
        }
    }

    pub fn regex(pattern: impl Into<String>) -> Self {
        Self {
            address: None,
            address_regex: Some(pattern.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub bind_address: String,
    pub protocol_version: String,
    pub max_frame_bytes: usize,
    pub handshake_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub max_missed_heartbeats: u32,
    /// Rejected frames tolerated before the connection is closed
    pub max_violations_before_close: u32,
    /// Violation-closed connections after which a peer address is refused
    pub ban_after_closures: u32,
    pub outbound_queue_capacity: usize,
    /// Deadline for SEND frames without `timeout_ms`
    pub default_send_timeout_ms: u64,
    /// Addresses a peer may SEND or PUBLISH to
    pub inbound_permitted: Vec<AddressRuleConfig>,
    /// Addresses a peer may REGISTER against
    pub outbound_permitted: Vec<AddressRuleConfig>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:7000".to_string(),
            protocol_version: "1".to_string(),
            max_frame_bytes: 1024 * 1024,
            handshake_timeout_ms: 5_000,
            heartbeat_interval_ms: 10_000,
            max_missed_heartbeats: 3,
            max_violations_before_close: 1,
            ban_after_closures: 3,
            outbound_queue_capacity: 256,
            default_send_timeout_ms: 30_000,
            inbound_permitted: Vec::new(),
            outbound_permitted: Vec::new(),
        }
    }
}

impl BridgeConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn default_send_timeout(&self) -> Duration {
        Duration::from_millis(self.default_send_timeout_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.protocol_version.trim().is_empty() || self.protocol_version.contains(' ') {
            return Err(ConfigurationError::invalid_value(
                "bridge.protocol_version",
                &self.protocol_version,
                "must be a non-empty token without spaces",
            ));
        }
        if self.max_frame_bytes == 0 {
            return Err(ConfigurationError::invalid_value(
                "bridge.max_frame_bytes",
                self.max_frame_bytes,
                "must be greater than 0",
            ));
        }
        if self.heartbeat_interval_ms == 0 || self.max_missed_heartbeats == 0 {
            return Err(ConfigurationError::invalid_value(
                "bridge.heartbeat_interval_ms",
                self.heartbeat_interval_ms,
                "heartbeat interval and max_missed_heartbeats must be greater than 0",
            ));
        }
        if self.max_violations_before_close == 0 {
            return Err(ConfigurationError::invalid_value(
                "bridge.max_violations_before_close",
                self.max_violations_before_close,
                "must be greater than 0",
            ));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "bridge.outbound_queue_capacity",
                self.outbound_queue_capacity,
                "must be greater than 0",
            ));
        }
        // Surface bad patterns at load time rather than on first connection
        crate::bridge::AllowList::from_config(self)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Falls back to `DATABASE_URL` when empty
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            max_connections: 10,
            acquire_timeout_ms: 5_000,
        }
    }
}

impl StoreConfig {
    /// Resolve the connection URL from config or environment
    pub fn resolved_url(&self) -> Option<String> {
        if !self.database_url.is_empty() {
            return Some(self.database_url.clone());
        }
        std::env::var("DATABASE_URL").ok().filter(|url| !url.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Event-loop workers driving dispatcher and bridge I/O
    pub event_loop_workers: usize,
    /// Threads in the secondary pool for blocking work
    pub blocking_workers: usize,
    /// Jobs that may wait for a blocking worker before `Backpressure`
    pub blocking_queue_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            event_loop_workers: 4,
            blocking_workers: 2,
            blocking_queue_capacity: 64,
        }
    }
}

impl ExecutorConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.event_loop_workers == 0 {
            return Err(ConfigurationError::invalid_value(
                "executor.event_loop_workers",
                self.event_loop_workers,
                "must be greater than 0",
            ));
        }
        if self.blocking_workers == 0 {
            return Err(ConfigurationError::invalid_value(
                "executor.blocking_workers",
                self.blocking_workers,
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}
