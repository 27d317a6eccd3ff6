//! # Circuit Breaker Configuration
//!
//! Runtime parameters for a single breaker. System-wide settings with
//! per-operation overrides live in `crate::config::CircuitBreakerSettings`.

use std::time::Duration;

/// Configuration for a single circuit breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Failure ratio over the rolling window at which the circuit opens
    pub failure_ratio_threshold: f64,

    /// Number of most recent outcomes retained
    pub window_size: usize,

    /// Outcomes required before the ratio is evaluated
    pub min_samples: usize,

    /// Outcomes older than this no longer count
    pub window_duration: Option<Duration>,

    /// Time to wait in open state before admitting probes
    pub cooldown: Duration,

    /// Consecutive probe successes required to close the circuit
    pub success_threshold: u32,

    /// Concurrent probes admitted while half-open
    pub half_open_max_probes: u32,

    /// Re-open when a call arrives while every probe slot is taken
    pub reopen_on_probe_overflow: bool,

    /// Upper bound on a single guarded call
    pub call_timeout: Option<Duration>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_ratio_threshold: 0.5,
            window_size: 10,
            min_samples: 10,
            window_duration: None,
            cooldown: Duration::from_secs(30),
            success_threshold: 1,
            half_open_max_probes: 1,
            reopen_on_probe_overflow: true,
            call_timeout: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Configuration for store statements
    pub fn for_store() -> Self {
        Self {
            cooldown: Duration::from_secs(30),
            success_threshold: 2,
            half_open_max_probes: 2,
            ..Self::default()
        }
    }

    /// Configuration for the distributed cache tier; opens quickly so a
    /// flapping cache degrades to local-only reads
    pub fn for_distributed_cache() -> Self {
        Self {
            window_size: 20,
            min_samples: 5,
            cooldown: Duration::from_secs(5),
            call_timeout: Some(Duration::from_millis(500)),
            ..Self::default()
        }
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if !(self.failure_ratio_threshold > 0.0 && self.failure_ratio_threshold <= 1.0) {
            return Err("failure_ratio_threshold must be in (0, 1]".to_string());
        }

        if self.window_size == 0 {
            return Err("window_size must be greater than 0".to_string());
        }

        if self.min_samples == 0 || self.min_samples > self.window_size {
            return Err("min_samples must be between 1 and window_size".to_string());
        }

        if self.cooldown.is_zero() {
            return Err("cooldown must be greater than 0".to_string());
        }

        if self.success_threshold == 0 {
            return Err("success_threshold must be greater than 0".to_string());
        }

        if self.half_open_max_probes == 0 {
            return Err("half_open_max_probes must be greater than 0".to_string());
        }

        Ok(())
    }
}
