//! # Circuit Breaker Metrics
//!
//! Point-in-time snapshots of breaker counters, per operation key and
//! aggregated across the registry.

use crate::resilience::CircuitState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Metrics for a single circuit breaker instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    /// Calls that reached the guarded operation
    pub total_calls: u64,

    pub success_count: u64,

    /// Failed calls, including timeouts
    pub failure_count: u64,

    /// Subset of `failure_count` caused by deadlines or call timeouts
    pub timeout_count: u64,

    /// Calls rejected without invoking the operation
    pub rejected_count: u64,

    /// Calls answered by a fallback
    pub fallback_count: u64,

    /// Outcomes currently in the rolling window
    pub window_samples: usize,

    /// Failure ratio of the rolling window (0.0 to 1.0)
    pub window_failure_ratio: f64,

    pub total_duration: Duration,

    pub current_state: CircuitState,

    /// Lifetime failure rate (0.0 to 1.0)
    pub failure_rate: f64,

    /// Lifetime success rate (0.0 to 1.0)
    pub success_rate: f64,

    pub average_duration: Duration,
}

impl CircuitBreakerMetrics {
    /// Create new metrics instance with zero values
    pub fn new() -> Self {
        Self {
            total_calls: 0,
            success_count: 0,
            failure_count: 0,
            timeout_count: 0,
            rejected_count: 0,
            fallback_count: 0,
            window_samples: 0,
            window_failure_ratio: 0.0,
            total_duration: Duration::ZERO,
            current_state: CircuitState::Closed,
            failure_rate: 0.0,
            success_rate: 0.0,
            average_duration: Duration::ZERO,
        }
    }

    /// Healthy means closed with a low recent failure ratio, or probing
    pub fn is_healthy(&self) -> bool {
        match self.current_state {
            CircuitState::Closed => self.window_failure_ratio < 0.1,
            CircuitState::Open => false,
            CircuitState::HalfOpen => true,
        }
    }

    pub fn state_description(&self) -> &'static str {
        match self.current_state {
            CircuitState::Closed => "Healthy - Normal operation",
            CircuitState::Open => "Failing - Rejecting all calls",
            CircuitState::HalfOpen => "Recovering - Probing dependency",
        }
    }

    /// Format metrics for logging
    pub fn format_summary(&self) -> String {
        format!(
            "State: {} | Calls: {} | Success: {:.1}% | Failures: {} | Rejected: {} | Avg Duration: {}ms",
            self.state_description(),
            self.total_calls,
            self.success_rate * 100.0,
            self.failure_count,
            self.rejected_count,
            self.average_duration.as_millis()
        )
    }
}

impl Default for CircuitBreakerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry-wide metrics aggregate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemCircuitBreakerMetrics {
    /// Metrics keyed by operation key
    pub circuit_breakers: HashMap<String, CircuitBreakerMetrics>,

    pub collected_at: DateTime<Utc>,
}

impl SystemCircuitBreakerMetrics {
    pub fn new() -> Self {
        Self {
            circuit_breakers: HashMap::new(),
            collected_at: Utc::now(),
        }
    }

    pub fn add_circuit_breaker(&mut self, operation_key: String, metrics: CircuitBreakerMetrics) {
        self.circuit_breakers.insert(operation_key, metrics);
        self.collected_at = Utc::now();
    }

    /// Get count of circuit breakers by state
    pub fn count_by_state(&self) -> HashMap<CircuitState, usize> {
        let mut counts = HashMap::new();
        for metrics in self.circuit_breakers.values() {
            *counts.entry(metrics.current_state).or_insert(0) += 1;
        }
        counts
    }

    /// Operation keys whose breaker is not healthy
    pub fn unhealthy_circuits(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self
            .circuit_breakers
            .iter()
            .filter(|(_, metrics)| !metrics.is_healthy())
            .map(|(key, _)| key.as_str())
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Fraction of healthy breakers (1.0 when none exist)
    pub fn health_score(&self) -> f64 {
        if self.circuit_breakers.is_empty() {
            return 1.0;
        }

        let healthy_count = self
            .circuit_breakers
            .values()
            .filter(|metrics| metrics.is_healthy())
            .count();

        healthy_count as f64 / self.circuit_breakers.len() as f64
    }

    pub fn total_calls(&self) -> u64 {
        self.circuit_breakers.values().map(|m| m.total_calls).sum()
    }

    pub fn total_failures(&self) -> u64 {
        self.circuit_breakers.values().map(|m| m.failure_count).sum()
    }

    pub fn system_failure_rate(&self) -> f64 {
        let total_calls = self.total_calls();
        if total_calls == 0 {
            return 0.0;
        }
        self.total_failures() as f64 / total_calls as f64
    }

    /// Format summary for logging
    pub fn format_summary(&self) -> String {
        let state_counts = self.count_by_state();
        let count = |state| state_counts.get(&state).copied().unwrap_or(0);

        format!(
            "Circuit Breakers: {} total | {} closed | {} open | {} half-open | Health: {:.1}% | Failure rate: {:.2}%",
            self.circuit_breakers.len(),
            count(CircuitState::Closed),
            count(CircuitState::Open),
            count(CircuitState::HalfOpen),
            self.health_score() * 100.0,
            self.system_failure_rate() * 100.0
        )
    }
}

impl Default for SystemCircuitBreakerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_metrics_aggregation() {
        let mut system_metrics = SystemCircuitBreakerMetrics::new();

        let store = CircuitBreakerMetrics {
            total_calls: 100,
            success_count: 95,
            failure_count: 5,
            window_failure_ratio: 0.0,
            ..CircuitBreakerMetrics::new()
        };

        let cache = CircuitBreakerMetrics {
            current_state: CircuitState::Open,
            total_calls: 50,
            success_count: 25,
            failure_count: 25,
            window_failure_ratio: 0.5,
            ..CircuitBreakerMetrics::new()
        };

        system_metrics.add_circuit_breaker("store:todo.by_id".to_string(), store);
        system_metrics.add_circuit_breaker("cache:distributed".to_string(), cache);

        assert_eq!(system_metrics.total_calls(), 150);
        assert_eq!(system_metrics.total_failures(), 30);
        assert_eq!(system_metrics.system_failure_rate(), 0.2);

        let state_counts = system_metrics.count_by_state();
        assert_eq!(state_counts.get(&CircuitState::Closed), Some(&1));
        assert_eq!(state_counts.get(&CircuitState::Open), Some(&1));

        assert_eq!(system_metrics.health_score(), 0.5);
        assert_eq!(system_metrics.unhealthy_circuits(), vec!["cache:distributed"]);
    }

    #[test]
    fn test_metrics_health_calculation() {
        let mut metrics = CircuitBreakerMetrics::new();
        assert!(metrics.is_healthy());

        metrics.window_failure_ratio = 0.3;
        assert!(!metrics.is_healthy());

        metrics.current_state = CircuitState::Open;
        metrics.window_failure_ratio = 0.0;
        assert!(!metrics.is_healthy());

        metrics.current_state = CircuitState::HalfOpen;
        assert!(metrics.is_healthy());
    }
}
