//! # Circuit Breaker Registry
//!
//! Owns one breaker per operation key, created lazily on first use with the
//! configuration resolved for that key. Entries are independent: the map is
//! sharded, and each breaker serializes only its own transitions.

use crate::config::{CircuitBreakerSettings, FallbackPolicy};
use crate::resilience::{
    BreakerError, CircuitBreaker, CircuitBreakerMetrics, CircuitState, FallbackCause,
    SystemCircuitBreakerMetrics,
};
use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, warn};

/// Registry of circuit breakers keyed by operation identity
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    settings: CircuitBreakerSettings,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerSettings::default())
    }
}

impl CircuitBreakerRegistry {
    pub fn new(settings: CircuitBreakerSettings) -> Self {
        info!(
            enabled = settings.enabled,
            overrides = settings.component_configs.len(),
            "Initializing circuit breaker registry"
        );

        Self {
            breakers: DashMap::new(),
            settings,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Get or create the breaker for an operation key
    pub fn breaker(&self, operation_key: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(operation_key) {
            return Arc::clone(existing.value());
        }

        let current = self.breakers.len();
        let entry = self
            .breakers
            .entry(operation_key.to_string())
            .or_insert_with(|| {
                if current >= self.settings.max_breakers {
                    warn!(
                        operation_key,
                        current_count = current,
                        max_allowed = self.settings.max_breakers,
                        "Maximum circuit breaker count reached"
                    );
                }

                let config = self
                    .settings
                    .config_for_component(operation_key)
                    .to_resilience_config();

                info!(operation_key, "Created circuit breaker");
                Arc::new(CircuitBreaker::new(operation_key, config))
            });

        Arc::clone(entry.value())
    }

    /// Run `call` through the breaker for `operation_key`
    ///
    /// With breakers disabled the call runs directly, still bounded by
    /// `deadline`.
    pub async fn execute<T, E, F, Fut, FB>(
        &self,
        operation_key: &str,
        call: F,
        fallback: Option<FB>,
        deadline: Option<Instant>,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce(FallbackCause<E>) -> T,
    {
        if !self.settings.enabled {
            let result = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, call()).await.ok(),
                None => Some(call().await),
            };
            return match (result, fallback) {
                (Some(Ok(value)), _) => Ok(value),
                (Some(Err(err)), Some(fallback)) => Ok(fallback(FallbackCause::Failed(err))),
                (Some(Err(err)), None) => Err(BreakerError::Failed(err)),
                (None, Some(fallback)) => Ok(fallback(FallbackCause::TimedOut)),
                (None, None) => Err(BreakerError::TimedOut {
                    operation_key: operation_key.to_string(),
                }),
            };
        }

        self.breaker(operation_key)
            .execute(call, fallback, deadline)
            .await
    }

    /// Configured fallback policy for an operation key
    pub fn fallback_policy(&self, operation_key: &str) -> FallbackPolicy {
        self.settings.config_for_component(operation_key).fallback
    }

    pub fn state_of(&self, operation_key: &str) -> Option<CircuitState> {
        self.breakers.get(operation_key).map(|b| b.state())
    }

    pub fn list_operation_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn metrics_for(&self, operation_key: &str) -> Option<CircuitBreakerMetrics> {
        self.breakers.get(operation_key).map(|b| b.metrics())
    }

    pub fn system_metrics(&self) -> SystemCircuitBreakerMetrics {
        let mut system_metrics = SystemCircuitBreakerMetrics::new();
        for entry in self.breakers.iter() {
            system_metrics.add_circuit_breaker(entry.key().clone(), entry.value().metrics());
        }
        system_metrics
    }

    pub fn count_by_state(&self) -> HashMap<CircuitState, usize> {
        self.system_metrics().count_by_state()
    }

    pub fn health_score(&self) -> f64 {
        self.system_metrics().health_score()
    }

    /// Force open all circuit breakers (emergency stop)
    pub fn force_open_all(&self) {
        warn!("Forcing all circuit breakers open");
        for entry in self.breakers.iter() {
            entry.value().force_open();
        }
    }

    /// Force close all circuit breakers (emergency recovery)
    pub fn force_close_all(&self) {
        warn!("Forcing all circuit breakers closed");
        for entry in self.breakers.iter() {
            entry.value().force_closed();
        }
    }

    pub fn remove(&self, operation_key: &str) -> bool {
        self.breakers.remove(operation_key).is_some()
    }
}
