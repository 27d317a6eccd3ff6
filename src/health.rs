//! # Health Reporting
//!
//! Aggregates the health of the core's dependencies into one report: a store
//! round trip, a write/read/delete probe against the distributed cache tier,
//! and a summary of breaker states. The store is essential (its failure makes
//! the core unhealthy); the distributed tier and open breakers only degrade.

use crate::cache::DistributedTier;
use crate::resilience::{CircuitBreakerRegistry, CircuitState};
use crate::store::GuardedStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const PROBE_TTL: Duration = Duration::from_secs(30);
const PROBE_VALUE: &[u8] = b"ok";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSummary {
    pub total: usize,
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
    pub open_keys: Vec<String>,
    pub health_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checked_at: DateTime<Utc>,
    pub components: Vec<ComponentHealth>,
    pub breakers: BreakerSummary,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    pub fn component(&self, name: &str) -> Option<&ComponentHealth> {
        self.components.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone)]
pub struct HealthReporter {
    store: Option<GuardedStore>,
    distributed: Option<DistributedTier>,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl HealthReporter {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            store: None,
            distributed: None,
            breakers,
        }
    }

    pub fn with_store(mut self, store: GuardedStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_distributed(mut self, distributed: DistributedTier) -> Self {
        self.distributed = Some(distributed);
        self
    }

    pub async fn check(&self) -> HealthReport {
        let mut components = Vec::new();
        if let Some(store) = &self.store {
            components.push(Self::check_store(store).await);
        }
        if let Some(distributed) = &self.distributed {
            components.push(Self::check_distributed(distributed).await);
        }
        let breakers = self.summarize_breakers();

        let worst_component = components
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        let breaker_status = if breakers.open + breakers.half_open > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        let status = worst_component.max(breaker_status);

        debug!(%status, components = components.len(), open_breakers = breakers.open, "Health check complete");
        HealthReport {
            status,
            checked_at: Utc::now(),
            components,
            breakers,
        }
    }

    async fn check_store(store: &GuardedStore) -> ComponentHealth {
        let started = Instant::now();
        let result = store.ping(Some(started + PROBE_TIMEOUT)).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(()) => ComponentHealth {
                name: "store".to_string(),
                status: HealthStatus::Healthy,
                latency_ms,
                detail: Some(store.store().store_name().to_string()),
            },
            Err(err) => {
                warn!(error = %err, "Store health probe failed");
                ComponentHealth {
                    name: "store".to_string(),
                    status: HealthStatus::Unhealthy,
                    latency_ms,
                    detail: Some(err.to_string()),
                }
            }
        }
    }

    async fn check_distributed(distributed: &DistributedTier) -> ComponentHealth {
        let started = Instant::now();
        if !distributed.is_enabled() {
            return ComponentHealth {
                name: "distributed_cache".to_string(),
                status: HealthStatus::Healthy,
                latency_ms: 0,
                detail: Some(format!("{} backend", distributed.provider_name())),
            };
        }

        let probe = tokio::time::timeout_at(started + PROBE_TIMEOUT, Self::probe(distributed)).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        let failure = match probe {
            Ok(Ok(())) => None,
            Ok(Err(reason)) => Some(reason),
            Err(_) => Some("probe timed out".to_string()),
        };

        match failure {
            None => ComponentHealth {
                name: "distributed_cache".to_string(),
                status: HealthStatus::Healthy,
                latency_ms,
                detail: Some(distributed.provider_name().to_string()),
            },
            Some(reason) => {
                warn!(reason = %reason, "Distributed cache health probe failed");
                ComponentHealth {
                    name: "distributed_cache".to_string(),
                    status: HealthStatus::Degraded,
                    latency_ms,
                    detail: Some(reason),
                }
            }
        }
    }

    /// Write, read back and delete a throwaway key
    async fn probe(distributed: &DistributedTier) -> Result<(), String> {
        let key = format!("health@{}", Utc::now().timestamp_millis());
        distributed
            .set(&key, PROBE_VALUE, PROBE_TTL)
            .await
            .map_err(|e| e.to_string())?;
        let read = distributed.get(&key).await.map_err(|e| e.to_string());
        let deleted = distributed.delete(&key).await.map_err(|e| e.to_string());

        match read? {
            Some(value) if value == PROBE_VALUE => deleted,
            Some(_) => Err("probe read back a different value".to_string()),
            None => Err("probe value missing after write".to_string()),
        }
    }

    fn summarize_breakers(&self) -> BreakerSummary {
        let system = self.breakers.system_metrics();
        let counts = system.count_by_state();
        let mut open_keys: Vec<String> = system
            .unhealthy_circuits()
            .into_iter()
            .map(str::to_string)
            .collect();
        open_keys.sort();

        BreakerSummary {
            total: counts.values().sum(),
            closed: counts.get(&CircuitState::Closed).copied().unwrap_or(0),
            open: counts.get(&CircuitState::Open).copied().unwrap_or(0),
            half_open: counts.get(&CircuitState::HalfOpen).copied().unwrap_or(0),
            open_keys,
            health_score: system.health_score(),
        }
    }
}
