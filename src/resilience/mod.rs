//! # Resilience Module
//!
//! Per-operation circuit breakers that protect the store and the distributed
//! cache from overload and absorb transient failures.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use zephyr_core::resilience::{CircuitBreaker, CircuitBreakerConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let breaker = CircuitBreaker::new("store:todo.by_id", CircuitBreakerConfig::for_store());
//!
//! let rows = breaker
//!     .call(|| async { Ok::<_, std::io::Error>(vec!["row"]) })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod metrics;
pub mod registry;

pub use circuit_breaker::{BreakerError, CallPermit, CircuitBreaker, CircuitState, FallbackCause};
pub use config::CircuitBreakerConfig;
pub use metrics::{CircuitBreakerMetrics, SystemCircuitBreakerMetrics};
pub use registry::CircuitBreakerRegistry;

use crate::error::CoreError;

impl<E: Into<CoreError>> From<BreakerError<E>> for CoreError {
    fn from(err: BreakerError<E>) -> Self {
        match err {
            BreakerError::Open { operation_key } => CoreError::BreakerOpen { operation_key },
            BreakerError::TimedOut { operation_key } => {
                CoreError::Timeout(format!("guarded call {operation_key} exceeded its deadline"))
            }
            BreakerError::Failed(err) => err.into(),
        }
    }
}
