//! Circuit breaker protected store
//!
//! Wraps any [`Store`] so each statement is guarded by its own breaker, keyed
//! `store:<statement id>`. Failures and timeouts count against that key
//! only; one misbehaving statement does not trip the others.

use super::{Statement, StatementCall, Store};
use crate::config::FallbackPolicy;
use crate::error::CoreResult;
use crate::resilience::{CircuitBreakerRegistry, FallbackCause};
use serde_json::Value;
use std::sync::Arc;
use tokio::time::Instant;

/// Operation key of the breaker guarding liveness probes
pub const STORE_PING_OPERATION_KEY: &str = "store:ping";

/// Operation key of the breaker guarding multi-statement transactions
pub const STORE_TRANSACTION_OPERATION_KEY: &str = "store:transaction";

type NoFallback<T> = fn(FallbackCause<crate::error::CoreError>) -> T;

#[derive(Debug, Clone)]
pub struct GuardedStore {
    store: Arc<dyn Store>,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl GuardedStore {
    pub fn new(store: Arc<dyn Store>, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self { store, breakers }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Configured fallback for a statement's breaker
    pub fn fallback_policy(&self, statement: &Statement) -> FallbackPolicy {
        self.breakers.fallback_policy(&statement.operation_key())
    }

    pub async fn query(
        &self,
        statement: &Statement,
        params: &[Value],
        deadline: Option<Instant>,
    ) -> CoreResult<Vec<Value>> {
        Ok(self
            .breakers
            .execute(
                &statement.operation_key(),
                || self.store.query(statement, params),
                None::<NoFallback<Vec<Value>>>,
                deadline,
            )
            .await?)
    }

    pub async fn execute(
        &self,
        statement: &Statement,
        params: &[Value],
        deadline: Option<Instant>,
    ) -> CoreResult<u64> {
        Ok(self
            .breakers
            .execute(
                &statement.operation_key(),
                || self.store.execute(statement, params),
                None::<NoFallback<u64>>,
                deadline,
            )
            .await?)
    }

    pub async fn transaction(
        &self,
        calls: &[StatementCall],
        deadline: Option<Instant>,
    ) -> CoreResult<Vec<u64>> {
        Ok(self
            .breakers
            .execute(
                STORE_TRANSACTION_OPERATION_KEY,
                || self.store.transaction(calls),
                None::<NoFallback<Vec<u64>>>,
                deadline,
            )
            .await?)
    }

    pub async fn ping(&self, deadline: Option<Instant>) -> CoreResult<()> {
        Ok(self
            .breakers
            .execute(
                STORE_PING_OPERATION_KEY,
                || self.store.ping(),
                None::<NoFallback<()>>,
                deadline,
            )
            .await?)
    }
}
