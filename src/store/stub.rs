//! Programmable store for tests and local runs without a database
//!
//! Each statement id is answered by a registered closure. The store can be
//! taken offline or slowed down to exercise breakers and deadlines.

use super::{Statement, StatementCall, Store};
use crate::error::{CoreError, CoreResult};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

type QueryFn = Arc<dyn Fn(&[Value]) -> CoreResult<Vec<Value>> + Send + Sync>;
type ExecuteFn = Arc<dyn Fn(&[Value]) -> CoreResult<u64> + Send + Sync>;

#[derive(Default)]
pub struct StubStore {
    queries: DashMap<String, QueryFn>,
    executes: DashMap<String, ExecuteFn>,
    calls: DashMap<String, u64>,
    latency: parking_lot::Mutex<Option<Duration>>,
    offline: AtomicBool,
}

impl fmt::Debug for StubStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StubStore")
            .field("queries", &self.queries.len())
            .field("executes", &self.executes.len())
            .field("offline", &self.offline.load(Ordering::SeqCst))
            .finish()
    }
}

impl StubStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_query<F>(&self, statement_id: impl Into<String>, f: F) -> &Self
    where
        F: Fn(&[Value]) -> CoreResult<Vec<Value>> + Send + Sync + 'static,
    {
        self.queries.insert(statement_id.into(), Arc::new(f));
        self
    }

    pub fn on_execute<F>(&self, statement_id: impl Into<String>, f: F) -> &Self
    where
        F: Fn(&[Value]) -> CoreResult<u64> + Send + Sync + 'static,
    {
        self.executes.insert(statement_id.into(), Arc::new(f));
        self
    }

    /// Fail every call with `DependencyFailure` while set
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay applied before every call
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Calls that reached the store for a statement id
    pub fn calls(&self, statement_id: &str) -> u64 {
        self.calls.get(statement_id).map(|c| *c).unwrap_or(0)
    }

    async fn enter(&self, statement_id: &str) -> CoreResult<()> {
        *self.calls.entry(statement_id.to_string()).or_insert(0) += 1;

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(CoreError::DependencyFailure("store offline".to_string()));
        }
        Ok(())
    }

    fn execute_fn(&self, statement: &Statement) -> CoreResult<ExecuteFn> {
        self.executes
            .get(&statement.id)
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| CoreError::Internal(format!("no stubbed execute for {}", statement.id)))
    }
}

#[async_trait]
impl Store for StubStore {
    async fn query(&self, statement: &Statement, params: &[Value]) -> CoreResult<Vec<Value>> {
        self.enter(&statement.id).await?;
        let f = self
            .queries
            .get(&statement.id)
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| CoreError::Internal(format!("no stubbed query for {}", statement.id)))?;
        f(params)
    }

    async fn execute(&self, statement: &Statement, params: &[Value]) -> CoreResult<u64> {
        self.enter(&statement.id).await?;
        let f = self.execute_fn(statement)?;
        f(params)
    }

    async fn transaction(&self, calls: &[StatementCall]) -> CoreResult<Vec<u64>> {
        self.enter("transaction").await?;
        let mut affected = Vec::with_capacity(calls.len());
        for call in calls {
            let f = self.execute_fn(&call.statement)?;
            affected.push(f(&call.params)?);
        }
        Ok(affected)
    }

    async fn ping(&self) -> CoreResult<()> {
        self.enter("ping").await
    }

    fn store_name(&self) -> &'static str {
        "stub"
    }
}
