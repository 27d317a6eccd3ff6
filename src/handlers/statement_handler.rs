//! Bus handler that runs one store statement
//!
//! Reads go through the tiered cache before the breaker-guarded store call;
//! writes run the guarded statement and then invalidate the cached reads they
//! affect. Fallback values configured for the statement's breaker are applied
//! after the cache, so they are never cached.

use crate::bus::{Command, CommandHandler};
use crate::cache::TieredCache;
use crate::config::FallbackPolicy;
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::store::{GuardedStore, Statement};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How query rows become a reply payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    /// Array of every row
    Rows,
    /// First row, or `null` (cached as a tombstone) when there is none
    Single,
}

#[derive(Debug, Clone)]
enum StatementKind {
    Read {
        shape: ResultShape,
        ttl: Option<Duration>,
    },
    Write {
        invalidates: Vec<String>,
    },
}

#[derive(Debug, Clone)]
pub struct StatementHandler {
    statement: Statement,
    kind: StatementKind,
    param_names: Vec<String>,
    store: GuardedStore,
    cache: Option<Arc<TieredCache>>,
}

impl StatementHandler {
    /// Cache-eligible read
    pub fn read(statement: Statement, store: GuardedStore, cache: Option<Arc<TieredCache>>) -> Self {
        Self {
            statement,
            kind: StatementKind::Read {
                shape: ResultShape::Rows,
                ttl: None,
            },
            param_names: Vec::new(),
            store,
            cache,
        }
    }

    /// Write that invalidates the reads named with [`StatementHandler::invalidates`]
    pub fn write(statement: Statement, store: GuardedStore, cache: Option<Arc<TieredCache>>) -> Self {
        Self {
            statement,
            kind: StatementKind::Write {
                invalidates: Vec::new(),
            },
            param_names: Vec::new(),
            store,
            cache,
        }
    }

    pub fn single(mut self) -> Self {
        if let StatementKind::Read { shape, .. } = &mut self.kind {
            *shape = ResultShape::Single;
        }
        self
    }

    pub fn with_ttl(mut self, cache_ttl: Duration) -> Self {
        if let StatementKind::Read { ttl, .. } = &mut self.kind {
            *ttl = Some(cache_ttl);
        }
        self
    }

    /// Positional order of parameters taken from an object payload
    pub fn with_param_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.param_names = names.into_iter().map(Into::into).collect();
        self
    }

    /// Drop cached results of `statement_id` after every successful write
    pub fn invalidates(mut self, statement_id: impl Into<String>) -> Self {
        if let StatementKind::Write { invalidates } = &mut self.kind {
            invalidates.push(statement_id.into());
        }
        self
    }

    pub fn statement(&self) -> &Statement {
        &self.statement
    }

    /// Cache key of a read: statement id plus its JSON-encoded parameters
    pub fn cache_key(statement_id: &str, params: &[Value]) -> CoreResult<String> {
        Ok(format!("{}:{}", statement_id, serde_json::to_string(params)?))
    }

    fn params_from(&self, payload: &Value) -> CoreResult<Vec<Value>> {
        match payload {
            Value::Null => Ok(Vec::new()),
            Value::Array(values) => Ok(values.clone()),
            Value::Object(fields) => {
                if self.param_names.is_empty() {
                    return Err(CoreError::ValidationFailed(format!(
                        "{} takes positional parameters",
                        self.statement.id
                    )));
                }
                self.param_names
                    .iter()
                    .map(|name| {
                        fields.get(name).cloned().ok_or_else(|| {
                            CoreError::ValidationFailed(format!("missing parameter {name}"))
                        })
                    })
                    .collect()
            }
            scalar => Ok(vec![scalar.clone()]),
        }
    }

    async fn run_read(
        &self,
        shape: ResultShape,
        ttl: Option<Duration>,
        params: &[Value],
        command: &Command,
    ) -> CoreResult<Value> {
        let deadline = Some(command.deadline);
        let load = || async move {
            let rows = self.store.query(&self.statement, params, deadline).await?;
            let shaped = match shape {
                ResultShape::Rows => Some(Value::Array(rows)),
                ResultShape::Single => rows.into_iter().next(),
            };
            shaped
                .map(|value| serde_json::to_vec(&value))
                .transpose()
                .map_err(CoreError::from)
        };

        let bytes = match &self.cache {
            Some(cache) => {
                let key = Self::cache_key(&self.statement.id, params)?;
                let result = match ttl {
                    Some(ttl) => cache.get_with_ttl(&key, ttl, load).await,
                    None => cache.get(&key, load).await,
                };
                result?
            }
            None => load().await?,
        };

        match bytes {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Value::Null),
        }
    }

    async fn run_write(
        &self,
        invalidates: &[String],
        params: &[Value],
        command: &Command,
    ) -> CoreResult<Value> {
        let affected = self
            .store
            .execute(&self.statement, params, Some(command.deadline))
            .await?;

        if let Some(cache) = &self.cache {
            for statement_id in invalidates {
                // The write already happened; a failed invalidation is surfaced,
                // never swallowed, so the caller knows reads may be stale
                cache.invalidate_prefix(&format!("{statement_id}:")).await?;
            }
        }

        debug!(
            correlation_id = %command.correlation_id,
            statement_id = %self.statement.id,
            affected,
            "Write executed"
        );
        Ok(json!({ "affected": affected }))
    }

    fn apply_fallback(&self, err: CoreError, command: &Command) -> CoreResult<Value> {
        let eligible = matches!(
            err.kind(),
            ErrorKind::BreakerOpen | ErrorKind::Timeout | ErrorKind::DependencyFailure
        );
        if !eligible {
            return Err(err);
        }

        match self.store.fallback_policy(&self.statement) {
            FallbackPolicy::FailFast => Err(err),
            FallbackPolicy::StaticValue { value } => {
                warn!(
                    correlation_id = %command.correlation_id,
                    operation_key = %self.statement.operation_key(),
                    error = %err,
                    "Answering with configured fallback value"
                );
                Ok(value)
            }
        }
    }
}

#[async_trait]
impl CommandHandler for StatementHandler {
    async fn handle(&self, command: Command) -> Result<Value, CoreError> {
        let params = self.params_from(&command.payload)?;

        match &self.kind {
            StatementKind::Read { shape, ttl } => {
                match self.run_read(*shape, *ttl, &params, &command).await {
                    Ok(value) => Ok(value),
                    Err(err) => self.apply_fallback(err, &command),
                }
            }
            StatementKind::Write { invalidates } => {
                self.run_write(invalidates, &params, &command).await
            }
        }
    }

    fn handler_name(&self) -> &str {
        &self.statement.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DistributedTier, InMemoryDistributedCache};
    use crate::config::{BreakerComponentConfig, CacheConfig, CircuitBreakerSettings};
    use crate::resilience::CircuitBreakerRegistry;
    use crate::store::StubStore;

    struct Fixture {
        stub: Arc<StubStore>,
        store: GuardedStore,
        cache: Arc<TieredCache>,
    }

    fn fixture(settings: CircuitBreakerSettings) -> Fixture {
        let stub = Arc::new(StubStore::new());
        let store = GuardedStore::new(
            stub.clone(),
            Arc::new(CircuitBreakerRegistry::new(settings)),
        );
        let cache = Arc::new(TieredCache::new(
            &CacheConfig::default(),
            DistributedTier::in_memory(InMemoryDistributedCache::new()),
        ));
        Fixture { stub, store, cache }
    }

    fn todo_by_id() -> Statement {
        Statement::new("todo_by_id", "SELECT id, title FROM todo WHERE id = $1")
    }

    fn command(payload: Value) -> Command {
        Command::new("todo.get", payload, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_read_is_served_from_cache() {
        let fx = fixture(CircuitBreakerSettings::default());
        fx.stub.on_query("todo_by_id", |params| {
            Ok(vec![json!({"id": params[0], "title": "write docs"})])
        });
        let handler = StatementHandler::read(todo_by_id(), fx.store.clone(), Some(fx.cache.clone()))
            .single();

        let first = handler.handle(command(json!([7]))).await.unwrap();
        let second = handler.handle(command(json!([7]))).await.unwrap();

        assert_eq!(first, json!({"id": 7, "title": "write docs"}));
        assert_eq!(first, second);
        assert_eq!(fx.stub.calls("todo_by_id"), 1);
    }

    #[tokio::test]
    async fn test_missing_row_is_remembered() {
        let fx = fixture(CircuitBreakerSettings::default());
        fx.stub.on_query("todo_by_id", |_| Ok(vec![]));
        let handler = StatementHandler::read(todo_by_id(), fx.store.clone(), Some(fx.cache.clone()))
            .single();

        assert_eq!(handler.handle(command(json!([404]))).await.unwrap(), Value::Null);
        assert_eq!(handler.handle(command(json!([404]))).await.unwrap(), Value::Null);
        assert_eq!(fx.stub.calls("todo_by_id"), 1);
    }

    #[tokio::test]
    async fn test_write_invalidates_cached_reads() {
        let fx = fixture(CircuitBreakerSettings::default());
        fx.stub.on_query("todo_by_id", |_| Ok(vec![json!({"id": 1})]));
        fx.stub.on_execute("todo_rename", |_| Ok(1));

        let read = StatementHandler::read(todo_by_id(), fx.store.clone(), Some(fx.cache.clone()));
        let write = StatementHandler::write(
            Statement::new("todo_rename", "UPDATE todo SET title = $2 WHERE id = $1"),
            fx.store.clone(),
            Some(fx.cache.clone()),
        )
        .with_param_names(["id", "title"])
        .invalidates("todo_by_id");

        read.handle(command(json!([1]))).await.unwrap();
        let reply = write
            .handle(command(json!({"id": 1, "title": "renamed"})))
            .await
            .unwrap();
        assert_eq!(reply, json!({"affected": 1}));

        read.handle(command(json!([1]))).await.unwrap();
        assert_eq!(fx.stub.calls("todo_by_id"), 2);
    }

    #[tokio::test]
    async fn test_static_fallback_is_not_cached() {
        let mut settings = CircuitBreakerSettings::default();
        settings.component_configs.insert(
            "store:todo_by_id".to_string(),
            BreakerComponentConfig {
                fallback: FallbackPolicy::StaticValue {
                    value: json!({"id": null, "title": "unavailable"}),
                },
                ..Default::default()
            },
        );
        let fx = fixture(settings);
        fx.stub.on_query("todo_by_id", |_| Ok(vec![json!({"id": 3, "title": "real"})]));
        let handler = StatementHandler::read(todo_by_id(), fx.store.clone(), Some(fx.cache.clone()))
            .single();

        let breaker = fx.store.breakers().breaker("store:todo_by_id");
        breaker.force_open();
        let degraded = handler.handle(command(json!([3]))).await.unwrap();
        assert_eq!(degraded["title"], "unavailable");
        assert_eq!(fx.stub.calls("todo_by_id"), 0);

        breaker.force_closed();
        let recovered = handler.handle(command(json!([3]))).await.unwrap();
        assert_eq!(recovered["title"], "real");
    }

    #[tokio::test]
    async fn test_fail_fast_surfaces_breaker_open() {
        let fx = fixture(CircuitBreakerSettings::default());
        let handler = StatementHandler::read(todo_by_id(), fx.store.clone(), None);
        fx.store.breakers().breaker("store:todo_by_id").force_open();

        let err = handler.handle(command(json!([1]))).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BreakerOpen);
    }

    #[tokio::test]
    async fn test_object_payload_requires_named_parameters() {
        let fx = fixture(CircuitBreakerSettings::default());
        let handler = StatementHandler::read(todo_by_id(), fx.store.clone(), None)
            .with_param_names(["id"]);

        let err = handler.handle(command(json!({"title": "x"}))).await.unwrap_err();
        assert_eq!(err, CoreError::ValidationFailed("missing parameter id".to_string()));

        let positional = StatementHandler::read(todo_by_id(), fx.store, None);
        let err = positional.handle(command(json!({"id": 1}))).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    }
}
