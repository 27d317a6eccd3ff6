//! PostgreSQL store over a sqlx pool
//!
//! Query rows are converted to JSON server-side with `row_to_json`, so any
//! statement shape maps onto the store's row representation without
//! per-statement decoding.

use super::{Statement, StatementCall, Store};
use crate::config::StoreConfig;
use crate::error::{CoreError, CoreResult};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(config: &StoreConfig) -> CoreResult<Self> {
        let database_url = config.resolved_url().ok_or_else(|| {
            CoreError::Configuration(
                "store.database_url is empty and DATABASE_URL is not set".to_string(),
            )
        })?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_millis(config.acquire_timeout_ms))
            .connect(&database_url)
            .await?;

        info!(
            max_connections = config.max_connections,
            pool_size = pool.size(),
            "PostgreSQL store pool initialized"
        );
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &[Value],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64()),
            },
            Value::String(s) => query.bind(s.clone()),
            other => query.bind(sqlx::types::Json(other.clone())),
        };
    }
    query
}

#[async_trait]
impl Store for PgStore {
    async fn query(&self, statement: &Statement, params: &[Value]) -> CoreResult<Vec<Value>> {
        let sql = format!(
            "SELECT row_to_json(q)::jsonb AS row FROM ({}) AS q",
            statement.sql
        );
        let rows = bind_params(sqlx::query(&sql), params)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| row.try_get::<Value, _>("row").map_err(CoreError::from))
            .collect()
    }

    async fn execute(&self, statement: &Statement, params: &[Value]) -> CoreResult<u64> {
        let result = bind_params(sqlx::query(&statement.sql), params)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn transaction(&self, calls: &[StatementCall]) -> CoreResult<Vec<u64>> {
        let mut tx = self.pool.begin().await?;
        let mut affected = Vec::with_capacity(calls.len());
        for call in calls {
            let result = bind_params(sqlx::query(&call.statement.sql), &call.params)
                .execute(&mut *tx)
                .await?;
            affected.push(result.rows_affected());
        }
        // Dropping `tx` on an early return rolls back
        tx.commit().await?;
        Ok(affected)
    }

    async fn ping(&self) -> CoreResult<()> {
        let row = sqlx::query("SELECT 1 AS health").fetch_one(&self.pool).await?;
        let health: i32 = row.try_get("health")?;
        if health == 1 {
            Ok(())
        } else {
            Err(CoreError::DependencyFailure(format!(
                "store health probe returned {health}"
            )))
        }
    }

    fn store_name(&self) -> &'static str {
        "postgres"
    }
}
