//! Shared fixtures for integration tests
#![allow(dead_code)]

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use zephyr_core::bus::{handler_fn, CommandHandler};
use zephyr_core::cache::{DistributedTier, InMemoryDistributedCache};
use zephyr_core::config::{AddressRuleConfig, CoreConfig};
use zephyr_core::core::ResilienceCore;
use zephyr_core::error::CoreError;
use zephyr_core::store::StubStore;

pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("zephyr_core=debug")
        .with_test_writer()
        .try_init();
}

/// Configuration for tests: ephemeral bridge port, permissive test addresses
pub fn test_config() -> CoreConfig {
    let mut config = CoreConfig::default();
    config.bridge.bind_address = "127.0.0.1:0".to_string();
    config.bridge.inbound_permitted = vec![
        AddressRuleConfig::exact("todo.get"),
        AddressRuleConfig::exact("todo.rename"),
        AddressRuleConfig::regex(r"echo\..+"),
    ];
    config.bridge.outbound_permitted = vec![AddressRuleConfig::regex(r"remote\..+")];
    config.bus.default_send_timeout_ms = 2_000;
    config
}

/// A `todo` table held in memory behind the stub store
#[derive(Debug, Clone, Default)]
pub struct TodoTable {
    rows: Arc<Mutex<BTreeMap<i64, String>>>,
}

impl TodoTable {
    pub fn with_rows(rows: &[(i64, &str)]) -> Self {
        let table = Self::default();
        for (id, title) in rows {
            table.rows.lock().insert(*id, title.to_string());
        }
        table
    }

    pub fn title(&self, id: i64) -> Option<String> {
        self.rows.lock().get(&id).cloned()
    }

    /// Stub answering `todo_by_id` and `todo_rename` from this table
    pub fn store(&self) -> Arc<StubStore> {
        let stub = Arc::new(StubStore::new());

        let rows = Arc::clone(&self.rows);
        stub.on_query("todo_by_id", move |params| {
            let id = param_id(params)?;
            Ok(rows
                .lock()
                .get(&id)
                .map(|title| vec![json!({"id": id, "title": title})])
                .unwrap_or_default())
        });

        let rows = Arc::clone(&self.rows);
        stub.on_execute("todo_rename", move |params| {
            let id = param_id(params)?;
            let title = params
                .get(1)
                .and_then(Value::as_str)
                .ok_or_else(|| CoreError::ValidationFailed("title must be a string".into()))?;
            let mut rows = rows.lock();
            match rows.get_mut(&id) {
                Some(existing) => {
                    *existing = title.to_string();
                    Ok(1)
                }
                None => Ok(0),
            }
        });

        stub
    }
}

fn param_id(params: &[Value]) -> Result<i64, CoreError> {
    params
        .first()
        .and_then(Value::as_i64)
        .ok_or_else(|| CoreError::ValidationFailed("id must be an integer".into()))
}

/// Core over a stub-backed todo table and an in-memory distributed tier
pub fn todo_core(table: &TodoTable, shared: InMemoryDistributedCache) -> Arc<ResilienceCore> {
    let core = ResilienceCore::with_components(
        test_config(),
        Some(table.store()),
        DistributedTier::in_memory(shared),
    )
    .expect("test core assembles");
    Arc::new(core)
}

pub fn echo_handler() -> Arc<dyn CommandHandler> {
    handler_fn("echo", |command| async move { Ok(command.payload) })
}

pub fn slow_handler(delay: Duration) -> Arc<dyn CommandHandler> {
    handler_fn("slow", move |command| async move {
        tokio::time::sleep(delay).await;
        Ok(command.payload)
    })
}
