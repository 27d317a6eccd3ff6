//! Handler capability for bus addresses

use super::command::Command;
use crate::error::CoreError;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

/// Handles commands delivered to an address
///
/// The returned value becomes the payload of an `ok` reply; an error becomes
/// a failed reply carrying its kind. Broadcast deliveries discard both.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: Command) -> Result<Value, CoreError>;

    /// Get handler name for debugging
    fn handler_name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Adapts an async closure into a `CommandHandler`
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> std::fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnHandler").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, CoreError>> + Send + 'static,
{
    async fn handle(&self, command: Command) -> Result<Value, CoreError> {
        (self.f)(command).await
    }

    fn handler_name(&self) -> &str {
        &self.name
    }
}

/// Wrap a closure as a shareable handler
///
/// ```rust
/// use zephyr_core::bus::{handler_fn, CommandHandler};
///
/// let echo = handler_fn("echo", |command| async move { Ok(command.payload) });
/// assert_eq!(echo.handler_name(), "echo");
/// ```
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn CommandHandler>
where
    F: Fn(Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, CoreError>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f,
    })
}
