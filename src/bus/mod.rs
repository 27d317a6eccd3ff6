//! # Internal Command Bus
//!
//! Address-based routing between ingress and handlers. Handlers implement
//! [`CommandHandler`] and are registered per address; callers either `send`
//! (one subscriber, round-robin, awaited `Reply`) or `publish` (every
//! subscriber, no reply).
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use serde_json::json;
//! use zephyr_core::bus::{handler_fn, Command, DeliveryMode, Dispatcher};
//!
//! # async fn example() {
//! let dispatcher = Dispatcher::default();
//! dispatcher.subscribe(
//!     "todo.get",
//!     handler_fn("todo.get", |command| async move { Ok(command.payload) }),
//!     DeliveryMode::PointToPoint,
//! );
//!
//! let reply = dispatcher
//!     .send(Command::new("todo.get", json!({"id": 1}), Duration::from_secs(1)))
//!     .await;
//! assert!(reply.is_ok());
//! # }
//! ```

pub mod command;
pub mod dispatcher;
pub mod handler;

pub use command::{
    Command, CorrelationId, DeliveryMode, Principal, PublishReport, Reply, ReplyError, ReplyStatus,
};
pub use dispatcher::{Dispatcher, DispatcherStats, SubscribeOptions, SubscriptionId};
pub use handler::{handler_fn, CommandHandler, FnHandler};
