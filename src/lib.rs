#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, ValKey in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Zephyr Core
//!
//! Resilience and dispatch core of a backend service. It sits between
//! validated inbound requests and a relational store, protecting the store
//! from overload and absorbing transient failures while keeping hot reads
//! fast.
//!
//! ## Architecture
//!
//! ```text
//! ingress ─▶ CommandFactory ─▶ ResilienceCore::dispatch
//!                                   │
//! TCP peers ─▶ BridgeServer ─▶ Dispatcher ─▶ CommandHandler
//!                                               │
//!                               TieredCache (local ─▶ distributed)
//!                                               │ miss
//!                               CircuitBreakerRegistry ─▶ Store
//! ```
//!
//! ## Module Organization
//!
//! - [`resilience`] - Per-operation circuit breakers and their registry
//! - [`cache`] - Local and distributed tiers composed with single-flight loads
//! - [`bus`] - Commands, replies and the address-based dispatcher
//! - [`bridge`] - Length-prefixed frame protocol exposing the bus over TCP
//! - [`store`] - Store capability and its breaker-guarded wrapper
//! - [`handlers`] - Statement handlers joining cache, breaker and store
//! - [`executor`] - Event-loop runtime and bounded blocking pool
//! - [`health`] - Aggregated dependency health
//! - [`core`] - Bootstrap facade and command factory
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Structured error handling
//! - [`logging`] - Tracing subscriber setup and domain log macros
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use zephyr_core::config::ConfigLoader;
//! use zephyr_core::core::ResilienceCore;
//! use zephyr_core::store::Statement;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigLoader::load()?;
//! let core = Arc::new(ResilienceCore::from_config(config).await?);
//!
//! let todo_by_id = core
//!     .read_statement(Statement::new("todo_by_id", "SELECT * FROM todo WHERE id = $1"))?
//!     .single();
//! core.register("todo.get", Arc::new(todo_by_id));
//! core.register_builtin_handlers();
//!
//! let addr = core.start_bridge().await?;
//! println!("bridge listening on {addr}");
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod bus;
pub mod cache;
pub mod config;
pub mod core;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod health;
pub mod logging;
pub mod resilience;
pub mod store;

pub use crate::core::{CommandFactory, InboundRequest, ResilienceCore};
pub use bus::{Command, CorrelationId, Dispatcher, Principal, Reply, ReplyStatus};
pub use config::CoreConfig;
pub use error::{CoreError, CoreResult, ErrorKind};
