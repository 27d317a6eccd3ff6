//! # Structured Logging Module
//!
//! Environment-aware console logging using the tracing ecosystem. Logs go to
//! stdout; an optional JSON layer is added for log shippers.
//!
//! Every event emitted by the core leads with its correlating field
//! (`correlation_id`, `operation_key`, `cache_key` or `peer`) so a single
//! command can be followed from the bridge through the dispatcher, the
//! breaker and the cache.

use std::io::IsTerminal;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static TRACING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize console-only logging
///
/// Safe to call more than once; an already-installed global subscriber is
/// left in place.
pub fn init_console_only() {
    TRACING_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);
        let use_ansi = IsTerminal::is_terminal(&std::io::stdout());

        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_ansi(use_ansi)
            .with_filter(EnvFilter::new(&log_level));

        let subscriber = tracing_subscriber::registry().with(console_layer);

        if subscriber.try_init().is_err() {
            tracing::debug!(
                "Global tracing subscriber already initialized - continuing with existing subscriber"
            );
        } else {
            tracing::info!(
                environment = %environment,
                log_level = %log_level,
                ansi_colors = use_ansi,
                "Console logging initialized"
            );
        }
    });
}

/// Initialize console logging plus a JSON layer on stdout
pub fn init_structured_logging() {
    TRACING_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);

        let json_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_current_span(true)
            .with_filter(EnvFilter::new(&log_level));

        let subscriber = tracing_subscriber::registry().with(json_layer);

        if subscriber.try_init().is_err() {
            tracing::debug!(
                "Global tracing subscriber already initialized - continuing with existing subscriber"
            );
        } else {
            tracing::info!(
                environment = %environment,
                log_level = %log_level,
                "Structured JSON logging initialized"
            );
        }
    });
}

/// Get current environment from environment variables
pub fn get_environment() -> String {
    std::env::var("ZEPHYR_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Resolve the filter directive: explicit level first, then `RUST_LOG`,
/// then the environment default
fn get_log_level(environment: &str) -> String {
    if let Ok(level) = std::env::var("LOG_LEVEL") {
        return level.to_lowercase();
    }

    if let Ok(level) = std::env::var("RUST_LOG") {
        return level.to_lowercase();
    }

    default_level_for(environment).to_string()
}

fn default_level_for(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        _ => "debug",
    }
}

/// Log a dispatcher event with correlation context
#[macro_export]
macro_rules! log_bus {
    ($level:ident, $message:expr, correlation_id: $correlation_id:expr, address: $address:expr $(, $key:ident: $value:expr)* $(,)?) => {
        tracing::$level!(
            correlation_id = %$correlation_id,
            address = %$address,
            component = "bus",
            $($key = ?$value,)*
            $message
        )
    };
}

/// Log a bridge connection event
#[macro_export]
macro_rules! log_bridge {
    ($level:ident, $message:expr, peer: $peer:expr $(, $key:ident: $value:expr)* $(,)?) => {
        tracing::$level!(
            peer = %$peer,
            component = "bridge",
            $($key = ?$value,)*
            $message
        )
    };
}

/// Log a cache tier event
#[macro_export]
macro_rules! log_cache {
    ($level:ident, $message:expr, cache_key: $cache_key:expr $(, $key:ident: $value:expr)* $(,)?) => {
        tracing::$level!(
            cache_key = %$cache_key,
            component = "cache",
            $($key = ?$value,)*
            $message
        )
    };
}

/// Log a circuit breaker event
#[macro_export]
macro_rules! log_breaker {
    ($level:ident, $message:expr, operation_key: $operation_key:expr $(, $key:ident: $value:expr)* $(,)?) => {
        tracing::$level!(
            operation_key = %$operation_key,
            component = "breaker",
            $($key = ?$value,)*
            $message
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(default_level_for("test"), "debug");
        assert_eq!(default_level_for("development"), "debug");
        assert_eq!(default_level_for("production"), "info");
        assert_eq!(default_level_for("unknown"), "debug");
    }

    #[test]
    fn test_init_is_idempotent() {
        init_console_only();
        init_console_only();
        init_structured_logging();
        crate::log_bus!(debug, "macro smoke test", correlation_id: "c-1", address: "todo.get");
        crate::log_cache!(debug, "macro smoke test", cache_key: "k", tier: "local");
    }
}
