//! Configuration Loader
//!
//! Layers three sources, later ones winning:
//! 0. `.env` in the working directory, if present (via dotenvy)
//! 1. Built-in defaults (`CoreConfig::default()`)
//! 2. A TOML file from `ZEPHYR_CONFIG_PATH`, else `config/zephyr.toml` when it exists
//! 3. `ZEPHYR__<SECTION>__<FIELD>` environment variables
//!
//! The merged result is validated before it is returned.

use super::error::ConfigResult;
use super::CoreConfig;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const DEFAULT_CONFIG_PATH: &str = "config/zephyr.toml";
const ENV_PREFIX: &str = "ZEPHYR";

/// Zero-state loader; all functions are associated
#[derive(Debug)]
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from the default locations and the environment
    pub fn load() -> ConfigResult<CoreConfig> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "Loaded .env file");
        }

        let path = std::env::var("ZEPHYR_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        Self::load_from(Some(&path))
    }

    /// Load with an explicit file (missing files are skipped) plus env overrides
    pub fn load_from(path: Option<&Path>) -> ConfigResult<CoreConfig> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&CoreConfig::default())?);

        if let Some(path) = path {
            debug!(path = %path.display(), "Adding configuration file source");
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: CoreConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        info!(
            bridge_bind_address = %config.bridge.bind_address,
            cache_backend = %config.cache.distributed.backend,
            breakers_enabled = config.breaker.enabled,
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Parse a TOML document directly (no environment layering)
    pub fn from_toml_str(toml: &str) -> ConfigResult<CoreConfig> {
        let config: CoreConfig = config::Config::builder()
            .add_source(config::Config::try_from(&CoreConfig::default())?)
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_toml_overrides_defaults() {
        let config = ConfigLoader::from_toml_str(
            r#"
            [bus]
            subscriber_queue_capacity = 8

            [breaker.default_config]
            cooldown_ms = 1500
            window_size = 20
            min_samples = 5

            [breaker.component_configs."store:todo_by_id"]
            cooldown_ms = 100

            [[bridge.inbound_permitted]]
            address = "todo.get"

            [[bridge.inbound_permitted]]
            address_regex = "^todo\\..+$"
            "#,
        )
        .unwrap();

        assert_eq!(config.bus.subscriber_queue_capacity, 8);
        assert_eq!(config.breaker.default_config.cooldown_ms, 1500);
        assert_eq!(config.breaker.default_config.window_size, 20);
        // untouched fields keep their defaults
        assert_eq!(config.bus.default_send_timeout_ms, 30_000);
        assert_eq!(
            config
                .breaker
                .config_for_component("store:todo_by_id")
                .cooldown_ms,
            100
        );
        assert_eq!(config.bridge.inbound_permitted.len(), 2);
    }

    #[test]
    fn test_invalid_toml_values_are_rejected() {
        let result = ConfigLoader::from_toml_str(
            r#"
            [executor]
            event_loop_workers = 0
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[cache]\nnegative_ttl_ms = 1000").unwrap();

        let config = ConfigLoader::load_from(Some(file.path())).unwrap();
        assert_eq!(config.cache.negative_ttl_ms, 1000);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config =
            ConfigLoader::load_from(Some(Path::new("/nonexistent/zephyr.toml"))).unwrap();
        assert_eq!(config.bridge.protocol_version, "1");
    }

    #[test]
    fn test_shipped_config_is_valid() {
        let config = ConfigLoader::from_toml_str(include_str!("../../config/zephyr.toml")).unwrap();
        let todo = config.breaker.config_for_component("store:todo_by_id");
        assert_eq!(todo.success_threshold, 2);
        assert!(matches!(
            todo.fallback,
            crate::config::FallbackPolicy::StaticValue { .. }
        ));
        assert_eq!(config.bridge.outbound_permitted.len(), 1);
    }
}
