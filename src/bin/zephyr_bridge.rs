//! Zephyr Bridge Binary
//!
//! Standalone process running the resilience core with its TCP bridge. It
//! loads configuration, connects the store and distributed cache tier,
//! answers `zephyr.health` and `zephyr.stats` on the bus, and serves bridge
//! peers until interrupted.

use anyhow::Context;
use std::sync::Arc;
use tokio::signal;
use tracing::info;

use zephyr_core::config::ConfigLoader;
use zephyr_core::core::ResilienceCore;
use zephyr_core::executor::build_runtime;
use zephyr_core::logging;

fn main() -> anyhow::Result<()> {
    let config = ConfigLoader::load().context("failed to load configuration")?;

    if std::env::var("ZEPHYR_LOG_FORMAT").as_deref() == Ok("json") {
        logging::init_structured_logging();
    } else {
        logging::init_console_only();
    }

    let runtime = build_runtime(&config.executor).context("failed to build runtime")?;
    runtime.block_on(run(config))
}

async fn run(config: zephyr_core::CoreConfig) -> anyhow::Result<()> {
    info!(environment = %logging::get_environment(), "Starting Zephyr bridge");

    let core = Arc::new(
        ResilienceCore::from_config(config)
            .await
            .context("failed to bootstrap resilience core")?,
    );
    core.register_builtin_handlers();

    let addr = core.start_bridge().await.context("failed to start bridge")?;
    info!(%addr, "Bridge listening");

    signal::ctrl_c().await?;
    info!("Shutdown signal received");

    core.shutdown();
    info!(stats = ?core.stats(), "Zephyr bridge stopped");

    Ok(())
}
