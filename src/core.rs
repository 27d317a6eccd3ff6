//! # Resilience Core
//!
//! Single bootstrap path for every entry point. [`ResilienceCore`] wires the
//! breaker registry, the tiered cache, the dispatcher, the store, the
//! blocking pool and the bridge from one [`CoreConfig`], and exposes
//! `dispatch(Command) -> Reply` as the one way in for upstream callers.
//! [`CommandFactory`] turns an already validated and authenticated request
//! into a [`Command`].

use crate::bridge::{BridgeServer, BridgeStats};
use crate::bus::{
    Command, CommandHandler, CorrelationId, DeliveryMode, Dispatcher, DispatcherStats, Principal,
    PublishReport, Reply, SubscriptionId,
};
use crate::cache::{CacheStats, DistributedTier, TieredCache};
use crate::config::{BusConfig, CoreConfig, StoreConfig};
use crate::error::{CoreError, CoreResult};
use crate::executor::{BlockingPool, BlockingPoolStats};
use crate::handlers::StatementHandler;
use crate::health::{HealthReport, HealthReporter};
use crate::resilience::{CircuitBreakerRegistry, SystemCircuitBreakerMetrics};
use crate::store::{GuardedStore, Statement, Store};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Address answering with the aggregated health report
pub const HEALTH_ADDRESS: &str = "zephyr.health";

/// Address answering with dispatcher, cache, breaker, bridge and pool counters
pub const STATS_ADDRESS: &str = "zephyr.stats";

/// A request that has passed upstream validation and authentication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundRequest {
    pub address: String,
    #[serde(default)]
    pub payload: Value,
    pub principal: Principal,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Builds commands with the bus's default deadline
#[derive(Debug, Clone)]
pub struct CommandFactory {
    default_timeout: Duration,
}

impl CommandFactory {
    pub fn new(config: &BusConfig) -> Self {
        Self {
            default_timeout: config.default_send_timeout(),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Command for `address` owned by `principal`, with a fresh correlation id
    pub fn create(&self, address: impl Into<String>, payload: Value, principal: Principal) -> CoreResult<Command> {
        let address = address.into();
        Self::check_address(&address)?;
        Ok(Command::new(address, payload, self.default_timeout)
            .with_correlation_id(CorrelationId::generate())
            .with_principal(principal))
    }

    pub fn from_request(&self, request: InboundRequest) -> CoreResult<Command> {
        Self::check_address(&request.address)?;
        let timeout = match request.timeout_ms {
            Some(0) => {
                return Err(CoreError::ValidationFailed(
                    "timeout_ms must be greater than 0".to_string(),
                ))
            }
            Some(ms) => Duration::from_millis(ms),
            None => self.default_timeout,
        };
        let correlation_id = match request.correlation_id {
            Some(id) if id.trim().is_empty() => {
                return Err(CoreError::ValidationFailed(
                    "correlation_id must not be blank".to_string(),
                ))
            }
            Some(id) => CorrelationId::new(id),
            None => CorrelationId::generate(),
        };

        Ok(Command::new(request.address, request.payload, timeout)
            .with_correlation_id(correlation_id)
            .with_principal(request.principal))
    }

    fn check_address(address: &str) -> CoreResult<()> {
        if address.trim().is_empty() {
            return Err(CoreError::ValidationFailed("address must not be empty".to_string()));
        }
        if address.chars().any(char::is_whitespace) {
            return Err(CoreError::ValidationFailed(format!(
                "address {address:?} contains whitespace"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CoreStats {
    pub dispatcher: DispatcherStats,
    pub cache: CacheStats,
    pub breakers: SystemCircuitBreakerMetrics,
    pub bridge: BridgeStats,
    pub blocking_pool: BlockingPoolStats,
}

pub struct ResilienceCore {
    config: CoreConfig,
    breakers: Arc<CircuitBreakerRegistry>,
    cache: Arc<TieredCache>,
    dispatcher: Arc<Dispatcher>,
    store: Option<GuardedStore>,
    blocking: BlockingPool,
    health: HealthReporter,
    bridge: Arc<BridgeServer>,
    factory: CommandFactory,
}

impl fmt::Debug for ResilienceCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceCore")
            .field("dispatcher", &self.dispatcher)
            .field("store", &self.store.as_ref().map(|s| s.store().store_name()))
            .field("distributed", &self.cache.distributed().provider_name())
            .field("bridge", &self.bridge)
            .finish()
    }
}

impl ResilienceCore {
    /// Bootstrap from configuration, connecting the store and distributed tier
    ///
    /// The distributed tier degrades to NoOp when it cannot connect. A store
    /// is only connected when a database URL is configured.
    pub async fn from_config(config: CoreConfig) -> CoreResult<Self> {
        config.validate()?;
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker.clone()));
        let distributed = DistributedTier::from_config_graceful(&config.cache, Some(&breakers)).await;
        let store = connect_store(&config.store).await?;
        Self::assemble(config, breakers, store, distributed)
    }

    /// Assemble around caller-supplied dependencies
    pub fn with_components(
        config: CoreConfig,
        store: Option<Arc<dyn Store>>,
        distributed: DistributedTier,
    ) -> CoreResult<Self> {
        config.validate()?;
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.breaker.clone()));
        Self::assemble(config, breakers, store, distributed)
    }

    fn assemble(
        config: CoreConfig,
        breakers: Arc<CircuitBreakerRegistry>,
        store: Option<Arc<dyn Store>>,
        distributed: DistributedTier,
    ) -> CoreResult<Self> {
        let cache = Arc::new(TieredCache::new(&config.cache, distributed.clone()));
        let dispatcher = Arc::new(Dispatcher::new(config.bus.clone()));
        let store = store.map(|store| GuardedStore::new(store, Arc::clone(&breakers)));

        let mut health = HealthReporter::new(Arc::clone(&breakers)).with_distributed(distributed);
        if let Some(store) = &store {
            health = health.with_store(store.clone());
        }

        let bridge = Arc::new(BridgeServer::new(config.bridge.clone(), Arc::clone(&dispatcher))?);

        info!(
            store = store.as_ref().map(|s| s.store().store_name()).unwrap_or("none"),
            distributed = cache.distributed().provider_name(),
            breakers_enabled = breakers.is_enabled(),
            "Resilience core assembled"
        );

        Ok(Self {
            blocking: BlockingPool::new(&config.executor),
            factory: CommandFactory::new(&config.bus),
            config,
            breakers,
            cache,
            dispatcher,
            store,
            health,
            bridge,
        })
    }

    /// Route a command to its handler and wait for the reply
    pub async fn dispatch(&self, command: Command) -> Reply {
        self.dispatcher.send(command).await
    }

    /// Build a command from an upstream request and dispatch it
    pub async fn dispatch_request(&self, request: InboundRequest) -> Reply {
        let fallback_id = request
            .correlation_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .map(CorrelationId::new)
            .unwrap_or_else(CorrelationId::generate);

        match self.factory.from_request(request) {
            Ok(command) => self.dispatch(command).await,
            Err(err) => Reply::failed(fallback_id, &err),
        }
    }

    pub fn publish(&self, command: Command) -> PublishReport {
        self.dispatcher.publish(command)
    }

    /// Subscribe a point-to-point handler
    pub fn register(&self, address: impl Into<String>, handler: Arc<dyn CommandHandler>) -> SubscriptionId {
        self.dispatcher
            .subscribe(address, handler, DeliveryMode::PointToPoint)
    }

    /// Answer [`HEALTH_ADDRESS`] and [`STATS_ADDRESS`] on the bus
    pub fn register_builtin_handlers(self: &Arc<Self>) -> Vec<SubscriptionId> {
        vec![
            self.register(HEALTH_ADDRESS, Arc::new(HealthHandler(self.health.clone()))),
            self.register(STATS_ADDRESS, Arc::new(StatsHandler(Arc::clone(self)))),
        ]
    }

    /// Cached read handler for `statement`
    pub fn read_statement(&self, statement: Statement) -> CoreResult<StatementHandler> {
        Ok(StatementHandler::read(
            statement,
            self.guarded_store()?.clone(),
            Some(Arc::clone(&self.cache)),
        ))
    }

    /// Invalidating write handler for `statement`
    pub fn write_statement(&self, statement: Statement) -> CoreResult<StatementHandler> {
        Ok(StatementHandler::write(
            statement,
            self.guarded_store()?.clone(),
            Some(Arc::clone(&self.cache)),
        ))
    }

    pub async fn start_bridge(&self) -> CoreResult<SocketAddr> {
        self.bridge.start().await
    }

    pub async fn health(&self) -> HealthReport {
        self.health.check().await
    }

    pub fn stats(&self) -> CoreStats {
        CoreStats {
            dispatcher: self.dispatcher.stats(),
            cache: self.cache.stats(),
            breakers: self.breakers.system_metrics(),
            bridge: self.bridge.stats(),
            blocking_pool: self.blocking.stats(),
        }
    }

    /// Stop the bridge, drop every subscription and close the blocking pool
    pub fn shutdown(&self) {
        info!("Shutting down resilience core");
        self.bridge.stop();
        self.dispatcher.shutdown();
        self.blocking.close();
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn commands(&self) -> &CommandFactory {
        &self.factory
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn store(&self) -> Option<&GuardedStore> {
        self.store.as_ref()
    }

    pub fn blocking_pool(&self) -> &BlockingPool {
        &self.blocking
    }

    pub fn bridge(&self) -> &Arc<BridgeServer> {
        &self.bridge
    }

    fn guarded_store(&self) -> CoreResult<&GuardedStore> {
        self.store
            .as_ref()
            .ok_or_else(|| CoreError::Configuration("no store configured".to_string()))
    }
}

#[cfg(feature = "postgres")]
async fn connect_store(config: &StoreConfig) -> CoreResult<Option<Arc<dyn Store>>> {
    if config.resolved_url().is_none() {
        warn!("No database URL configured, running without a store");
        return Ok(None);
    }
    let store = crate::store::PgStore::connect(config).await?;
    Ok(Some(Arc::new(store)))
}

#[cfg(not(feature = "postgres"))]
async fn connect_store(_config: &StoreConfig) -> CoreResult<Option<Arc<dyn Store>>> {
    warn!("Built without the 'postgres' feature, running without a store");
    Ok(None)
}

struct HealthHandler(HealthReporter);

#[async_trait]
impl CommandHandler for HealthHandler {
    async fn handle(&self, _command: Command) -> Result<Value, CoreError> {
        Ok(serde_json::to_value(self.0.check().await)?)
    }

    fn handler_name(&self) -> &str {
        "health"
    }
}

struct StatsHandler(Arc<ResilienceCore>);

#[async_trait]
impl CommandHandler for StatsHandler {
    async fn handle(&self, _command: Command) -> Result<Value, CoreError> {
        Ok(serde_json::to_value(self.0.stats())?)
    }

    fn handler_name(&self) -> &str {
        "stats"
    }
}
