//! TCP bridge server: accept loop, shared connection state and statistics

use super::allow_list::AllowList;
use super::connection;
use super::peers::PeerRegistry;
use crate::bus::Dispatcher;
use crate::config::BridgeConfig;
use crate::error::{CoreError, CoreResult};
use crate::log_bridge;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info};
use uuid::Uuid;

/// A connected, handshaken peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub connection_id: Uuid,
    pub peer: SocketAddr,
    pub connected_at: DateTime<Utc>,
    /// Addresses the peer has registered for forwarding
    pub registrations: Vec<String>,
}

const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Pause after `consecutive` failed accepts, doubling up to a cap
fn accept_backoff(consecutive: u32) -> Duration {
    let factor = 1u32 << consecutive.saturating_sub(1).min(10);
    ACCEPT_BACKOFF_BASE.saturating_mul(factor).min(ACCEPT_BACKOFF_MAX)
}

#[derive(Debug, Default)]
pub(crate) struct BridgeCounters {
    pub(crate) accepted: AtomicU64,
    pub(crate) rejected_banned: AtomicU64,
    pub(crate) handshake_failures: AtomicU64,
    pub(crate) frames_in: AtomicU64,
    pub(crate) frames_out: AtomicU64,
    pub(crate) violations: AtomicU64,
    pub(crate) violation_closures: AtomicU64,
    pub(crate) heartbeat_timeouts: AtomicU64,
}

/// State shared by the accept loop and every connection task
#[derive(Debug)]
pub(crate) struct BridgeShared {
    pub(crate) config: BridgeConfig,
    pub(crate) allow_list: AllowList,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) peers: PeerRegistry,
    pub(crate) counters: BridgeCounters,
    pub(crate) connections: DashMap<Uuid, ConnectionInfo>,
}

/// Bridge statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeStats {
    pub running: bool,
    pub uptime_seconds: u64,
    pub accepted_connections: u64,
    pub active_connections: usize,
    pub rejected_connections: u64,
    pub handshake_failures: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub violations: u64,
    pub violation_closures: u64,
    pub heartbeat_timeouts: u64,
    pub banned_peers: usize,
    pub remote_subscriptions: usize,
}

#[derive(Debug, Default)]
struct ServerState {
    local_addr: Option<SocketAddr>,
    started_at: Option<DateTime<Utc>>,
}

/// Exposes the internal bus to external TCP peers
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use zephyr_core::bridge::BridgeServer;
/// use zephyr_core::bus::Dispatcher;
/// use zephyr_core::config::BridgeConfig;
///
/// # async fn example() -> zephyr_core::error::CoreResult<()> {
/// let dispatcher = Arc::new(Dispatcher::default());
/// let server = BridgeServer::new(BridgeConfig::default(), dispatcher)?;
/// let addr = server.start().await?;
/// println!("bridge listening on {addr}");
/// server.stop();
/// # Ok(())
/// # }
/// ```
pub struct BridgeServer {
    shared: Arc<BridgeShared>,
    shutdown_tx: broadcast::Sender<()>,
    state: parking_lot::Mutex<ServerState>,
}

impl std::fmt::Debug for BridgeServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeServer")
            .field("bind_address", &self.shared.config.bind_address)
            .field("local_addr", &self.local_addr())
            .field("active_connections", &self.shared.connections.len())
            .finish()
    }
}

impl BridgeServer {
    pub fn new(config: BridgeConfig, dispatcher: Arc<Dispatcher>) -> CoreResult<Self> {
        let allow_list = AllowList::from_config(&config)?;
        let (shutdown_tx, _) = broadcast::channel(16);

        Ok(Self {
            shared: Arc::new(BridgeShared {
                peers: PeerRegistry::new(config.ban_after_closures),
                config,
                allow_list,
                dispatcher,
                counters: BridgeCounters::default(),
                connections: DashMap::new(),
            }),
            shutdown_tx,
            state: parking_lot::Mutex::new(ServerState::default()),
        })
    }

    /// Bind and start accepting connections; returns the bound address
    pub async fn start(&self) -> CoreResult<SocketAddr> {
        if self.is_running() {
            return Err(CoreError::Internal("bridge server is already running".to_string()));
        }

        let bind_address = &self.shared.config.bind_address;
        info!(bind_address = %bind_address, "Starting bridge server");

        let listener = TcpListener::bind(bind_address).await.map_err(|e| {
            CoreError::DependencyFailure(format!("failed to bind bridge to {bind_address}: {e}"))
        })?;
        let local_addr = listener.local_addr()?;

        {
            let mut state = self.state.lock();
            state.local_addr = Some(local_addr);
            state.started_at = Some(Utc::now());
        }

        tokio::spawn(accept_loop(
            Arc::clone(&self.shared),
            listener,
            self.shutdown_tx.clone(),
        ));

        info!(local_addr = %local_addr, "Bridge server listening");
        Ok(local_addr)
    }

    /// Stop accepting and close every connection
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if state.local_addr.take().is_none() {
            return;
        }
        state.started_at = None;
        let _ = self.shutdown_tx.send(());
        info!("Bridge server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().local_addr.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().local_addr
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.shared.peers
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut connections: Vec<ConnectionInfo> = self
            .shared
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        connections.sort_by_key(|c| c.connected_at);
        connections
    }

    pub fn stats(&self) -> BridgeStats {
        let c = &self.shared.counters;
        let state = self.state.lock();
        BridgeStats {
            running: state.local_addr.is_some(),
            uptime_seconds: state
                .started_at
                .map(|start| (Utc::now() - start).num_seconds().max(0) as u64)
                .unwrap_or(0),
            accepted_connections: c.accepted.load(Ordering::Relaxed),
            active_connections: self.shared.connections.len(),
            rejected_connections: c.rejected_banned.load(Ordering::Relaxed),
            handshake_failures: c.handshake_failures.load(Ordering::Relaxed),
            frames_in: c.frames_in.load(Ordering::Relaxed),
            frames_out: c.frames_out.load(Ordering::Relaxed),
            violations: c.violations.load(Ordering::Relaxed),
            violation_closures: c.violation_closures.load(Ordering::Relaxed),
            heartbeat_timeouts: c.heartbeat_timeouts.load(Ordering::Relaxed),
            banned_peers: self.shared.peers.banned_peers().len(),
            remote_subscriptions: self
                .shared
                .connections
                .iter()
                .map(|entry| entry.registrations.len())
                .sum(),
        }
    }
}

impl Drop for BridgeServer {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn accept_loop(
    shared: Arc<BridgeShared>,
    listener: TcpListener,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut accept_errors = 0u32;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        accept_errors = 0;
                        if shared.peers.is_banned(&peer.ip()) {
                            shared.counters.rejected_banned.fetch_add(1, Ordering::Relaxed);
                            log_bridge!(warn, "Refusing connection from banned peer", peer: peer);
                            drop(stream);
                            continue;
                        }

                        shared.counters.accepted.fetch_add(1, Ordering::Relaxed);
                        log_bridge!(debug, "Accepted bridge connection", peer: peer);
                        tokio::spawn(connection::run(
                            Arc::clone(&shared),
                            stream,
                            peer,
                            shutdown_tx.subscribe(),
                        ));
                    }
                    Err(e) => {
                        // typically fd exhaustion; retrying at once would spin
                        accept_errors = accept_errors.saturating_add(1);
                        let backoff = accept_backoff(accept_errors);
                        error!(error = %e, backoff_ms = backoff.as_millis() as u64, "Failed to accept bridge connection");
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = shutdown_rx.recv() => {
                                info!("Bridge accept loop shutting down");
                                break;
                            }
                        }
                    }
                }
            }

            _ = shutdown_rx.recv() => {
                info!("Bridge accept loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ephemeral() -> BridgeConfig {
        BridgeConfig {
            bind_address: "127.0.0.1:0".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_accept_backoff_grows_and_caps() {
        assert_eq!(accept_backoff(1), Duration::from_millis(10));
        assert_eq!(accept_backoff(2), Duration::from_millis(20));
        assert_eq!(accept_backoff(4), Duration::from_millis(80));
        assert!(accept_backoff(1) > Duration::ZERO);
        assert_eq!(accept_backoff(8), ACCEPT_BACKOFF_MAX);
        assert_eq!(accept_backoff(u32::MAX), ACCEPT_BACKOFF_MAX);
    }

    #[tokio::test]
    async fn test_start_stop() {
        let server = BridgeServer::new(ephemeral(), Arc::new(Dispatcher::default())).unwrap();
        assert!(!server.is_running());

        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert!(server.is_running());
        assert!(server.start().await.is_err());

        server.stop();
        assert!(!server.is_running());
        assert_eq!(server.stats().active_connections, 0);
    }

    #[test]
    fn test_invalid_allow_list_fails_construction() {
        let config = BridgeConfig {
            inbound_permitted: vec![crate::config::AddressRuleConfig::regex("(")],
            ..ephemeral()
        };
        let err = BridgeServer::new(config, Arc::new(Dispatcher::default())).unwrap_err();
        assert!(matches!(err, CoreError::Configuration(_)));
    }
}
