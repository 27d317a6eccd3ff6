//! One bridge connection: handshake, frame handling, heartbeats and the
//! forwarding subscriptions a peer registers

use super::frame::{read_frame, write_frame, Frame, FrameError, FrameType};
use super::handshake;
use super::server::{BridgeShared, ConnectionInfo};
use crate::bus::{
    Command, CommandHandler, CorrelationId, DeliveryMode, Principal, Reply, SubscriptionId,
};
use crate::error::CoreError;
use crate::log_bridge;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

/// Replies awaited from the peer for SENDs forwarded to it
type PendingReplies = Arc<DashMap<CorrelationId, oneshot::Sender<Reply>>>;

const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
enum CloseReason {
    PeerClosed,
    Io(String),
    Violations,
    HeartbeatTimeout,
    ServerShutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => f.write_str("peer closed"),
            CloseReason::Io(e) => write!(f, "io error: {e}"),
            CloseReason::Violations => f.write_str("protocol violations"),
            CloseReason::HeartbeatTimeout => f.write_str("missed heartbeats"),
            CloseReason::ServerShutdown => f.write_str("server shutdown"),
        }
    }
}

pub(crate) async fn run(
    shared: Arc<BridgeShared>,
    mut stream: TcpStream,
    peer: SocketAddr,
    mut shutdown: broadcast::Receiver<()>,
) {
    let _ = stream.set_nodelay(true);

    if let Err(e) = handshake::accept(
        &mut stream,
        &shared.config.protocol_version,
        shared.config.handshake_timeout(),
    )
    .await
    {
        shared.counters.handshake_failures.fetch_add(1, Ordering::Relaxed);
        log_bridge!(warn, "Handshake failed, closing connection", peer: peer, error: e.to_string());
        // A transport error is not the peer's fault; anything else is a protocol violation
        if !matches!(e, FrameError::Io(_)) {
            shared.counters.violation_closures.fetch_add(1, Ordering::Relaxed);
            shared.peers.record_violation_closure(peer.ip());
        }
        return;
    }

    let connection_id = Uuid::new_v4();
    shared.connections.insert(
        connection_id,
        ConnectionInfo {
            connection_id,
            peer,
            connected_at: Utc::now(),
            registrations: Vec::new(),
        },
    );
    log_bridge!(info, "Bridge peer connected", peer: peer, connection_id: connection_id);

    let (read_half, write_half) = stream.into_split();
    let (outbound, outbound_rx) = mpsc::channel(shared.config.outbound_queue_capacity);
    let (close_tx, close_rx) = oneshot::channel();
    let mut writer = tokio::spawn(write_loop(
        write_half,
        outbound_rx,
        close_rx,
        Arc::clone(&shared),
        peer,
    ));
    let (inbound_tx, inbound) = mpsc::channel(16);
    let reader = tokio::spawn(read_loop(read_half, inbound_tx, shared.config.max_frame_bytes));

    let mut session = Session {
        connection_id,
        peer,
        shared: Arc::clone(&shared),
        outbound,
        pending: Arc::new(DashMap::new()),
        registrations: HashMap::new(),
        violations: 0,
        missed_heartbeats: 0,
    };

    let reason = session.drive(inbound, &mut shutdown).await;
    session.close(&reason);
    drop(session);

    reader.abort();
    let _ = close_tx.send(());
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }

    shared.connections.remove(&connection_id);
    log_bridge!(
        info,
        "Bridge peer disconnected",
        peer: peer,
        connection_id: connection_id,
        reason: reason.to_string()
    );
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    inbound: mpsc::Sender<Result<Frame, FrameError>>,
    max_frame_bytes: usize,
) {
    loop {
        match read_frame(&mut reader, max_frame_bytes).await {
            Ok(Some(frame)) => {
                if inbound.send(Ok(frame)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                let fatal = !err.is_recoverable();
                if inbound.send(Err(err)).await.is_err() || fatal {
                    break;
                }
            }
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Frame>,
    mut close: oneshot::Receiver<()>,
    shared: Arc<BridgeShared>,
    peer: SocketAddr,
) {
    let max = shared.config.max_frame_bytes;

    loop {
        let frame = tokio::select! {
            biased;
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = &mut close => {
                while let Ok(frame) = outbound.try_recv() {
                    if write_one(&mut writer, frame, max, &shared, peer).await.is_err() {
                        break;
                    }
                }
                break;
            }
        };

        if write_one(&mut writer, frame, max, &shared, peer).await.is_err() {
            break;
        }
    }

    let _ = writer.shutdown().await;
}

async fn write_one(
    writer: &mut OwnedWriteHalf,
    frame: Frame,
    max: usize,
    shared: &BridgeShared,
    peer: SocketAddr,
) -> Result<(), FrameError> {
    let written = write_frame(writer, &frame, max).await;
    let result = match written {
        Err(FrameError::TooLarge { size, .. }) => {
            log_bridge!(
                warn,
                "Outbound frame exceeds max frame size, sending error instead",
                peer: peer,
                frame_type: frame.frame_type,
                size: size
            );
            let replacement = Frame::error(
                frame.correlation_id,
                &CoreError::ProtocolError(format!("{size}-byte {} frame exceeds max frame size", frame.frame_type)),
            );
            write_frame(writer, &replacement, max).await
        }
        other => other,
    };

    match &result {
        Ok(()) => {
            shared.counters.frames_out.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            log_bridge!(debug, "Bridge write failed", peer: peer, error: e.to_string());
        }
    }
    result
}

struct Session {
    connection_id: Uuid,
    peer: SocketAddr,
    shared: Arc<BridgeShared>,
    outbound: mpsc::Sender<Frame>,
    pending: PendingReplies,
    registrations: HashMap<String, SubscriptionId>,
    violations: u32,
    missed_heartbeats: u32,
}

impl Session {
    async fn drive(
        &mut self,
        mut inbound: mpsc::Receiver<Result<Frame, FrameError>>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> CloseReason {
        let period = self.shared.config.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                frame = inbound.recv() => {
                    let outcome = match frame {
                        None => Err(CloseReason::PeerClosed),
                        Some(Ok(frame)) => {
                            self.shared.counters.frames_in.fetch_add(1, Ordering::Relaxed);
                            self.missed_heartbeats = 0;
                            self.handle_frame(frame)
                        }
                        Some(Err(FrameError::Io(e))) => Err(CloseReason::Io(e.to_string())),
                        Some(Err(err)) if err.is_recoverable() => self.reject(None, err.to_string()),
                        Some(Err(err)) => self
                            .reject(None, err.to_string())
                            .and(Err(CloseReason::Violations)),
                    };
                    if let Err(reason) = outcome {
                        return reason;
                    }
                }

                _ = heartbeat.tick() => {
                    if self.missed_heartbeats >= self.shared.config.max_missed_heartbeats {
                        self.shared.counters.heartbeat_timeouts.fetch_add(1, Ordering::Relaxed);
                        log_bridge!(
                            warn,
                            "Peer missed consecutive heartbeats",
                            peer: self.peer,
                            missed: self.missed_heartbeats
                        );
                        return CloseReason::HeartbeatTimeout;
                    }
                    self.missed_heartbeats += 1;
                    self.push(Frame::ping());
                }

                _ = shutdown.recv() => return CloseReason::ServerShutdown,
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<(), CloseReason> {
        match frame.frame_type {
            FrameType::Ping => {
                self.push(Frame::pong());
                Ok(())
            }
            FrameType::Pong => Ok(()),
            FrameType::Send => self.handle_send(frame),
            FrameType::Publish => self.handle_publish(frame),
            FrameType::Register => self.handle_register(frame),
            FrameType::Unregister => self.handle_unregister(frame),
            FrameType::Reply | FrameType::Error => self.handle_reply(frame),
        }
    }

    fn principal(&self) -> Principal {
        Principal::new(format!("bridge:{}", self.peer)).with_role("bridge")
    }

    fn handle_send(&mut self, frame: Frame) -> Result<(), CloseReason> {
        let (address, correlation_id) = match (frame.require_address(), frame.require_correlation_id()) {
            (Ok(address), Ok(correlation_id)) => (address.to_string(), correlation_id.clone()),
            (Err(e), _) | (_, Err(e)) => return self.reject(frame.correlation_id.clone(), e.to_string()),
        };

        if !self.shared.allow_list.permits_inbound(&address) {
            return self.reject(
                Some(correlation_id),
                format!("SEND to {address} is not permitted"),
            );
        }

        let timeout = frame
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.shared.config.default_send_timeout());
        let command = Command::new(address, frame.payload, timeout)
            .with_correlation_id(correlation_id)
            .with_principal(self.principal());

        let dispatcher = Arc::clone(&self.shared.dispatcher);
        let outbound = self.outbound.clone();
        let peer = self.peer;
        tokio::spawn(async move {
            let reply = dispatcher.send(command).await;
            let correlation_id = reply.correlation_id.clone();
            if outbound.send(Frame::reply(&reply)).await.is_err() {
                log_bridge!(
                    debug,
                    "Peer gone before reply could be relayed",
                    peer: peer,
                    correlation_id: correlation_id
                );
            }
        });
        Ok(())
    }

    fn handle_publish(&mut self, frame: Frame) -> Result<(), CloseReason> {
        let address = match frame.require_address() {
            Ok(address) => address.to_string(),
            Err(e) => return self.reject(frame.correlation_id.clone(), e.to_string()),
        };

        if !self.shared.allow_list.permits_inbound(&address) {
            return self.reject(
                frame.correlation_id.clone(),
                format!("PUBLISH to {address} is not permitted"),
            );
        }

        let mut command = Command::new(
            address,
            frame.payload,
            self.shared.config.default_send_timeout(),
        )
        .with_principal(self.principal());
        if let Some(correlation_id) = frame.correlation_id {
            command = command.with_correlation_id(correlation_id);
        }

        let correlation_id = command.correlation_id.clone();
        let address = command.address.clone();
        let report = self.shared.dispatcher.publish(command);
        log_bridge!(
            debug,
            "Relayed PUBLISH",
            peer: self.peer,
            delivered: report.delivered,
            dropped: report.dropped
        );

        // Not a violation: the peer did nothing wrong, the bus is saturated
        if let Err(err) = report.into_result(&address) {
            self.push(Frame::error(Some(correlation_id), &err));
        }
        Ok(())
    }

    fn handle_register(&mut self, frame: Frame) -> Result<(), CloseReason> {
        let address = match frame.require_address() {
            Ok(address) => address.to_string(),
            Err(e) => return self.reject(None, e.to_string()),
        };

        if !self.shared.allow_list.permits_outbound(&address) {
            return self.reject(None, format!("REGISTER for {address} is not permitted"));
        }

        if self.registrations.contains_key(&address) {
            log_bridge!(debug, "Address already registered by peer", peer: self.peer, address: address);
            return Ok(());
        }

        let forwarder = RemoteForwarder {
            name: format!("bridge:{}:{address}", self.peer),
            peer: self.peer,
            outbound: self.outbound.clone(),
            pending: Arc::clone(&self.pending),
        };
        let id = self.shared.dispatcher.subscribe(
            address.clone(),
            Arc::new(forwarder),
            DeliveryMode::PointToPoint,
        );
        self.registrations.insert(address.clone(), id);
        self.sync_registrations();

        log_bridge!(info, "Peer registered address", peer: self.peer, address: address);
        Ok(())
    }

    fn handle_unregister(&mut self, frame: Frame) -> Result<(), CloseReason> {
        let address = match frame.require_address() {
            Ok(address) => address.to_string(),
            Err(e) => return self.reject(None, e.to_string()),
        };

        match self.registrations.remove(&address) {
            Some(id) => {
                self.shared.dispatcher.unsubscribe(id);
                self.sync_registrations();
                log_bridge!(info, "Peer unregistered address", peer: self.peer, address: address);
            }
            None => {
                log_bridge!(debug, "UNREGISTER for address not registered", peer: self.peer, address: address);
            }
        }
        Ok(())
    }

    fn handle_reply(&mut self, frame: Frame) -> Result<(), CloseReason> {
        let Some(correlation_id) = frame.correlation_id.clone() else {
            if frame.frame_type == FrameType::Error {
                log_bridge!(warn, "Peer reported an error", peer: self.peer, error: frame.error);
                return Ok(());
            }
            return self.reject(None, "REPLY frame without correlation_id".to_string());
        };

        let Some((_, waiter)) = self.pending.remove(&correlation_id) else {
            log_bridge!(
                debug,
                "Ignoring reply with no outstanding request",
                peer: self.peer,
                correlation_id: correlation_id
            );
            return Ok(());
        };

        match frame.into_reply() {
            Ok(reply) => {
                let _ = waiter.send(reply);
            }
            Err(e) => {
                log_bridge!(debug, "Unusable reply frame", peer: self.peer, error: e.to_string());
            }
        }
        Ok(())
    }

    /// Answer a bad frame with ERROR; close once violations reach the limit
    fn reject(&mut self, correlation_id: Option<CorrelationId>, message: String) -> Result<(), CloseReason> {
        self.violations += 1;
        self.shared.counters.violations.fetch_add(1, Ordering::Relaxed);
        log_bridge!(
            warn,
            "Rejected bridge frame",
            peer: self.peer,
            violations: self.violations,
            reason: message
        );

        self.push(Frame::error(correlation_id, &CoreError::ProtocolError(message)));

        if self.violations >= self.shared.config.max_violations_before_close {
            Err(CloseReason::Violations)
        } else {
            Ok(())
        }
    }

    fn push(&self, frame: Frame) {
        match self.outbound.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                log_bridge!(
                    warn,
                    "Outbound queue full, dropping frame",
                    peer: self.peer,
                    frame_type: frame.frame_type
                );
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    fn sync_registrations(&self) {
        if let Some(mut info) = self.shared.connections.get_mut(&self.connection_id) {
            let mut addresses: Vec<String> = self.registrations.keys().cloned().collect();
            addresses.sort();
            info.registrations = addresses;
        }
    }

    fn close(&mut self, reason: &CloseReason) {
        for (_, id) in self.registrations.drain() {
            self.shared.dispatcher.unsubscribe(id);
        }
        self.sync_registrations();
        // Dropping the waiters fails every request still forwarded to this peer
        self.pending.clear();

        if *reason == CloseReason::Violations {
            self.shared
                .counters
                .violation_closures
                .fetch_add(1, Ordering::Relaxed);
            self.shared.peers.record_violation_closure(self.peer.ip());
        }
    }
}

/// Handler standing in for a peer that registered an address
struct RemoteForwarder {
    name: String,
    peer: SocketAddr,
    outbound: mpsc::Sender<Frame>,
    pending: PendingReplies,
}

impl RemoteForwarder {
    fn enqueue(&self, frame: Frame) -> Result<(), CoreError> {
        self.outbound.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => {
                CoreError::Backpressure(format!("outbound queue full for peer {}", self.peer))
            }
            TrySendError::Closed(_) => {
                CoreError::DependencyFailure(format!("peer {} disconnected", self.peer))
            }
        })
    }
}

#[async_trait]
impl CommandHandler for RemoteForwarder {
    async fn handle(&self, command: Command) -> Result<Value, CoreError> {
        let correlation_id = command.correlation_id.clone();

        if command.delivery == DeliveryMode::Broadcast {
            self.enqueue(Frame::publish(command.address, correlation_id, command.payload))?;
            return Ok(Value::Null);
        }

        let (waiter, reply) = oneshot::channel();
        self.pending.insert(correlation_id.clone(), waiter);

        let timeout_ms = command.remaining().as_millis() as u64;
        let frame = Frame::send(
            command.address,
            correlation_id.clone(),
            command.payload,
            Some(timeout_ms),
        );
        if let Err(e) = self.enqueue(frame) {
            self.pending.remove(&correlation_id);
            return Err(e);
        }

        match tokio::time::timeout_at(command.deadline, reply).await {
            Ok(Ok(reply)) => reply.into_result(),
            Ok(Err(_)) => Err(CoreError::DependencyFailure(format!(
                "peer {} disconnected before replying",
                self.peer
            ))),
            Err(_) => {
                self.pending.remove(&correlation_id);
                Err(CoreError::Timeout(format!(
                    "peer {} did not reply to {correlation_id}",
                    self.peer
                )))
            }
        }
    }

    fn handler_name(&self) -> &str {
        &self.name
    }
}
