//! Peer side of the bridge
//!
//! Connects, performs the handshake and multiplexes request/reply over one
//! connection. Frames the server pushes on its own initiative (SEND and
//! PUBLISH for registered addresses, ERROR) are surfaced through
//! [`BridgeClient::next_frame`].

use super::frame::{read_frame, write_frame, Frame, FrameType};
use super::handshake;
use crate::bus::{CorrelationId, Reply};
use crate::config::BridgeConfig;
use crate::error::{CoreError, CoreResult};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

type Waiters = Arc<DashMap<CorrelationId, oneshot::Sender<Reply>>>;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub protocol_version: String,
    pub max_frame_bytes: usize,
    pub handshake_timeout: Duration,
    /// Answer server PINGs automatically
    pub answer_pings: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from(&BridgeConfig::default())
    }
}

impl From<&BridgeConfig> for ClientOptions {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            protocol_version: config.protocol_version.clone(),
            max_frame_bytes: config.max_frame_bytes,
            handshake_timeout: config.handshake_timeout(),
            answer_pings: true,
        }
    }
}

#[derive(Debug)]
pub struct BridgeClient {
    outbound: mpsc::Sender<Frame>,
    waiters: Waiters,
    pushed: mpsc::Receiver<Frame>,
    closed: Arc<AtomicBool>,
}

impl BridgeClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> CoreResult<Self> {
        Self::connect_with(addr, ClientOptions::default()).await
    }

    pub async fn connect_with(addr: impl ToSocketAddrs, options: ClientOptions) -> CoreResult<Self> {
        let mut stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        handshake::initiate(&mut stream, &options.protocol_version, options.handshake_timeout).await?;

        let (mut reader, mut writer) = stream.into_split();
        let (outbound, mut outbound_rx) = mpsc::channel::<Frame>(256);
        let (pushed_tx, pushed) = mpsc::channel(256);
        let waiters: Waiters = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));
        let max = options.max_frame_bytes;

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if write_frame(&mut writer, &frame, max).await.is_err() {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        {
            let waiters = Arc::clone(&waiters);
            let closed = Arc::clone(&closed);
            let pong = outbound.clone();
            let answer_pings = options.answer_pings;
            tokio::spawn(async move {
                while let Ok(Some(frame)) = read_frame(&mut reader, max).await {
                    match frame.frame_type {
                        FrameType::Ping if answer_pings => {
                            let _ = pong.try_send(Frame::pong());
                        }
                        FrameType::Reply | FrameType::Error => {
                            let waiter = frame
                                .correlation_id
                                .as_ref()
                                .and_then(|id| waiters.remove(id))
                                .map(|(_, waiter)| waiter);
                            match waiter {
                                Some(waiter) => {
                                    if let Ok(reply) = frame.into_reply() {
                                        let _ = waiter.send(reply);
                                    }
                                }
                                None => {
                                    let _ = pushed_tx.send(frame).await;
                                }
                            }
                        }
                        _ => {
                            let _ = pushed_tx.send(frame).await;
                        }
                    }
                }
                closed.store(true, Ordering::SeqCst);
                // Fail every request still waiting on this connection
                waiters.clear();
                debug!("Bridge client connection closed");
            });
        }

        Ok(Self {
            outbound,
            waiters,
            pushed,
            closed,
        })
    }

    async fn push(&self, frame: Frame) -> CoreResult<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| CoreError::ProtocolError("bridge connection closed".to_string()))
    }

    /// Request/reply over the bridge
    pub async fn send(&self, address: &str, payload: Value, timeout: Duration) -> CoreResult<Reply> {
        let correlation_id = CorrelationId::generate();
        self.send_with_id(address, correlation_id, payload, timeout).await
    }

    pub async fn send_with_id(
        &self,
        address: &str,
        correlation_id: CorrelationId,
        payload: Value,
        timeout: Duration,
    ) -> CoreResult<Reply> {
        let (waiter, reply) = oneshot::channel();
        self.waiters.insert(correlation_id.clone(), waiter);

        let frame = Frame::send(
            address,
            correlation_id.clone(),
            payload,
            Some(timeout.as_millis() as u64),
        );
        if let Err(e) = self.push(frame).await {
            self.waiters.remove(&correlation_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(CoreError::ProtocolError(
                "bridge connection closed before reply".to_string(),
            )),
            Err(_) => {
                self.waiters.remove(&correlation_id);
                Err(CoreError::Timeout(format!("no REPLY for {correlation_id}")))
            }
        }
    }

    pub async fn publish(&self, address: &str, payload: Value) -> CoreResult<()> {
        self.push(Frame::publish(address, CorrelationId::generate(), payload))
            .await
    }

    pub async fn register(&self, address: &str) -> CoreResult<()> {
        self.push(Frame::register(address)).await
    }

    pub async fn unregister(&self, address: &str) -> CoreResult<()> {
        self.push(Frame::unregister(address)).await
    }

    /// Answer a SEND the server forwarded to this peer
    pub async fn reply(&self, reply: &Reply) -> CoreResult<()> {
        self.push(Frame::reply(reply)).await
    }

    /// Write an arbitrary frame
    pub async fn send_frame(&self, frame: Frame) -> CoreResult<()> {
        self.push(frame).await
    }

    /// Next frame pushed by the server; `None` once the connection closed
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.pushed.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
