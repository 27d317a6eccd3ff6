//! Integration tests for the TCP bridge against a running core

mod common;

use common::{echo_handler, init_test_logging, test_config};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use zephyr_core::bridge::frame::{read_frame, write_frame};
use zephyr_core::bridge::handshake;
use zephyr_core::bridge::{BridgeClient, ClientOptions, Frame, FrameType};
use zephyr_core::bus::{Command, CorrelationId, Reply, ReplyStatus, SubscribeOptions};
use zephyr_core::cache::DistributedTier;
use zephyr_core::config::CoreConfig;
use zephyr_core::core::ResilienceCore;
use zephyr_core::error::ErrorKind;

const WAIT: Duration = Duration::from_secs(2);
const MAX_FRAME: usize = 1024 * 1024;

async fn running_core(config: CoreConfig) -> (Arc<ResilienceCore>, SocketAddr) {
    let core = Arc::new(ResilienceCore::with_components(config, None, DistributedTier::noop()).unwrap());
    core.register("echo.x", echo_handler());
    let addr = core.start_bridge().await.unwrap();
    (core, addr)
}

async fn raw_peer(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    handshake::initiate(&mut stream, "1", WAIT).await.unwrap();
    stream
}

#[tokio::test]
async fn test_send_gets_exactly_one_reply() {
    init_test_logging();
    let (core, addr) = running_core(test_config()).await;
    let mut stream = raw_peer(addr).await;

    let cid = CorrelationId::new("bridge-1");
    let send = Frame::send("echo.x", cid.clone(), json!({"hello": "bridge"}), Some(1_000));
    write_frame(&mut stream, &send, MAX_FRAME).await.unwrap();

    let reply = timeout(WAIT, read_frame(&mut stream, MAX_FRAME))
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(reply.frame_type, FrameType::Reply);
    assert_eq!(reply.correlation_id, Some(cid));
    assert_eq!(reply.payload, json!({"hello": "bridge"}));

    // nothing else arrives for the same request
    let extra = timeout(Duration::from_millis(100), read_frame(&mut stream, MAX_FRAME)).await;
    assert!(extra.is_err(), "unexpected frame: {extra:?}");

    core.shutdown();
}

#[tokio::test]
async fn test_disallowed_address_gets_error_then_close() {
    init_test_logging();
    let (core, addr) = running_core(test_config()).await;
    let mut stream = raw_peer(addr).await;

    let send = Frame::send("admin.drop_tables", CorrelationId::new("bad-1"), json!({}), None);
    write_frame(&mut stream, &send, MAX_FRAME).await.unwrap();

    let mut frames = Vec::new();
    while let Some(frame) = timeout(WAIT, read_frame(&mut stream, MAX_FRAME))
        .await
        .unwrap()
        .unwrap()
    {
        frames.push(frame);
    }

    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].frame_type, FrameType::Error);
    assert_eq!(frames[0].correlation_id, Some(CorrelationId::new("bad-1")));
    assert_eq!(frames[0].error.as_ref().map(|e| e.kind), Some(ErrorKind::ProtocolError));
    assert_eq!(core.bridge().stats().violation_closures, 1);

    core.shutdown();
}

#[tokio::test]
async fn test_registered_address_forwards_to_peer() {
    init_test_logging();
    let (core, addr) = running_core(test_config()).await;
    let mut client = BridgeClient::connect(addr).await.unwrap();

    client.register("remote.echo").await.unwrap();
    timeout(WAIT, async {
        while !core.dispatcher().has_handler("remote.echo") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let dispatcher = Arc::clone(core.dispatcher());
    let pending = tokio::spawn(async move {
        dispatcher
            .send(Command::new("remote.echo", json!({"n": 41}), WAIT))
            .await
    });

    let forwarded = timeout(WAIT, client.next_frame()).await.unwrap().unwrap();
    assert_eq!(forwarded.frame_type, FrameType::Send);
    assert_eq!(forwarded.address.as_deref(), Some("remote.echo"));
    let cid = forwarded.correlation_id.clone().unwrap();
    client.reply(&Reply::ok(cid, json!({"n": 42}))).await.unwrap();

    let reply = timeout(WAIT, pending).await.unwrap().unwrap();
    assert_eq!(reply.status, ReplyStatus::Ok);
    assert_eq!(reply.payload, Some(json!({"n": 42})));

    core.shutdown();
}

#[tokio::test]
async fn test_register_outside_outbound_rules_is_refused() {
    init_test_logging();
    let (core, addr) = running_core(test_config()).await;
    let mut client = BridgeClient::connect(addr).await.unwrap();

    client.register("todo.get").await.unwrap();
    let refusal = timeout(WAIT, client.next_frame()).await.unwrap().unwrap();
    assert_eq!(refusal.frame_type, FrameType::Error);
    assert!(timeout(WAIT, client.next_frame()).await.unwrap().is_none());
    assert!(!core.dispatcher().has_handler("todo.get"));

    core.shutdown();
}

#[tokio::test]
async fn test_silent_peer_closed_after_missed_heartbeats() {
    init_test_logging();
    let mut config = test_config();
    config.bridge.heartbeat_interval_ms = 50;
    config.bridge.max_missed_heartbeats = 2;
    let (core, addr) = running_core(config).await;

    let options = ClientOptions {
        answer_pings: false,
        ..ClientOptions::default()
    };
    let mut client = BridgeClient::connect_with(addr, options).await.unwrap();

    let mut pings = 0;
    while let Some(frame) = timeout(WAIT, client.next_frame()).await.unwrap() {
        assert_eq!(frame.frame_type, FrameType::Ping);
        pings += 1;
    }
    assert_eq!(pings, 2);
    assert_eq!(core.bridge().stats().heartbeat_timeouts, 1);

    core.shutdown();
}

#[tokio::test]
async fn test_answering_peer_survives_heartbeats() {
    init_test_logging();
    let mut config = test_config();
    config.bridge.heartbeat_interval_ms = 30;
    config.bridge.max_missed_heartbeats = 2;
    let (core, addr) = running_core(config).await;

    let client = BridgeClient::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let reply = client.send("echo.x", json!("still here"), WAIT).await.unwrap();
    assert_eq!(reply.payload, Some(json!("still here")));
    assert!(!client.is_closed());

    core.shutdown();
}

#[tokio::test]
async fn test_version_mismatch_refused() {
    init_test_logging();
    let (core, addr) = running_core(test_config()).await;

    let options = ClientOptions {
        protocol_version: "2".to_string(),
        ..ClientOptions::default()
    };
    let err = BridgeClient::connect_with(addr, options).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolError);
    assert_eq!(core.bridge().stats().handshake_failures, 1);

    core.shutdown();
}

#[tokio::test]
async fn test_repeat_offender_is_banned() {
    init_test_logging();
    let mut config = test_config();
    config.bridge.ban_after_closures = 1;
    let (core, addr) = running_core(config).await;

    let client = BridgeClient::connect(addr).await.unwrap();
    let reply = client
        .send("admin.drop_tables", json!({}), WAIT)
        .await
        .unwrap();
    assert_eq!(reply.error_kind(), Some(ErrorKind::ProtocolError));

    timeout(WAIT, async {
        while core.bridge().stats().banned_peers == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert!(BridgeClient::connect(addr).await.is_err());
    assert_eq!(core.bridge().stats().rejected_connections, 1);

    core.shutdown();
}

#[tokio::test]
async fn test_repeated_bad_handshakes_get_peer_banned() {
    init_test_logging();
    let mut config = test_config();
    config.bridge.ban_after_closures = 2;
    let (core, addr) = running_core(config).await;

    let bad_version = ClientOptions {
        protocol_version: "999".to_string(),
        ..ClientOptions::default()
    };
    for _ in 0..2 {
        let err = BridgeClient::connect_with(addr, bad_version.clone())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
    }

    timeout(WAIT, async {
        while core.bridge().stats().banned_peers == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // even a correct handshake is refused now
    assert!(BridgeClient::connect(addr).await.is_err());
    let stats = core.bridge().stats();
    assert_eq!(stats.handshake_failures, 2);
    assert_eq!(stats.violation_closures, 2);
    assert_eq!(stats.rejected_connections, 1);

    core.shutdown();
}

#[tokio::test]
async fn test_partial_publish_is_reported_to_peer() {
    init_test_logging();
    let (core, addr) = running_core(test_config()).await;

    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel();
    let handler = {
        let gate = Arc::clone(&gate);
        zephyr_core::bus::handler_fn("gated", move |_command| {
            let gate = Arc::clone(&gate);
            let started_tx = started_tx.clone();
            async move {
                let _ = started_tx.send(());
                let _permit = gate.acquire().await;
                Ok(serde_json::Value::Null)
            }
        })
    };
    core.dispatcher().subscribe_with(
        "echo.events",
        handler,
        SubscribeOptions::broadcast().with_queue_capacity(1),
    );

    let mut client = BridgeClient::connect(addr).await.unwrap();
    client.publish("echo.events", json!({"n": 1})).await.unwrap();
    timeout(WAIT, started_rx.recv()).await.unwrap().unwrap();
    client.publish("echo.events", json!({"n": 2})).await.unwrap();
    client.publish("echo.events", json!({"n": 3})).await.unwrap();

    let notice = timeout(WAIT, client.next_frame()).await.unwrap().unwrap();
    assert_eq!(notice.frame_type, FrameType::Error);
    assert_eq!(notice.error.as_ref().map(|e| e.kind), Some(ErrorKind::Backpressure));
    // saturation is not held against the peer
    assert_eq!(core.bridge().stats().violations, 0);
    assert!(!client.is_closed());

    gate.add_permits(3);
    core.shutdown();
}
