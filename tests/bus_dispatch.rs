//! Integration tests for dispatch through the resilience core

mod common;

use common::{echo_handler, init_test_logging, slow_handler, todo_core, TodoTable};
use futures::FutureExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use zephyr_core::bus::{Command, DeliveryMode, Principal, ReplyStatus};
use zephyr_core::cache::InMemoryDistributedCache;
use zephyr_core::error::ErrorKind;
use zephyr_core::store::Statement;

fn reader() -> Principal {
    Principal::new("user-7").with_role("reader")
}

#[tokio::test]
async fn test_dispatch_without_subscriber_is_immediate_no_handler() {
    init_test_logging();
    let core = todo_core(&TodoTable::default(), InMemoryDistributedCache::new());
    let command = core.commands().create("nobody.home", Value::Null, reader()).unwrap();

    // resolves on first poll, never waits for the deadline
    let reply = core
        .dispatch(command)
        .now_or_never()
        .expect("no-handler reply is immediate");
    assert_eq!(reply.error_kind(), Some(ErrorKind::NoHandler));
}

#[tokio::test]
async fn test_read_write_read_through_statement_handlers() {
    init_test_logging();
    let table = TodoTable::with_rows(&[(1, "draft spec"), (2, "ship it")]);
    let core = todo_core(&table, InMemoryDistributedCache::new());

    let get = core
        .read_statement(Statement::new("todo_by_id", "SELECT id, title FROM todo WHERE id = $1"))
        .unwrap()
        .single()
        .with_param_names(["id"]);
    let rename = core
        .write_statement(Statement::new(
            "todo_rename",
            "UPDATE todo SET title = $2 WHERE id = $1",
        ))
        .unwrap()
        .with_param_names(["id", "title"])
        .invalidates("todo_by_id");
    core.register("todo.get", Arc::new(get));
    core.register("todo.rename", Arc::new(rename));

    let first = core
        .dispatch(core.commands().create("todo.get", json!({"id": 1}), reader()).unwrap())
        .await;
    assert_eq!(first.payload, Some(json!({"id": 1, "title": "draft spec"})));

    let renamed = core
        .dispatch(
            core.commands()
                .create("todo.rename", json!({"id": 1, "title": "final spec"}), reader())
                .unwrap(),
        )
        .await;
    assert_eq!(renamed.payload, Some(json!({"affected": 1})));
    assert_eq!(table.title(1).as_deref(), Some("final spec"));

    let second = core
        .dispatch(core.commands().create("todo.get", json!({"id": 1}), reader()).unwrap())
        .await;
    assert_eq!(second.payload, Some(json!({"id": 1, "title": "final spec"})));
}

#[tokio::test]
async fn test_deadline_yields_timeout_and_late_reply_is_dropped() {
    init_test_logging();
    let core = todo_core(&TodoTable::default(), InMemoryDistributedCache::new());
    core.register("echo.slow", slow_handler(Duration::from_millis(200)));

    let command = Command::new("echo.slow", json!("late"), Duration::from_millis(30))
        .with_principal(reader());
    let reply = core.dispatch(command).await;
    assert_eq!(reply.status, ReplyStatus::Timeout);
    assert!(reply.payload.is_none());

    tokio::time::sleep(Duration::from_millis(300)).await;
    let stats = core.dispatcher().stats();
    assert_eq!(stats.timed_out, 1);
    assert_eq!(stats.late_replies_dropped, 1);
    assert_eq!(stats.pending_replies, 0);
}

#[tokio::test]
async fn test_round_robin_across_point_to_point_subscribers() {
    init_test_logging();
    let core = todo_core(&TodoTable::default(), InMemoryDistributedCache::new());
    let dispatcher = core.dispatcher();
    dispatcher.subscribe(
        "echo.who",
        zephyr_core::bus::handler_fn("a", |_| async { Ok(json!("a")) }),
        DeliveryMode::PointToPoint,
    );
    dispatcher.subscribe(
        "echo.who",
        zephyr_core::bus::handler_fn("b", |_| async { Ok(json!("b")) }),
        DeliveryMode::PointToPoint,
    );

    let mut answers = Vec::new();
    for _ in 0..4 {
        let reply = dispatcher.request("echo.who", Value::Null).await;
        answers.push(reply.payload.unwrap());
    }
    assert_eq!(answers, vec![json!("a"), json!("b"), json!("a"), json!("b")]);
}

#[tokio::test]
async fn test_publish_reaches_every_subscriber() {
    init_test_logging();
    let core = todo_core(&TodoTable::default(), InMemoryDistributedCache::new());
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();

    for name in ["audit", "metrics", "search"] {
        let seen_tx = seen_tx.clone();
        core.dispatcher().subscribe(
            "todo.changed",
            zephyr_core::bus::handler_fn(name, move |command| {
                let seen_tx = seen_tx.clone();
                async move {
                    let _ = seen_tx.send(command.delivery);
                    Ok(Value::Null)
                }
            }),
            DeliveryMode::Broadcast,
        );
    }

    let report = core.publish(Command::new("todo.changed", json!({"id": 1}), Duration::from_secs(1)));
    assert_eq!(report.delivered, 3);
    assert_eq!(report.dropped, 0);

    for _ in 0..3 {
        let delivery = tokio::time::timeout(Duration::from_secs(1), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery, DeliveryMode::Broadcast);
    }
}

#[tokio::test]
async fn test_echo_keeps_correlation_id() {
    init_test_logging();
    let core = todo_core(&TodoTable::default(), InMemoryDistributedCache::new());
    core.register("echo.plain", echo_handler());

    let command = Command::new("echo.plain", json!({"n": 1}), Duration::from_secs(1))
        .with_correlation_id("req-123");
    let reply = core.dispatch(command).await;
    assert!(reply.is_ok());
    assert_eq!(reply.correlation_id.as_str(), "req-123");
    assert_eq!(reply.into_result().unwrap(), json!({"n": 1}));
}
