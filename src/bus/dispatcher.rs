//! Address-based command dispatcher
//!
//! Each subscription owns a bounded inbound queue drained by its own worker
//! task. `send` picks one point-to-point subscriber round-robin and awaits
//! its reply until the command deadline; `publish` offers a copy to every
//! subscriber of the address. Neither ever waits for queue space.

use super::command::{Command, CorrelationId, DeliveryMode, PublishReport, Reply};
use super::handler::CommandHandler;
use crate::config::BusConfig;
use crate::error::CoreError;
use crate::log_bus;
use dashmap::DashSet;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Options for a subscription
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    pub mode: DeliveryMode,
    /// Commands handled at once; 1 keeps FIFO order
    pub concurrency: usize,
    /// Overrides `bus.subscriber_queue_capacity`
    pub queue_capacity: Option<usize>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            mode: DeliveryMode::PointToPoint,
            concurrency: 1,
            queue_capacity: None,
        }
    }
}

impl SubscribeOptions {
    pub fn broadcast() -> Self {
        Self {
            mode: DeliveryMode::Broadcast,
            ..Default::default()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }
}

type ReplySender = oneshot::Sender<Result<Value, CoreError>>;

struct Delivery {
    command: Command,
    reply: Option<ReplySender>,
}

struct Subscriber {
    id: SubscriptionId,
    mode: DeliveryMode,
    handler_name: String,
    queue: mpsc::Sender<Delivery>,
}

#[derive(Default)]
struct Route {
    subscribers: Vec<Arc<Subscriber>>,
    cursor: AtomicUsize,
}

#[derive(Debug, Default)]
struct DispatcherCounters {
    sent: AtomicU64,
    replied_ok: AtomicU64,
    replied_failed: AtomicU64,
    timed_out: AtomicU64,
    no_handler: AtomicU64,
    backpressure: AtomicU64,
    published: AtomicU64,
    publish_dropped: AtomicU64,
    late_replies_dropped: AtomicU64,
}

/// Snapshot of dispatcher activity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherStats {
    pub sent: u64,
    pub replied_ok: u64,
    pub replied_failed: u64,
    pub timed_out: u64,
    pub no_handler: u64,
    pub backpressure: u64,
    pub published: u64,
    pub publish_dropped: u64,
    pub late_replies_dropped: u64,
    pub addresses: usize,
    pub pending_replies: usize,
}

/// Removes an outstanding correlation id once its reply resolves
struct PendingGuard<'a> {
    pending: &'a DashSet<CorrelationId>,
    correlation_id: CorrelationId,
}

impl<'a> PendingGuard<'a> {
    fn register(pending: &'a DashSet<CorrelationId>, correlation_id: &CorrelationId) -> Option<Self> {
        pending.insert(correlation_id.clone()).then(|| Self {
            pending,
            correlation_id: correlation_id.clone(),
        })
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.correlation_id);
    }
}

/// Internal command bus
pub struct Dispatcher {
    routes: RwLock<HashMap<String, Route>>,
    pending: DashSet<CorrelationId>,
    next_subscription_id: AtomicU64,
    config: BusConfig,
    counters: Arc<DispatcherCounters>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("addresses", &self.addresses())
            .field("pending_replies", &self.pending.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl Dispatcher {
    pub fn new(config: BusConfig) -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            pending: DashSet::new(),
            next_subscription_id: AtomicU64::new(0),
            config,
            counters: Arc::new(DispatcherCounters::default()),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Register `handler` for `address`
    ///
    /// Must be called from within a tokio runtime; the subscription's worker
    /// task is spawned immediately.
    pub fn subscribe(
        &self,
        address: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
        mode: DeliveryMode,
    ) -> SubscriptionId {
        self.subscribe_with(
            address,
            handler,
            SubscribeOptions {
                mode,
                ..Default::default()
            },
        )
    }

    pub fn subscribe_with(
        &self,
        address: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
        options: SubscribeOptions,
    ) -> SubscriptionId {
        let address = address.into();
        let capacity = options
            .queue_capacity
            .unwrap_or(self.config.subscriber_queue_capacity)
            .max(1);
        let (queue, inbox) = mpsc::channel(capacity);
        let id = SubscriptionId(self.next_subscription_id.fetch_add(1, Ordering::Relaxed) + 1);
        let handler_name = handler.handler_name().to_string();

        tokio::spawn(run_subscriber(
            address.clone(),
            id,
            handler,
            inbox,
            options.concurrency.max(1),
            Arc::clone(&self.counters),
        ));

        self.routes
            .write()
            .entry(address.clone())
            .or_default()
            .subscribers
            .push(Arc::new(Subscriber {
                id,
                mode: options.mode,
                handler_name: handler_name.clone(),
                queue,
            }));

        info!(
            address = %address,
            subscription_id = %id,
            handler = %handler_name,
            mode = %options.mode,
            queue_capacity = capacity,
            "Registered bus subscriber"
        );
        id
    }

    /// Remove a subscription; its worker finishes the commands already queued
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut routes = self.routes.write();
        let mut removed = None;

        for (address, route) in routes.iter_mut() {
            if let Some(position) = route.subscribers.iter().position(|s| s.id == id) {
                let subscriber = route.subscribers.remove(position);
                removed = Some((address.clone(), subscriber));
                break;
            }
        }

        match removed {
            Some((address, subscriber)) => {
                if routes.get(&address).is_some_and(|r| r.subscribers.is_empty()) {
                    routes.remove(&address);
                }
                info!(
                    address = %address,
                    subscription_id = %id,
                    handler = %subscriber.handler_name,
                    "Unregistered bus subscriber"
                );
                true
            }
            None => {
                warn!(subscription_id = %id, "Attempted to unregister unknown subscription");
                false
            }
        }
    }

    /// Remove every subscription for `address`, returning how many there were
    pub fn unsubscribe_address(&self, address: &str) -> usize {
        let removed = self
            .routes
            .write()
            .remove(address)
            .map(|route| route.subscribers.len())
            .unwrap_or(0);
        if removed > 0 {
            info!(address = %address, removed, "Unregistered all subscribers for address");
        }
        removed
    }

    /// Drop every subscription; workers drain and exit
    pub fn shutdown(&self) {
        let removed: usize = self
            .routes
            .write()
            .drain()
            .map(|(_, route)| route.subscribers.len())
            .sum();
        info!(removed, "Dispatcher shut down");
    }

    /// Point-to-point delivery; every outcome is a `Reply`
    pub async fn send(&self, mut command: Command) -> Reply {
        let correlation_id = command.correlation_id.clone();
        let address = command.address.clone();
        self.counters.sent.fetch_add(1, Ordering::Relaxed);

        let Some(_pending) = PendingGuard::register(&self.pending, &correlation_id) else {
            log_bus!(warn, "Rejected duplicate correlation id", correlation_id: correlation_id, address: address);
            self.counters.replied_failed.fetch_add(1, Ordering::Relaxed);
            return Reply::failed(
                correlation_id.clone(),
                &CoreError::ValidationFailed(format!(
                    "correlation id {correlation_id} already has an outstanding reply"
                )),
            );
        };

        if command.is_expired() {
            self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
            return Reply::timeout(
                correlation_id,
                format!("deadline passed before dispatch to {address}"),
            );
        }

        let Some(subscriber) = self.select_point_to_point(&address) else {
            self.counters.no_handler.fetch_add(1, Ordering::Relaxed);
            log_bus!(debug, "No handler for address", correlation_id: correlation_id, address: address);
            return Reply::failed(correlation_id, &CoreError::NoHandler { address });
        };

        command.delivery = DeliveryMode::PointToPoint;
        let deadline = command.deadline;
        let (reply_tx, reply_rx) = oneshot::channel();

        match subscriber.queue.try_send(Delivery {
            command,
            reply: Some(reply_tx),
        }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.counters.backpressure.fetch_add(1, Ordering::Relaxed);
                log_bus!(
                    warn,
                    "Subscriber queue full, rejecting command",
                    correlation_id: correlation_id,
                    address: address,
                    subscription_id: subscriber.id
                );
                return Reply::failed(
                    correlation_id,
                    &CoreError::Backpressure(format!("inbound queue full for {address}")),
                );
            }
            Err(TrySendError::Closed(_)) => {
                self.counters.no_handler.fetch_add(1, Ordering::Relaxed);
                return Reply::failed(correlation_id, &CoreError::NoHandler { address });
            }
        }

        log_bus!(
            debug,
            "Command queued",
            correlation_id: correlation_id,
            address: address,
            subscription_id: subscriber.id
        );

        match tokio::time::timeout_at(deadline, reply_rx).await {
            Ok(Ok(result)) => {
                let counter = if result.is_ok() {
                    &self.counters.replied_ok
                } else {
                    &self.counters.replied_failed
                };
                counter.fetch_add(1, Ordering::Relaxed);
                Reply::from_result(correlation_id, result)
            }
            Ok(Err(_)) if Instant::now() >= deadline => {
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                Reply::timeout(correlation_id, format!("{address} expired in queue"))
            }
            Ok(Err(_)) => {
                self.counters.replied_failed.fetch_add(1, Ordering::Relaxed);
                Reply::failed(
                    correlation_id,
                    &CoreError::Internal(format!("subscriber for {address} dropped the command")),
                )
            }
            Err(_) => {
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                log_bus!(debug, "Command timed out awaiting reply", correlation_id: correlation_id, address: address);
                Reply::timeout(correlation_id, format!("no reply from {address} before deadline"))
            }
        }
    }

    /// Send `payload` to `address` with the configured default timeout
    pub async fn request(&self, address: impl Into<String>, payload: Value) -> Reply {
        self.send(Command::new(address, payload, self.config.default_send_timeout()))
            .await
    }

    /// Broadcast delivery to every current subscriber; no reply
    pub fn publish(&self, mut command: Command) -> PublishReport {
        command.delivery = DeliveryMode::Broadcast;
        let subscribers: Vec<Arc<Subscriber>> = self
            .routes
            .read()
            .get(&command.address)
            .map(|route| route.subscribers.clone())
            .unwrap_or_default();

        let mut report = PublishReport::default();
        for subscriber in subscribers {
            let delivery = Delivery {
                command: command.clone(),
                reply: None,
            };
            match subscriber.queue.try_send(delivery) {
                Ok(()) => report.delivered += 1,
                Err(_) => {
                    report.dropped += 1;
                    log_bus!(
                        warn,
                        "Dropped broadcast copy for full or closed subscriber",
                        correlation_id: command.correlation_id,
                        address: command.address,
                        subscription_id: subscriber.id
                    );
                }
            }
        }

        self.counters.published.fetch_add(1, Ordering::Relaxed);
        self.counters
            .publish_dropped
            .fetch_add(report.dropped as u64, Ordering::Relaxed);
        log_bus!(
            debug,
            "Published command",
            correlation_id: command.correlation_id,
            address: command.address,
            delivered: report.delivered,
            dropped: report.dropped
        );
        report
    }

    fn select_point_to_point(&self, address: &str) -> Option<Arc<Subscriber>> {
        let routes = self.routes.read();
        let route = routes.get(address)?;
        let candidates: Vec<&Arc<Subscriber>> = route
            .subscribers
            .iter()
            .filter(|s| s.mode == DeliveryMode::PointToPoint)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let index = route.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(Arc::clone(candidates[index]))
    }

    /// Whether `send` to `address` would find a subscriber
    pub fn has_handler(&self, address: &str) -> bool {
        self.routes.read().get(address).is_some_and(|route| {
            route
                .subscribers
                .iter()
                .any(|s| s.mode == DeliveryMode::PointToPoint)
        })
    }

    pub fn subscriber_count(&self, address: &str) -> usize {
        self.routes
            .read()
            .get(address)
            .map(|route| route.subscribers.len())
            .unwrap_or(0)
    }

    /// Registered addresses, sorted
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.routes.read().keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub fn pending_replies(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> DispatcherStats {
        let c = &self.counters;
        DispatcherStats {
            sent: c.sent.load(Ordering::Relaxed),
            replied_ok: c.replied_ok.load(Ordering::Relaxed),
            replied_failed: c.replied_failed.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            no_handler: c.no_handler.load(Ordering::Relaxed),
            backpressure: c.backpressure.load(Ordering::Relaxed),
            published: c.published.load(Ordering::Relaxed),
            publish_dropped: c.publish_dropped.load(Ordering::Relaxed),
            late_replies_dropped: c.late_replies_dropped.load(Ordering::Relaxed),
            addresses: self.routes.read().len(),
            pending_replies: self.pending.len(),
        }
    }
}

async fn run_subscriber(
    address: String,
    id: SubscriptionId,
    handler: Arc<dyn CommandHandler>,
    mut inbox: mpsc::Receiver<Delivery>,
    concurrency: usize,
    counters: Arc<DispatcherCounters>,
) {
    let permits = Arc::new(Semaphore::new(concurrency));

    while let Some(delivery) = inbox.recv().await {
        if delivery.command.is_expired() {
            log_bus!(
                debug,
                "Skipping command that expired in queue",
                correlation_id: delivery.command.correlation_id,
                address: address
            );
            continue;
        }

        if concurrency == 1 {
            deliver(handler.as_ref(), delivery, &counters).await;
            continue;
        }

        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let handler = Arc::clone(&handler);
        let counters = Arc::clone(&counters);
        tokio::spawn(async move {
            deliver(handler.as_ref(), delivery, &counters).await;
            drop(permit);
        });
    }

    debug!(address = %address, subscription_id = %id, "Subscriber worker stopped");
}

async fn deliver(handler: &dyn CommandHandler, delivery: Delivery, counters: &DispatcherCounters) {
    let Delivery { command, reply } = delivery;
    let correlation_id = command.correlation_id.clone();
    let address = command.address.clone();

    let result = match AssertUnwindSafe(handler.handle(command)).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            log_bus!(
                error,
                "Handler panicked",
                correlation_id: correlation_id,
                address: address,
                handler: handler.handler_name()
            );
            Err(CoreError::Internal(format!(
                "handler {} panicked",
                handler.handler_name()
            )))
        }
    };

    match reply {
        Some(reply) => {
            if reply.send(result).is_err() {
                counters.late_replies_dropped.fetch_add(1, Ordering::Relaxed);
                log_bus!(debug, "Dropped late reply", correlation_id: correlation_id, address: address);
            }
        }
        None => {
            if let Err(err) = result {
                log_bus!(
                    warn,
                    "Broadcast handler failed",
                    correlation_id: correlation_id,
                    address: address,
                    error: err
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{handler_fn, ReplyStatus};
    use crate::error::ErrorKind;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn echo() -> Arc<dyn CommandHandler> {
        handler_fn("echo", |command: Command| async move { Ok(command.payload) })
    }

    fn named(name: &'static str) -> Arc<dyn CommandHandler> {
        handler_fn(name, move |_command: Command| async move { Ok(json!(name)) })
    }

    fn command(address: &str) -> Command {
        Command::new(address, json!({"id": 1}), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_send_returns_handler_reply() {
        let dispatcher = Dispatcher::default();
        dispatcher.subscribe("todo.get", echo(), DeliveryMode::PointToPoint);

        let command = command("todo.get");
        let correlation_id = command.correlation_id.clone();
        let reply = dispatcher.send(command).await;

        assert!(reply.is_ok());
        assert_eq!(reply.correlation_id, correlation_id);
        assert_eq!(reply.payload, Some(json!({"id": 1})));
        assert_eq!(dispatcher.pending_replies(), 0);
    }

    #[tokio::test]
    async fn test_no_handler_resolves_without_waiting() {
        let dispatcher = Dispatcher::default();

        let reply = dispatcher
            .send(command("todo.missing"))
            .now_or_never()
            .expect("no-handler reply must be immediate");
        assert_eq!(reply.error_kind(), Some(ErrorKind::NoHandler));
        assert_eq!(dispatcher.stats().no_handler, 1);
    }

    #[tokio::test]
    async fn test_round_robin_across_subscribers() {
        let dispatcher = Dispatcher::default();
        dispatcher.subscribe("todo.get", named("a"), DeliveryMode::PointToPoint);
        dispatcher.subscribe("todo.get", named("b"), DeliveryMode::PointToPoint);

        let mut served = Vec::new();
        for _ in 0..4 {
            served.push(dispatcher.send(command("todo.get")).await.payload.unwrap());
        }
        assert_eq!(served, vec![json!("a"), json!("b"), json!("a"), json!("b")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_yields_timeout_and_late_reply_is_dropped() {
        let dispatcher = Dispatcher::default();
        dispatcher.subscribe(
            "todo.slow",
            handler_fn("slow", |_command: Command| async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(json!("late"))
            }),
            DeliveryMode::PointToPoint,
        );

        let command = Command::new("todo.slow", json!(null), Duration::from_millis(50));
        let reply = dispatcher.send(command).await;
        assert_eq!(reply.status, ReplyStatus::Timeout);
        assert_eq!(dispatcher.pending_replies(), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let stats = dispatcher.stats();
        assert_eq!(stats.late_replies_dropped, 1);
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.replied_ok, 0);
    }

    #[tokio::test]
    async fn test_expired_command_is_not_dispatched() {
        let dispatcher = Dispatcher::default();
        dispatcher.subscribe("todo.get", echo(), DeliveryMode::PointToPoint);

        let command = command("todo.get").with_deadline(Instant::now());
        let reply = dispatcher.send(command).await;
        assert_eq!(reply.status, ReplyStatus::Timeout);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_with_backpressure() {
        let dispatcher = Arc::new(Dispatcher::default());
        let started = Arc::new(Notify::new());
        let gate = Arc::new(Semaphore::new(0));

        let handler = {
            let started = Arc::clone(&started);
            let gate = Arc::clone(&gate);
            handler_fn("gated", move |command: Command| {
                let started = Arc::clone(&started);
                let gate = Arc::clone(&gate);
                async move {
                    started.notify_one();
                    let _permit = gate.acquire().await;
                    Ok(command.payload)
                }
            })
        };
        dispatcher.subscribe_with(
            "todo.write",
            handler,
            SubscribeOptions::default().with_queue_capacity(1),
        );

        let first = tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.send(command("todo.write")).await }
        });
        started.notified().await;

        let second = tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move { dispatcher.send(command("todo.write")).await }
        });
        while dispatcher.pending_replies() < 2 {
            tokio::task::yield_now().await;
        }

        let rejected = dispatcher
            .send(command("todo.write"))
            .now_or_never()
            .expect("backpressure must be immediate");
        assert_eq!(rejected.error_kind(), Some(ErrorKind::Backpressure));

        gate.add_permits(2);
        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());
        assert_eq!(dispatcher.stats().backpressure, 1);
    }

    #[tokio::test]
    async fn test_duplicate_outstanding_correlation_id_is_rejected() {
        let dispatcher = Arc::new(Dispatcher::default());
        let release = Arc::new(Notify::new());
        let handler = {
            let release = Arc::clone(&release);
            handler_fn("held", move |_command: Command| {
                let release = Arc::clone(&release);
                async move {
                    release.notified().await;
                    Ok(json!("done"))
                }
            })
        };
        dispatcher.subscribe("todo.get", handler, DeliveryMode::PointToPoint);

        let outstanding = tokio::spawn({
            let dispatcher = Arc::clone(&dispatcher);
            async move {
                dispatcher
                    .send(command("todo.get").with_correlation_id("dup-1"))
                    .await
            }
        });
        while dispatcher.pending_replies() < 1 {
            tokio::task::yield_now().await;
        }

        let duplicate = dispatcher
            .send(command("todo.get").with_correlation_id("dup-1"))
            .now_or_never()
            .expect("duplicate rejection must be immediate");
        assert_eq!(duplicate.error_kind(), Some(ErrorKind::ValidationFailed));

        release.notify_one();
        assert!(outstanding.await.unwrap().is_ok());
        assert_eq!(dispatcher.pending_replies(), 0);
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let dispatcher = Dispatcher::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let counting = || {
            let seen = Arc::clone(&seen);
            handler_fn("counting", move |_command: Command| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            })
        };
        dispatcher.subscribe("todo.changed", counting(), DeliveryMode::Broadcast);
        dispatcher.subscribe("todo.changed", counting(), DeliveryMode::Broadcast);
        dispatcher.subscribe("todo.changed", counting(), DeliveryMode::PointToPoint);

        let report = dispatcher.publish(command("todo.changed"));
        assert_eq!(report, PublishReport { delivered: 3, dropped: 0 });

        while seen.load(Ordering::SeqCst) < 3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(dispatcher.publish(command("todo.nobody")), PublishReport::default());
    }

    #[tokio::test]
    async fn test_publish_to_full_subscriber_reports_drop() {
        let dispatcher = Dispatcher::default();
        let started = Arc::new(Notify::new());
        let gate = Arc::new(Semaphore::new(0));
        let handler = {
            let started = Arc::clone(&started);
            let gate = Arc::clone(&gate);
            handler_fn("gated", move |_command: Command| {
                let started = Arc::clone(&started);
                let gate = Arc::clone(&gate);
                async move {
                    started.notify_one();
                    let _permit = gate.acquire().await;
                    Ok(Value::Null)
                }
            })
        };
        dispatcher.subscribe_with(
            "todo.changed",
            handler,
            SubscribeOptions::broadcast().with_queue_capacity(1),
        );

        // first copy is being handled, second waits in the queue
        assert_eq!(dispatcher.publish(command("todo.changed")).delivered, 1);
        started.notified().await;
        assert_eq!(dispatcher.publish(command("todo.changed")).delivered, 1);

        let report = dispatcher.publish(command("todo.changed"));
        assert_eq!(report, PublishReport { delivered: 0, dropped: 1 });
        let err = report.into_result("todo.changed").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Backpressure);
        assert_eq!(dispatcher.stats().publish_dropped, 1);

        gate.add_permits(2);
    }

    #[tokio::test]
    async fn test_broadcast_only_address_has_no_point_to_point_handler() {
        let dispatcher = Dispatcher::default();
        dispatcher.subscribe("todo.changed", echo(), DeliveryMode::Broadcast);

        assert!(!dispatcher.has_handler("todo.changed"));
        let reply = dispatcher.send(command("todo.changed")).await;
        assert_eq!(reply.error_kind(), Some(ErrorKind::NoHandler));
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_route() {
        let dispatcher = Dispatcher::default();
        let id = dispatcher.subscribe("todo.get", echo(), DeliveryMode::PointToPoint);
        assert_eq!(dispatcher.addresses(), vec!["todo.get".to_string()]);

        assert!(dispatcher.unsubscribe(id));
        assert!(!dispatcher.unsubscribe(id));
        assert!(dispatcher.addresses().is_empty());

        let reply = dispatcher.send(command("todo.get")).await;
        assert_eq!(reply.error_kind(), Some(ErrorKind::NoHandler));
    }

    #[tokio::test]
    async fn test_panicking_handler_fails_reply_and_keeps_worker() {
        let dispatcher = Dispatcher::default();
        dispatcher.subscribe(
            "todo.get",
            handler_fn("flaky", |command: Command| async move {
                if command.payload["boom"] == json!(true) {
                    panic!("handler exploded");
                }
                Ok(command.payload)
            }),
            DeliveryMode::PointToPoint,
        );

        let boom = Command::new("todo.get", json!({"boom": true}), Duration::from_secs(5));
        let reply = dispatcher.send(boom).await;
        assert_eq!(reply.error_kind(), Some(ErrorKind::Internal));

        assert!(dispatcher.send(command("todo.get")).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_subscriber_overlaps_commands() {
        let dispatcher = Arc::new(Dispatcher::default());
        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        let handler = {
            let barrier = Arc::clone(&barrier);
            handler_fn("paired", move |_command: Command| {
                let barrier = Arc::clone(&barrier);
                async move {
                    barrier.wait().await;
                    Ok(json!("met"))
                }
            })
        };
        dispatcher.subscribe_with(
            "todo.pair",
            handler,
            SubscribeOptions::default().with_concurrency(2),
        );

        let (a, b) = tokio::join!(
            dispatcher.send(command("todo.pair")),
            dispatcher.send(command("todo.pair"))
        );
        assert!(a.is_ok());
        assert!(b.is_ok());
    }
}
