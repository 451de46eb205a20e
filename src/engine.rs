// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # The Messaging Reliability Engine
//!
//! [`AmqpEngine`] is the imperative implementation of the
//! [`MessagingService`](crate::service::MessagingService) contract. It owns
//! two broker connections (publisher-side and consumer-side), the topology
//! registry, the outbox drain task, and the reconnection state machine.
//!
//! The engine guarantees at-least-once delivery for accepted messages:
//! a publish that cannot reach the broker is parked in the outbox and
//! replayed by the resend loop, and a lost connection triggers a reconnect
//! cycle that re-declares every registered exchange, queue, binding, and
//! subscription without any caller involvement.
//!
//! Failures of the individual registration operations follow the service
//! contract: they are logged and reported to the error sink, and the
//! operation becomes a no-op rather than an error the caller must handle.

use crate::{
    channel::{self, ConnectionRole},
    config::{AmqpConfig, EngineOptions, RetryPolicy},
    consumer,
    errors::AmqpError,
    exchange::ExchangeKind,
    handler::MessageHandler,
    outbox::{Outbox, OutboxMessage},
    publisher,
    service::MessagingService,
    sink::ErrorSink,
    topology::{
        self, ConsumerRegistration, PublisherRegistration, QueueRegistration, TopologyRegistry,
    },
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::BasicConsumeOptions, protocol::constants::REPLY_SUCCESS, types::FieldTable, Channel,
    Connection,
};
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex, Weak,
    },
};
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, warn};

/// Reliability engine over two RabbitMQ connections.
///
/// Cheap to clone; clones share the same connections and registries. The
/// engine connects lazily on the first `init_publisher`/`init_consumer`
/// call and keeps retrying forever, so construction itself cannot fail.
#[derive(Clone)]
pub struct AmqpEngine {
    inner: Arc<EngineInner>,
}

impl AmqpEngine {
    pub fn new(
        config: AmqpConfig,
        options: EngineOptions,
        outbox: Arc<dyn Outbox>,
        sink: Arc<dyn ErrorSink>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak| EngineInner {
            weak: weak.clone(),
            config,
            options,
            outbox,
            sink,
            publisher_connection: Mutex::new(None),
            consumer_connection: Mutex::new(None),
            topology: RwLock::new(TopologyRegistry::default()),
            connected: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            resend_task: StdMutex::new(None),
        });

        AmqpEngine { inner }
    }
}

#[async_trait]
impl MessagingService for AmqpEngine {
    async fn init_publisher(&self, exchange_name: &str, exchange_kind: ExchangeKind) {
        if let Err(err) = self.inner.setup_publisher(exchange_name, exchange_kind).await {
            error!(
                error = err.to_string(),
                exchange = exchange_name,
                "failure to initialize publisher"
            );
            self.inner
                .sink
                .capture(&err, Some(exchange_tags(exchange_name)));
        }
    }

    async fn init_consumer(
        &self,
        exchange_name: &str,
        exchange_kind: ExchangeKind,
        queue_name: &str,
        binding_key: &str,
        prefetch: u16,
    ) {
        if let Err(err) = self
            .inner
            .setup_queue(exchange_name, exchange_kind, queue_name, binding_key, prefetch)
            .await
        {
            error!(
                error = err.to_string(),
                exchange = exchange_name,
                queue = queue_name,
                "failure to initialize consumer"
            );
            self.inner
                .sink
                .capture(&err, Some(exchange_tags(exchange_name)));
        }
    }

    async fn publish(&self, exchange_name: &str, routing_key: &str, message: Value) -> bool {
        self.inner
            .do_publish(exchange_name, routing_key, &message)
            .await
    }

    async fn consume(&self, queue_name: &str, handler: Arc<dyn MessageHandler>) -> Option<String> {
        self.inner.do_consume(queue_name, handler).await
    }

    async fn stop(&self) {
        self.inner.stop().await
    }
}

struct EngineInner {
    weak: Weak<EngineInner>,
    config: AmqpConfig,
    options: EngineOptions,
    outbox: Arc<dyn Outbox>,
    sink: Arc<dyn ErrorSink>,
    publisher_connection: Mutex<Option<Connection>>,
    consumer_connection: Mutex<Option<Connection>>,
    topology: RwLock<TopologyRegistry>,
    /// The engine considered itself connected at least once; connection
    /// closes observed before that are startup noise, not outages.
    connected: AtomicBool,
    /// The sole synchronization primitive over the reconnection critical
    /// section: set via compare-exchange so only one cycle runs.
    reconnecting: AtomicBool,
    stopped: AtomicBool,
    resend_task: StdMutex<Option<JoinHandle<()>>>,
}

impl EngineInner {
    fn slot(&self, role: ConnectionRole) -> &Mutex<Option<Connection>> {
        match role {
            ConnectionRole::Publisher => &self.publisher_connection,
            ConnectionRole::Consumer => &self.consumer_connection,
        }
    }

    /// Connects the given role, retrying forever, and wires the
    /// connection-close observer. A publisher-role connect (re)arms the
    /// resend loop. Returns false only if the engine was stopped mid-retry.
    async fn connect(&self, role: ConnectionRole) -> bool {
        let conn = match channel::connect_with_retry(
            &self.config,
            role.as_str(),
            self.options.reconnect_delay,
            &self.stopped,
        )
        .await
        {
            Some(conn) => conn,
            None => return false,
        };

        self.install_close_observer(&conn, role);
        *self.slot(role).lock().await = Some(conn);
        self.connected.store(true, Ordering::SeqCst);

        if role == ConnectionRole::Publisher {
            self.arm_resend();
        }

        true
    }

    /// Connects the role if there is no open connection for it yet.
    async fn ensure_connection(&self, role: ConnectionRole) -> bool {
        let missing = {
            let guard = self.slot(role).lock().await;
            guard.as_ref().map(|c| !c.status().connected()).unwrap_or(true)
        };

        if missing {
            return self.connect(role).await;
        }

        true
    }

    /// Forwards fatal connection closes to the reconnection coordinator.
    ///
    /// Self-initiated closes during reconnection or shutdown are filtered
    /// by the `connected`/`stopped` flags and by the coordinator's own
    /// entry guard.
    fn install_close_observer(&self, conn: &Connection, role: ConnectionRole) {
        let weak = self.weak.clone();
        let handle = tokio::runtime::Handle::current();

        conn.on_error(move |err| {
            error!(
                error = err.to_string(),
                role = role.as_str(),
                "connection error on amqp"
            );

            if !channel::is_fatal(&err) {
                return;
            }

            let Some(inner) = weak.upgrade() else {
                return;
            };

            handle.spawn(async move {
                if inner.connected.load(Ordering::SeqCst) && !inner.stopped.load(Ordering::SeqCst) {
                    inner.sink.capture(&AmqpError::ConnectionError, None);
                    inner.reconnect().await;
                }
            });
        });
    }

    /// Opens a confirm channel, declares the exchange, and records the
    /// publisher registration. Re-registration replaces the previous entry,
    /// which is exactly what reconnect replay relies on.
    async fn setup_publisher(
        &self,
        exchange: &str,
        kind: ExchangeKind,
    ) -> Result<(), AmqpError> {
        if !self.ensure_connection(ConnectionRole::Publisher).await {
            return Err(AmqpError::ConnectionError);
        }

        let chan = {
            let guard = self.publisher_connection.lock().await;
            let conn = guard.as_ref().ok_or(AmqpError::ConnectionError)?;
            channel::open_confirm_channel(conn).await?
        };
        let chan = Arc::new(chan);

        topology::declare_exchange(&chan, exchange, &kind).await?;

        self.topology.write().await.publishers.insert(
            exchange.to_owned(),
            PublisherRegistration {
                kind,
                channel: chan,
            },
        );

        Ok(())
    }

    /// Opens a consumer channel, declares the exchange and queue, binds
    /// them, applies fair dispatch, and records the queue registration.
    async fn setup_queue(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        queue: &str,
        binding_key: &str,
        prefetch: u16,
    ) -> Result<(), AmqpError> {
        if !self.ensure_connection(ConnectionRole::Consumer).await {
            return Err(AmqpError::ConnectionError);
        }

        let chan = {
            let guard = self.consumer_connection.lock().await;
            let conn = guard.as_ref().ok_or(AmqpError::ConnectionError)?;
            channel::open_channel(conn).await?
        };
        let chan = Arc::new(chan);

        topology::declare_exchange(&chan, exchange, &kind).await?;
        topology::declare_queue(&chan, queue).await?;
        topology::bind_queue(&chan, queue, exchange, binding_key).await?;
        topology::apply_prefetch(&chan, prefetch).await?;

        self.topology.write().await.queues.insert(
            queue.to_owned(),
            QueueRegistration {
                exchange: exchange.to_owned(),
                kind,
                binding_key: binding_key.to_owned(),
                prefetch,
                channel: chan,
            },
        );

        Ok(())
    }

    /// Publishes with confirmation, falling back to the outbox on any
    /// failure. Always reports acceptance: `true` means the message was
    /// either delivered or durably queued for retry, and callers cannot
    /// distinguish the two.
    async fn do_publish(&self, exchange: &str, routing_key: &str, message: &Value) -> bool {
        let chan = {
            self.topology
                .read()
                .await
                .publishers
                .get(exchange)
                .map(|reg| reg.channel.clone())
        };

        let Some(chan) = chan else {
            warn!(
                exchange,
                routing_key, "publish requested for unregistered exchange, saving message"
            );
            self.save_message(exchange, routing_key, message.clone()).await;
            return true;
        };

        match publisher::publish_with_confirm(&chan, exchange, routing_key, message).await {
            Ok(()) => {
                debug!(exchange, routing_key, "message acked");
                true
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange, routing_key, "failure to publish, saving message for resend"
                );
                self.sink.capture(&err, Some(exchange_tags(exchange)));
                self.save_message(exchange, routing_key, message.clone()).await;
                self.escalate_if_disconnected(ConnectionRole::Publisher).await;
                true
            }
        }
    }

    /// Saves a message into the outbox. When the store itself fails, the
    /// save is retried on a timer until it succeeds so the message is not
    /// silently lost.
    async fn save_message(&self, exchange: &str, routing_key: &str, content: Value) {
        let message = OutboxMessage::new(exchange, routing_key, content);

        if let Err(err) = self.outbox.enqueue(message.clone()).await {
            error!(
                error = err.to_string(),
                exchange = message.exchange,
                "failure to save message into the outbox, scheduling retry"
            );
            self.sink.capture(&err, Some(exchange_tags(&message.exchange)));

            let weak = self.weak.clone();
            let delay = self.options.save_retry_interval;

            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(delay).await;

                    let Some(inner) = weak.upgrade() else {
                        return;
                    };

                    match inner.outbox.enqueue(message.clone()).await {
                        Ok(()) => return,
                        Err(err) => {
                            error!(
                                error = err.to_string(),
                                "failure to save message into the outbox, will retry"
                            );
                        }
                    }
                }
            });
        }
    }

    /// Registers the handler and subscribes it to the queue's delivery
    /// stream. Returns the broker-assigned consumer tag, or `None` if the
    /// subscription could not be established.
    async fn do_consume(&self, queue: &str, handler: Arc<dyn MessageHandler>) -> Option<String> {
        {
            let mut topo = self.topology.write().await;

            if !topo.queues.contains_key(queue) {
                error!(queue, "consume requested for unregistered queue");
                self.sink
                    .capture(&AmqpError::ConsumerError(queue.to_owned()), None);
                return None;
            }

            topo.consumers
                .insert(queue.to_owned(), ConsumerRegistration { handler, tag: None });
        }

        match self.subscribe(queue).await {
            Ok(tag) => Some(tag),
            Err(err) => {
                error!(
                    error = err.to_string(),
                    queue, "failure to subscribe consumer"
                );
                self.sink.capture(&err, None);
                self.escalate_if_disconnected(ConnectionRole::Consumer).await;
                None
            }
        }
    }

    /// Starts a broker subscription for an already-registered consumer and
    /// spawns its delivery loop.
    async fn subscribe(&self, queue: &str) -> Result<String, AmqpError> {
        let (chan, handler) = {
            let topo = self.topology.read().await;
            let queue_reg = topo
                .queues
                .get(queue)
                .ok_or_else(|| AmqpError::SubscribeError(queue.to_owned()))?;
            let consumer_reg = topo
                .consumers
                .get(queue)
                .ok_or_else(|| AmqpError::SubscribeError(queue.to_owned()))?;
            (queue_reg.channel.clone(), consumer_reg.handler.clone())
        };

        let deliveries = chan
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, "error to create the consumer");
                AmqpError::SubscribeError(queue.to_owned())
            })?;

        let tag = deliveries.tag().to_string();

        if let Some(reg) = self.topology.write().await.consumers.get_mut(queue) {
            if let Some(previous) = reg.tag.replace(tag.clone()) {
                debug!(queue, previous, "replacing consumer subscription");
            }
        }

        self.spawn_delivery_loop(queue, deliveries, chan, handler);

        Ok(tag)
    }

    /// Drains a subscription's delivery stream until it ends.
    ///
    /// The stream ends when the channel dies or the broker cancels the
    /// consumer; recovery is left to the next reconnect cycle, which
    /// re-subscribes from the registry.
    fn spawn_delivery_loop(
        &self,
        queue: &str,
        mut deliveries: lapin::Consumer,
        chan: Arc<Channel>,
        handler: Arc<dyn MessageHandler>,
    ) {
        let weak = self.weak.clone();
        let sink = self.sink.clone();
        let queue = queue.to_owned();
        // the imperative engine nacks rejected messages right away; only
        // the declarative variant defers
        let policy = RetryPolicy::immediate();

        tokio::spawn(async move {
            while let Some(result) = deliveries.next().await {
                match result {
                    Ok(delivery) => {
                        if let Err(err) = consumer::process_delivery(
                            &delivery,
                            handler.as_ref(),
                            sink.as_ref(),
                            &policy,
                        )
                        .await
                        {
                            error!(error = err.to_string(), queue, "error to consume message");
                        }
                    }
                    Err(err) => {
                        error!(error = err.to_string(), queue, "consumer stream error");

                        if let Some(inner) = weak.upgrade() {
                            if !chan.status().connected() {
                                inner.escalate_if_disconnected(ConnectionRole::Consumer).await;
                            }
                        }
                    }
                }
            }

            info!(queue, "consumer subscription ended");
        });
    }

    /// Hands off to the reconnection coordinator if the role's connection
    /// turns out to be closed.
    async fn escalate_if_disconnected(&self, role: ConnectionRole) {
        let closed = {
            let guard = self.slot(role).lock().await;
            guard.as_ref().map(|c| !c.status().connected()).unwrap_or(true)
        };

        if closed
            && !self.reconnecting.load(Ordering::SeqCst)
            && !self.stopped.load(Ordering::SeqCst)
        {
            if let Some(inner) = self.weak.upgrade() {
                tokio::spawn(async move { inner.reconnect().await });
            }
        }
    }

    /// The reconnection coordinator: `Stable -> Reconnecting -> Stable`.
    ///
    /// Entry is guarded by a compare-exchange on the reconnecting flag, so
    /// near-simultaneous triggers collapse into a single cycle. Both
    /// connections are closed best-effort, reconnected with infinite retry,
    /// and the whole topology registry is replayed. Replay errors are
    /// logged and captured but do not abort the sequence; a later cycle can
    /// repair gaps.
    async fn reconnect(&self) {
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("reconnect already in flight, ignoring trigger");
            return;
        }

        warn!("broker connection lost, starting reconnect cycle");
        self.connected.store(false, Ordering::SeqCst);

        self.close_connection(ConnectionRole::Publisher, "reconnecting").await;
        self.close_connection(ConnectionRole::Consumer, "reconnecting").await;

        if !self.connect(ConnectionRole::Publisher).await
            || !self.connect(ConnectionRole::Consumer).await
        {
            // stopped mid-reconnect
            self.reconnecting.store(false, Ordering::SeqCst);
            return;
        }

        info!("reconnected successfully, replaying topology");
        self.replay_topology().await;

        self.reconnecting.store(false, Ordering::SeqCst);
        info!("reconnect cycle finished");
    }

    /// Re-declares every exchange, re-declares and rebinds every queue, and
    /// re-subscribes every consumer recorded in the registry.
    async fn replay_topology(&self) {
        let (publishers, queues, consumers) = {
            let topo = self.topology.read().await;
            (
                topo.publishers
                    .iter()
                    .map(|(name, reg)| (name.clone(), reg.kind.clone()))
                    .collect::<Vec<_>>(),
                topo.queues
                    .iter()
                    .map(|(name, reg)| (name.clone(), reg.clone()))
                    .collect::<Vec<_>>(),
                topo.consumers.keys().cloned().collect::<Vec<_>>(),
            )
        };

        for (exchange, kind) in publishers {
            if let Err(err) = self.setup_publisher(&exchange, kind).await {
                error!(
                    error = err.to_string(),
                    exchange, "failure to replay publisher"
                );
                self.sink.capture(&err, Some(exchange_tags(&exchange)));
            }
        }

        for (queue, reg) in queues {
            if let Err(err) = self
                .setup_queue(&reg.exchange, reg.kind, &queue, &reg.binding_key, reg.prefetch)
                .await
            {
                error!(error = err.to_string(), queue, "failure to replay queue");
                self.sink.capture(&err, None);
            }
        }

        for queue in consumers {
            if let Err(err) = self.subscribe(&queue).await {
                error!(
                    error = err.to_string(),
                    queue, "failure to replay consumer subscription"
                );
                self.sink.capture(&err, None);
            }
        }
    }

    /// (Re)arms the resend loop. Armed on every publisher connect so a
    /// fresh connection immediately starts draining the outbox; the
    /// previous task, if any, is cancelled first.
    fn arm_resend(&self) {
        let weak = self.weak.clone();
        let interval = self.options.resend_interval;

        let mut guard = self.resend_task.lock().unwrap();

        if let Some(task) = guard.take() {
            task.abort();
        }

        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let Some(inner) = weak.upgrade() else {
                    return;
                };

                inner.resend_once().await;
            }
        }));
    }

    /// One resend tick: dispatch the oldest outbox message, if any.
    ///
    /// A message whose exchange has no publisher registration yet (topology
    /// mid-rebuild) goes back to the head of the store untouched, stalling
    /// the drain rather than losing ordering. The publish failure path
    /// re-enqueues on its own, so every branch leaves the loop
    /// self-sustaining.
    async fn resend_once(&self) {
        let message = match self.outbox.dequeue_oldest().await {
            Ok(Some(message)) => message,
            Ok(None) => return,
            Err(err) => {
                error!(error = err.to_string(), "failure to read from the outbox");
                return;
            }
        };

        let registered = {
            self.topology
                .read()
                .await
                .publishers
                .contains_key(&message.exchange)
        };

        if !registered {
            debug!(
                exchange = message.exchange.as_str(),
                "exchange not registered yet, keeping message at the head of the outbox"
            );
            if let Err(err) = self.outbox.requeue_front(message).await {
                error!(error = err.to_string(), "failure to requeue outbox message");
                self.sink.capture(&err, None);
            }
            return;
        }

        self.do_publish(&message.exchange, &message.routing_key, &message.content)
            .await;
    }

    /// Best-effort graceful close of one connection; failures are logged.
    async fn close_connection(&self, role: ConnectionRole, reason: &str) {
        let conn = self.slot(role).lock().await.take();

        if let Some(conn) = conn {
            if let Err(err) = conn.close(REPLY_SUCCESS, reason).await {
                warn!(
                    error = err.to_string(),
                    role = role.as_str(),
                    "failure to close connection gracefully"
                );
            }
        }
    }

    /// Coordinated shutdown: cancels the resend loop and closes both
    /// connections. The stopped flag keeps close observers and in-flight
    /// connect retries from resurrecting anything afterwards.
    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);

        if let Some(task) = self.resend_task.lock().unwrap().take() {
            task.abort();
        }

        self.close_connection(ConnectionRole::Publisher, "shutdown").await;
        self.close_connection(ConnectionRole::Consumer, "shutdown").await;

        info!("messaging engine stopped");
    }
}

fn exchange_tags(exchange: &str) -> HashMap<String, String> {
    HashMap::from([("exchange".to_owned(), exchange.to_owned())])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{outbox::InMemoryOutbox, sink::MockErrorSink};
    use serde_json::json;
    use std::time::Duration;

    fn test_engine(outbox: Arc<InMemoryOutbox>) -> AmqpEngine {
        AmqpEngine::new(
            AmqpConfig::default(),
            EngineOptions::default(),
            outbox,
            Arc::new(crate::sink::LogSink),
        )
    }

    #[tokio::test]
    async fn publish_without_registration_is_accepted_and_saved() {
        let outbox = Arc::new(InMemoryOutbox::new());
        let engine = test_engine(outbox.clone());

        let accepted = engine
            .publish("video_job", "created", json!({ "job": 42 }))
            .await;

        assert!(accepted);
        assert_eq!(outbox.len().await, 1);

        let saved = outbox.dequeue_oldest().await.unwrap().unwrap();
        assert_eq!(saved.exchange, "video_job");
        assert_eq!(saved.routing_key, "created");
        assert_eq!(saved.content, json!({ "job": 42 }));
    }

    #[tokio::test]
    async fn resend_keeps_head_message_for_unregistered_exchange() {
        let outbox = Arc::new(InMemoryOutbox::new());
        let engine = test_engine(outbox.clone());

        outbox
            .enqueue(OutboxMessage::new("video_job", "created", json!("m1")))
            .await
            .unwrap();
        outbox
            .enqueue(OutboxMessage::new("video_job", "created", json!("m2")))
            .await
            .unwrap();

        // repeated ticks with no registered exchange must not drop or
        // reorder anything
        engine.inner.resend_once().await;
        engine.inner.resend_once().await;

        assert_eq!(outbox.len().await, 2);
        let head = outbox.dequeue_oldest().await.unwrap().unwrap();
        assert_eq!(head.content, json!("m1"));
    }

    #[tokio::test]
    async fn resend_tick_with_empty_outbox_is_a_noop() {
        let outbox = Arc::new(InMemoryOutbox::new());
        let engine = test_engine(outbox.clone());

        engine.inner.resend_once().await;

        assert!(outbox.is_empty().await);
    }

    #[tokio::test]
    async fn consume_on_unregistered_queue_reports_and_returns_none() {
        let mut sink = MockErrorSink::new();
        sink.expect_capture()
            .withf(|err, _| matches!(err, AmqpError::ConsumerError(q) if q.as_str() == "job_queue"))
            .times(1)
            .return_const(());

        let engine = AmqpEngine::new(
            AmqpConfig::default(),
            EngineOptions::default(),
            Arc::new(InMemoryOutbox::new()),
            Arc::new(sink),
        );

        let handler: Arc<dyn MessageHandler> = Arc::new(|_message: Value| async move {
            Ok::<bool, crate::handler::HandlerError>(true)
        });
        let tag = engine.consume("job_queue", handler).await;

        assert!(tag.is_none());
        assert!(engine.inner.topology.read().await.consumers.is_empty());
    }

    #[tokio::test]
    async fn failed_outbox_save_is_retried_until_it_succeeds() {
        let mut outbox = crate::outbox::MockOutbox::new();
        outbox
            .expect_enqueue()
            .times(1)
            .returning(|_| Err(AmqpError::OutboxError("store down".to_owned())));
        outbox.expect_enqueue().times(1).returning(|_| Ok(()));

        let engine = AmqpEngine::new(
            AmqpConfig::default(),
            EngineOptions {
                save_retry_interval: Duration::from_millis(50),
                ..EngineOptions::default()
            },
            Arc::new(outbox),
            Arc::new(crate::sink::LogSink),
        );

        engine
            .inner
            .save_message("video_job", "created", json!({ "job": 1 }))
            .await;

        // give the retry timer room to fire; the mock panics on drop if the
        // second enqueue never happened
        tokio::time::sleep(Duration::from_millis(300)).await;
        engine.stop().await;
    }

    #[tokio::test]
    async fn concurrent_reconnect_triggers_collapse() {
        let engine = test_engine(Arc::new(InMemoryOutbox::new()));

        // simulate a cycle already in flight: the second trigger must
        // return immediately instead of starting another cycle
        engine.inner.reconnecting.store(true, Ordering::SeqCst);

        tokio::time::timeout(Duration::from_millis(100), engine.inner.reconnect())
            .await
            .expect("re-entrant reconnect should be ignored immediately");

        assert!(engine.inner.reconnecting.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stop_cancels_the_resend_loop() {
        let engine = test_engine(Arc::new(InMemoryOutbox::new()));

        engine.inner.arm_resend();
        assert!(engine.inner.resend_task.lock().unwrap().is_some());

        engine.stop().await;

        assert!(engine.inner.resend_task.lock().unwrap().is_none());
        assert!(engine.inner.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn rearming_resend_keeps_a_single_task() {
        let engine = test_engine(Arc::new(InMemoryOutbox::new()));

        engine.inner.arm_resend();
        engine.inner.arm_resend();

        assert!(engine.inner.resend_task.lock().unwrap().is_some());

        engine.stop().await;
        assert!(engine.inner.resend_task.lock().unwrap().is_none());
    }
}
