//! A consumer that keeps a queue subscription alive across broker restarts.

use crate::error::ConsumeError;
use crate::queue::broker::{
    Broker, BrokerChannel, BrokerConnection, BrokerPool, ChannelOf, DeliveryOf, DeliveryStream,
};
use futures_util::StreamExt;
use futures_util::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};

/// Wait between a failed or lost session and the next dial.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(3);

/// What to consume and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    /// Queue to declare and consume
    pub queue: String,
    /// Exchange to bind the queue to; empty uses the default exchange and
    /// skips the bind
    pub exchange: String,
    /// Binding key; defaults to the queue name
    pub routing_key: String,
    /// Maximum unacknowledged deliveries, `0` for unbounded
    pub prefetch: u16,
    /// Consumer tag; empty lets the broker choose
    pub consumer_tag: String,
    /// Wait before redialing after a failure
    pub backoff: Duration,
}

impl ConsumerSettings {
    /// Consume `queue` from the default exchange.
    pub fn new(queue: impl Into<String>) -> Self {
        let queue = queue.into();
        Self {
            routing_key: queue.clone(),
            queue,
            exchange: String::new(),
            prefetch: 0,
            consumer_tag: String::new(),
            backoff: DEFAULT_BACKOFF,
        }
    }

    /// Bind the queue to `exchange`.
    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    /// Bind with `routing_key` instead of the queue name.
    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    /// Cap unacknowledged deliveries.
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Set the consumer tag.
    pub fn consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }

    /// Set the reconnect backoff.
    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Number of handler tasks currently running.
///
/// Every session starts a fresh count, which its handlers receive. The
/// consumer also keeps a running total across sessions.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    count: Arc<AtomicUsize>,
}

impl InFlight {
    /// Current count.
    pub fn get(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    fn enter(&self) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            count: Arc::clone(&self.count),
        }
    }
}

/// Decrements on drop, so a panicking handler is still counted out.
struct InFlightGuard {
    count: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Cloneable stop signal.
///
/// Level triggered: once triggered every current and future waiter sees it.
/// One signal can stop many consumers.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    /// A signal that has not fired.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Whether the signal has fired.
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

async fn triggered(rx: &mut watch::Receiver<bool>) {
    // The consumer holds a sender, so the channel cannot close under it.
    let closed = rx.wait_for(|stop| *stop).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

/// Observable state of a [`ResilientConsumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No session; the next step dials.
    Disconnected,
    /// Connected; the next step builds a consuming session.
    Connecting,
    /// Receiving deliveries.
    Consuming,
    /// Session lost or stopping; the next step closes it.
    Draining,
    /// Shut down. Terminal.
    Stopped,
}

struct Session<B: Broker> {
    connection: Arc<B::Connection>,
    channel: ChannelOf<B>,
    deliveries: DeliveryStream<DeliveryOf<B>>,
    in_flight: InFlight,
}

enum ConsumerState<B: Broker> {
    Disconnected { backoff: bool },
    Connecting(Arc<B::Connection>),
    Consuming(Session<B>),
    Draining { session: Session<B>, stop: bool },
    Stopped,
}

impl<B: Broker> ConsumerState<B> {
    fn phase(&self) -> Phase {
        match self {
            Self::Disconnected { .. } => Phase::Disconnected,
            Self::Connecting(_) => Phase::Connecting,
            Self::Consuming(_) => Phase::Consuming,
            Self::Draining { .. } => Phase::Draining,
            Self::Stopped => Phase::Stopped,
        }
    }
}

enum Event<D> {
    Shutdown,
    Closed,
    Delivery(Option<std::result::Result<D, ConsumeError>>),
}

type HandlerFn<D> = Arc<dyn Fn(D, InFlight) -> BoxFuture<'static, ()> + Send + Sync>;

/// Consumes a queue forever, reconnecting with a fixed backoff whenever the
/// broker is unreachable or the session breaks.
///
/// The consumer is a state machine:
///
/// ```text
/// Disconnected -> Connecting -> Consuming -> Draining -> Disconnected
///       ^              |
///       +--------------+  (on any failure, after the backoff)
/// ```
///
/// Each delivery is handed to the handler in its own task; the consumer moves
/// on to the next delivery immediately. The handler owns acknowledgement, and
/// the prefetch limit is what bounds how many deliveries are outstanding.
///
/// # Examples
///
/// ```rust,no_run
/// # #[cfg(feature = "amqp")]
/// # async fn example(store: hotswap_conn::core::ConfigStore) {
/// use hotswap_conn::prelude::*;
/// use hotswap_conn::queue::amqp::AmqpBroker;
///
/// let pool = ConnectionPool::new(BrokerConnector::new(AmqpBroker::default()), store);
/// let settings = ConsumerSettings::new("orders").prefetch(10);
/// let consumer = ResilientConsumer::new(pool, "rabbit", settings, |delivery, _in_flight| async move {
///     println!("{} bytes", delivery.body().len());
///     let _ = delivery.ack().await;
/// });
///
/// let handle = consumer.spawn();
/// // ...
/// handle.stop().await.ok();
/// # }
/// ```
pub struct ResilientConsumer<B: Broker> {
    pool: BrokerPool<B>,
    resource: String,
    settings: ConsumerSettings,
    handler: HandlerFn<DeliveryOf<B>>,
    in_flight: InFlight,
    shutdown: Shutdown,
    stop_rx: watch::Receiver<bool>,
    state: ConsumerState<B>,
}

impl<B: Broker> ResilientConsumer<B> {
    /// Create a consumer for the broker configured by document `resource`.
    ///
    /// Nothing happens until [`step`](Self::step), [`run`](Self::run) or
    /// [`spawn`](Self::spawn) is called.
    pub fn new<H, Fut>(
        pool: BrokerPool<B>,
        resource: impl Into<String>,
        settings: ConsumerSettings,
        handler: H,
    ) -> Self
    where
        H: Fn(DeliveryOf<B>, InFlight) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shutdown = Shutdown::new();
        Self {
            pool,
            resource: resource.into(),
            settings,
            handler: Arc::new(move |delivery: DeliveryOf<B>, in_flight: InFlight| {
                handler(delivery, in_flight).boxed()
            }),
            in_flight: InFlight::default(),
            stop_rx: shutdown.subscribe(),
            shutdown,
            state: ConsumerState::Disconnected { backoff: false },
        }
    }

    /// Stop on `shutdown` instead of a private signal.
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.stop_rx = shutdown.subscribe();
        self.shutdown = shutdown;
        self
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Handler tasks currently running, including those started by earlier
    /// sessions.
    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// The signal that stops this consumer.
    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// The settings this consumer was built with.
    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    /// Advance the state machine by one transition and return the new phase.
    ///
    /// In `Consuming` one step handles one event: a delivery, a close, or
    /// the shutdown signal.
    pub async fn step(&mut self) -> Phase {
        let state = std::mem::replace(&mut self.state, ConsumerState::Stopped);
        self.state = match state {
            ConsumerState::Disconnected { backoff } => self.reconnect(backoff).await,
            ConsumerState::Connecting(connection) => self.open_session(connection).await,
            ConsumerState::Consuming(session) => self.consume(session).await,
            ConsumerState::Draining { session, stop } => self.drain(session, stop).await,
            ConsumerState::Stopped => ConsumerState::Stopped,
        };
        self.state.phase()
    }

    /// Step until stopped.
    pub async fn run(mut self) {
        while self.step().await != Phase::Stopped {}
    }

    /// Run on a new task.
    pub fn spawn(self) -> ConsumerHandle {
        let shutdown = self.shutdown.clone();
        let in_flight = self.in_flight.clone();
        ConsumerHandle {
            shutdown,
            in_flight,
            task: tokio::spawn(self.run()),
        }
    }

    async fn reconnect(&mut self, backoff: bool) -> ConsumerState<B> {
        if self.shutdown.is_triggered() {
            return ConsumerState::Stopped;
        }

        if backoff {
            tokio::select! {
                _ = triggered(&mut self.stop_rx) => return ConsumerState::Stopped,
                _ = tokio::time::sleep(self.settings.backoff) => {}
            }
        }

        let acquired = tokio::select! {
            _ = triggered(&mut self.stop_rx) => return ConsumerState::Stopped,
            acquired = self.pool.acquire(&self.resource) => acquired,
        };

        match acquired {
            Ok(connection) => ConsumerState::Connecting(connection),
            Err(e) => {
                tracing::warn!(
                    resource = %self.resource,
                    queue = %self.settings.queue,
                    error = %e,
                    backoff = ?self.settings.backoff,
                    "Broker unavailable, consumer will retry"
                );
                ConsumerState::Disconnected { backoff: true }
            }
        }
    }

    async fn open_session(&mut self, connection: Arc<B::Connection>) -> ConsumerState<B> {
        match Self::establish(connection, &self.settings).await {
            Ok(session) => {
                tracing::info!(
                    resource = %self.resource,
                    queue = %self.settings.queue,
                    prefetch = self.settings.prefetch,
                    "Consumer started"
                );
                ConsumerState::Consuming(session)
            }
            Err(e) => {
                tracing::warn!(
                    resource = %self.resource,
                    queue = %self.settings.queue,
                    error = %e,
                    "Failed to start consuming, consumer will retry"
                );
                ConsumerState::Disconnected { backoff: true }
            }
        }
    }

    async fn establish(
        connection: Arc<B::Connection>,
        settings: &ConsumerSettings,
    ) -> std::result::Result<Session<B>, ConsumeError> {
        let channel = connection.open_channel().await?;
        match Self::prepare(&channel, settings).await {
            Ok(deliveries) => Ok(Session {
                connection,
                channel,
                deliveries,
                in_flight: InFlight::default(),
            }),
            Err(e) => {
                if let Err(close) = channel.close().await {
                    tracing::debug!(error = %close, "Failed to close half-open channel");
                }
                Err(e)
            }
        }
    }

    async fn prepare(
        channel: &ChannelOf<B>,
        settings: &ConsumerSettings,
    ) -> std::result::Result<DeliveryStream<DeliveryOf<B>>, ConsumeError> {
        channel.declare_queue(&settings.queue).await?;
        if !settings.exchange.is_empty() {
            channel
                .bind_queue(&settings.queue, &settings.exchange, &settings.routing_key)
                .await?;
        }
        channel.qos(settings.prefetch).await?;
        channel
            .consume(&settings.queue, &settings.consumer_tag)
            .await
    }

    async fn consume(&mut self, mut session: Session<B>) -> ConsumerState<B> {
        let event = tokio::select! {
            biased;
            _ = triggered(&mut self.stop_rx) => Event::Shutdown,
            _ = session.connection.closed() => Event::Closed,
            next = session.deliveries.next() => Event::Delivery(next),
        };

        match event {
            Event::Delivery(Some(Ok(delivery))) => {
                self.dispatch(delivery, &session.in_flight);
                ConsumerState::Consuming(session)
            }
            Event::Shutdown => ConsumerState::Draining {
                session,
                stop: true,
            },
            Event::Closed => {
                tracing::warn!(
                    resource = %self.resource,
                    queue = %self.settings.queue,
                    "Broker connection closed"
                );
                ConsumerState::Draining {
                    session,
                    stop: false,
                }
            }
            Event::Delivery(Some(Err(e))) => {
                tracing::warn!(
                    resource = %self.resource,
                    queue = %self.settings.queue,
                    error = %e,
                    "Delivery stream failed"
                );
                ConsumerState::Draining {
                    session,
                    stop: false,
                }
            }
            Event::Delivery(None) => {
                tracing::warn!(
                    resource = %self.resource,
                    queue = %self.settings.queue,
                    "Delivery stream ended"
                );
                ConsumerState::Draining {
                    session,
                    stop: false,
                }
            }
        }
    }

    fn dispatch(&self, delivery: DeliveryOf<B>, session: &InFlight) {
        let guards = (self.in_flight.enter(), session.enter());
        let handling = (self.handler)(delivery, session.clone());
        tokio::spawn(async move {
            handling.await;
            drop(guards);
        });
    }

    async fn drain(&mut self, session: Session<B>, stop: bool) -> ConsumerState<B> {
        if let Err(e) = session.channel.close().await {
            tracing::debug!(error = %e, "Failed to close consumer channel");
        }
        let abandoned = session.in_flight.get();
        drop(session);
        if abandoned > 0 {
            tracing::debug!(
                queue = %self.settings.queue,
                in_flight = abandoned,
                "Session closed with handlers still running"
            );
        }

        if stop {
            tracing::info!(
                resource = %self.resource,
                queue = %self.settings.queue,
                in_flight = self.in_flight.get(),
                "Consumer stopped"
            );
            ConsumerState::Stopped
        } else {
            ConsumerState::Disconnected { backoff: true }
        }
    }
}

/// Handle to a spawned consumer.
pub struct ConsumerHandle {
    shutdown: Shutdown,
    in_flight: InFlight,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    /// Ask the consumer to stop. Running handlers are not interrupted.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Handler tasks currently running, across all sessions.
    pub fn in_flight(&self) -> usize {
        self.in_flight.get()
    }

    /// Whether the consumer loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the consumer loop to exit.
    pub async fn join(self) -> std::result::Result<(), JoinError> {
        self.task.await
    }

    /// Signal shutdown and wait for the loop to exit.
    pub async fn stop(self) -> std::result::Result<(), JoinError> {
        self.shutdown();
        self.join().await
    }
}
