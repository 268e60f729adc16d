//! In-memory broker for consumer and publisher tests.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::stream;
use hotswap_conn::core::ConfigStore;
use hotswap_conn::error::{BoxError, ConsumeError};
use hotswap_conn::notify::ChangeNotifier;
use hotswap_conn::pool::ConnectionPool;
use hotswap_conn::queue::{
    Broker, BrokerChannel, BrokerConnection, BrokerConnector, BrokerPool, Delivery, DeliveryStream,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use tempfile::TempDir;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;

#[derive(Default)]
pub struct BrokerState {
    pub dials: Mutex<Vec<(Instant, String)>>,
    pub fail_connect: AtomicBool,
    pub fail_declare: AtomicBool,
    pub declared: Mutex<Vec<String>>,
    pub bindings: Mutex<Vec<(String, String, String)>>,
    pub published: Mutex<Vec<(String, String, Vec<u8>)>>,
    pub consumers: AtomicUsize,
    pub channels_opened: AtomicUsize,
    pub channels_closed: AtomicUsize,
    pub max_outstanding: AtomicUsize,
    pub acked: AtomicUsize,
    messages: Mutex<VecDeque<Vec<u8>>>,
    connections: Mutex<Vec<watch::Sender<bool>>>,
    next_tag: AtomicU64,
    wake: Notify,
}

/// Broker double counting dials, unacknowledged deliveries and channels.
#[derive(Clone, Default)]
pub struct MockBroker {
    pub state: Arc<BrokerState>,
}

impl MockBroker {
    pub fn push(&self, body: impl Into<Vec<u8>>) {
        self.state.messages.lock().push_back(body.into());
        self.state.wake.notify_waiters();
    }

    /// Close every live connection, as a broker restart would.
    pub fn disconnect_all(&self) {
        for closed in self.state.connections.lock().drain(..) {
            closed.send_replace(true);
        }
        self.state.wake.notify_waiters();
    }

    pub fn dial_count(&self) -> usize {
        self.state.dials.lock().len()
    }

    pub fn dial_times(&self) -> Vec<Instant> {
        self.state.dials.lock().iter().map(|(at, _)| *at).collect()
    }

    pub fn dialed(&self) -> Vec<String> {
        self.state.dials.lock().iter().map(|(_, dsn)| dsn.clone()).collect()
    }

    pub fn pending(&self) -> usize {
        self.state.messages.lock().len()
    }
}

#[async_trait]
impl Broker for MockBroker {
    type Connection = MockConnection;

    async fn connect(&self, dsn: &str) -> Result<MockConnection, BoxError> {
        self.state
            .dials
            .lock()
            .push((Instant::now(), dsn.to_string()));
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err("connection refused".into());
        }

        let (tx, closed) = watch::channel(false);
        self.state.connections.lock().push(tx);
        Ok(MockConnection {
            broker: Arc::clone(&self.state),
            closed,
        })
    }
}

pub struct MockConnection {
    broker: Arc<BrokerState>,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl BrokerConnection for MockConnection {
    type Channel = MockChannel;

    async fn open_channel(&self) -> Result<MockChannel, ConsumeError> {
        if self.is_closed() {
            return Err(ConsumeError::Channel("connection closed".into()));
        }
        self.broker.channels_opened.fetch_add(1, Ordering::SeqCst);
        Ok(MockChannel {
            broker: Arc::clone(&self.broker),
            closed: self.closed.clone(),
            prefetch: AtomicU16::new(0),
            outstanding: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

pub struct MockChannel {
    broker: Arc<BrokerState>,
    closed: watch::Receiver<bool>,
    prefetch: AtomicU16,
    outstanding: Arc<AtomicUsize>,
}

struct Feed {
    broker: Arc<BrokerState>,
    closed: watch::Receiver<bool>,
    prefetch: usize,
    outstanding: Arc<AtomicUsize>,
}

impl Feed {
    /// Next message, holding back while `prefetch` deliveries are unacked.
    async fn next(&self) -> Option<MockDelivery> {
        loop {
            let wake = self.broker.wake.notified();
            if *self.closed.borrow() {
                return None;
            }

            let room = self.prefetch == 0 || self.outstanding.load(Ordering::SeqCst) < self.prefetch;
            if room {
                if let Some(body) = self.broker.messages.lock().pop_front() {
                    let outstanding = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
                    self.broker
                        .max_outstanding
                        .fetch_max(outstanding, Ordering::SeqCst);
                    return Some(MockDelivery {
                        body,
                        tag: self.broker.next_tag.fetch_add(1, Ordering::SeqCst),
                        broker: Arc::clone(&self.broker),
                        outstanding: Arc::clone(&self.outstanding),
                        settled: AtomicBool::new(false),
                    });
                }
            }
            wake.await;
        }
    }
}

#[async_trait]
impl BrokerChannel for MockChannel {
    type Delivery = MockDelivery;

    async fn declare_queue(&self, queue: &str) -> Result<(), ConsumeError> {
        if self.broker.fail_declare.load(Ordering::SeqCst) {
            return Err(ConsumeError::Declare {
                queue: queue.to_string(),
                reason: "PRECONDITION_FAILED".into(),
            });
        }
        self.broker.declared.lock().push(queue.to_string());
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), ConsumeError> {
        self.broker.bindings.lock().push((
            queue.to_string(),
            exchange.to_string(),
            routing_key.to_string(),
        ));
        Ok(())
    }

    async fn qos(&self, prefetch: u16) -> Result<(), ConsumeError> {
        self.prefetch.store(prefetch, Ordering::SeqCst);
        Ok(())
    }

    async fn consume(
        &self,
        _queue: &str,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream<MockDelivery>, ConsumeError> {
        self.broker.consumers.fetch_add(1, Ordering::SeqCst);
        let feed = Feed {
            broker: Arc::clone(&self.broker),
            closed: self.closed.clone(),
            prefetch: self.prefetch.load(Ordering::SeqCst) as usize,
            outstanding: Arc::clone(&self.outstanding),
        };
        Ok(Box::pin(stream::unfold(feed, |feed| async move {
            let delivery = feed.next().await?;
            Some((Ok(delivery), feed))
        })))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), ConsumeError> {
        self.broker.published.lock().push((
            exchange.to_string(),
            routing_key.to_string(),
            body.to_vec(),
        ));
        Ok(())
    }

    async fn close(&self) -> Result<(), ConsumeError> {
        self.broker.channels_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockDelivery {
    body: Vec<u8>,
    tag: u64,
    broker: Arc<BrokerState>,
    outstanding: Arc<AtomicUsize>,
    settled: AtomicBool,
}

impl MockDelivery {
    fn settle(&self) {
        if !self.settled.swap(true, Ordering::SeqCst) {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
            self.broker.wake.notify_waiters();
        }
    }
}

#[async_trait]
impl Delivery for MockDelivery {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn delivery_tag(&self) -> u64 {
        self.tag
    }

    async fn ack(&self) -> Result<(), ConsumeError> {
        self.settle();
        self.broker.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), ConsumeError> {
        self.settle();
        if requeue {
            self.broker.messages.lock().push_back(self.body.clone());
            self.broker.wake.notify_waiters();
        }
        Ok(())
    }
}

/// A config directory holding `rabbit.yaml` and a broker pool over it.
pub fn broker_pool(broker: &MockBroker) -> (TempDir, BrokerPool<MockBroker>) {
    let temp_dir = TempDir::new().unwrap();
    fs::write(
        temp_dir.path().join("rabbit.yaml"),
        "host: mq.internal\nport: 5672\nusername: app\npassword: secret\n",
    )
    .unwrap();
    let store = ConfigStore::open(temp_dir.path(), ChangeNotifier::new()).unwrap();
    let pool = ConnectionPool::new(BrokerConnector::new(broker.clone()), store);
    (temp_dir, pool)
}
