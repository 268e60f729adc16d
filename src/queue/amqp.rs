//! AMQP 0-9-1 broker over `lapin`.

use crate::error::{BoxError, ConsumeError};
use crate::queue::broker::{Broker, BrokerChannel, BrokerConnection, Delivery, DeliveryStream};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection, ConnectionProperties};
use tokio::sync::watch;

const PERSISTENT: u8 = 2;

/// Dials RabbitMQ (or any AMQP 0-9-1 broker) with `lapin`.
///
/// The default broker drives `lapin` on the tokio runtime it is created in.
/// Created outside a runtime it falls back to `lapin`'s own executor and
/// reactor threads.
#[derive(Clone)]
pub struct AmqpBroker {
    properties: ConnectionProperties,
}

impl AmqpBroker {
    /// Dial with custom connection properties.
    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }

    /// Drive connections on the runtime behind `handle`.
    pub fn tokio(handle: tokio::runtime::Handle) -> Self {
        Self::with_properties(
            ConnectionProperties::default()
                .with_executor(tokio_executor_trait::Tokio::default().with_handle(handle))
                .with_reactor(tokio_reactor_trait::Tokio),
        )
    }
}

impl Default for AmqpBroker {
    fn default() -> Self {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => Self::tokio(handle),
            Err(_) => Self::with_properties(ConnectionProperties::default()),
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    type Connection = AmqpConnection;

    async fn connect(&self, dsn: &str) -> Result<AmqpConnection, BoxError> {
        let connection = Connection::connect(dsn, self.properties.clone()).await?;

        let (tx, closed) = watch::channel(false);
        connection.on_error(move |e| {
            tracing::warn!(error = %e, "AMQP connection error");
            tx.send_replace(true);
        });

        Ok(AmqpConnection {
            inner: connection,
            closed,
        })
    }
}

/// A `lapin` connection plus its close signal.
pub struct AmqpConnection {
    inner: Connection,
    closed: watch::Receiver<bool>,
}

impl AmqpConnection {
    /// The underlying `lapin` connection.
    pub fn inner(&self) -> &Connection {
        &self.inner
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    type Channel = AmqpChannel;

    async fn open_channel(&self) -> Result<AmqpChannel, ConsumeError> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|e| ConsumeError::Channel(e.to_string()))?;
        Ok(AmqpChannel { inner: channel })
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow() || !self.inner.status().connected()
    }

    async fn closed(&self) {
        let mut closed = self.closed.clone();
        // A dropped sender means the error callback is gone with the connection.
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

/// A `lapin` channel.
pub struct AmqpChannel {
    inner: lapin::Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    type Delivery = AmqpDelivery;

    async fn declare_queue(&self, queue: &str) -> Result<(), ConsumeError> {
        self.inner
            .queue_declare(queue, QueueDeclareOptions::default(), FieldTable::default())
            .await
            .map(|_| ())
            .map_err(|e| ConsumeError::Declare {
                queue: queue.to_string(),
                reason: e.to_string(),
            })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), ConsumeError> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| ConsumeError::Bind {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                reason: e.to_string(),
            })
    }

    async fn qos(&self, prefetch: u16) -> Result<(), ConsumeError> {
        self.inner
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| ConsumeError::Qos {
                prefetch,
                reason: e.to_string(),
            })
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream<AmqpDelivery>, ConsumeError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| ConsumeError::Channel(e.to_string()))?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(|inner| AmqpDelivery { inner })
                    .map_err(|e| ConsumeError::Channel(e.to_string()))
            })
            .boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), ConsumeError> {
        let publish_error = |e: lapin::Error| ConsumeError::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            reason: e.to_string(),
        };

        self.inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default()
                    .with_content_type("text/plain".into())
                    .with_delivery_mode(PERSISTENT),
            )
            .await
            .map_err(publish_error)?
            .await
            .map_err(publish_error)?;
        Ok(())
    }

    async fn close(&self) -> Result<(), ConsumeError> {
        self.inner
            .close(200, "Bye")
            .await
            .map_err(|e| ConsumeError::Channel(e.to_string()))
    }
}

/// A message delivered by `lapin`.
pub struct AmqpDelivery {
    inner: lapin::message::Delivery,
}

impl AmqpDelivery {
    /// The underlying `lapin` delivery.
    pub fn inner(&self) -> &lapin::message::Delivery {
        &self.inner
    }
}

#[async_trait]
impl Delivery for AmqpDelivery {
    fn body(&self) -> &[u8] {
        &self.inner.data
    }

    fn delivery_tag(&self) -> u64 {
        self.inner.delivery_tag
    }

    async fn ack(&self) -> Result<(), ConsumeError> {
        self.inner
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| ConsumeError::Channel(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<(), ConsumeError> {
        let options = BasicNackOptions {
            requeue,
            ..BasicNackOptions::default()
        };
        self.inner
            .acker
            .nack(options)
            .await
            .map_err(|e| ConsumeError::Channel(e.to_string()))
    }
}
