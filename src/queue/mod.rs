//! Message-broker consumption and publishing on top of the connection pool.
//!
//! Broker connections come from a [`BrokerPool`], so a change to the broker's
//! configuration document drops the pooled connection and the consumer's next
//! reconnect dials the new target.

pub mod broker;
mod consumer;
mod publisher;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use broker::{
    Broker, BrokerChannel, BrokerConnection, BrokerConnector, BrokerOptions, BrokerPool, Delivery,
    DeliveryStream,
};
pub use consumer::{
    ConsumerHandle, ConsumerSettings, DEFAULT_BACKOFF, InFlight, Phase, ResilientConsumer,
    Shutdown,
};
pub use publisher::Publisher;
