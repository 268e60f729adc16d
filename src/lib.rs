//! # hotswap-conn
//!
//! Hot-reloadable configuration whose changes drop and rebuild live network
//! connections, plus a queue consumer that survives broker restarts.
//!
//! ## Overview
//!
//! - [`core::ConfigStore`] loads one document per configuration file and
//!   serves dotted-path lookups (`"db.host"`). Reads are lock-free via
//!   `arc-swap`; a failed reparse keeps the previous tree.
//! - [`notify::ChangeNotifier`] is the registry of per-file change queues.
//!   The store publishes into it after every successful reload.
//! - [`pool::ConnectionPool`] caches one connection per connection string and
//!   drops it when the backing document changes. The next `acquire` reads the
//!   new configuration and dials again.
//! - [`queue::ResilientConsumer`] consumes a queue through a broker pool and
//!   reconnects with a fixed backoff whenever the session is lost.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hotswap_conn::prelude::*;
//!
//! # async fn example() -> Result<()> {
//! let notifier = ChangeNotifier::new();
//! let store = ConfigStore::open("config", notifier)?;
//! store.watch_all().await?;
//!
//! let host: Option<String> = store.get_as("db.host")?;
//! println!("database host: {:?}", host);
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `amqp`: [`queue::amqp`], a broker implementation over `lapin`.

#![warn(missing_docs, rust_2024_compatibility)]
#![deny(unsafe_code)]

pub mod core;
pub mod error;
pub mod notify;
pub mod pool;
pub mod queue;

/// Convenient re-exports for common usage patterns.
pub mod prelude {
    pub use crate::core::{ConfigDocument, ConfigFormat, ConfigStore};
    pub use crate::error::{ConfigError, ConnectionError, ConsumeError, Result};
    pub use crate::notify::{ChangeNotifier, ChangeSubscription};
    pub use crate::pool::{
        ConnectionPool, Connector, DatabaseConnector, DatabaseDriver, DatabaseKind,
        DatabaseOptions,
    };
    pub use crate::queue::{
        Broker, BrokerChannel, BrokerConnection, BrokerConnector, BrokerOptions, ConsumerHandle,
        ConsumerSettings, Delivery, InFlight, Publisher, ResilientConsumer, Shutdown,
    };
}
