//! Keyed connection pools driven by configuration.
//!
//! A [`ConnectionPool`] is generic over a [`Connector`]; the database and
//! broker instantiations differ only in how they read options and dial.

mod connector;
mod database;
#[allow(clippy::module_inception)]
mod pool;

pub use connector::Connector;
pub use database::{
    DatabaseConnector, DatabaseDriver, DatabaseKind, DatabaseOptions, DatabasePool, PoolSettings,
};
pub use pool::ConnectionPool;
