//! The seam between a connection pool and a concrete transport.

use crate::core::ConfigDocument;
use crate::error::{ConnectionError, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Knows how to turn a configuration document into a live connection.
///
/// A [`ConnectionPool`](crate::pool::ConnectionPool) calls [`options`] and
/// [`dsn`] once per resource (until the resource's configuration changes) and
/// [`dial`] once per connection string.
///
/// [`options`]: Connector::options
/// [`dsn`]: Connector::dsn
/// [`dial`]: Connector::dial
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The live connection handle shared by all callers of one DSN.
    type Connection: Send + Sync + 'static;

    /// Dial parameters extracted from configuration.
    type Options: Send + Sync + 'static;

    /// Resource kind used in logs and errors, e.g. `"database"`.
    fn kind(&self) -> &'static str;

    /// Extract dial parameters from the resource's document.
    ///
    /// # Errors
    ///
    /// Returns an error if the document does not describe a valid target.
    fn options(&self, document: &ConfigDocument) -> Result<Self::Options>;

    /// Derive the connection string. Two resources with equal DSNs share one
    /// pooled connection.
    fn dsn(&self, options: &Self::Options) -> String;

    /// Upper bound for a single dial.
    fn dial_timeout(&self, options: &Self::Options) -> Duration;

    /// Open a new connection.
    async fn dial(
        &self,
        dsn: &str,
        options: &Self::Options,
    ) -> std::result::Result<Self::Connection, ConnectionError>;

    /// Whether the transport has closed `connection`. Closed connections are
    /// treated as absent and redialed.
    fn is_closed(&self, _connection: &Self::Connection) -> bool {
        false
    }
}
