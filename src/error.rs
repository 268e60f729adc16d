//! Error types for hotswap-conn.

use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Opaque error returned by external drivers and brokers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur when loading, reading or watching configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The backing file of a configuration document does not exist.
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The file exists but its content is not valid in the declared format.
    #[error("Failed to parse configuration '{}': {reason}", path.display())]
    Parse {
        /// Path of the document that failed to parse
        path: PathBuf,
        /// Parser message
        reason: String,
    },

    /// The file extension does not map to a supported format.
    #[error("Unsupported configuration format: {0}. Supported: .yaml, .yml, .toml, .json")]
    UnsupportedFormat(String),

    /// No document with the given name has been loaded.
    #[error("Unknown configuration document: {0}")]
    UnknownDocument(String),

    /// A value exists but does not have the requested shape.
    #[error("Failed to deserialize '{key}': {reason}")]
    Deserialize {
        /// Dotted key that was looked up
        key: String,
        /// Deserializer message
        reason: String,
    },

    /// Serializing a document back to disk failed.
    #[error("Failed to write configuration: {0}")]
    Write(String),

    /// File watching failed to initialize.
    #[error("File watching error: {0}")]
    Watch(String),

    /// IO error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while acquiring a pooled connection.
///
/// All variants are recoverable; the caller decides whether to retry.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The resource key has no configuration document behind it.
    #[error("No configuration loaded for resource '{0}'")]
    UnknownResource(String),

    /// The connection string could not be derived from configuration.
    #[error("Invalid configuration for resource '{resource}': {source}")]
    Config {
        /// Resource key being acquired
        resource: String,
        /// Underlying configuration error
        #[source]
        source: ConfigError,
    },

    /// The transport refused or failed the dial.
    #[error("Failed to connect {kind} at {target}: {reason}")]
    Dial {
        /// Resource kind ("database", "broker")
        kind: &'static str,
        /// Redacted dial target
        target: String,
        /// Transport message
        reason: String,
    },

    /// The dial did not complete within the configured bound.
    #[error("Timed out after {timeout:?} connecting {kind} at {target}")]
    Timeout {
        /// Resource kind ("database", "broker")
        kind: &'static str,
        /// Redacted dial target
        target: String,
        /// The bound that elapsed
        timeout: Duration,
    },
}

/// Errors raised while establishing or running a consuming session.
///
/// Any of these sends the consumer back to `Disconnected`.
#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    /// No live broker connection could be acquired.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Declaring the target queue failed.
    #[error("Failed to declare queue '{queue}': {reason}")]
    Declare {
        /// Queue name
        queue: String,
        /// Broker message
        reason: String,
    },

    /// Binding the queue to its exchange failed.
    #[error("Failed to bind queue '{queue}' to exchange '{exchange}': {reason}")]
    Bind {
        /// Queue name
        queue: String,
        /// Exchange name
        exchange: String,
        /// Broker message
        reason: String,
    },

    /// Quality-of-service negotiation failed.
    #[error("Failed to apply prefetch {prefetch}: {reason}")]
    Qos {
        /// Requested prefetch count
        prefetch: u16,
        /// Broker message
        reason: String,
    },

    /// Opening, using or closing a channel failed.
    #[error("Channel error: {0}")]
    Channel(String),

    /// Publishing a message failed.
    #[error("Failed to publish to '{exchange}' with key '{routing_key}': {reason}")]
    Publish {
        /// Exchange name (empty for the default exchange)
        exchange: String,
        /// Routing key
        routing_key: String,
        /// Broker message
        reason: String,
    },
}

impl ConnectionError {
    /// Create a dial error for a target, hiding any credentials in it.
    pub fn dial(kind: &'static str, target: &str, reason: impl ToString) -> Self {
        Self::Dial {
            kind,
            target: redact(target),
            reason: reason.to_string(),
        }
    }
}

/// Replace the password of a `user:pass@host` or `password=...` style target
/// with `***`.
pub(crate) fn redact(target: &str) -> String {
    if target.contains("password=") {
        return target
            .split(' ')
            .map(|pair| match pair.strip_prefix("password=") {
                Some(_) => "password=***",
                None => pair,
            })
            .collect::<Vec<_>>()
            .join(" ");
    }
    let Some(at) = target.rfind('@') else {
        return target.to_string();
    };
    let (creds, rest) = target.split_at(at);
    let scheme_end = creds.find("://").map(|i| i + 3).unwrap_or(0);
    match creds[scheme_end..].find(':') {
        Some(colon) => format!("{}***{}", &creds[..scheme_end + colon + 1], rest),
        None => target.to_string(),
    }
}
