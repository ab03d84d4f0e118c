//! Error types for the email worker.

use std::path::PathBuf;

/// Configuration-related errors. Always fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Broker connection errors.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Cannot connect to broker at {host}: {source}")]
    Connect {
        host: String,
        #[source]
        source: lapin::Error,
    },

    #[error("Cannot declare queue {queue}: {source}")]
    Declare {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    #[error("Consuming from {queue} failed: {source}")]
    ConsumeFailed {
        queue: String,
        #[source]
        source: lapin::Error,
    },

    #[error("Acknowledging delivery {delivery_tag} failed: {reason}")]
    AckFailed { delivery_tag: u64, reason: String },

    #[error("Publishing to {routing_key} failed: {source}")]
    PublishFailed {
        routing_key: String,
        #[source]
        source: lapin::Error,
    },

    #[error("Cannot encode email request: {source}")]
    Encode {
        #[source]
        source: serde_json::Error,
    },

    #[error("Broker rejected message for {routing_key}")]
    Nacked { routing_key: String },
}

/// A payload did not match the parameters of the operation it was bound to.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BindingError {
    #[error("missing required argument: '{0}'")]
    Missing(String),

    #[error("got an unexpected argument: '{0}'")]
    Unexpected(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

/// SMTP transmission errors. A single attempt is made, never retried here.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Invalid {field} address '{value}': {reason}")]
    InvalidAddress {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Failed to build email: {0}")]
    Build(String),

    #[error("SMTP send to {host} failed: {reason}")]
    Transport { host: String, reason: String },
}

/// Failure while processing one delivery. Logged and dropped by the
/// consume loop; never stops the worker.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Binding(#[from] BindingError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}
