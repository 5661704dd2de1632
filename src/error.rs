use thiserror::Error;

use crate::config::ConfigError;
use crate::metrics::MetricsError;
use crate::transport::TransportError;

/// Errors surfaced by a [`Node`](crate::node::Node).
#[derive(Debug, Error)]
pub enum NodeError {
    /// Malformed caller input, never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Every configured reconnect attempt failed.
    #[error("Connection failed after {attempts} attempts: {last_error}")]
    ConnectionExhausted { attempts: u32, last_error: String },

    /// Broker rejected a subscription. Logged, not returned by subscribe or replay.
    #[error("Failed to subscribe to topic '{topic}': {reason}")]
    SubscribeFailure { topic: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    #[error("Node is closed")]
    Closed,
}
