//! Seam between the node and the broker-protocol client.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::subscription::QoS;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The broker or the network refused the connection. Transient.
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("No CONNACK within {0:?}")]
    Timeout(Duration),
    /// The local client could not queue the request.
    #[error("Client error: {0}")]
    Client(String),
    #[error("Transport is closed")]
    Closed,
}

impl TransportError {
    pub fn is_refused(&self) -> bool {
        matches!(self, TransportError::ConnectionRefused(_))
    }
}

/// Notifications from the transport's background I/O task, delivered in the
/// order they happened on the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    PreConnect,
    Connected,
    ConnectFailed { reason: String },
    Disconnected { reason: String },
    MessageReceived { topic: String, payload: Vec<u8>, qos: QoS },
    /// The broker acknowledged a publish (immediately for QoS 0).
    PublishAcked { pkid: u16 },
    SubscribeRejected { topic: Option<String>, reason: String },
}

/// A broker connection driven by a background task.
///
/// The endpoint is fixed when the transport is built; the first `reconnect`
/// is the initial connect.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Make one connection attempt and wait for its outcome.
    async fn reconnect(&self) -> Result<(), TransportError>;

    /// Disconnect and stop the background task.
    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
        user_properties: Vec<(String, String)>,
    ) -> Result<(), TransportError>;

    async fn subscribe(&self, topic_filter: &str, qos: QoS) -> Result<(), TransportError>;

    async fn unsubscribe(&self, topic_filter: &str) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;
}
