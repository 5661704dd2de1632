//! Turns transport events into counter updates, log records, state changes
//! and subscription replay.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::error::NodeError;
use crate::node::{ConnectionState, NodeShared};
use crate::service_utils::shorten_data;
use crate::transport::TransportEvent;

/// Dispatch loop. Ends when the transport drops its event sender.
pub(crate) async fn run(shared: Arc<NodeShared>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        dispatch(&shared, event).await;
    }
    debug!(node_id = %shared.identity.node_id, "Transport event stream closed");
}

pub(crate) async fn dispatch(shared: &NodeShared, event: TransportEvent) {
    match event {
        TransportEvent::PreConnect => {
            info!("Connecting to broker at {}", shared.config.address());
        }
        TransportEvent::Connected => {
            info!("Connected to broker at {}", shared.config.address());
            shared.set_state(ConnectionState::Connected).await;
            let restored = shared.restore_subscriptions().await;
            debug!(restored, "Subscriptions restored");
        }
        TransportEvent::ConnectFailed { reason } => {
            error!(
                reason_code = %reason,
                "Failed to connect to broker at {}",
                shared.config.address()
            );
            shared
                .transition(ConnectionState::Connecting, ConnectionState::Disconnected)
                .await;
        }
        TransportEvent::Disconnected { reason } => {
            info!(reason_code = %reason, "Disconnected with result code {}", reason);
            shared
                .transition(ConnectionState::Connected, ConnectionState::Disconnected)
                .await;
        }
        TransportEvent::MessageReceived { topic, payload, qos } => {
            shared.metrics.record_received(payload.len());
            info!(
                topic = %topic,
                qos = %qos,
                "Received message on topic '{}': {}",
                topic,
                shorten_data(&String::from_utf8_lossy(&payload))
            );
        }
        TransportEvent::PublishAcked { pkid } => {
            shared.metrics.record_message_sent();
            debug!("Published message: {}", pkid);
        }
        TransportEvent::SubscribeRejected { topic, reason } => {
            let failure = NodeError::SubscribeFailure {
                topic: topic.unwrap_or_else(|| "<unknown>".to_string()),
                reason: reason.clone(),
            };
            error!(reason_code = %reason, "{}", failure);
        }
    }
}
