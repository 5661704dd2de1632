use serde_json::{json, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{error, info};

use crate::error::NodeError;
use crate::metrics::MetricsSnapshot;
use crate::node::Node;
use crate::subscription::QoS;

/// Longest payload preview written to the log.
pub const PREVIEW_LENGTH: usize = 75;

/// Trim `data` and cut it to [`PREVIEW_LENGTH`] characters, appending `...`
/// when something was cut.
pub fn shorten_data(data: &str) -> String {
    let data = data.trim();
    if data.chars().count() > PREVIEW_LENGTH {
        let mut preview: String = data.chars().take(PREVIEW_LENGTH).collect();
        preview.push_str("...");
        preview
    } else {
        data.to_string()
    }
}

/// Format a byte count with two decimals and a binary-scaled unit, e.g. `1.50 KB`.
pub fn convert_bytes_to_human_readable(num: f64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];

    let mut value = num;
    let mut unit = UNITS[0];
    for next in &UNITS[1..] {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = *next;
    }
    format!("{:.2} {}", value, unit)
}

/// Convert a JSON object into MQTT v5 user properties. Non-string values are
/// stored in their JSON form.
pub fn parse_user_properties(properties: &Value) -> Result<Vec<(String, String)>, NodeError> {
    let Value::Object(map) = properties else {
        return Err(NodeError::Configuration("User property must be a JSON object".to_string()));
    };

    Ok(map
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect())
}

/// Status document published by the node binary.
pub fn status_message(status: &str, details: Option<&str>, totals: &MetricsSnapshot) -> Value {
    json!({
        "status": status,
        "details": details.unwrap_or_default(),
        "sent": convert_bytes_to_human_readable(totals.bytes_sent as f64),
        "received": convert_bytes_to_human_readable(totals.bytes_received as f64),
        "counters": totals,
    })
}

/// Publish node status in the background
pub fn publish_status(node: Arc<Node>, topic: String, status: String, details: Option<String>) {
    tokio::spawn(async move {
        let message = status_message(&status, details.as_deref(), &node.metrics());
        if let Err(e) = node
            .publish(&topic, message.to_string(), QoS::AtLeastOnce, true)
            .await
        {
            error!("Failed to publish status to '{}': {}", topic, e);
        }
    });
}

/// Start periodic status updates
pub fn periodic_status_update(node: Arc<Node>, topic: String, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(period).await;
            let message = status_message("running", Some("Node is operational"), &node.metrics());
            if let Err(e) = node
                .publish(&topic, message.to_string(), QoS::AtLeastOnce, true)
                .await
            {
                error!("Failed to publish status to '{}': {}", topic, e);
            }
        }
    })
}

/// Wait for ctrl-c, then publish the shutdown status
pub async fn handle_shutdown(node: Arc<Node>, status_topic: &str) {
    let (status, details) = match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Node is shutting down...");
            ("shutdown", "Node is shutting down...")
        }
        Err(e) => {
            error!("Failed to handle termination signal: {:?}", e);
            ("error", "Termination signal failed")
        }
    };

    let message = status_message(status, Some(details), &node.metrics());
    if let Err(e) = node
        .publish(status_topic, message.to_string(), QoS::AtLeastOnce, true)
        .await
    {
        error!("Failed to publish shutdown status: {}", e);
    }
}
