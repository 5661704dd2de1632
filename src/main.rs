use mqtt_node_network::service_utils::{handle_shutdown, periodic_status_update, publish_status};
use mqtt_node_network::{BrokerConfig, NodeFactory, NodeOptions, QoS, Subscription};
use std::env;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Load configuration
    let config = match BrokerConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Error loading configuration: {:?}", e);
            return;
        }
    };

    let subscribe_topic = env::var("NODE_SUBSCRIBE_TOPIC").unwrap_or_else(|_| "nodes/#".to_string());
    let status_topic = env::var("NODE_STATUS_TOPIC").unwrap_or_else(|_| "nodes/status".to_string());
    let options = NodeOptions {
        name: env::var("NODE_NAME").ok(),
        node_id: env::var("NODE_ID").ok(),
        node_type: env::var("NODE_TYPE").ok(),
        subscriptions: vec![Subscription::new(subscribe_topic, QoS::AtMostOnce)],
    };

    let factory = NodeFactory::new();
    let node = match factory.create(config, options) {
        Ok(node) => Arc::new(node),
        Err(e) => {
            error!("Failed to create node: {}", e);
            return;
        }
    };
    info!(
        "Starting node {} for broker at {}",
        node.identity().node_id,
        node.config().address()
    );

    if let Err(e) = node.connect().await {
        error!("Failed to connect: {}", e);
        return;
    }

    publish_status(
        node.clone(),
        status_topic.clone(),
        "running".to_string(),
        Some("Node started successfully.".to_string()),
    );
    let status_task = periodic_status_update(node.clone(), status_topic.clone(), Duration::from_secs(30));

    handle_shutdown(node.clone(), &status_topic).await;
    status_task.abort();

    if let Err(e) = node.close(Duration::from_secs(5)).await {
        error!("Failed to close node: {}", e);
    }
    debug!("Final counters:\n{}", factory.metrics_registry().render());
    info!("Node shut down successfully.");
}
