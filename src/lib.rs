//! Managed MQTT nodes.
//!
//! A [`Node`] keeps one logical broker session alive over an unreliable link:
//! it reconnects with a bounded, fixed-backoff retry, replays its desired
//! subscriptions after every (re)connect and counts traffic per node.
//!
//! ```ignore
//! let factory = NodeFactory::new();
//! let node = factory.create(BrokerConfig::from_env()?, NodeOptions::default())?;
//! node.connect().await?;
//! node.subscribe("sensors/#", QoS::AtLeastOnce).await?;
//! node.publish("sensors/lab/temp", "21.5", QoS::AtMostOnce, false).await?;
//! node.close(Duration::from_secs(5)).await?;
//! ```

pub mod config;
pub mod error;
pub mod identity;
pub mod metrics;
pub mod mqtt_transport;
pub mod node;
mod router;
pub mod service_utils;
pub mod subscription;
pub mod transport;

#[cfg(test)]
mod test_helpers;

pub use config::{BrokerConfig, ConfigError};
pub use error::NodeError;
pub use identity::{IdAllocator, NodeIdentity};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use node::{ConnectionState, Node, NodeFactory, NodeOptions};
pub use subscription::{QoS, Subscription};
pub use transport::{Transport, TransportError, TransportEvent};
